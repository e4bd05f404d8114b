//! gRPC Transport Backend
//!
//! Station-to-station calls over HTTP/2 with optional TLS. The service is
//! equivalent to:
//!
//! ```text
//! package meridian.station;
//!
//! service StationTransfer {
//!   rpc LookupPermission(PermissionQuery) returns (PermissionReply);
//!   rpc TransferAgent(TransferEnvelope) returns (TransferReply);
//! }
//! ```
//!
//! Client and server stubs are generated by `build.rs`; the message types
//! below are the hand-written prost structs those stubs refer to.

use crate::error::{ServerError, ServerResult};
use chrono::DateTime;
use meridian_agents::{Endpoint, InboundHandler, RemoteTransport, TransferRequest};
use meridian_core::{
    AgentIdentity, EntityKind, Instance, Location, Permission, PermissionKey, StationError,
    StationResult, TlsConfig, TransportError,
};
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Runtime;
use tonic::transport::{
    Certificate, Channel, ClientTlsConfig, Endpoint as ChannelEndpoint, Identity, Server,
    ServerTlsConfig,
};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info, warn};

/// Generated client and server stubs.
pub mod service {
    include!(concat!(env!("OUT_DIR"), "/meridian.station.StationTransfer.rs"));
}

use service::station_transfer_client::StationTransferClient;
use service::station_transfer_server::{StationTransfer, StationTransferServer};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// MESSAGES
// ============================================================================

#[derive(Clone, PartialEq, prost::Message)]
pub struct PermissionQuery {
    #[prost(string, tag = "1")]
    pub agent_name: String,
    #[prost(string, tag = "2")]
    pub agent_short_id: String,
    #[prost(string, tag = "3")]
    pub place: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PermissionMessage {
    #[prost(string, tag = "1")]
    pub agent_name: String,
    #[prost(string, tag = "2")]
    pub agent_short_id: String,
    #[prost(string, tag = "3")]
    pub place: String,
    #[prost(bool, tag = "4")]
    pub allowed: bool,
    #[prost(bool, tag = "5")]
    pub auto_start: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PermissionReply {
    /// Absent when the destination has no entry
    #[prost(message, optional, tag = "1")]
    pub permission: Option<PermissionMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LocationMessage {
    #[prost(string, tag = "1")]
    pub server: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(string, tag = "3")]
    pub place: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IdentityMessage {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub class_name: String,
    #[prost(string, tag = "3")]
    pub organisation: String,
    #[prost(string, tag = "4")]
    pub hash: String,
    #[prost(uint32, tag = "5")]
    pub major: u32,
    #[prost(uint32, tag = "6")]
    pub minor: u32,
    #[prost(string, tag = "7")]
    pub description: String,
    #[prost(string, tag = "8")]
    pub package: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InstanceMessage {
    #[prost(message, optional, tag = "1")]
    pub identity: Option<IdentityMessage>,
    #[prost(int64, tag = "2")]
    pub created_at_seconds: i64,
    #[prost(uint32, tag = "3")]
    pub created_at_nanos: u32,
    #[prost(string, tag = "4")]
    pub place: String,
    #[prost(string, repeated, tag = "5")]
    pub parameters: Vec<String>,
    #[prost(message, optional, tag = "6")]
    pub home: Option<LocationMessage>,
    #[prost(message, optional, tag = "7")]
    pub last_remote: Option<LocationMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TransferEnvelope {
    #[prost(message, optional, tag = "1")]
    pub instance: Option<InstanceMessage>,
    /// JSON agent snapshot
    #[prost(bytes = "vec", tag = "2")]
    pub state: Vec<u8>,
    #[prost(string, tag = "3")]
    pub package_name: String,
    #[prost(string, tag = "4")]
    pub place: String,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub package_bytes: Option<Vec<u8>>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct TransferReply {}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<Permission> for PermissionMessage {
    fn from(p: Permission) -> Self {
        Self {
            agent_name: p.key.agent_name,
            agent_short_id: p.key.agent_short_id,
            place: p.key.place,
            allowed: p.allowed,
            auto_start: p.auto_start,
        }
    }
}

impl From<PermissionMessage> for Permission {
    fn from(m: PermissionMessage) -> Self {
        Permission {
            key: PermissionKey::new(m.agent_name, m.agent_short_id, m.place),
            allowed: m.allowed,
            auto_start: m.auto_start,
        }
    }
}

impl From<&Location> for LocationMessage {
    fn from(l: &Location) -> Self {
        Self {
            server: l.server.clone(),
            port: u32::from(l.port),
            place: l.place.clone(),
        }
    }
}

fn location_from(m: LocationMessage) -> Result<Location, Status> {
    let port = u16::try_from(m.port)
        .map_err(|_| Status::invalid_argument(format!("Invalid port {}", m.port)))?;
    Ok(Location::new(m.server, port, m.place))
}

impl From<&Instance> for InstanceMessage {
    fn from(i: &Instance) -> Self {
        let id = &i.identity;
        Self {
            identity: Some(IdentityMessage {
                name: id.name.clone(),
                class_name: id.class_name.clone(),
                organisation: id.organisation.clone(),
                hash: id.hash.clone(),
                major: id.major,
                minor: id.minor,
                description: id.description.clone(),
                package: id.package.clone(),
            }),
            created_at_seconds: i.created_at.timestamp(),
            created_at_nanos: i.created_at.timestamp_subsec_nanos(),
            place: i.place.clone(),
            parameters: i.parameters.clone(),
            home: i.home().map(LocationMessage::from),
            last_remote: i.last_remote.as_ref().map(LocationMessage::from),
        }
    }
}

/// Rebuild instance metadata sent by a peer. State and sid are never
/// carried; arrivals are inactive and unpersisted.
fn instance_from(m: InstanceMessage) -> Result<Instance, Status> {
    let id = m
        .identity
        .ok_or_else(|| Status::invalid_argument("Missing identity"))?;
    let created_at = DateTime::from_timestamp(m.created_at_seconds, m.created_at_nanos)
        .ok_or_else(|| Status::invalid_argument("Invalid created_at"))?;
    let identity = AgentIdentity {
        name: id.name,
        class_name: id.class_name,
        organisation: id.organisation,
        hash: id.hash,
        major: id.major,
        minor: id.minor,
        description: id.description,
        package: id.package,
    };
    let mut instance = Instance::new(identity, created_at, m.place, m.parameters);
    if let Some(home) = m.home {
        instance.set_home_once(location_from(home)?);
    }
    instance.last_remote = m.last_remote.map(location_from).transpose()?;
    Ok(instance)
}

/// Map a station failure onto the status returned to the calling peer.
///
/// A missing package travels as `FAILED_PRECONDITION` carrying only the
/// package name, so the caller can resend with the bytes attached.
pub fn status_from(err: StationError) -> Status {
    let message = err.to_string();
    match err {
        StationError::Validation(_) => Status::invalid_argument(message),
        StationError::NotFound(missing) if missing.entity == EntityKind::Package => {
            Status::failed_precondition(missing.key)
        }
        StationError::NotFound(_) => Status::not_found(message),
        StationError::Integrity(_) => Status::data_loss(message),
        StationError::Transport(_) => Status::unavailable(message),
        StationError::Storage(_) | StationError::Agent(_) => Status::internal(message),
    }
}

/// Map a status received from a peer onto the transport taxonomy.
pub fn transport_error(endpoint: &Endpoint, status: &Status) -> TransportError {
    let endpoint = endpoint.to_string();
    let reason = status.message().to_string();
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
            TransportError::Unreachable { endpoint, reason }
        }
        Code::Unimplemented | Code::Unknown | Code::Internal => {
            TransportError::Protocol { endpoint, reason }
        }
        Code::FailedPrecondition => TransportError::PackageMissing {
            endpoint,
            package: reason,
        },
        _ => TransportError::Rejected { endpoint, reason },
    }
}

// ============================================================================
// TLS
// ============================================================================

/// PEM identity and optional peer CA, loaded once at startup.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    identity: Identity,
    ca: Option<Certificate>,
}

impl TlsMaterial {
    pub fn load(config: &TlsConfig) -> ServerResult<Self> {
        let read = |path: &std::path::Path| fs::read(path).map_err(|e| ServerError::io(path, e));
        let identity = Identity::from_pem(read(config.cert_path.as_path())?, read(config.key_path.as_path())?);
        let ca = match &config.ca_path {
            Some(path) => Some(Certificate::from_pem(read(path.as_path())?)),
            None => None,
        };
        Ok(Self { identity, ca })
    }

    fn server_config(&self) -> ServerTlsConfig {
        let config = ServerTlsConfig::new().identity(self.identity.clone());
        match &self.ca {
            Some(ca) => config.client_ca_root(ca.clone()),
            None => config,
        }
    }

    fn client_config(&self, domain: &str) -> ClientTlsConfig {
        let config = ClientTlsConfig::new()
            .domain_name(domain)
            .identity(self.identity.clone());
        match &self.ca {
            Some(ca) => config.ca_certificate(ca.clone()),
            None => config,
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Blocking [`RemoteTransport`] over gRPC. Owns the runtime its calls are
/// driven on, so it can be used from agent and operator threads alike.
pub struct GrpcTransport {
    runtime: Runtime,
    tls: Option<TlsMaterial>,
    max_message_bytes: usize,
    channels: Mutex<HashMap<Endpoint, Channel>>,
}

impl GrpcTransport {
    pub fn new(tls: Option<TlsMaterial>, max_message_bytes: usize) -> StationResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("meridian-grpc-client")
            .enable_all()
            .build()
            .map_err(|e| TransportError::Configuration {
                reason: format!("client runtime: {}", e),
            })?;
        Ok(Self {
            runtime,
            tls,
            max_message_bytes,
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn uri(&self, endpoint: &Endpoint) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{}://{}:{}", scheme, endpoint.host, endpoint.port)
    }

    async fn client(
        &self,
        endpoint: &Endpoint,
    ) -> Result<StationTransferClient<Channel>, TransportError> {
        let cached = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned();
        let channel = match cached {
            Some(channel) => channel,
            None => {
                let channel = self.connect(endpoint).await?;
                self.channels
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(endpoint.clone(), channel.clone());
                channel
            }
        };
        Ok(StationTransferClient::new(channel)
            .max_encoding_message_size(self.max_message_bytes)
            .max_decoding_message_size(self.max_message_bytes))
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Channel, TransportError> {
        let unreachable = |reason: String| TransportError::Unreachable {
            endpoint: endpoint.to_string(),
            reason,
        };
        let mut target = ChannelEndpoint::from_shared(self.uri(endpoint))
            .map_err(|e| TransportError::Configuration {
                reason: format!("invalid endpoint {}: {}", endpoint, e),
            })?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);
        if let Some(tls) = &self.tls {
            target = target
                .tls_config(tls.client_config(&endpoint.host))
                .map_err(|e| TransportError::Configuration {
                    reason: e.to_string(),
                })?;
        }
        debug!(endpoint = %endpoint, "Connecting to station");
        target.connect().await.map_err(|e| unreachable(e.to_string()))
    }

    fn forget(&self, endpoint: &Endpoint) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
    }

    fn failed(&self, endpoint: &Endpoint, status: &Status) -> TransportError {
        let err = transport_error(endpoint, status);
        if matches!(err, TransportError::Unreachable { .. }) {
            self.forget(endpoint);
        }
        err
    }
}

impl RemoteTransport for GrpcTransport {
    fn lookup_permission(
        &self,
        endpoint: &Endpoint,
        agent_name: &str,
        agent_short_id: &str,
        place: &str,
    ) -> Result<Option<Permission>, TransportError> {
        let query = PermissionQuery {
            agent_name: agent_name.to_string(),
            agent_short_id: agent_short_id.to_string(),
            place: place.to_string(),
        };
        self.runtime.block_on(async {
            let mut client = self.client(endpoint).await?;
            let reply = client
                .lookup_permission(Request::new(query))
                .await
                .map_err(|status| self.failed(endpoint, &status))?;
            Ok(reply.into_inner().permission.map(Permission::from))
        })
    }

    fn transfer_agent(
        &self,
        endpoint: &Endpoint,
        request: TransferRequest,
    ) -> Result<(), TransportError> {
        let envelope = TransferEnvelope {
            instance: Some(InstanceMessage::from(&request.instance)),
            state: request.state,
            package_name: request.package_name,
            place: request.place,
            package_bytes: request.package_bytes,
        };
        self.runtime.block_on(async {
            let mut client = self.client(endpoint).await?;
            client
                .transfer_agent(Request::new(envelope))
                .await
                .map_err(|status| self.failed(endpoint, &status))?;
            Ok(())
        })
    }
}

// ============================================================================
// SERVER
// ============================================================================

/// Dispatches inbound calls into the station on blocking threads.
#[derive(Clone)]
pub struct TransferService {
    handler: Arc<dyn InboundHandler>,
}

impl TransferService {
    pub fn new(handler: Arc<dyn InboundHandler>) -> Self {
        Self { handler }
    }
}

async fn blocking<T, F>(work: F) -> Result<T, Status>
where
    F: FnOnce() -> StationResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Status::internal(format!("Handler task failed: {}", e)))?
        .map_err(status_from)
}

#[tonic::async_trait]
impl StationTransfer for TransferService {
    async fn lookup_permission(
        &self,
        request: Request<PermissionQuery>,
    ) -> Result<Response<PermissionReply>, Status> {
        let query = request.into_inner();
        debug!(agent = %query.agent_name, short_id = %query.agent_short_id, place = %query.place, "Inbound permission lookup");
        let handler = Arc::clone(&self.handler);
        let permission = blocking(move || {
            handler.lookup_permission(&query.agent_name, &query.agent_short_id, &query.place)
        })
        .await?;
        Ok(Response::new(PermissionReply {
            permission: permission.map(PermissionMessage::from),
        }))
    }

    async fn transfer_agent(
        &self,
        request: Request<TransferEnvelope>,
    ) -> Result<Response<TransferReply>, Status> {
        let envelope = request.into_inner();
        let instance = instance_from(
            envelope
                .instance
                .ok_or_else(|| Status::invalid_argument("Missing instance"))?,
        )?;
        debug!(agent = %instance.label(), place = %envelope.place, with_package = envelope.package_bytes.is_some(), "Inbound transfer");
        let transfer = TransferRequest {
            instance,
            state: envelope.state,
            package_name: envelope.package_name,
            place: envelope.place,
            package_bytes: envelope.package_bytes,
        };
        let handler = Arc::clone(&self.handler);
        blocking(move || handler.accept_transfer(transfer)).await?;
        Ok(Response::new(TransferReply {}))
    }
}

/// Inbound side of the gRPC backend.
pub struct GrpcInboundServer {
    service: TransferService,
    tls: Option<TlsMaterial>,
    max_message_bytes: usize,
}

impl GrpcInboundServer {
    pub fn new(handler: Arc<dyn InboundHandler>, max_message_bytes: usize) -> Self {
        Self {
            service: TransferService::new(handler),
            tls: None,
            max_message_bytes,
        }
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self, addr: SocketAddr, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut builder = Server::builder();
        if let Some(tls) = &self.tls {
            builder = builder
                .tls_config(tls.server_config())
                .map_err(|e| ServerError::Serve(format!("TLS setup failed: {}", e)))?;
        }
        let service = StationTransferServer::new(self.service)
            .max_decoding_message_size(self.max_message_bytes)
            .max_encoding_message_size(self.max_message_bytes);

        info!(%addr, tls = self.tls.is_some(), "gRPC transport listening");
        let result = builder
            .add_service(service)
            .serve_with_shutdown(addr, shutdown)
            .await;
        if let Err(e) = &result {
            warn!(%addr, error = %e, "gRPC transport stopped with error");
        }
        result.map_err(|e| ServerError::Serve(e.to_string()))
    }
}
