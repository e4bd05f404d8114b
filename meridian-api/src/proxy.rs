//! Object-Proxy Transport Backend
//!
//! A remote object reference to a peer station: every remote method is one
//! [`ProxyRequest`] variant, answered by one [`ProxyResponse`]. Frames are
//! newline-delimited JSON over plain TCP, each bounded by a maximum size.
//! Package and state bytes travel base64-encoded.

use crate::error::{ServerError, ServerResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use meridian_agents::{Endpoint, InboundHandler, RemoteTransport, TransferRequest};
use meridian_core::{EntityKind, Instance, Permission, StationError, StationResult, TransportError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum ProxyRequest {
    LookupPermission {
        agent_name: String,
        agent_short_id: String,
        place: String,
    },
    TransferAgent {
        instance: Instance,
        /// base64 JSON snapshot
        state: String,
        package_name: String,
        place: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        package_bytes: Option<String>,
    },
}

/// Failure category reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    NotFound,
    PackageMissing,
    Integrity,
    Transport,
    Storage,
    Agent,
}

impl FailureKind {
    fn of(err: &StationError) -> Self {
        match err {
            StationError::Validation(_) => FailureKind::Validation,
            StationError::NotFound(_) => FailureKind::NotFound,
            StationError::Integrity(_) => FailureKind::Integrity,
            StationError::Transport(_) => FailureKind::Transport,
            StationError::Storage(_) => FailureKind::Storage,
            StationError::Agent(_) => FailureKind::Agent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum ProxyResponse {
    Permission(Option<Permission>),
    Transferred,
    Failed { kind: FailureKind, message: String },
}

impl ProxyResponse {
    fn failed(err: &StationError) -> Self {
        match err {
            StationError::NotFound(missing) if missing.entity == EntityKind::Package => {
                ProxyResponse::Failed {
                    kind: FailureKind::PackageMissing,
                    message: missing.key.clone(),
                }
            }
            _ => ProxyResponse::Failed {
                kind: FailureKind::of(err),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("connection closed")]
    Closed,
    #[error("frame I/O failed: {0}")]
    Io(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8], max_frame_bytes: usize) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Read one frame, never buffering more than `max_frame_bytes` plus the
/// delimiter. `Closed` on a clean end of stream.
async fn read_frame<R>(reader: &mut BufReader<R>, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = Vec::new();
    let limit = (max_frame_bytes as u64).saturating_add(2);
    let read = reader
        .take(limit)
        .read_until(b'\n', &mut frame)
        .await
        .map_err(|e| FrameError::Io(e.to_string()))?;
    if read == 0 {
        return Err(FrameError::Closed);
    }
    if !frame.ends_with(b"\n") && frame.len() as u64 >= limit {
        return Err(FrameError::OversizedFrame {
            size: frame.len(),
            max: max_frame_bytes,
        });
    }
    Ok(frame)
}

async fn write_frame<W, T>(writer: &mut W, value: &T, max_frame_bytes: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value, max_frame_bytes)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| FrameError::Io(e.to_string()))?;
    writer.flush().await.map_err(|e| FrameError::Io(e.to_string()))
}

fn decode_bytes(field: &str, encoded: &str) -> StationResult<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|e| StationError::missing(format!("{} (invalid base64: {})", field, e)))
}

// ============================================================================
// CLIENT
// ============================================================================

/// Blocking [`RemoteTransport`] speaking the proxy protocol, one connection
/// per call.
pub struct ProxyTransport {
    runtime: Runtime,
    max_frame_bytes: usize,
}

impl ProxyTransport {
    pub fn new(max_frame_bytes: usize) -> StationResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("meridian-proxy-client")
            .enable_all()
            .build()
            .map_err(|e| TransportError::Configuration {
                reason: format!("client runtime: {}", e),
            })?;
        Ok(Self {
            runtime,
            max_frame_bytes,
        })
    }

    fn call(&self, endpoint: &Endpoint, request: &ProxyRequest) -> Result<ProxyResponse, TransportError> {
        let unreachable = |reason: String| TransportError::Unreachable {
            endpoint: endpoint.to_string(),
            reason,
        };
        let protocol = |err: FrameError| TransportError::Protocol {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        };

        self.runtime.block_on(async {
            let address = (endpoint.host.as_str(), endpoint.port);
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
                .await
                .map_err(|_| unreachable("connect timed out".to_string()))?
                .map_err(|e| unreachable(e.to_string()))?;
            let (read_half, mut write_half) = stream.into_split();

            write_frame(&mut write_half, request, self.max_frame_bytes)
                .await
                .map_err(protocol)?;
            let mut reader = BufReader::new(read_half);
            let frame = tokio::time::timeout(REQUEST_TIMEOUT, read_frame(&mut reader, self.max_frame_bytes))
                .await
                .map_err(|_| unreachable("no reply before timeout".to_string()))?
                .map_err(protocol)?;
            decode_frame(&frame, self.max_frame_bytes).map_err(protocol)
        })
    }

    fn unexpected(endpoint: &Endpoint, response: ProxyResponse) -> TransportError {
        match response {
            ProxyResponse::Failed { kind, message } => match kind {
                FailureKind::Transport => TransportError::Unreachable {
                    endpoint: endpoint.to_string(),
                    reason: message,
                },
                FailureKind::PackageMissing => TransportError::PackageMissing {
                    endpoint: endpoint.to_string(),
                    package: message,
                },
                _ => TransportError::Rejected {
                    endpoint: endpoint.to_string(),
                    reason: message,
                },
            },
            other => TransportError::Protocol {
                endpoint: endpoint.to_string(),
                reason: format!("unexpected reply {:?}", other),
            },
        }
    }
}

impl RemoteTransport for ProxyTransport {
    fn lookup_permission(
        &self,
        endpoint: &Endpoint,
        agent_name: &str,
        agent_short_id: &str,
        place: &str,
    ) -> Result<Option<Permission>, TransportError> {
        let request = ProxyRequest::LookupPermission {
            agent_name: agent_name.to_string(),
            agent_short_id: agent_short_id.to_string(),
            place: place.to_string(),
        };
        match self.call(endpoint, &request)? {
            ProxyResponse::Permission(permission) => Ok(permission),
            other => Err(Self::unexpected(endpoint, other)),
        }
    }

    fn transfer_agent(
        &self,
        endpoint: &Endpoint,
        request: TransferRequest,
    ) -> Result<(), TransportError> {
        let request = ProxyRequest::TransferAgent {
            instance: request.instance,
            state: BASE64.encode(&request.state),
            package_name: request.package_name,
            place: request.place,
            package_bytes: request.package_bytes.map(|bytes| BASE64.encode(bytes)),
        };
        match self.call(endpoint, &request)? {
            ProxyResponse::Transferred => Ok(()),
            other => Err(Self::unexpected(endpoint, other)),
        }
    }
}

// ============================================================================
// SERVER
// ============================================================================

/// Inbound side of the proxy backend.
pub struct ProxyInboundServer {
    handler: Arc<dyn InboundHandler>,
    max_frame_bytes: usize,
}

impl ProxyInboundServer {
    pub fn new(handler: Arc<dyn InboundHandler>, max_frame_bytes: usize) -> Self {
        Self {
            handler,
            max_frame_bytes,
        }
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    pub async fn serve<F>(self, addr: SocketAddr, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Serve(format!("Failed to bind {}: {}", addr, e)))?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve_listener<F>(self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::Serve(e.to_string()))?;
        info!(addr = %local, "Proxy transport listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %local, "Proxy transport stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&self.handler);
                        let max = self.max_frame_bytes;
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler, max).await {
                                debug!(%peer, error = %e, "Proxy connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn InboundHandler>,
    max_frame_bytes: usize,
) -> Result<(), FrameError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let frame = match read_frame(&mut reader, max_frame_bytes).await {
            Ok(frame) => frame,
            Err(FrameError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let response = match decode_frame::<ProxyRequest>(&frame, max_frame_bytes) {
            Ok(request) => dispatch(Arc::clone(&handler), request).await,
            Err(e) => ProxyResponse::failed(&StationError::missing(format!("request ({})", e))),
        };
        write_frame(&mut write_half, &response, max_frame_bytes).await?;
    }
}

async fn dispatch(handler: Arc<dyn InboundHandler>, request: ProxyRequest) -> ProxyResponse {
    let outcome = tokio::task::spawn_blocking(move || handle(handler.as_ref(), request)).await;
    match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => ProxyResponse::failed(&e),
        Err(e) => ProxyResponse::Failed {
            kind: FailureKind::Agent,
            message: format!("handler task failed: {}", e),
        },
    }
}

fn handle(handler: &dyn InboundHandler, request: ProxyRequest) -> StationResult<ProxyResponse> {
    match request {
        ProxyRequest::LookupPermission {
            agent_name,
            agent_short_id,
            place,
        } => {
            debug!(agent = %agent_name, short_id = %agent_short_id, place = %place, "Inbound permission lookup");
            handler
                .lookup_permission(&agent_name, &agent_short_id, &place)
                .map(ProxyResponse::Permission)
        }
        ProxyRequest::TransferAgent {
            instance,
            state,
            package_name,
            place,
            package_bytes,
        } => {
            debug!(agent = %instance.label(), place = %place, with_package = package_bytes.is_some(), "Inbound transfer");
            let request = TransferRequest {
                instance,
                state: decode_bytes("state", &state)?,
                package_name,
                place,
                package_bytes: package_bytes
                    .map(|bytes| decode_bytes("package_bytes", &bytes))
                    .transpose()?,
            };
            handler.accept_transfer(request)?;
            Ok(ProxyResponse::Transferred)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{PermissionKey, DEFAULT_PLACE};

    #[test]
    fn test_request_wire_shape() {
        let request = ProxyRequest::LookupPermission {
            agent_name: "Courier".to_string(),
            agent_short_id: "abc123".to_string(),
            place: DEFAULT_PLACE.to_string(),
        };
        let frame = encode_frame(&request, 1024).unwrap();
        let text = String::from_utf8(frame.clone()).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("\"method\":\"lookup_permission\""));
        assert_eq!(decode_frame::<ProxyRequest>(&frame, 1024).unwrap(), request);
    }

    #[test]
    fn test_oversized_frames_are_refused() {
        let response = ProxyResponse::Permission(Some(Permission::allow(
            PermissionKey::new("Courier", "abc123", DEFAULT_PLACE),
            true,
        )));
        assert!(matches!(
            encode_frame(&response, 8),
            Err(FrameError::OversizedFrame { max: 8, .. })
        ));
        assert!(matches!(
            decode_frame::<ProxyResponse>(&[b'x'; 32], 8),
            Err(FrameError::OversizedFrame { size: 32, max: 8 })
        ));
    }

    #[test]
    fn test_failure_keeps_category() {
        let response = ProxyResponse::failed(&StationError::not_found(
            meridian_core::EntityKind::Package,
            "courier.pkg",
        ));
        match response {
            ProxyResponse::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::PackageMissing);
                assert_eq!(message, "courier.pkg");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        let response = ProxyResponse::failed(&StationError::not_found(
            meridian_core::EntityKind::Place,
            "Lab",
        ));
        assert!(matches!(
            response,
            ProxyResponse::Failed {
                kind: FailureKind::NotFound,
                ..
            }
        ));
    }

    #[test]
    fn test_remote_failures_map_to_transport_errors() {
        let endpoint = Endpoint::new("beta", 7001);
        let rejected = ProxyTransport::unexpected(
            &endpoint,
            ProxyResponse::Failed {
                kind: FailureKind::Integrity,
                message: "hash mismatch".to_string(),
            },
        );
        assert!(matches!(rejected, TransportError::Rejected { .. }));
        let missing = ProxyTransport::unexpected(
            &endpoint,
            ProxyResponse::Failed {
                kind: FailureKind::PackageMissing,
                message: "courier.pkg".to_string(),
            },
        );
        assert_eq!(
            missing,
            TransportError::PackageMissing {
                endpoint: endpoint.to_string(),
                package: "courier.pkg".to_string(),
            }
        );
        let protocol = ProxyTransport::unexpected(&endpoint, ProxyResponse::Transferred);
        assert!(matches!(protocol, TransportError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_stops_at_limit() {
        let input: &[u8] = b"0123456789abcdef\n";
        let mut reader = BufReader::new(input);
        assert!(matches!(
            read_frame(&mut reader, 4).await,
            Err(FrameError::OversizedFrame { .. })
        ));

        let mut reader = BufReader::new(&b"{}\n"[..]);
        assert_eq!(read_frame(&mut reader, 4).await.unwrap(), b"{}\n".to_vec());
        assert!(matches!(
            read_frame(&mut reader, 4).await,
            Err(FrameError::Closed)
        ));
    }
}
