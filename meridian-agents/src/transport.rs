//! Remote station ports.
//!
//! [`RemoteTransport`] is the client side used by migration; a backend is
//! chosen once when the station is assembled. [`InboundHandler`] is what a
//! backend's server dispatches into; the station implements it.

use meridian_core::{Instance, Permission, StationResult, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a station.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything a destination needs to rebuild a migrated agent.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    /// Instance metadata as it left the origin
    pub instance: Instance,
    /// JSON encoding of the agent snapshot
    pub state: Vec<u8>,
    pub package_name: String,
    /// Destination place
    pub place: String,
    /// Package content, omitted when the destination already has it
    pub package_bytes: Option<Vec<u8>>,
}

/// Client side of station-to-station calls.
pub trait RemoteTransport: Send + Sync {
    /// Ask `endpoint` for its permission entry for an agent in `place`.
    fn lookup_permission(
        &self,
        endpoint: &Endpoint,
        agent_name: &str,
        agent_short_id: &str,
        place: &str,
    ) -> Result<Option<Permission>, TransportError>;

    /// Hand an agent over to `endpoint`.
    fn transfer_agent(
        &self,
        endpoint: &Endpoint,
        request: TransferRequest,
    ) -> Result<(), TransportError>;
}

/// Server side of station-to-station calls.
pub trait InboundHandler: Send + Sync {
    fn lookup_permission(
        &self,
        agent_name: &str,
        agent_short_id: &str,
        place: &str,
    ) -> StationResult<Option<Permission>>;

    /// Accept a migrated agent. Disallowed agents are dropped without an
    /// error.
    fn accept_transfer(&self, request: TransferRequest) -> StationResult<()>;
}

/// Transport for a station with no peers; every call is unreachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedTransport;

impl RemoteTransport for DisconnectedTransport {
    fn lookup_permission(
        &self,
        endpoint: &Endpoint,
        _agent_name: &str,
        _agent_short_id: &str,
        _place: &str,
    ) -> Result<Option<Permission>, TransportError> {
        Err(TransportError::Unreachable {
            endpoint: endpoint.to_string(),
            reason: "no transport configured".to_string(),
        })
    }

    fn transfer_agent(
        &self,
        endpoint: &Endpoint,
        _request: TransferRequest,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unreachable {
            endpoint: endpoint.to_string(),
            reason: "no transport configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("beta", 7001).to_string(), "beta:7001");
    }

    #[test]
    fn test_disconnected_is_unreachable() {
        let transport = DisconnectedTransport;
        let err = transport
            .lookup_permission(&Endpoint::new("beta", 7001), "Ping", "abc123", "Default")
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }
}
