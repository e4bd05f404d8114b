//! Error types for Meridian station operations

use std::fmt;
use thiserror::Error;

/// Kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Agent,
    AgentClass,
    Place,
    Permission,
    Schedule,
    Package,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Agent => "agent",
            EntityKind::AgentClass => "agent class",
            EntityKind::Place => "place",
            EntityKind::Permission => "permission",
            EntityKind::Schedule => "schedule",
            EntityKind::Package => "package",
        };
        f.write_str(name)
    }
}

/// Input rejected before any side effect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Duplicate {entity}: {key}")]
    Duplicate { entity: EntityKind, key: String },

    #[error("Place {place} still holds {count} agent(s)")]
    PlaceNotEmpty { place: String, count: usize },

    #[error("Place {place} cannot be removed")]
    ProtectedPlace { place: String },
}

/// A required entity is absent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{entity} not found: {key}")]
pub struct NotFoundError {
    pub entity: EntityKind,
    pub key: String,
}

impl NotFoundError {
    pub fn new(entity: EntityKind, key: impl Into<String>) -> Self {
        Self {
            entity,
            key: key.into(),
        }
    }
}

/// Package content does not match its declared identity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Package {package} hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        package: String,
        expected: String,
        actual: String,
    },
}

/// Remote station communication errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Station {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("Protocol error talking to {endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },

    #[error("Station {endpoint} rejected request: {reason}")]
    Rejected { endpoint: String, reason: String },

    #[error("Station {endpoint} does not hold package {package}")]
    PackageMissing { endpoint: String, package: String },

    #[error("Transport misconfigured: {reason}")]
    Configuration { reason: String },
}

/// Registry and package-cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Registry operation {operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    #[error("Registry lock poisoned")]
    LockPoisoned,

    #[error("Package cache I/O failed for {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Agent runtime errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Failed to spawn thread for agent {agent}: {reason}")]
    SpawnFailed { agent: String, reason: String },

    #[error("Snapshot codec failed for agent {agent}: {reason}")]
    Snapshot { agent: String, reason: String },

    #[error("Station is shutting down")]
    ShuttingDown,
}

/// Master error type for all station operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StationError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

impl StationError {
    /// Shorthand for a [`NotFoundError`].
    pub fn not_found(entity: EntityKind, key: impl Into<String>) -> Self {
        StationError::NotFound(NotFoundError::new(entity, key))
    }

    /// Shorthand for a missing required field.
    pub fn missing(field: impl Into<String>) -> Self {
        StationError::Validation(ValidationError::RequiredFieldMissing {
            field: field.into(),
        })
    }

    /// Shorthand for a registry failure.
    pub fn storage(operation: impl Into<String>, reason: impl fmt::Display) -> Self {
        StationError::Storage(StorageError::OperationFailed {
            operation: operation.into(),
            reason: reason.to_string(),
        })
    }
}

impl TransportError {
    /// The peer refused a transfer because the package it was told to reuse
    /// is absent from its cache.
    pub fn package_missing(endpoint: impl fmt::Display, err: &StationError) -> Option<Self> {
        match err {
            StationError::NotFound(NotFoundError {
                entity: EntityKind::Package,
                key,
            }) => Some(TransportError::PackageMissing {
                endpoint: endpoint.to_string(),
                package: key.clone(),
            }),
            _ => None,
        }
    }
}

/// Result type alias for station operations.
pub type StationResult<T> = Result<T, StationError>;
