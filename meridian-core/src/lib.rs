//! Meridian Core - Station Data Model
//!
//! Pure data structures shared by every Meridian crate: agent identities and
//! instances, permissions, places, schedules, configuration and the error
//! taxonomy. No runtime behavior lives here.

mod agent;
mod config;
mod error;
mod identity;
mod permission;
mod schedule;

pub use agent::{AgentIdentity, AgentState, Instance, InstanceKey, Location};
pub use config::{
    StationConfig, TlsConfig, TransportKind, DEFAULT_LOG_CAPACITY, DEFAULT_MAX_FRAME_BYTES,
};
pub use error::{
    AgentError, EntityKind, IntegrityError, NotFoundError, StationError, StationResult,
    StorageError, TransportError, ValidationError,
};
pub use identity::{
    compute_content_hash, long_fingerprint, short_fingerprint, Sid, Timestamp, SHORT_ID_LEN,
};
pub use permission::{validate_place_name, Permission, PermissionKey, Place, DEFAULT_PLACE};
pub use schedule::{Recurrence, RepeatPolicy, Schedule};
