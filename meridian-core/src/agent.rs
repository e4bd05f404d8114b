//! Agent identity and instance types
//!
//! An [`AgentIdentity`] describes a build of agent code (class, package,
//! version). An [`Instance`] is one runnable copy of that build living in a
//! place on a station. Two instances of the same build created at different
//! times are different agents.

use crate::error::{StationError, StationResult};
use crate::identity::{long_fingerprint, short_fingerprint, Sid, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

// ============================================================================
// AGENT IDENTITY
// ============================================================================

/// Immutable description of a build of agent code.
///
/// Equality is keyed on `(class_name, hash, major, minor)`. The package
/// location is the only mutable part: it is rewritten to the local cache
/// path once the package has been copied or transferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Human-facing agent name, also half of the permission key
    pub name: String,
    /// Fully-qualified implementation class reference
    pub class_name: String,
    /// Publishing organisation
    pub organisation: String,
    /// Content hash of the code package (lowercase hex)
    pub hash: String,
    pub major: u32,
    pub minor: u32,
    pub description: String,
    /// Location of the code package
    pub package: String,
}

impl AgentIdentity {
    /// Combined decimal version, e.g. `1.2`.
    pub fn version(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// Long fingerprint over class, hash and version.
    pub fn long_id(&self) -> String {
        long_fingerprint(&self.class_name, &self.hash, &self.version())
    }

    /// File name of the package, used as the cache entry name.
    pub fn package_name(&self) -> String {
        Path::new(&self.package)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.package.clone())
    }

    /// Reject identities with blank required fields.
    pub fn validate(&self) -> StationResult<()> {
        let fields = [
            ("name", &self.name),
            ("class_name", &self.class_name),
            ("package", &self.package),
            ("organisation", &self.organisation),
            ("hash", &self.hash),
            ("description", &self.description),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(StationError::missing(field));
            }
        }
        Ok(())
    }

    /// Whether this build matches a collaboration request.
    pub fn matches(&self, name: &str, organisation: &str, major: u32, minor: u32) -> bool {
        self.name == name
            && self.organisation == organisation
            && self.major == major
            && self.minor == minor
    }
}

impl PartialEq for AgentIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.class_name == other.class_name
            && self.hash == other.hash
            && self.major == other.major
            && self.minor == other.minor
    }
}

impl Eq for AgentIdentity {}

impl Hash for AgentIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class_name.hash(state);
        self.hash.hash(state);
        self.major.hash(state);
        self.minor.hash(state);
    }
}

// ============================================================================
// LOCATION & STATE
// ============================================================================

/// A place on a specific station.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub server: String,
    pub port: u16,
    pub place: String,
}

impl Location {
    pub fn new(server: impl Into<String>, port: u16, place: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port,
            place: place.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.server, self.port, self.place)
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Active,
    Inactive,
}

impl AgentState {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AgentState::Active => "ACTIVE",
            AgentState::Inactive => "INACTIVE",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

// ============================================================================
// INSTANCE
// ============================================================================

/// Natural key of an instance: long id plus creation timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub long_id: String,
    pub created_at: Timestamp,
}

impl InstanceKey {
    pub fn short_id(&self) -> String {
        short_fingerprint(&self.long_id)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.short_id(),
            self.created_at.timestamp_nanos_opt().unwrap_or_default()
        )
    }
}

/// One running-or-runnable agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub identity: AgentIdentity,
    pub created_at: Timestamp,
    /// Place the instance currently lives in
    pub place: String,
    pub parameters: Vec<String>,
    pub state: AgentState,
    /// Where the instance was first created; set once
    home: Option<Location>,
    /// Last station the instance migrated into
    pub last_remote: Option<Location>,
    /// Registry surrogate id, assigned on first persist
    pub sid: Option<Sid>,
}

impl Instance {
    /// Create a new inactive instance in `place`.
    pub fn new(
        identity: AgentIdentity,
        created_at: Timestamp,
        place: impl Into<String>,
        parameters: Vec<String>,
    ) -> Self {
        Self {
            identity,
            created_at,
            place: place.into(),
            parameters,
            state: AgentState::Inactive,
            home: None,
            last_remote: None,
            sid: None,
        }
    }

    pub fn long_id(&self) -> String {
        self.identity.long_id()
    }

    /// Human-facing trace id, the tail of [`Instance::long_id`].
    pub fn short_id(&self) -> String {
        short_fingerprint(&self.long_id())
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            long_id: self.long_id(),
            created_at: self.created_at,
        }
    }

    pub fn home(&self) -> Option<&Location> {
        self.home.as_ref()
    }

    /// Record the home location. Later calls are ignored.
    pub fn set_home_once(&mut self, home: Location) -> bool {
        if self.home.is_some() {
            return false;
        }
        self.home = Some(home);
        true
    }

    /// Move the instance into `location` after an inbound migration.
    pub fn record_arrival(&mut self, location: Location) {
        self.place = location.place.clone();
        self.last_remote = Some(location);
    }

    pub fn is_active(&self) -> bool {
        self.state == AgentState::Active
    }

    /// Display label: `name (short_id)`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.identity.name, self.short_id())
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.long_id() == other.long_id() && self.created_at == other.created_at
    }
}

impl Eq for Instance {}

impl Hash for Instance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.long_id().hash(state);
        self.created_at.hash(state);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn identity() -> AgentIdentity {
        AgentIdentity {
            name: "Ping".to_string(),
            class_name: "agents.ping.Ping".to_string(),
            organisation: "Meridian".to_string(),
            hash: "0f".repeat(32),
            major: 1,
            minor: 2,
            description: "Replies to pings".to_string(),
            package: "/tmp/ping.pkg".to_string(),
        }
    }

    #[test]
    fn test_identity_version_and_package_name() {
        let id = identity();
        assert_eq!(id.version(), "1.2");
        assert_eq!(id.package_name(), "ping.pkg");
    }

    #[test]
    fn test_identity_equality_ignores_descriptive_fields() {
        let a = identity();
        let mut b = identity();
        b.description = "something else".to_string();
        b.package = "/var/cache/ping.pkg".to_string();
        b.name = "Pong".to_string();
        assert_eq!(a, b);

        b.minor = 3;
        assert_ne!(a, b);
    }

    #[test]
    fn test_identity_validate_rejects_blank_fields() {
        let mut id = identity();
        assert!(id.validate().is_ok());

        id.organisation = "   ".to_string();
        let err = id.validate().unwrap_err();
        assert!(err.to_string().contains("organisation"));
    }

    #[test]
    fn test_instances_differ_by_creation_time() {
        let now = Utc::now();
        let a = Instance::new(identity(), now, "Default", vec![]);
        let b = Instance::new(identity(), now + Duration::milliseconds(1), "Default", vec![]);
        assert_eq!(a.identity, b.identity);
        assert_ne!(a, b);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_short_id_is_tail_of_long_id() {
        let inst = Instance::new(identity(), Utc::now(), "Default", vec![]);
        let long = inst.long_id();
        assert_eq!(long.len(), 64);
        assert_eq!(inst.short_id(), long[58..]);
        assert_eq!(inst.key().short_id(), inst.short_id());
    }

    #[test]
    fn test_home_is_set_once() {
        let mut inst = Instance::new(identity(), Utc::now(), "Default", vec![]);
        assert!(inst.set_home_once(Location::new("alpha", 7000, "Default")));
        assert!(!inst.set_home_once(Location::new("beta", 7001, "Lab")));
        assert_eq!(inst.home().map(|h| h.server.as_str()), Some("alpha"));
    }

    #[test]
    fn test_record_arrival_moves_place() {
        let mut inst = Instance::new(identity(), Utc::now(), "Default", vec![]);
        inst.record_arrival(Location::new("beta", 7001, "Lab"));
        assert_eq!(inst.place, "Lab");
        assert_eq!(inst.last_remote, Some(Location::new("beta", 7001, "Lab")));
    }

    #[test]
    fn test_instance_serde_keeps_home() {
        let mut inst = Instance::new(identity(), Utc::now(), "Default", vec!["a".into()]);
        inst.set_home_once(Location::new("alpha", 7000, "Default"));
        let json = serde_json::to_string(&inst).unwrap();
        let back: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
        assert_eq!(back.home(), inst.home());
        assert_eq!(back.parameters, vec!["a".to_string()]);
    }
}
