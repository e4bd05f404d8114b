//! Per-place permissions and places

use crate::agent::Instance;
use crate::error::{StationError, StationResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the place every station always has.
pub const DEFAULT_PLACE: &str = "Default";

/// Unique key of a permission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PermissionKey {
    pub agent_name: String,
    pub agent_short_id: String,
    pub place: String,
}

impl PermissionKey {
    pub fn new(
        agent_name: impl Into<String>,
        agent_short_id: impl Into<String>,
        place: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            agent_short_id: agent_short_id.into(),
            place: place.into(),
        }
    }

    /// Key that governs `instance` in `place`.
    pub fn for_instance(instance: &Instance, place: &str) -> Self {
        Self::new(
            instance.identity.name.clone(),
            instance.short_id(),
            place.to_string(),
        )
    }
}

impl fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.agent_name, self.agent_short_id, self.place)
    }
}

/// Whether an agent may exist in a place, and whether it starts on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub key: PermissionKey,
    pub allowed: bool,
    /// Only meaningful when `allowed` is set
    pub auto_start: bool,
}

impl Permission {
    pub fn allow(key: PermissionKey, auto_start: bool) -> Self {
        Self {
            key,
            allowed: true,
            auto_start,
        }
    }

    pub fn deny(key: PermissionKey) -> Self {
        Self {
            key,
            allowed: false,
            auto_start: false,
        }
    }

    /// Auto-start honoured only for allowed entries.
    pub fn starts_automatically(&self) -> bool {
        self.allowed && self.auto_start
    }

    pub fn validate(&self) -> StationResult<()> {
        if self.key.agent_name.trim().is_empty() {
            return Err(StationError::missing("agent_name"));
        }
        if self.key.agent_short_id.trim().is_empty() {
            return Err(StationError::missing("agent_short_id"));
        }
        validate_place_name(&self.key.place)
    }
}

/// A named partition of a station.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Place {
    pub name: String,
}

impl Place {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_PLACE
    }
}

/// Reject blank place names.
pub fn validate_place_name(name: &str) -> StationResult<()> {
    if name.trim().is_empty() {
        return Err(StationError::missing("place"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_start_requires_allowed() {
        let key = PermissionKey::new("Ping", "abc123", DEFAULT_PLACE);
        let mut perm = Permission::allow(key, true);
        assert!(perm.starts_automatically());

        perm.allowed = false;
        assert!(!perm.starts_automatically());
    }

    #[test]
    fn test_validate_blank_place() {
        let perm = Permission::deny(PermissionKey::new("Ping", "abc123", " "));
        assert!(perm.validate().is_err());
    }

    #[test]
    fn test_key_display() {
        let key = PermissionKey::new("Ping", "abc123", "Lab");
        assert_eq!(key.to_string(), "Ping/abc123@Lab");
    }

    #[test]
    fn test_default_place() {
        assert!(Place::new(DEFAULT_PLACE).is_default());
        assert!(!Place::new("Lab").is_default());
    }
}
