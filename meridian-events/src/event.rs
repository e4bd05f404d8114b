//! Station event types.
//!
//! Every lifecycle transition the station performs is published as a
//! [`StationEvent`]. Presentation layers render them; the station itself
//! listens to keep the registry in step with live agents.

use chrono::Utc;
use meridian_core::{Instance, InstanceKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of an agent log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One line of an agent's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: Timestamp,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Outcome of a migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationOutcome {
    /// Destination refused the agent; it was removed locally
    NoPermission,
    /// Permission lookup at the destination failed
    RegistryCommFailed,
    /// Agent transfer to the destination failed
    StationCommFailed,
    Success,
}

impl MigrationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationOutcome::NoPermission => "noPermission",
            MigrationOutcome::RegistryCommFailed => "registryCommFailed",
            MigrationOutcome::StationCommFailed => "stationCommFailed",
            MigrationOutcome::Success => "success",
        }
    }
}

impl fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Station notification delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StationEvent {
    PlaceCreated {
        place: String,
    },
    PlaceRemoved {
        place: String,
    },
    AgentCreated {
        instance: Instance,
    },
    AgentRemoved {
        instance: Instance,
    },
    AgentStarted {
        instance: Instance,
    },
    AgentStopped {
        instance: Instance,
    },
    AgentLogged {
        key: InstanceKey,
        agent: String,
        entry: LogEntry,
    },
    AgentMigrated {
        instance: Instance,
        outcome: MigrationOutcome,
        destination: String,
    },
    ServerStarted {
        host: String,
        port: u16,
    },
}

impl StationEvent {
    /// Operation name as seen by presentation layers.
    pub fn operation_name(&self) -> &'static str {
        match self {
            StationEvent::PlaceCreated { .. } => "createPlace",
            StationEvent::PlaceRemoved { .. } => "removePlace",
            StationEvent::AgentCreated { .. } => "createAgent",
            StationEvent::AgentRemoved { .. } => "removeAgent",
            StationEvent::AgentStarted { .. } => "start",
            StationEvent::AgentStopped { .. } => "stop",
            StationEvent::AgentLogged { .. } => "agentLog",
            StationEvent::AgentMigrated { .. } => "migrateAgent",
            StationEvent::ServerStarted { .. } => "serverStart",
        }
    }

    /// Instance the event is about, if any.
    pub fn instance(&self) -> Option<&Instance> {
        match self {
            StationEvent::AgentCreated { instance }
            | StationEvent::AgentRemoved { instance }
            | StationEvent::AgentStarted { instance }
            | StationEvent::AgentStopped { instance }
            | StationEvent::AgentMigrated { instance, .. } => Some(instance),
            _ => None,
        }
    }

    /// Sub-reason for `migrateAgent` events.
    pub fn migration_outcome(&self) -> Option<MigrationOutcome> {
        match self {
            StationEvent::AgentMigrated { outcome, .. } => Some(*outcome),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        let event = StationEvent::PlaceCreated {
            place: "Lab".to_string(),
        };
        assert_eq!(event.operation_name(), "createPlace");
        assert!(event.instance().is_none());

        let event = StationEvent::ServerStarted {
            host: "alpha".to_string(),
            port: 7000,
        };
        assert_eq!(event.operation_name(), "serverStart");
    }

    #[test]
    fn test_migration_outcome_strings() {
        assert_eq!(MigrationOutcome::NoPermission.as_str(), "noPermission");
        assert_eq!(
            MigrationOutcome::RegistryCommFailed.to_string(),
            "registryCommFailed"
        );
        assert_eq!(MigrationOutcome::StationCommFailed.as_str(), "stationCommFailed");
        assert_eq!(MigrationOutcome::Success.as_str(), "success");
    }

    #[test]
    fn test_log_entry_display() {
        let entry = LogEntry::warn("allowed=false");
        let line = entry.to_string();
        assert!(line.contains("[WARN] allowed=false"));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = StationEvent::PlaceRemoved {
            place: "Lab".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PlaceRemoved");
        assert_eq!(json["place"], "Lab");
    }
}
