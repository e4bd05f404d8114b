//! Bounded per-agent log.

use meridian_core::{Instance, InstanceKey};
use meridian_events::{LogEntry, LogLevel, StationEvent, StationMessenger};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

/// Fixed-capacity log of one agent. The oldest entry is evicted first.
///
/// Every entry is mirrored to `tracing` and published as an `agentLog`
/// event.
pub struct AgentLog {
    key: InstanceKey,
    agent: String,
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    messenger: Arc<StationMessenger>,
}

impl AgentLog {
    pub fn new(instance: &Instance, capacity: usize, messenger: Arc<StationMessenger>) -> Self {
        let capacity = capacity.max(1);
        Self {
            key: instance.key(),
            agent: instance.identity.name.clone(),
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            messenger,
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogEntry::info(message));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogEntry::warn(message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogEntry::error(message));
    }

    pub fn push(&self, entry: LogEntry) {
        let short_id = self.key.short_id();
        match entry.level {
            LogLevel::Info => info!(agent = %self.agent, short_id = %short_id, "{}", entry.message),
            LogLevel::Warn => warn!(agent = %self.agent, short_id = %short_id, "{}", entry.message),
            LogLevel::Error => error!(agent = %self.agent, short_id = %short_id, "{}", entry.message),
        }

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        self.messenger.publish(StationEvent::AgentLogged {
            key: self.key.clone(),
            agent: self.agent.clone(),
            entry,
        });
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::instance;

    #[test]
    fn test_evicts_oldest_first() {
        let log = AgentLog::new(&instance("Ping"), 3, Arc::new(StationMessenger::default()));
        for i in 0..5 {
            log.info(format!("line {}", i));
        }
        let messages: Vec<String> = log.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(log.len(), log.capacity());
    }

    #[test]
    fn test_entries_are_published() {
        let messenger = Arc::new(StationMessenger::default());
        let mut rx = messenger.subscribe();
        let inst = instance("Ping");
        let log = AgentLog::new(&inst, 10, Arc::clone(&messenger));
        log.warn("careful");

        match rx.try_recv().unwrap() {
            StationEvent::AgentLogged { key, agent, entry } => {
                assert_eq!(key, inst.key());
                assert_eq!(agent, "Ping");
                assert_eq!(entry.level, LogLevel::Warn);
                assert_eq!(entry.message, "careful");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let log = AgentLog::new(&instance("Ping"), 0, Arc::new(StationMessenger::default()));
        log.info("a");
        log.info("b");
        assert_eq!(log.len(), 1);
        assert!(!log.is_empty());
    }
}
