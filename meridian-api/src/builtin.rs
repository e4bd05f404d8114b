//! Agent classes every station binary can host without extra packages.

use meridian_agents::{Agent, AgentAssistant, AgentCatalog, AgentFactory, Collaboration};
use meridian_core::{Instance, StationResult};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const IDLE_CLASS: &str = "meridian.builtin.Idle";
pub const ECHO_CLASS: &str = "meridian.builtin.Echo";

/// Parks until stopped. Its start count survives migration.
#[derive(Debug, Default)]
pub struct IdleAgent {
    starts: AtomicU64,
}

impl Agent for IdleAgent {
    fn run(&self, assistant: &AgentAssistant, instance: &Instance) {
        let starts = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        assistant
            .log()
            .info(format!("idle in {} (start {})", instance.place, starts));
        while assistant.is_active() {
            assistant.start_waiting();
        }
    }

    fn snapshot(&self) -> Value {
        json!({ "starts": self.starts.load(Ordering::SeqCst) })
    }
}

/// Answers collaborators with the message it was sent.
#[derive(Debug, Default)]
pub struct EchoAgent {
    served: AtomicU64,
}

impl Agent for EchoAgent {
    fn run(&self, assistant: &AgentAssistant, _instance: &Instance) {
        assistant.log().info("echo ready");
        while assistant.is_active() {
            assistant.start_waiting();
        }
    }

    fn snapshot(&self) -> Value {
        json!({ "served": self.served.load(Ordering::SeqCst) })
    }

    fn collaboration(&self) -> Option<&dyn Collaboration> {
        Some(self)
    }
}

impl Collaboration for EchoAgent {
    fn communicate(&self, message: Value) -> Value {
        self.served.fetch_add(1, Ordering::SeqCst);
        json!({ "echo": message })
    }
}

fn counter(state: &Value, field: &str) -> AtomicU64 {
    AtomicU64::new(state.get(field).and_then(Value::as_u64).unwrap_or(0))
}

struct IdleFactory;

impl AgentFactory for IdleFactory {
    fn create(&self, _parameters: &[String]) -> StationResult<Arc<dyn Agent>> {
        Ok(Arc::new(IdleAgent::default()))
    }

    fn restore(&self, state: Value) -> StationResult<Arc<dyn Agent>> {
        Ok(Arc::new(IdleAgent {
            starts: counter(&state, "starts"),
        }))
    }
}

struct EchoFactory;

impl AgentFactory for EchoFactory {
    fn create(&self, _parameters: &[String]) -> StationResult<Arc<dyn Agent>> {
        Ok(Arc::new(EchoAgent::default()))
    }

    fn restore(&self, state: Value) -> StationResult<Arc<dyn Agent>> {
        Ok(Arc::new(EchoAgent {
            served: counter(&state, "served"),
        }))
    }
}

/// Catalog holding the built-in classes.
pub fn builtin_catalog() -> AgentCatalog {
    AgentCatalog::new()
        .with(IDLE_CLASS, Arc::new(IdleFactory))
        .with(ECHO_CLASS, Arc::new(EchoFactory))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lists_builtins() {
        assert_eq!(builtin_catalog().class_names(), vec![ECHO_CLASS, IDLE_CLASS]);
    }

    #[test]
    fn test_idle_restores_start_count() {
        let agent = IdleFactory.restore(json!({ "starts": 4 })).unwrap();
        assert_eq!(agent.snapshot(), json!({ "starts": 4 }));
        assert!(agent.collaboration().is_none());
    }

    #[test]
    fn test_echo_collaborates() {
        let agent = EchoFactory.create(&[]).unwrap();
        let reply = agent
            .collaboration()
            .map(|c| c.communicate(json!("ping")));
        assert_eq!(reply, Some(json!({ "echo": "ping" })));
        assert_eq!(agent.snapshot(), json!({ "served": 1 }));
    }
}
