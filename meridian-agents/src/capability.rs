//! Agent capability contract.
//!
//! Agent code implements [`Agent`]. An agent that can answer in-process
//! requests from its neighbours also exposes a [`Collaboration`]. Packages
//! provide an [`AgentFactory`] per implementation class so the station can
//! build fresh agents and rebuild migrated ones from their snapshot.

use crate::assistant::AgentAssistant;
use meridian_core::{Instance, InstanceKey, StationResult};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Behaviour of one agent implementation.
pub trait Agent: Send + Sync + 'static {
    /// Entry point, called on the agent's own thread each time it starts.
    fn run(&self, assistant: &AgentAssistant, instance: &Instance);

    /// Called when the agent is stopped from outside. Must release any
    /// wait the agent is parked in.
    fn halt(&self, assistant: &AgentAssistant) {
        assistant.stop_waiting();
    }

    /// State carried across a migration.
    fn snapshot(&self) -> Value {
        Value::Null
    }

    /// The collaboration capability, if this agent offers one.
    fn collaboration(&self) -> Option<&dyn Collaboration> {
        None
    }
}

/// Synchronous in-process request/response offered to agents in the same
/// place. Runs on the caller's thread; implementors guard their own state.
pub trait Collaboration: Send + Sync {
    fn communicate(&self, message: Value) -> Value;
}

/// Builds agents of one implementation class.
pub trait AgentFactory: Send + Sync {
    /// New agent for a fresh instance.
    fn create(&self, parameters: &[String]) -> StationResult<Arc<dyn Agent>>;

    /// Agent rebuilt from a migration snapshot.
    fn restore(&self, state: Value) -> StationResult<Arc<dyn Agent>>;
}

/// Handle to a collaborating agent found by
/// [`AgentManager::collaborate`](crate::AgentManager::collaborate).
#[derive(Clone)]
pub struct CollaborationHandle {
    key: InstanceKey,
    agent: Arc<dyn Agent>,
}

impl CollaborationHandle {
    pub(crate) fn new(key: InstanceKey, agent: Arc<dyn Agent>) -> Self {
        Self { key, agent }
    }

    /// Instance that answers.
    pub fn target(&self) -> &InstanceKey {
        &self.key
    }

    pub fn communicate(&self, message: Value) -> Value {
        match self.agent.collaboration() {
            Some(collaboration) => collaboration.communicate(message),
            None => Value::Null,
        }
    }
}

impl fmt::Debug for CollaborationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollaborationHandle")
            .field("target", &self.key)
            .finish()
    }
}
