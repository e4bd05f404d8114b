//! Station services available to running agent code.

use crate::capability::CollaborationHandle;
use crate::gate::WaitGate;
use crate::log::AgentLog;
use crate::manager::AgentManager;
use crate::transport::Endpoint;
use meridian_core::{AgentError, InstanceKey, StationResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Per-agent handle passed to [`Agent::run`](crate::Agent::run) and
/// [`Agent::halt`](crate::Agent::halt).
#[derive(Clone)]
pub struct AgentAssistant {
    key: InstanceKey,
    gate: Arc<WaitGate>,
    log: Arc<AgentLog>,
    active: Arc<AtomicBool>,
    manager: Weak<AgentManager>,
}

impl AgentAssistant {
    pub(crate) fn new(
        key: InstanceKey,
        gate: Arc<WaitGate>,
        log: Arc<AgentLog>,
        active: Arc<AtomicBool>,
        manager: Weak<AgentManager>,
    ) -> Self {
        Self {
            key,
            gate,
            log,
            active,
            manager,
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    /// Park the calling thread until [`AgentAssistant::stop_waiting`] is
    /// called or the agent is stopped.
    pub fn start_waiting(&self) {
        self.gate.park();
    }

    pub fn stop_waiting(&self) {
        self.gate.unpark();
    }

    pub fn is_waiting(&self) -> bool {
        self.gate.is_waiting()
    }

    /// False once the agent has been stopped. Loops in `run` should check it.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn log(&self) -> &AgentLog {
        &self.log
    }

    /// Find an active collaborator in this agent's place.
    pub fn collaborate(
        &self,
        name: &str,
        organisation: &str,
        major: u32,
        minor: u32,
    ) -> Option<CollaborationHandle> {
        self.manager
            .upgrade()?
            .collaborate(&self.key, name, organisation, major, minor)
    }

    /// Move this agent to another station. The agent is stopped first, so
    /// `run` should return soon after this call.
    pub fn migrate(&self, destination: Endpoint, place: &str) -> StationResult<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or(AgentError::ShuttingDown)?;
        manager.migrate(&self.key, &destination, place)
    }
}
