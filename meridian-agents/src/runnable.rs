//! Per-agent thread and state machine.
//!
//! ```text
//! Inactive --start()--> Active --stop() / run returns--> Inactive
//! ```
//!
//! Each start spawns one named thread that calls [`Agent::run`]. The active
//! flag is flipped with compare-and-swap so that a `stop()` racing with the
//! natural end of `run` produces exactly one `stop` notification.

use crate::assistant::AgentAssistant;
use crate::capability::Agent;
use crate::gate::WaitGate;
use crate::log::AgentLog;
use meridian_core::{AgentError, AgentState, Instance, InstanceKey, StationResult};
use meridian_events::{StationEvent, StationMessenger};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Concurrency wrapper around one live agent.
pub struct AgentRunnable {
    key: InstanceKey,
    instance: RwLock<Instance>,
    agent: Arc<dyn Agent>,
    active: Arc<AtomicBool>,
    gate: Arc<WaitGate>,
    log: Arc<AgentLog>,
    assistant: AgentAssistant,
    messenger: Arc<StationMessenger>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRunnable {
    pub(crate) fn new(
        instance: Instance,
        agent: Arc<dyn Agent>,
        log: Arc<AgentLog>,
        messenger: Arc<StationMessenger>,
        assistant: impl FnOnce(Arc<WaitGate>, Arc<AgentLog>, Arc<AtomicBool>) -> AgentAssistant,
    ) -> Self {
        let gate = Arc::new(WaitGate::new());
        let active = Arc::new(AtomicBool::new(false));
        let assistant = assistant(Arc::clone(&gate), Arc::clone(&log), Arc::clone(&active));
        let mut instance = instance;
        instance.state = AgentState::Inactive;
        Self {
            key: instance.key(),
            instance: RwLock::new(instance),
            agent,
            active,
            gate,
            log,
            assistant,
            messenger,
            thread: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    /// Copy of the current instance record.
    pub fn instance(&self) -> Instance {
        self.instance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn update_instance<F: FnOnce(&mut Instance)>(&self, apply: F) -> Instance {
        let mut instance = self.instance.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut instance);
        instance.clone()
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn log(&self) -> &Arc<AgentLog> {
        &self.log
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_waiting(&self) -> bool {
        self.gate.is_waiting()
    }

    fn transition(&self, state: AgentState) -> Instance {
        self.update_instance(|instance| instance.state = state)
    }

    /// Start the agent on a new thread. Returns false if it was already
    /// active.
    pub fn start(self: &Arc<Self>) -> StationResult<bool> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        self.gate.open();
        let instance = self.transition(AgentState::Active);
        let thread_name = format!("{}-{}", instance.identity.name, instance.short_id());
        self.messenger
            .publish(StationEvent::AgentStarted { instance });

        let runnable = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || runnable.run_to_completion());

        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                debug!(thread = %thread_name, "Agent thread started");
                Ok(true)
            }
            Err(e) => {
                if self
                    .active
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let instance = self.transition(AgentState::Inactive);
                    self.messenger
                        .publish(StationEvent::AgentStopped { instance });
                }
                Err(AgentError::SpawnFailed {
                    agent: thread_name,
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    fn run_to_completion(&self) {
        let instance = self.instance();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.agent.run(&self.assistant, &instance)
        }));
        if outcome.is_err() {
            error!(agent = %instance.identity.name, short_id = %instance.short_id(), "Agent panicked");
            self.log.error("agent terminated abnormally");
        }

        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.gate.close();
            let instance = self.transition(AgentState::Inactive);
            self.messenger
                .publish(StationEvent::AgentStopped { instance });
        }
    }

    /// Stop the agent cooperatively. Returns false if it was not active.
    ///
    /// The thread is not interrupted; it ends once `run` returns.
    pub fn stop(&self) -> bool {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let instance = self.transition(AgentState::Inactive);
        self.messenger
            .publish(StationEvent::AgentStopped { instance });
        self.agent.halt(&self.assistant);
        self.gate.close();
        true
    }

    /// Wait for the current agent thread to finish. Returns immediately when
    /// called from that thread or when no thread was started.
    pub fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                debug!(agent = %self.key, "Agent thread ended with a panic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{instance, runnable, OneShot, Parker};
    use std::sync::Mutex as StdMutex;

    fn recorder(messenger: &StationMessenger) -> Arc<StdMutex<Vec<&'static str>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        messenger.register(Arc::new(move |event: &StationEvent| {
            if matches!(
                event,
                StationEvent::AgentStarted { .. } | StationEvent::AgentStopped { .. }
            ) {
                sink.lock().unwrap().push(event.operation_name());
            }
        }));
        seen
    }

    #[test]
    fn test_start_then_stop_parker() -> StationResult<()> {
        let messenger = Arc::new(StationMessenger::default());
        let seen = recorder(&messenger);
        let r = runnable(instance("Parker"), Arc::new(Parker), &messenger);

        assert!(r.start()?);
        assert!(!r.start()?);
        assert!(r.is_active());
        assert_eq!(r.instance().state, AgentState::Active);

        assert!(r.stop());
        assert!(!r.stop());
        r.join();
        assert!(!r.is_active());
        assert_eq!(r.instance().state, AgentState::Inactive);
        assert_eq!(*seen.lock().unwrap(), vec!["start", "stop"]);
        Ok(())
    }

    #[test]
    fn test_natural_completion_stops_once() -> StationResult<()> {
        let messenger = Arc::new(StationMessenger::default());
        let seen = recorder(&messenger);
        let r = runnable(instance("Once"), Arc::new(OneShot), &messenger);

        r.start()?;
        r.join();
        assert!(!r.is_active());
        assert!(!r.stop());
        assert_eq!(*seen.lock().unwrap(), vec!["start", "stop"]);
        Ok(())
    }

    #[test]
    fn test_restart_after_stop() -> StationResult<()> {
        let messenger = Arc::new(StationMessenger::default());
        let seen = recorder(&messenger);
        let r = runnable(instance("Parker"), Arc::new(Parker), &messenger);

        r.start()?;
        r.stop();
        r.join();
        assert!(r.start()?);
        r.stop();
        r.join();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["start", "stop", "start", "stop"]
        );
        Ok(())
    }

    #[test]
    fn test_thread_is_named_after_agent() -> StationResult<()> {
        let messenger = Arc::new(StationMessenger::default());
        let inst = instance("Namer");
        let expected = format!("Namer-{}", inst.short_id());
        let r = runnable(inst, Arc::new(OneShot), &messenger);
        r.start()?;
        r.join();
        let lines: Vec<String> = r.log().entries().into_iter().map(|e| e.message).collect();
        assert!(lines.contains(&format!("ran on {}", expected)));
        Ok(())
    }
}
