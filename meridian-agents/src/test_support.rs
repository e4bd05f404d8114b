use crate::assistant::AgentAssistant;
use crate::capability::{Agent, AgentFactory, Collaboration};
use crate::log::AgentLog;
use crate::runnable::AgentRunnable;
use chrono::Utc;
use meridian_core::{AgentIdentity, Instance, StationResult, DEFAULT_PLACE};
use meridian_events::StationMessenger;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::thread;

pub(crate) fn instance(name: &str) -> Instance {
    let identity = AgentIdentity {
        name: name.to_string(),
        class_name: format!("agents.{}", name),
        organisation: "Meridian".to_string(),
        hash: "cd".repeat(32),
        major: 1,
        minor: 0,
        description: format!("{} test agent", name),
        package: format!("/tmp/{}.pkg", name.to_lowercase()),
    };
    Instance::new(identity, Utc::now(), DEFAULT_PLACE, vec![])
}

pub(crate) fn runnable(
    instance: Instance,
    agent: Arc<dyn Agent>,
    messenger: &Arc<StationMessenger>,
) -> Arc<AgentRunnable> {
    let key = instance.key();
    let log = Arc::new(AgentLog::new(&instance, 20, Arc::clone(messenger)));
    Arc::new(AgentRunnable::new(
        instance,
        agent,
        log,
        Arc::clone(messenger),
        move |gate, log, active| AgentAssistant::new(key, gate, log, active, Weak::new()),
    ))
}

/// Parks until stopped.
pub(crate) struct Parker;

impl Agent for Parker {
    fn run(&self, assistant: &AgentAssistant, _instance: &Instance) {
        while assistant.is_active() {
            assistant.start_waiting();
        }
    }
}

/// Logs its thread name and returns.
pub(crate) struct OneShot;

impl Agent for OneShot {
    fn run(&self, assistant: &AgentAssistant, _instance: &Instance) {
        let name = thread::current().name().unwrap_or("unnamed").to_string();
        assistant.log().info(format!("ran on {}", name));
    }
}

pub(crate) struct OneShotFactory;

impl AgentFactory for OneShotFactory {
    fn create(&self, _parameters: &[String]) -> StationResult<Arc<dyn Agent>> {
        Ok(Arc::new(OneShot))
    }

    fn restore(&self, _state: Value) -> StationResult<Arc<dyn Agent>> {
        Ok(Arc::new(OneShot))
    }
}

/// Parks until stopped and echoes collaboration requests.
pub(crate) struct Echo;

impl Agent for Echo {
    fn run(&self, assistant: &AgentAssistant, _instance: &Instance) {
        while assistant.is_active() {
            assistant.start_waiting();
        }
    }

    fn collaboration(&self) -> Option<&dyn Collaboration> {
        Some(self)
    }
}

impl Collaboration for Echo {
    fn communicate(&self, message: Value) -> Value {
        json!({ "echo": message })
    }
}
