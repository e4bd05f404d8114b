//! Meridian Agents - Station Runtime
//!
//! Hosts mobile agents: one thread per running agent, cooperative stop,
//! a self-rearming scheduler, local collaboration and migration to peer
//! stations over a pluggable transport.
//!
//! # Layers
//!
//! - `Agent` / `Collaboration` / `AgentFactory`: what agent code implements
//! - `AgentRunnable`: thread + state machine around one agent
//! - `AgentManager`: live table, lifecycle, migration, schedules
//! - `PlaceManager`: places of a station
//! - `AgentStation`: validated facade used by operators and peer stations

mod assistant;
mod capability;
mod catalog;
mod gate;
mod log;
mod manager;
mod place;
mod runnable;
mod scheduler;
mod station;
mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use assistant::AgentAssistant;
pub use capability::{Agent, AgentFactory, Collaboration, CollaborationHandle};
pub use catalog::{AgentCatalog, PackageLoader};
pub use gate::WaitGate;
pub use log::AgentLog;
pub use manager::{AgentManager, ManagerParts};
pub use place::PlaceManager;
pub use runnable::AgentRunnable;
pub use scheduler::ScheduleTimers;
pub use station::{AgentStation, BootReport, CreateOutcome, RegistrySync, StationBuilder};
pub use transport::{
    DisconnectedTransport, Endpoint, InboundHandler, RemoteTransport, TransferRequest,
};
