//! Meridian Events - Station Notification Bus
//!
//! This crate defines the events a station emits and the messenger that
//! fans them out to listeners.
//!
//! # Key Types
//!
//! - `StationEvent`: one notification (`createAgent`, `start`, `migrateAgent`, ...)
//! - `StationListener`: synchronous consumer
//! - `StationMessenger`: the bus, owned by the station
//! - `LogEntry`: payload of `agentLog` notifications

mod event;
mod messenger;

pub use event::{LogEntry, LogLevel, MigrationOutcome, StationEvent};
pub use messenger::{ListenerId, StationListener, StationMessenger};
