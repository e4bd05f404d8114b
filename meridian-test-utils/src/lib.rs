//! Meridian Test Utilities
//!
//! Shared test infrastructure for the Meridian workspace:
//! - Proptest generators for the data model
//! - Sample agents and their factories
//! - A recording listener and scripted/loopback transports
//! - Station fixtures backed by a temporary data directory
//! - Custom assertions for the error taxonomy

// Re-export core types for convenience
pub use meridian_core::{
    compute_content_hash, AgentIdentity, AgentState, EntityKind, Instance, InstanceKey, Location,
    Permission, PermissionKey, Place, Recurrence, RepeatPolicy, Schedule, StationError,
    StationResult, Timestamp, TransportError, DEFAULT_PLACE,
};
pub use meridian_events::{MigrationOutcome, StationEvent};
pub use meridian_storage::InMemoryRegistry;

use chrono::Utc;

// ============================================================================
// SAMPLE AGENTS
// ============================================================================

pub mod agents {
    //! Small agents exercising each part of the capability contract.

    use super::*;
    use meridian_agents::{Agent, AgentAssistant, AgentFactory, Collaboration};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    pub const PARKING_CLASS: &str = "meridian.samples.Parking";
    pub const COUNTER_CLASS: &str = "meridian.samples.Counter";
    pub const ECHO_CLASS: &str = "meridian.samples.Echo";
    pub const ONE_SHOT_CLASS: &str = "meridian.samples.OneShot";

    /// Parks in the wait gate until stopped.
    #[derive(Debug, Default)]
    pub struct ParkingAgent;

    impl Agent for ParkingAgent {
        fn run(&self, assistant: &AgentAssistant, instance: &Instance) {
            assistant.log().info(format!("listening in {}", instance.place));
            while assistant.is_active() {
                assistant.start_waiting();
            }
        }
    }

    /// Counts its starts and carries the count across migrations.
    #[derive(Debug, Default)]
    pub struct CounterAgent {
        starts: AtomicU64,
    }

    impl CounterAgent {
        pub fn with_count(count: u64) -> Self {
            Self {
                starts: AtomicU64::new(count),
            }
        }

        pub fn count(&self) -> u64 {
            self.starts.load(Ordering::SeqCst)
        }
    }

    impl Agent for CounterAgent {
        fn run(&self, assistant: &AgentAssistant, _instance: &Instance) {
            let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
            assistant.log().info(format!("start #{}", n));
            while assistant.is_active() {
                assistant.start_waiting();
            }
        }

        fn snapshot(&self) -> Value {
            json!({ "starts": self.count() })
        }
    }

    /// Collaborator answering `{"echo": message}` while parked.
    #[derive(Debug, Default)]
    pub struct EchoAgent {
        served: AtomicU64,
    }

    impl Agent for EchoAgent {
        fn run(&self, assistant: &AgentAssistant, _instance: &Instance) {
            while assistant.is_active() {
                assistant.start_waiting();
            }
        }

        fn collaboration(&self) -> Option<&dyn Collaboration> {
            Some(self)
        }
    }

    impl Collaboration for EchoAgent {
        fn communicate(&self, message: Value) -> Value {
            let served = self.served.fetch_add(1, Ordering::SeqCst) + 1;
            json!({ "echo": message, "served": served })
        }
    }

    /// Logs its parameters and returns.
    #[derive(Debug, Default)]
    pub struct OneShotAgent;

    impl Agent for OneShotAgent {
        fn run(&self, assistant: &AgentAssistant, instance: &Instance) {
            assistant
                .log()
                .info(format!("one shot with {:?}", instance.parameters));
        }
    }

    /// Factory for every sample class.
    #[derive(Debug, Clone, Copy)]
    pub struct SampleFactory(pub &'static str);

    impl AgentFactory for SampleFactory {
        fn create(&self, _parameters: &[String]) -> StationResult<Arc<dyn Agent>> {
            self.restore(Value::Null)
        }

        fn restore(&self, state: Value) -> StationResult<Arc<dyn Agent>> {
            let agent: Arc<dyn Agent> = match self.0 {
                PARKING_CLASS => Arc::new(ParkingAgent),
                COUNTER_CLASS => Arc::new(CounterAgent::with_count(
                    state.get("starts").and_then(Value::as_u64).unwrap_or(0),
                )),
                ECHO_CLASS => Arc::new(EchoAgent::default()),
                _ => Arc::new(OneShotAgent),
            };
            Ok(agent)
        }
    }

    /// Catalog with every sample class registered.
    pub fn sample_catalog() -> meridian_agents::AgentCatalog {
        [PARKING_CLASS, COUNTER_CLASS, ECHO_CLASS, ONE_SHOT_CLASS]
            .into_iter()
            .fold(meridian_agents::AgentCatalog::new(), |catalog, class| {
                catalog.with(class, Arc::new(SampleFactory(class)))
            })
    }
}

// ============================================================================
// LISTENERS
// ============================================================================

pub mod listeners {
    //! Event recording for assertions on notification order.

    use super::*;
    use meridian_events::StationListener;
    use std::sync::{Mutex, PoisonError};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Keeps every event it is notified of.
    #[derive(Debug, Default)]
    pub struct RecordingListener {
        events: Mutex<Vec<StationEvent>>,
    }

    impl RecordingListener {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<StationEvent> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Operation names in notification order.
        pub fn operations(&self) -> Vec<&'static str> {
            self.events().iter().map(|e| e.operation_name()).collect()
        }

        /// Operation names of events about one instance, agent log lines
        /// excluded.
        pub fn operations_for(&self, key: &InstanceKey) -> Vec<&'static str> {
            self.events()
                .iter()
                .filter(|e| e.instance().is_some_and(|i| &i.key() == key))
                .map(|e| e.operation_name())
                .collect()
        }

        pub fn migration_outcomes(&self) -> Vec<MigrationOutcome> {
            self.events()
                .iter()
                .filter_map(|e| e.migration_outcome())
                .collect()
        }

        pub fn count(&self, operation: &str) -> usize {
            self.operations().iter().filter(|op| **op == operation).count()
        }

        /// Log messages published as `agentLog` events.
        pub fn log_messages(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    StationEvent::AgentLogged { entry, .. } => Some(entry.message),
                    _ => None,
                })
                .collect()
        }

        /// Poll until `operation` has been seen `times` times.
        pub fn wait_for(&self, operation: &str, times: usize, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.count(operation) >= times {
                    return true;
                }
                thread::sleep(Duration::from_millis(10));
            }
            self.count(operation) >= times
        }

        pub fn clear(&self) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    impl StationListener for RecordingListener {
        fn notify(&self, event: &StationEvent) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        }
    }
}

// ============================================================================
// TRANSPORTS
// ============================================================================

pub mod transports {
    //! In-process transports for migration tests.

    use super::*;
    use meridian_agents::{Endpoint, InboundHandler, RemoteTransport, TransferRequest};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, PoisonError, Weak};

    /// Transport that answers from a script and records transfers.
    #[derive(Debug)]
    pub struct ScriptedTransport {
        permission: Mutex<Result<Option<Permission>, TransportError>>,
        transfer: Mutex<Result<(), TransportError>>,
        queued: Mutex<VecDeque<Result<(), TransportError>>>,
        transfers: Mutex<Vec<TransferRequest>>,
    }

    impl Default for ScriptedTransport {
        fn default() -> Self {
            Self {
                permission: Mutex::new(Ok(None)),
                transfer: Mutex::new(Ok(())),
                queued: Mutex::new(VecDeque::new()),
                transfers: Mutex::new(Vec::new()),
            }
        }
    }

    pub fn unreachable(endpoint: &Endpoint) -> TransportError {
        TransportError::Unreachable {
            endpoint: endpoint.to_string(),
            reason: "connection refused".to_string(),
        }
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn answer_permission(&self, answer: Result<Option<Permission>, TransportError>) {
            *self.permission.lock().unwrap_or_else(PoisonError::into_inner) = answer;
        }

        pub fn answer_transfer(&self, answer: Result<(), TransportError>) {
            *self.transfer.lock().unwrap_or_else(PoisonError::into_inner) = answer;
        }

        /// Answer the next transfer with `answer`, ahead of the standing one.
        pub fn queue_transfer(&self, answer: Result<(), TransportError>) {
            self.queued
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(answer);
        }

        pub fn transfers(&self) -> Vec<TransferRequest> {
            self.transfers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl RemoteTransport for ScriptedTransport {
        fn lookup_permission(
            &self,
            _endpoint: &Endpoint,
            _agent_name: &str,
            _agent_short_id: &str,
            _place: &str,
        ) -> Result<Option<Permission>, TransportError> {
            self.permission
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        fn transfer_agent(
            &self,
            _endpoint: &Endpoint,
            request: TransferRequest,
        ) -> Result<(), TransportError> {
            self.transfers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            if let Some(answer) = self
                .queued
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                return answer;
            }
            self.transfer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    /// Routes calls straight into peer stations of the same process.
    #[derive(Default)]
    pub struct LoopbackTransport {
        peers: Mutex<HashMap<Endpoint, Weak<dyn InboundHandler>>>,
    }

    impl LoopbackTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn connect<H: InboundHandler + 'static>(&self, endpoint: Endpoint, handler: &Arc<H>) {
            let handler: Arc<dyn InboundHandler> = handler.clone();
            self.peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(endpoint, Arc::downgrade(&handler));
        }

        fn peer(&self, endpoint: &Endpoint) -> Result<Arc<dyn InboundHandler>, TransportError> {
            self.peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(endpoint)
                .and_then(Weak::upgrade)
                .ok_or_else(|| unreachable(endpoint))
        }
    }

    fn rejected(endpoint: &Endpoint, err: StationError) -> TransportError {
        TransportError::package_missing(endpoint, &err).unwrap_or_else(|| {
            TransportError::Rejected {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        })
    }

    impl RemoteTransport for LoopbackTransport {
        fn lookup_permission(
            &self,
            endpoint: &Endpoint,
            agent_name: &str,
            agent_short_id: &str,
            place: &str,
        ) -> Result<Option<Permission>, TransportError> {
            self.peer(endpoint)?
                .lookup_permission(agent_name, agent_short_id, place)
                .map_err(|e| rejected(endpoint, e))
        }

        fn transfer_agent(
            &self,
            endpoint: &Endpoint,
            request: TransferRequest,
        ) -> Result<(), TransportError> {
            self.peer(endpoint)?
                .accept_transfer(request)
                .map_err(|e| rejected(endpoint, e))
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for the Meridian data model.

    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use proptest::prelude::*;

    /// Generate a Timestamp (DateTime<Utc>).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-2030, with sub-second precision
        (1577836800i64..1893456000i64, 0u32..1_000_000_000).prop_map(|(secs, nanos)| {
            chrono::DateTime::from_timestamp(secs, nanos).unwrap_or_else(Utc::now)
        })
    }

    /// Generate a wall-clock datetime, minute precision.
    pub fn arb_naive_datetime() -> impl Strategy<Value = NaiveDateTime> {
        (0i64..(365 * 24 * 60)).prop_map(|minutes| {
            NaiveDate::from_ymd_opt(2026, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or_default()
                + chrono::Duration::minutes(minutes)
        })
    }

    pub fn arb_identity() -> impl Strategy<Value = AgentIdentity> {
        (
            "[A-Z][a-z]{2,10}",
            "[a-z]{2,6}\\.[a-z]{2,6}\\.[A-Z][a-z]{2,8}",
            "[A-Z][a-z]{2,10}",
            "[0-9a-f]{64}",
            0u32..10,
            0u32..10,
        )
            .prop_map(|(name, class_name, organisation, hash, major, minor)| {
                AgentIdentity {
                    description: format!("{} agent", name),
                    package: format!("/srv/packages/{}.pkg", name.to_lowercase()),
                    name,
                    class_name,
                    organisation,
                    hash,
                    major,
                    minor,
                }
            })
    }

    pub fn arb_instance() -> impl Strategy<Value = Instance> {
        (
            arb_identity(),
            arb_timestamp(),
            prop::collection::vec("[a-z0-9]{1,8}", 0..4),
        )
            .prop_map(|(identity, created_at, parameters)| {
                Instance::new(identity, created_at, DEFAULT_PLACE, parameters)
            })
    }

    pub fn arb_repeat_policy() -> impl Strategy<Value = RepeatPolicy> {
        prop_oneof![Just(RepeatPolicy::Hourly), Just(RepeatPolicy::Daily)]
    }

    pub fn arb_schedule() -> impl Strategy<Value = Schedule> {
        (
            arb_naive_datetime(),
            prop::option::of((arb_repeat_policy(), 1u32..6, 1u32..8)),
        )
            .prop_map(|(start, repeat)| match repeat {
                Some((policy, interval, occurrences)) => {
                    Schedule::recurring(1, start, policy, interval, occurrences)
                }
                None => Schedule::once(1, start),
            })
    }

    pub fn arb_permission() -> impl Strategy<Value = Permission> {
        (
            "[A-Z][a-z]{2,10}",
            "[0-9a-f]{6}",
            "[A-Z][a-z]{2,10}",
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(name, short_id, place, allowed, auto_start)| Permission {
                key: PermissionKey::new(name, short_id, place),
                allowed,
                auto_start,
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Stations assembled over a temporary data directory.

    use super::*;
    use crate::agents::sample_catalog;
    use crate::listeners::RecordingListener;
    use meridian_agents::{AgentStation, Endpoint, RemoteTransport};
    use meridian_storage::PackageStore;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// One booted station with in-memory registry, sample catalog and a
    /// recorder registered after boot.
    pub struct StationHarness {
        pub station: Arc<AgentStation>,
        pub registry: Arc<InMemoryRegistry>,
        pub recorder: Arc<RecordingListener>,
        pub endpoint: Endpoint,
        dir: TempDir,
    }

    impl StationHarness {
        pub fn new(host: &str, port: u16, transport: Arc<dyn RemoteTransport>) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let registry = Arc::new(InMemoryRegistry::new());
            let packages = PackageStore::new(dir.path().join("packages"))
                .expect("package store");
            let endpoint = Endpoint::new(host, port);
            let station = AgentStation::builder(endpoint.clone(), registry.clone(), packages)
                .with_transport(transport)
                .with_loader(Arc::new(sample_catalog()))
                .with_log_capacity(32)
                .build();
            station.boot().expect("boot");
            let recorder = Arc::new(RecordingListener::new());
            station.register_listener(recorder.clone());
            Self {
                station,
                registry,
                recorder,
                endpoint,
                dir,
            }
        }

        /// Directory outside the package cache holding source packages.
        pub fn source_dir(&self) -> PathBuf {
            let dir = self.dir.path().join("sources");
            fs::create_dir_all(&dir).expect("sources dir");
            dir
        }

        pub fn package_dir(&self) -> PathBuf {
            self.dir.path().join("packages")
        }

        /// Where this station caches the package build of `instance`.
        pub fn cached_package(&self, instance: &Instance) -> PathBuf {
            self.package_dir()
                .join(instance.identity.hash.to_ascii_lowercase())
                .join(instance.identity.package_name())
        }

        /// Write a source package for `class_name` and return an instance of
        /// it named `name` in the default place.
        pub fn instance(&self, name: &str, class_name: &str) -> Instance {
            let content = format!("package of {}", class_name);
            let path = self.source_dir().join(format!("{}.pkg", name.to_lowercase()));
            fs::write(&path, content.as_bytes()).expect("write package");
            let identity = AgentIdentity {
                name: name.to_string(),
                class_name: class_name.to_string(),
                organisation: "Meridian".to_string(),
                hash: compute_content_hash(content.as_bytes()),
                major: 1,
                minor: 0,
                description: format!("{} sample agent", name),
                package: path.display().to_string(),
            };
            Instance::new(identity, Utc::now(), DEFAULT_PLACE, vec![])
        }

        pub fn allow(&self, instance: &Instance, place: &str, auto_start: bool) {
            self.station
                .set_permission(Permission::allow(
                    PermissionKey::for_instance(instance, place),
                    auto_start,
                ))
                .expect("allow");
        }

        pub fn deny(&self, instance: &Instance, place: &str) {
            self.station
                .set_permission(Permission::deny(PermissionKey::for_instance(instance, place)))
                .expect("deny");
        }
    }

    impl Drop for StationHarness {
        fn drop(&mut self) {
            self.station.shutdown();
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the station error taxonomy.

    use super::*;

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &StationResult<T>) {
        match result {
            Err(StationError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &StationResult<T>, entity: EntityKind) {
        match result {
            Err(StationError::NotFound(e)) => {
                assert_eq!(e.entity, entity, "Wrong entity in NotFound error");
            }
            other => panic!("Expected NotFound error for {}, got: {:?}", entity, other),
        }
    }

    #[track_caller]
    pub fn assert_transport_error<T: std::fmt::Debug>(result: &StationResult<T>) {
        match result {
            Err(StationError::Transport(_)) => {}
            other => panic!("Expected Transport error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_integrity_error<T: std::fmt::Debug>(result: &StationResult<T>) {
        match result {
            Err(StationError::Integrity(_)) => {}
            other => panic!("Expected Integrity error, got: {:?}", other),
        }
    }
}
