//! The station facade.
//!
//! [`AgentStation`] is the single entry point for presentation layers and
//! for inbound transfers from peer stations. It validates input, then
//! coordinates the [`AgentManager`], the [`PlaceManager`] and the registry.

use crate::capability::CollaborationHandle;
use crate::catalog::{AgentCatalog, PackageLoader};
use crate::manager::{AgentManager, ManagerParts};
use crate::place::PlaceManager;
use crate::runnable::AgentRunnable;
use crate::transport::{DisconnectedTransport, Endpoint, InboundHandler, RemoteTransport, TransferRequest};
use chrono::NaiveDateTime;
use meridian_core::{
    validate_place_name, AgentError, AgentState, EntityKind, Instance, InstanceKey, Location,
    Permission, PermissionKey, Place, Recurrence, Schedule, StationError, StationResult,
    DEFAULT_LOG_CAPACITY, DEFAULT_PLACE,
};
use meridian_events::{ListenerId, LogEntry, StationEvent, StationListener, StationMessenger};
use meridian_storage::{PackageStore, Registry};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// REGISTRY SYNC
// ============================================================================

/// Keeps the persisted ACTIVE/INACTIVE state in step with `start`/`stop`
/// notifications.
pub struct RegistrySync {
    registry: Arc<dyn Registry>,
}

impl RegistrySync {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    fn persist(&self, instance: &Instance, state: AgentState) {
        match self.registry.instance_update_state(&instance.key(), state) {
            Ok(()) => {}
            Err(StationError::NotFound(_)) => {
                debug!(short_id = %instance.short_id(), %state, "Instance not persisted, state not recorded")
            }
            Err(e) => warn!(short_id = %instance.short_id(), %state, error = %e, "Failed to persist agent state"),
        }
    }
}

impl StationListener for RegistrySync {
    fn notify(&self, event: &StationEvent) {
        match event {
            StationEvent::AgentStarted { instance } => self.persist(instance, AgentState::Active),
            StationEvent::AgentStopped { instance } => self.persist(instance, AgentState::Inactive),
            _ => {}
        }
    }
}

// ============================================================================
// BUILDER & OUTCOMES
// ============================================================================

/// Assembles an [`AgentStation`].
pub struct StationBuilder {
    local: Endpoint,
    registry: Arc<dyn Registry>,
    packages: PackageStore,
    transport: Arc<dyn RemoteTransport>,
    loader: Arc<dyn PackageLoader>,
    messenger: Arc<StationMessenger>,
    log_capacity: usize,
}

impl StationBuilder {
    pub fn with_transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn PackageLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_messenger(mut self, messenger: Arc<StationMessenger>) -> Self {
        self.messenger = messenger;
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn build(self) -> Arc<AgentStation> {
        let places = PlaceManager::new(Arc::clone(&self.registry), Arc::clone(&self.messenger));
        let manager = AgentManager::new(ManagerParts {
            local: self.local.clone(),
            registry: Arc::clone(&self.registry),
            messenger: Arc::clone(&self.messenger),
            transport: self.transport,
            packages: self.packages,
            log_capacity: self.log_capacity,
        });
        let sync_listener = self
            .messenger
            .register(Arc::new(RegistrySync::new(Arc::clone(&self.registry))));

        Arc::new(AgentStation {
            local: self.local,
            registry: self.registry,
            messenger: self.messenger,
            loader: self.loader,
            places,
            manager,
            sync_listener,
            closed: AtomicBool::new(false),
        })
    }
}

/// Result of [`AgentStation::create_agent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(InstanceKey),
    /// The instance is already live; nothing was done
    AlreadyPresent(InstanceKey),
    /// An explicit `allowed = false` permission refused the agent
    Refused(PermissionKey),
}

/// Summary of [`AgentStation::boot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReport {
    pub restored: usize,
    pub started: usize,
    pub failed: Vec<InstanceKey>,
}

// ============================================================================
// STATION
// ============================================================================

/// Station facade.
pub struct AgentStation {
    local: Endpoint,
    registry: Arc<dyn Registry>,
    messenger: Arc<StationMessenger>,
    loader: Arc<dyn PackageLoader>,
    places: PlaceManager,
    manager: Arc<AgentManager>,
    sync_listener: ListenerId,
    closed: AtomicBool,
}

impl AgentStation {
    /// Start assembling a station reachable at `local`. Defaults: no peers,
    /// an empty [`AgentCatalog`], a fresh messenger.
    pub fn builder(
        local: Endpoint,
        registry: Arc<dyn Registry>,
        packages: PackageStore,
    ) -> StationBuilder {
        StationBuilder {
            local,
            registry,
            packages,
            transport: Arc::new(DisconnectedTransport),
            loader: Arc::new(AgentCatalog::new()),
            messenger: Arc::new(StationMessenger::default()),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn messenger(&self) -> &Arc<StationMessenger> {
        &self.messenger
    }

    pub fn manager(&self) -> &Arc<AgentManager> {
        &self.manager
    }

    pub fn register_listener(&self, listener: Arc<dyn StationListener>) -> ListenerId {
        self.messenger.register(listener)
    }

    pub fn deregister_listener(&self, id: ListenerId) -> bool {
        self.messenger.deregister(id)
    }

    fn ensure_open(&self) -> StationResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AgentError::ShuttingDown.into());
        }
        Ok(())
    }

    fn auto_start(&self, instance: &Instance) -> StationResult<bool> {
        let key = PermissionKey::for_instance(instance, &instance.place);
        Ok(self
            .registry
            .permission_get(&key)?
            .is_some_and(|p| p.starts_automatically()))
    }

    /// Restore persisted agents, then announce the station.
    ///
    /// Every persisted instance is rebuilt inactive from its cached package;
    /// those whose permission asks for auto-start are started. Instances
    /// that cannot be rebuilt are reported and skipped.
    pub fn boot(&self) -> StationResult<BootReport> {
        self.ensure_open()?;
        self.places.ensure(DEFAULT_PLACE)?;

        let mut report = BootReport::default();
        for mut instance in self.registry.instance_list()? {
            let key = instance.key();
            if self.manager.is_live(&key) {
                continue;
            }
            if instance.is_active() {
                instance.state = AgentState::Inactive;
                self.registry
                    .instance_update_state(&key, AgentState::Inactive)?;
            }

            let auto_start = self.auto_start(&instance)?;
            match self.restore_persisted(instance) {
                Ok(runnable) => {
                    report.restored += 1;
                    if auto_start && runnable.start()? {
                        report.started += 1;
                    }
                }
                Err(e) => {
                    warn!(agent = %key, error = %e, "Failed to restore agent");
                    report.failed.push(key);
                }
            }
        }

        info!(
            host = %self.local.host,
            port = self.local.port,
            restored = report.restored,
            started = report.started,
            failed = report.failed.len(),
            "Station started"
        );
        self.messenger.publish(StationEvent::ServerStarted {
            host: self.local.host.clone(),
            port: self.local.port,
        });
        Ok(report)
    }

    fn restore_persisted(&self, instance: Instance) -> StationResult<Arc<AgentRunnable>> {
        self.places.ensure(&instance.place)?;
        let packages = self.manager.packages();
        let name = instance.identity.package_name();
        packages.verify(&name, &instance.identity.hash)?;
        let path = packages.path_for(&name, &instance.identity.hash)?;
        let agent = self.loader.load_agent(
            &path,
            &instance.identity.class_name,
            &instance.parameters,
        )?;
        self.manager.register_agent(instance, agent)
    }

    // ========================================================================
    // AGENTS
    // ========================================================================

    /// Create an agent locally from its package.
    ///
    /// An explicit `allowed = false` permission for the target place refuses
    /// the agent without an error; no permission at all lets it in without
    /// auto-start.
    pub fn create_agent(&self, mut instance: Instance) -> StationResult<CreateOutcome> {
        self.ensure_open()?;
        instance.identity.validate()?;
        validate_place_name(&instance.place)?;

        let key = instance.key();
        if self.manager.is_live(&key) {
            debug!(agent = %key, "Agent already live");
            return Ok(CreateOutcome::AlreadyPresent(key));
        }

        let permission_key = PermissionKey::for_instance(&instance, &instance.place);
        let permission = self.registry.permission_get(&permission_key)?;
        if permission.as_ref().is_some_and(|p| !p.allowed) {
            info!(permission = %permission_key, allowed = false, "Agent creation refused");
            self.messenger.publish(StationEvent::AgentLogged {
                key,
                agent: instance.identity.name.clone(),
                entry: LogEntry::warn(format!(
                    "{} in place {}: allowed=false",
                    instance.label(),
                    instance.place
                )),
            });
            return Ok(CreateOutcome::Refused(permission_key));
        }

        let cached = self.manager.packages().ensure_cached(&instance.identity)?;
        instance.identity.package = cached.display().to_string();
        self.places.ensure(&instance.place)?;
        instance.set_home_once(Location::new(
            self.local.host.clone(),
            self.local.port,
            instance.place.clone(),
        ));

        let agent = self.loader.load_agent(
            &cached,
            &instance.identity.class_name,
            &instance.parameters,
        )?;
        let runnable = self.manager.register_agent(instance, agent)?;
        if permission.as_ref().is_some_and(Permission::starts_automatically) {
            runnable.start()?;
        }
        Ok(CreateOutcome::Created(key))
    }

    pub fn start_agent(&self, key: &InstanceKey) -> StationResult<bool> {
        self.ensure_open()?;
        self.manager.start(key)
    }

    pub fn stop_agent(&self, key: &InstanceKey) -> StationResult<bool> {
        self.manager.stop(key)
    }

    /// Remove an agent and release its package if unused.
    pub fn remove_agent(&self, key: &InstanceKey) -> StationResult<Instance> {
        let instance = self.manager.remove(key)?;
        self.manager
            .release_package(&instance.identity.package_name(), &instance.identity.hash)?;
        Ok(instance)
    }

    pub fn agent(&self, key: &InstanceKey) -> Option<Instance> {
        self.manager.get(key).map(|r| r.instance())
    }

    /// Live agents ordered by key.
    pub fn list_agents(&self) -> Vec<Instance> {
        self.manager
            .live_agents()
            .iter()
            .map(|r| r.instance())
            .collect()
    }

    pub fn list_agents_in(&self, place: &str) -> Vec<Instance> {
        self.list_agents()
            .into_iter()
            .filter(|i| i.place == place)
            .collect()
    }

    pub fn update_parameters(
        &self,
        key: &InstanceKey,
        parameters: Vec<String>,
    ) -> StationResult<Instance> {
        self.manager.update_parameters(key, parameters)
    }

    pub fn agent_log(&self, key: &InstanceKey) -> StationResult<Vec<LogEntry>> {
        self.manager.agent_log(key)
    }

    /// Migrate a live agent to `place` on `destination`.
    pub fn migrate_agent(
        &self,
        key: &InstanceKey,
        destination: &Endpoint,
        place: &str,
    ) -> StationResult<()> {
        self.ensure_open()?;
        self.manager.migrate(key, destination, place)
    }

    pub fn collaborate(
        &self,
        requester: &InstanceKey,
        name: &str,
        organisation: &str,
        major: u32,
        minor: u32,
    ) -> Option<CollaborationHandle> {
        self.manager
            .collaborate(requester, name, organisation, major, minor)
    }

    // ========================================================================
    // PLACES & PERMISSIONS
    // ========================================================================

    pub fn create_place(&self, name: &str) -> StationResult<()> {
        self.ensure_open()?;
        self.places.create(name)
    }

    pub fn remove_place(&self, name: &str) -> StationResult<()> {
        self.places.remove(name)
    }

    pub fn list_places(&self) -> StationResult<Vec<Place>> {
        self.places.list()
    }

    /// Store a permission and enforce the resulting policy on its place.
    /// Returns the agents that were removed as a consequence.
    pub fn set_permission(&self, permission: Permission) -> StationResult<Vec<InstanceKey>> {
        permission.validate()?;
        if !self.places.exists(&permission.key.place)? {
            return Err(StationError::not_found(
                EntityKind::Place,
                permission.key.place.clone(),
            ));
        }
        self.registry.permission_upsert(&permission)?;
        info!(permission = %permission.key, allowed = permission.allowed, auto_start = permission.auto_start, "Permission set");
        self.manager.permissions_change(&permission.key.place)
    }

    /// Delete a permission and enforce the resulting policy on its place.
    pub fn remove_permission(&self, key: &PermissionKey) -> StationResult<Vec<InstanceKey>> {
        if !self.registry.permission_delete(key)? {
            return Err(StationError::not_found(EntityKind::Permission, key.to_string()));
        }
        info!(permission = %key, "Permission removed");
        self.manager.permissions_change(&key.place)
    }

    pub fn list_permissions(&self, place: &str) -> StationResult<Vec<Permission>> {
        self.registry.permission_list_by_place(place)
    }

    // ========================================================================
    // SCHEDULES
    // ========================================================================

    /// Configure when an agent starts and arm the next occurrence.
    pub fn set_schedule(
        &self,
        key: &InstanceKey,
        start: NaiveDateTime,
        repeat: Option<Recurrence>,
    ) -> StationResult<Option<NaiveDateTime>> {
        self.ensure_open()?;
        let sid = self
            .registry
            .lookup_agent_sid(key)?
            .ok_or_else(|| StationError::not_found(EntityKind::Agent, key.to_string()))?;
        let schedule = Schedule {
            sid,
            start_date: start.date(),
            start_time: start.time(),
            repeat,
        };
        schedule.validate()?;
        self.registry.schedule_upsert(&schedule)?;
        self.manager.initiate_any_schedule(key)
    }

    pub fn remove_schedule(&self, key: &InstanceKey) -> StationResult<bool> {
        let Some(sid) = self.registry.lookup_agent_sid(key)? else {
            return Err(StationError::not_found(EntityKind::Agent, key.to_string()));
        };
        self.manager.cancel_schedule(key)?;
        self.registry.schedule_delete(sid)
    }

    pub fn schedule(&self, key: &InstanceKey) -> StationResult<Option<Schedule>> {
        match self.registry.lookup_agent_sid(key)? {
            Some(sid) => self.registry.schedule_get(sid),
            None => Ok(None),
        }
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Stop every agent, cancel timers and close the messenger.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.shutdown();
        self.messenger.deregister(self.sync_listener);
        self.messenger.shutdown();
        info!(host = %self.local.host, port = self.local.port, "Station shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// INBOUND TRANSFERS
// ============================================================================

impl InboundHandler for AgentStation {
    fn lookup_permission(
        &self,
        agent_name: &str,
        agent_short_id: &str,
        place: &str,
    ) -> StationResult<Option<Permission>> {
        self.registry
            .permission_get(&PermissionKey::new(agent_name, agent_short_id, place))
    }

    fn accept_transfer(&self, request: TransferRequest) -> StationResult<()> {
        self.ensure_open()?;
        let TransferRequest {
            mut instance,
            state,
            package_name,
            place,
            package_bytes,
        } = request;
        validate_place_name(&place)?;
        instance.identity.validate()?;

        let packages = self.manager.packages();
        match package_bytes {
            Some(bytes) => {
                packages.store_bytes(&package_name, &bytes, &instance.identity.hash)?;
            }
            None if packages.contains(&package_name, &instance.identity.hash) => {}
            None => return Err(StationError::not_found(EntityKind::Package, package_name)),
        }

        instance.record_arrival(Location::new(self.local.host.clone(), self.local.port, place.clone()));
        instance.state = AgentState::Inactive;
        instance.sid = None;

        let permission_key = PermissionKey::for_instance(&instance, &place);
        let permission = match self.registry.permission_get(&permission_key)? {
            Some(permission) if permission.allowed => permission,
            _ => {
                info!(permission = %permission_key, "Inbound agent not permitted, dropped");
                if let Err(e) = self
                    .manager
                    .release_package(&package_name, &instance.identity.hash)
                {
                    warn!(package = %package_name, error = %e, "Failed to release package");
                }
                return Ok(());
            }
        };

        let key = instance.key();
        if self.manager.is_live(&key) {
            warn!(agent = %key, "Inbound agent already live, dropped");
            return Ok(());
        }

        packages.verify(&package_name, &instance.identity.hash)?;
        let path = packages.path_for(&package_name, &instance.identity.hash)?;
        instance.identity.package = path.display().to_string();
        let snapshot: Value = serde_json::from_slice(&state).map_err(|e| AgentError::Snapshot {
            agent: instance.label(),
            reason: e.to_string(),
        })?;
        let agent = self
            .loader
            .restore_agent(&path, &instance.identity.class_name, snapshot)?;

        self.places.ensure(&place)?;
        let runnable = self.manager.register_agent(instance, agent)?;
        info!(agent = %key, place = %place, "Inbound agent accepted");
        if permission.starts_automatically() {
            runnable.start()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{instance, OneShotFactory};
    use meridian_core::compute_content_hash;
    use meridian_storage::InMemoryRegistry;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        station: Arc<AgentStation>,
        registry: Arc<InMemoryRegistry>,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        let catalog = AgentCatalog::new().with("agents.Ping", Arc::new(OneShotFactory));
        let station = AgentStation::builder(
            Endpoint::new("alpha", 7000),
            registry.clone(),
            PackageStore::new(dir.path().join("packages")).unwrap(),
        )
        .with_loader(Arc::new(catalog))
        .build();
        Fixture {
            station,
            registry,
            dir,
        }
    }

    fn packaged_instance(f: &Fixture) -> Instance {
        let source = f.dir.path().join("ping.pkg");
        fs::write(&source, b"ping code").unwrap();
        let mut inst = instance("Ping");
        inst.identity.package = source.display().to_string();
        inst.identity.hash = compute_content_hash(b"ping code");
        inst
    }

    #[test]
    fn test_create_sets_home_and_caches_package() -> StationResult<()> {
        let f = fixture();
        let inst = packaged_instance(&f);
        let key = inst.key();

        assert_eq!(f.station.create_agent(inst)?, CreateOutcome::Created(key.clone()));
        let live = f.station.agent(&key).unwrap();
        assert_eq!(live.home(), Some(&Location::new("alpha", 7000, DEFAULT_PLACE)));
        let cached = format!("packages/{}/ping.pkg", compute_content_hash(b"ping code"));
        assert!(live.identity.package.ends_with(&cached));
        assert!(f.station.list_places()?.iter().any(|p| p.is_default()));
        Ok(())
    }

    #[test]
    fn test_create_rejects_blank_identity() {
        let f = fixture();
        let mut inst = packaged_instance(&f);
        inst.identity.description = String::new();
        assert!(matches!(
            f.station.create_agent(inst),
            Err(StationError::Validation(_))
        ));
        assert_eq!(f.registry.instance_count(), 0);
    }

    #[test]
    fn test_registry_sync_tracks_state() -> StationResult<()> {
        let f = fixture();
        let inst = packaged_instance(&f);
        let key = inst.key();
        f.station.create_agent(inst)?;

        let runnable = f.station.manager().require(&key)?;
        runnable.start()?;
        runnable.join();
        let stored = f.registry.instance_get(&key)?.unwrap();
        assert_eq!(stored.state, AgentState::Inactive);
        Ok(())
    }

    #[test]
    fn test_set_schedule_requires_persisted_agent() {
        let f = fixture();
        let inst = instance("Ghost");
        let err = f
            .station
            .set_schedule(&inst.key(), chrono::Local::now().naive_local(), None)
            .unwrap_err();
        assert!(matches!(err, StationError::NotFound(_)));
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let f = fixture();
        f.station.shutdown();
        f.station.shutdown();
        assert!(f.station.is_shut_down());
        let inst = packaged_instance(&f);
        assert!(matches!(
            f.station.create_agent(inst),
            Err(StationError::Agent(AgentError::ShuttingDown))
        ));
    }
}
