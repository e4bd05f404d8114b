//! Live agent table, lifecycle orchestration, migration and scheduling.
//!
//! The manager is shared by operator threads, agent threads, schedule
//! timers and inbound transport handlers. The live table is the only
//! structure they all mutate; it is guarded by one mutex that is never held
//! while agent code runs.

use crate::assistant::AgentAssistant;
use crate::capability::{Agent, CollaborationHandle};
use crate::log::AgentLog;
use crate::runnable::AgentRunnable;
use crate::scheduler::ScheduleTimers;
use crate::transport::{Endpoint, RemoteTransport, TransferRequest};
use chrono::{Local, NaiveDateTime};
use meridian_core::{
    validate_place_name, AgentError, EntityKind, Instance, InstanceKey, PermissionKey,
    StationError, StationResult, TransportError, ValidationError,
};
use meridian_events::{LogEntry, MigrationOutcome, StationEvent, StationMessenger};
use meridian_storage::{PackageStore, Registry};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

type LiveTable = HashMap<InstanceKey, Arc<AgentRunnable>>;

/// Collaborators the manager is assembled from.
pub struct ManagerParts {
    /// Address peers use to reach this station
    pub local: Endpoint,
    pub registry: Arc<dyn Registry>,
    pub messenger: Arc<StationMessenger>,
    pub transport: Arc<dyn RemoteTransport>,
    pub packages: PackageStore,
    pub log_capacity: usize,
}

/// Owner of every live agent on a station.
pub struct AgentManager {
    me: Weak<AgentManager>,
    local: Endpoint,
    live: Mutex<LiveTable>,
    registry: Arc<dyn Registry>,
    messenger: Arc<StationMessenger>,
    transport: Arc<dyn RemoteTransport>,
    packages: PackageStore,
    timers: ScheduleTimers,
    // (package name, hash, destination) whose bytes were already delivered
    delivered: Mutex<HashSet<(String, String, Endpoint)>>,
    log_capacity: usize,
}

impl AgentManager {
    pub fn new(parts: ManagerParts) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local: parts.local,
            live: Mutex::new(HashMap::new()),
            registry: parts.registry,
            messenger: parts.messenger,
            transport: parts.transport,
            packages: parts.packages,
            timers: ScheduleTimers::new(),
            delivered: Mutex::new(HashSet::new()),
            log_capacity: parts.log_capacity,
        })
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn packages(&self) -> &PackageStore {
        &self.packages
    }

    pub fn timers(&self) -> &ScheduleTimers {
        &self.timers
    }

    fn live(&self) -> MutexGuard<'_, LiveTable> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivered(&self) -> MutexGuard<'_, HashSet<(String, String, Endpoint)>> {
        self.delivered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // LIVE TABLE
    // ========================================================================

    pub fn get(&self, key: &InstanceKey) -> Option<Arc<AgentRunnable>> {
        self.live().get(key).cloned()
    }

    pub fn require(&self, key: &InstanceKey) -> StationResult<Arc<AgentRunnable>> {
        self.get(key)
            .ok_or_else(|| StationError::not_found(EntityKind::Agent, key.to_string()))
    }

    pub fn is_live(&self, key: &InstanceKey) -> bool {
        self.live().contains_key(key)
    }

    /// Live runnables ordered by key.
    pub fn live_agents(&self) -> Vec<Arc<AgentRunnable>> {
        let mut agents: Vec<Arc<AgentRunnable>> = self.live().values().cloned().collect();
        agents.sort_by(|a, b| a.key().cmp(b.key()));
        agents
    }

    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Wrap `agent` in a runnable, add it to the live table, persist the
    /// instance unless already persisted, arm its schedule and announce it.
    pub fn register_agent(
        &self,
        instance: Instance,
        agent: Arc<dyn Agent>,
    ) -> StationResult<Arc<AgentRunnable>> {
        let key = instance.key();
        let log = Arc::new(AgentLog::new(
            &instance,
            self.log_capacity,
            Arc::clone(&self.messenger),
        ));
        let manager = self.me.clone();
        let assistant_key = key.clone();
        let runnable = Arc::new(AgentRunnable::new(
            instance,
            agent,
            log,
            Arc::clone(&self.messenger),
            move |gate, log, active| AgentAssistant::new(assistant_key, gate, log, active, manager),
        ));

        {
            let mut live = self.live();
            if live.contains_key(&key) {
                return Err(StationError::Validation(ValidationError::Duplicate {
                    entity: EntityKind::Agent,
                    key: key.to_string(),
                }));
            }
            live.insert(key.clone(), Arc::clone(&runnable));
        }

        let snapshot = runnable.instance();
        runnable.log().info(snapshot.identity.description.clone());
        runnable
            .log()
            .info(format!("parameters: [{}]", snapshot.parameters.join(", ")));

        let sid = if self.registry.instance_exists(&key)? {
            self.registry.lookup_agent_sid(&key)?
        } else {
            Some(self.registry.instance_insert(&snapshot)?)
        };
        let instance = runnable.update_instance(|i| i.sid = sid);

        if let Err(e) = self.initiate_any_schedule(&key) {
            warn!(agent = %instance.identity.name, short_id = %instance.short_id(), error = %e, "Failed to arm schedule");
        }

        info!(
            agent = %instance.identity.name,
            short_id = %instance.short_id(),
            place = %instance.place,
            "Agent created"
        );
        self.messenger
            .publish(StationEvent::AgentCreated { instance });
        Ok(runnable)
    }

    pub fn start(&self, key: &InstanceKey) -> StationResult<bool> {
        self.require(key)?.start()
    }

    pub fn stop(&self, key: &InstanceKey) -> StationResult<bool> {
        Ok(self.require(key)?.stop())
    }

    /// Stop and forget an agent: live table, registry row and schedule.
    pub fn remove(&self, key: &InstanceKey) -> StationResult<Instance> {
        let claimed = self.live().remove(key);
        let instance = match claimed {
            Some(runnable) => {
                runnable.stop();
                runnable.instance()
            }
            None => self
                .registry
                .instance_get(key)?
                .ok_or_else(|| StationError::not_found(EntityKind::Agent, key.to_string()))?,
        };

        let sid = match instance.sid {
            Some(sid) => Some(sid),
            None => self.registry.lookup_agent_sid(key)?,
        };
        if let Some(sid) = sid {
            self.timers.cancel(sid);
            self.registry.schedule_delete(sid)?;
        }
        self.registry.instance_delete(key)?;

        info!(agent = %instance.identity.name, short_id = %instance.short_id(), "Agent removed");
        self.messenger.publish(StationEvent::AgentRemoved {
            instance: instance.clone(),
        });
        Ok(instance)
    }

    /// Replace the parameters of a live agent and persist them.
    pub fn update_parameters(
        &self,
        key: &InstanceKey,
        parameters: Vec<String>,
    ) -> StationResult<Instance> {
        let runnable = self.require(key)?;
        let updated = runnable.update_instance(|i| i.parameters = parameters);
        self.registry.instance_update(&updated)?;
        runnable
            .log()
            .info(format!("parameters: [{}]", updated.parameters.join(", ")));
        Ok(updated)
    }

    pub fn agent_log(&self, key: &InstanceKey) -> StationResult<Vec<LogEntry>> {
        Ok(self.require(key)?.log().entries())
    }

    // ========================================================================
    // MIGRATION
    // ========================================================================

    fn publish_migration(&self, instance: Instance, outcome: MigrationOutcome, destination: &Endpoint) {
        self.messenger.publish(StationEvent::AgentMigrated {
            instance,
            outcome,
            destination: destination.to_string(),
        });
    }

    /// Move `instance` to `place` on `destination`.
    ///
    /// The local copy is removed before the transfer is attempted. If the
    /// transfer then fails the agent is gone from both stations and the
    /// error is returned to the caller.
    ///
    /// Package bytes are left out when this destination already received
    /// the same build. A destination that no longer holds it gets one resend
    /// with the bytes attached.
    pub fn migrate_agent(
        &self,
        instance: &Instance,
        destination: &Endpoint,
        place: &str,
    ) -> StationResult<()> {
        validate_place_name(place)?;
        let key = instance.key();
        let short_id = instance.short_id();
        info!(agent = %instance.identity.name, short_id = %short_id, destination = %destination, place, "Migrating agent");

        let permission = match self.transport.lookup_permission(
            destination,
            &instance.identity.name,
            &short_id,
            place,
        ) {
            Ok(permission) => permission,
            Err(e) => {
                warn!(short_id = %short_id, destination = %destination, error = %e, "Remote permission lookup failed");
                self.publish_migration(
                    instance.clone(),
                    MigrationOutcome::RegistryCommFailed,
                    destination,
                );
                return Err(e.into());
            }
        };

        if !permission.as_ref().is_some_and(|p| p.allowed) {
            info!(short_id = %short_id, destination = %destination, place, "Destination refused agent, removing locally");
            self.publish_migration(instance.clone(), MigrationOutcome::NoPermission, destination);
            return match self.remove(&key) {
                Ok(_) | Err(StationError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            };
        }

        let runnable = self.require(&key)?;
        let package_name = instance.identity.package_name();
        let delivery = (
            package_name.clone(),
            instance.identity.hash.clone(),
            destination.clone(),
        );
        let package_bytes = if self.delivered().contains(&delivery) {
            None
        } else {
            Some(self.packages.read(&package_name, &instance.identity.hash)?)
        };

        let mut departing = self.remove(&key)?;
        let state = serde_json::to_vec(&runnable.agent().snapshot()).map_err(|e| {
            AgentError::Snapshot {
                agent: departing.label(),
                reason: e.to_string(),
            }
        })?;
        departing.sid = None;

        let request = TransferRequest {
            instance: departing.clone(),
            state,
            package_name,
            place: place.to_string(),
            package_bytes,
        };

        let resend = request.package_bytes.is_none().then(|| request.clone());
        let mut outcome = self.transport.transfer_agent(destination, request);
        if let Some(mut retry) =
            resend.filter(|_| matches!(outcome, Err(TransportError::PackageMissing { .. })))
        {
            info!(short_id = %short_id, destination = %destination, package = %retry.package_name, "Destination lost cached package, resending");
            self.delivered().remove(&delivery);
            match self.packages.read(&retry.package_name, &departing.identity.hash) {
                Ok(bytes) => {
                    retry.package_bytes = Some(bytes);
                    outcome = self.transport.transfer_agent(destination, retry);
                }
                Err(e) => {
                    warn!(package = %retry.package_name, error = %e, "Package unavailable for resend");
                }
            }
        }

        match outcome {
            Ok(()) => {
                self.delivered().insert(delivery);
                info!(short_id = %short_id, destination = %destination, "Agent migrated");
                self.publish_migration(departing, MigrationOutcome::Success, destination);
                Ok(())
            }
            Err(e) => {
                self.delivered().remove(&delivery);
                error!(
                    short_id = %short_id,
                    destination = %destination,
                    error = %e,
                    "Agent transfer failed after local removal; agent is lost"
                );
                self.publish_migration(departing, MigrationOutcome::StationCommFailed, destination);
                Err(e.into())
            }
        }
    }

    /// Migrate a live agent by key, then drop its package from the cache if
    /// nothing else uses it.
    pub fn migrate(&self, key: &InstanceKey, destination: &Endpoint, place: &str) -> StationResult<()> {
        let instance = self.require(key)?.instance();
        let package = instance.identity.package_name();
        let result = self.migrate_agent(&instance, destination, place);
        if let Err(e) = self.release_package(&package, &instance.identity.hash) {
            warn!(package = %package, error = %e, "Failed to release package");
        }
        result
    }

    /// Delete a cached package build that no persisted or live instance
    /// uses.
    pub fn release_package(&self, package_name: &str, hash: &str) -> StationResult<bool> {
        let mut holders = self.registry.instance_list()?;
        holders.extend(self.live_agents().iter().map(|r| r.instance()));
        self.packages.remove_if_unreferenced(package_name, hash, &holders)
    }

    // ========================================================================
    // SCHEDULING
    // ========================================================================

    /// Arm the next occurrence of the instance's schedule, if any. An
    /// exhausted schedule is deleted. Returns the armed instant.
    pub fn initiate_any_schedule(&self, key: &InstanceKey) -> StationResult<Option<NaiveDateTime>> {
        self.arm_schedule(key, None)
    }

    fn arm_schedule(
        &self,
        key: &InstanceKey,
        not_before: Option<NaiveDateTime>,
    ) -> StationResult<Option<NaiveDateTime>> {
        let Some(sid) = self.registry.lookup_agent_sid(key)? else {
            return Ok(None);
        };
        let Some(schedule) = self.registry.schedule_get(sid)? else {
            self.timers.cancel(sid);
            return Ok(None);
        };

        let now = Local::now().naive_local();
        // a timer can fire a hair before the wall clock reaches its instant
        let reference = not_before.map_or(now, |fired| fired.max(now));
        match schedule.next_occurrence(reference) {
            None => {
                self.timers.cancel(sid);
                self.registry.schedule_delete(sid)?;
                info!(sid, agent = %key, "Schedule exhausted, removed");
                Ok(None)
            }
            Some(at) => {
                let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
                let manager = self.me.clone();
                let fired_key = key.clone();
                self.timers.arm(sid, delay, move || {
                    if let Some(manager) = manager.upgrade() {
                        manager.on_schedule_fired(&fired_key, at);
                    }
                })?;
                debug!(sid, agent = %key, at = %at, "Schedule armed");
                Ok(Some(at))
            }
        }
    }

    fn on_schedule_fired(&self, key: &InstanceKey, fired_for: NaiveDateTime) {
        if let Err(e) = self.arm_schedule(key, Some(fired_for)) {
            warn!(agent = %key, error = %e, "Failed to re-arm schedule");
        }
        match self.start(key) {
            Ok(started) => info!(agent = %key, started, "Scheduled start"),
            Err(e) => warn!(agent = %key, error = %e, "Scheduled start failed"),
        }
    }

    /// Cancel the pending timer of an instance's schedule.
    pub fn cancel_schedule(&self, key: &InstanceKey) -> StationResult<bool> {
        Ok(match self.registry.lookup_agent_sid(key)? {
            Some(sid) => self.timers.cancel(sid),
            None => false,
        })
    }

    // ========================================================================
    // COLLABORATION & POLICY
    // ========================================================================

    /// Find an active agent in the requester's place that matches the
    /// identity and offers collaboration.
    pub fn collaborate(
        &self,
        requester: &InstanceKey,
        name: &str,
        organisation: &str,
        major: u32,
        minor: u32,
    ) -> Option<CollaborationHandle> {
        let place = self.get(requester)?.instance().place;
        self.live_agents().into_iter().find_map(|runnable| {
            let instance = runnable.instance();
            let eligible = instance.place == place
                && runnable.is_active()
                && instance.identity.matches(name, organisation, major, minor)
                && runnable.agent().collaboration().is_some();
            eligible.then(|| CollaborationHandle::new(instance.key(), Arc::clone(runnable.agent())))
        })
    }

    /// Remove every registered agent of `place` that no longer holds an
    /// allowing permission there. Returns the removed keys.
    pub fn permissions_change(&self, place: &str) -> StationResult<Vec<InstanceKey>> {
        let mut removed = Vec::new();
        for instance in self.registry.instance_list_by_place(place)? {
            let key = PermissionKey::for_instance(&instance, place);
            let allowed = self
                .registry
                .permission_get(&key)?
                .is_some_and(|p| p.allowed);
            if !allowed {
                info!(permission = %key, "Agent no longer permitted, removing");
                removed.push(self.remove(&instance.key())?.key());
            }
        }
        Ok(removed)
    }

    /// Cancel timers and stop every live agent.
    pub fn shutdown(&self) {
        self.timers.shutdown();
        let agents: Vec<Arc<AgentRunnable>> = self.live().drain().map(|(_, r)| r).collect();
        let count = agents.len();
        for runnable in agents {
            runnable.stop();
        }
        info!(agents = count, "Agent manager shut down");
    }
}
