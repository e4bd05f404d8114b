//! Registry port.
//!
//! Durable storage for instances, places, permissions and schedules, keyed
//! by their natural keys. Implementations serialize their own writes per
//! key; nothing here is transactional across calls.

use meridian_core::{
    AgentState, Instance, InstanceKey, Permission, PermissionKey, Place, Schedule, Sid,
    StationResult,
};

/// Storage trait for station entities.
pub trait Registry: Send + Sync {
    // === Instance Operations ===

    /// Whether an instance with this natural key is persisted.
    fn instance_exists(&self, key: &InstanceKey) -> StationResult<bool>;

    /// Persist a new instance and return its assigned sid.
    ///
    /// Fails with a duplicate validation error if the key already exists.
    fn instance_insert(&self, instance: &Instance) -> StationResult<Sid>;

    fn instance_get(&self, key: &InstanceKey) -> StationResult<Option<Instance>>;

    /// Overwrite a persisted instance (parameters, place, locations, state).
    fn instance_update(&self, instance: &Instance) -> StationResult<()>;

    fn instance_update_state(&self, key: &InstanceKey, state: AgentState) -> StationResult<()>;

    /// Delete an instance. Returns false if it was not persisted.
    fn instance_delete(&self, key: &InstanceKey) -> StationResult<bool>;

    fn instance_list(&self) -> StationResult<Vec<Instance>>;

    fn instance_list_by_place(&self, place: &str) -> StationResult<Vec<Instance>>;

    /// Surrogate id of a persisted instance.
    fn lookup_agent_sid(&self, key: &InstanceKey) -> StationResult<Option<Sid>>;

    // === Place Operations ===

    fn place_exists(&self, name: &str) -> StationResult<bool>;

    /// Fails with a duplicate validation error if the place exists.
    fn place_insert(&self, place: &Place) -> StationResult<()>;

    fn place_delete(&self, name: &str) -> StationResult<bool>;

    fn place_list(&self) -> StationResult<Vec<Place>>;

    // === Permission Operations ===

    fn permission_get(&self, key: &PermissionKey) -> StationResult<Option<Permission>>;

    /// Insert or replace the permission stored under its key.
    fn permission_upsert(&self, permission: &Permission) -> StationResult<()>;

    fn permission_delete(&self, key: &PermissionKey) -> StationResult<bool>;

    fn permission_list_by_place(&self, place: &str) -> StationResult<Vec<Permission>>;

    // === Schedule Operations ===

    fn schedule_get(&self, sid: Sid) -> StationResult<Option<Schedule>>;

    /// Insert or replace the schedule of `schedule.sid`.
    fn schedule_upsert(&self, schedule: &Schedule) -> StationResult<()>;

    fn schedule_delete(&self, sid: Sid) -> StationResult<bool>;
}
