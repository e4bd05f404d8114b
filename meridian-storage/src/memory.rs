//! In-memory registry for tests and ephemeral stations.

use crate::registry::Registry;
use meridian_core::{
    AgentState, EntityKind, Instance, InstanceKey, Permission, PermissionKey, Place, Schedule,
    Sid, StationError, StationResult, StorageError, ValidationError,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Registry kept entirely in process memory.
#[derive(Debug)]
pub struct InMemoryRegistry {
    instances: RwLock<BTreeMap<InstanceKey, Instance>>,
    places: RwLock<BTreeMap<String, Place>>,
    permissions: RwLock<HashMap<PermissionKey, Permission>>,
    schedules: RwLock<HashMap<Sid, Schedule>>,
    next_sid: AtomicI64,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self {
            instances: RwLock::new(BTreeMap::new()),
            places: RwLock::new(BTreeMap::new()),
            permissions: RwLock::new(HashMap::new()),
            schedules: RwLock::new(HashMap::new()),
            next_sid: AtomicI64::new(1),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> StationResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| StationError::Storage(StorageError::LockPoisoned))
}

fn write<T>(lock: &RwLock<T>) -> StationResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| StationError::Storage(StorageError::LockPoisoned))
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get count of stored instances.
    pub fn instance_count(&self) -> usize {
        self.instances.read().map(|i| i.len()).unwrap_or(0)
    }

    /// Get count of stored schedules.
    pub fn schedule_count(&self) -> usize {
        self.schedules.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl Registry for InMemoryRegistry {
    // === Instance Operations ===

    fn instance_exists(&self, key: &InstanceKey) -> StationResult<bool> {
        Ok(read(&self.instances)?.contains_key(key))
    }

    fn instance_insert(&self, instance: &Instance) -> StationResult<Sid> {
        let mut instances = write(&self.instances)?;
        let key = instance.key();
        if instances.contains_key(&key) {
            return Err(StationError::Validation(ValidationError::Duplicate {
                entity: EntityKind::Agent,
                key: key.to_string(),
            }));
        }
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst);
        let mut stored = instance.clone();
        stored.sid = Some(sid);
        instances.insert(key, stored);
        Ok(sid)
    }

    fn instance_get(&self, key: &InstanceKey) -> StationResult<Option<Instance>> {
        Ok(read(&self.instances)?.get(key).cloned())
    }

    fn instance_update(&self, instance: &Instance) -> StationResult<()> {
        let mut instances = write(&self.instances)?;
        let key = instance.key();
        let stored = instances
            .get_mut(&key)
            .ok_or_else(|| StationError::not_found(EntityKind::Agent, key.to_string()))?;
        let sid = stored.sid;
        *stored = instance.clone();
        stored.sid = sid;
        Ok(())
    }

    fn instance_update_state(&self, key: &InstanceKey, state: AgentState) -> StationResult<()> {
        let mut instances = write(&self.instances)?;
        let stored = instances
            .get_mut(key)
            .ok_or_else(|| StationError::not_found(EntityKind::Agent, key.to_string()))?;
        stored.state = state;
        Ok(())
    }

    fn instance_delete(&self, key: &InstanceKey) -> StationResult<bool> {
        Ok(write(&self.instances)?.remove(key).is_some())
    }

    fn instance_list(&self) -> StationResult<Vec<Instance>> {
        Ok(read(&self.instances)?.values().cloned().collect())
    }

    fn instance_list_by_place(&self, place: &str) -> StationResult<Vec<Instance>> {
        Ok(read(&self.instances)?
            .values()
            .filter(|i| i.place == place)
            .cloned()
            .collect())
    }

    fn lookup_agent_sid(&self, key: &InstanceKey) -> StationResult<Option<Sid>> {
        Ok(read(&self.instances)?.get(key).and_then(|i| i.sid))
    }

    // === Place Operations ===

    fn place_exists(&self, name: &str) -> StationResult<bool> {
        Ok(read(&self.places)?.contains_key(name))
    }

    fn place_insert(&self, place: &Place) -> StationResult<()> {
        let mut places = write(&self.places)?;
        if places.contains_key(&place.name) {
            return Err(StationError::Validation(ValidationError::Duplicate {
                entity: EntityKind::Place,
                key: place.name.clone(),
            }));
        }
        places.insert(place.name.clone(), place.clone());
        Ok(())
    }

    fn place_delete(&self, name: &str) -> StationResult<bool> {
        Ok(write(&self.places)?.remove(name).is_some())
    }

    fn place_list(&self) -> StationResult<Vec<Place>> {
        Ok(read(&self.places)?.values().cloned().collect())
    }

    // === Permission Operations ===

    fn permission_get(&self, key: &PermissionKey) -> StationResult<Option<Permission>> {
        Ok(read(&self.permissions)?.get(key).cloned())
    }

    fn permission_upsert(&self, permission: &Permission) -> StationResult<()> {
        write(&self.permissions)?.insert(permission.key.clone(), permission.clone());
        Ok(())
    }

    fn permission_delete(&self, key: &PermissionKey) -> StationResult<bool> {
        Ok(write(&self.permissions)?.remove(key).is_some())
    }

    fn permission_list_by_place(&self, place: &str) -> StationResult<Vec<Permission>> {
        let mut list: Vec<Permission> = read(&self.permissions)?
            .values()
            .filter(|p| p.key.place == place)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(list)
    }

    // === Schedule Operations ===

    fn schedule_get(&self, sid: Sid) -> StationResult<Option<Schedule>> {
        Ok(read(&self.schedules)?.get(&sid).cloned())
    }

    fn schedule_upsert(&self, schedule: &Schedule) -> StationResult<()> {
        write(&self.schedules)?.insert(schedule.sid, schedule.clone());
        Ok(())
    }

    fn schedule_delete(&self, sid: Sid) -> StationResult<bool> {
        Ok(write(&self.schedules)?.remove(&sid).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::instance;
    use chrono::{Duration, Utc};
    use meridian_core::DEFAULT_PLACE;

    #[test]
    fn test_insert_assigns_increasing_sids() {
        let registry = InMemoryRegistry::new();
        let now = Utc::now();
        let a = instance(now);
        let b = instance(now + Duration::seconds(1));

        let sid_a = registry.instance_insert(&a).unwrap();
        let sid_b = registry.instance_insert(&b).unwrap();
        assert!(sid_b > sid_a);
        assert_eq!(registry.lookup_agent_sid(&a.key()).unwrap(), Some(sid_a));
        assert_eq!(registry.instance_count(), 2);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let registry = InMemoryRegistry::new();
        let inst = instance(Utc::now());
        registry.instance_insert(&inst).unwrap();
        let err = registry.instance_insert(&inst).unwrap_err();
        assert!(matches!(
            err,
            StationError::Validation(ValidationError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_update_keeps_sid() {
        let registry = InMemoryRegistry::new();
        let mut inst = instance(Utc::now());
        let sid = registry.instance_insert(&inst).unwrap();
        inst.parameters = vec!["x".to_string()];
        registry.instance_update(&inst).unwrap();

        let stored = registry.instance_get(&inst.key()).unwrap().unwrap();
        assert_eq!(stored.sid, Some(sid));
        assert_eq!(stored.parameters, vec!["x".to_string()]);
    }

    #[test]
    fn test_update_state_missing_is_not_found() {
        let registry = InMemoryRegistry::new();
        let inst = instance(Utc::now());
        let err = registry
            .instance_update_state(&inst.key(), AgentState::Active)
            .unwrap_err();
        assert!(matches!(err, StationError::NotFound(_)));
    }

    #[test]
    fn test_list_by_place() {
        let registry = InMemoryRegistry::new();
        let now = Utc::now();
        let a = instance(now);
        let mut b = instance(now + Duration::seconds(1));
        b.place = "Lab".to_string();
        registry.instance_insert(&a).unwrap();
        registry.instance_insert(&b).unwrap();

        assert_eq!(registry.instance_list_by_place(DEFAULT_PLACE).unwrap().len(), 1);
        assert_eq!(registry.instance_list_by_place("Lab").unwrap().len(), 1);
        assert_eq!(registry.instance_list().unwrap().len(), 2);
    }

    #[test]
    fn test_permission_upsert_replaces() {
        let registry = InMemoryRegistry::new();
        let key = PermissionKey::new("Ping", "abc123", DEFAULT_PLACE);
        registry
            .permission_upsert(&Permission::allow(key.clone(), true))
            .unwrap();
        registry.permission_upsert(&Permission::deny(key.clone())).unwrap();

        let stored = registry.permission_get(&key).unwrap().unwrap();
        assert!(!stored.allowed);
        assert_eq!(registry.permission_list_by_place(DEFAULT_PLACE).unwrap().len(), 1);
        assert!(registry.permission_delete(&key).unwrap());
        assert!(!registry.permission_delete(&key).unwrap());
    }

    #[test]
    fn test_place_duplicate_rejected() {
        let registry = InMemoryRegistry::new();
        registry.place_insert(&Place::new("Lab")).unwrap();
        assert!(registry.place_insert(&Place::new("Lab")).is_err());
        assert!(registry.place_exists("Lab").unwrap());
        assert!(registry.place_delete("Lab").unwrap());
        assert!(!registry.place_exists("Lab").unwrap());
    }
}
