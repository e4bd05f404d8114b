//! LMDB-backed registry.
//!
//! Uses the heed crate (Rust bindings for LMDB). Each entity family lives in
//! its own named database; values are JSON. Every mutation runs in a single
//! write transaction, so LMDB's single-writer lock serializes writes.

use std::path::Path;

use chrono::SecondsFormat;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use meridian_core::{
    AgentState, EntityKind, Instance, InstanceKey, Permission, PermissionKey, Place, Schedule,
    Sid, StationError, StationResult, ValidationError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::registry::Registry;

const NEXT_SID_KEY: &str = "next_sid";

/// Error type for LMDB registry operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbRegistryError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(#[from] heed::Error),

    /// Value could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Corrupt sid counter")]
    CorruptCounter,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbRegistryError> for StationError {
    fn from(e: LmdbRegistryError) -> Self {
        StationError::storage("lmdb", e)
    }
}

type LmdbResult<T> = Result<T, LmdbRegistryError>;

/// Registry persisted in an LMDB environment.
pub struct LmdbRegistry {
    env: Env,
    instances: Database<Str, Bytes>,
    places: Database<Str, Bytes>,
    permissions: Database<Str, Bytes>,
    schedules: Database<Str, Bytes>,
    meta: Database<Str, Bytes>,
}

fn instance_key(key: &InstanceKey) -> String {
    format!(
        "{}|{}",
        key.long_id,
        key.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    )
}

fn permission_key(key: &PermissionKey) -> String {
    format!(
        "{}\u{1f}{}\u{1f}{}",
        key.agent_name, key.agent_short_id, key.place
    )
}

fn encode<T: Serialize>(value: &T) -> LmdbResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> LmdbResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

impl LmdbRegistry {
    /// Open (or create) a registry under `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbRegistryError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(5)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbRegistryError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn()?;
        let instances = env.create_database(&mut wtxn, Some("instances"))?;
        let places = env.create_database(&mut wtxn, Some("places"))?;
        let permissions = env.create_database(&mut wtxn, Some("permissions"))?;
        let schedules = env.create_database(&mut wtxn, Some("schedules"))?;
        let meta = env.create_database(&mut wtxn, Some("meta"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            instances,
            places,
            permissions,
            schedules,
            meta,
        })
    }

    fn get<T: DeserializeOwned>(
        &self,
        db: Database<Str, Bytes>,
        key: &str,
    ) -> LmdbResult<Option<T>> {
        let rtxn = self.env.read_txn()?;
        match db.get(&rtxn, key)? {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn contains(&self, db: Database<Str, Bytes>, key: &str) -> LmdbResult<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(db.get(&rtxn, key)?.is_some())
    }

    fn put<T: Serialize>(&self, db: Database<Str, Bytes>, key: &str, value: &T) -> LmdbResult<()> {
        let bytes = encode(value)?;
        let mut wtxn = self.env.write_txn()?;
        db.put(&mut wtxn, key, &bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    fn delete(&self, db: Database<Str, Bytes>, key: &str) -> LmdbResult<bool> {
        let mut wtxn = self.env.write_txn()?;
        let deleted = db.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(deleted)
    }

    fn scan<T: DeserializeOwned>(
        &self,
        rtxn: &RoTxn<'_>,
        db: Database<Str, Bytes>,
    ) -> LmdbResult<Vec<T>> {
        let mut values = Vec::new();
        for entry in db.iter(rtxn)? {
            let (_, bytes) = entry?;
            values.push(decode(bytes)?);
        }
        Ok(values)
    }

    fn list<T: DeserializeOwned>(&self, db: Database<Str, Bytes>) -> LmdbResult<Vec<T>> {
        let rtxn = self.env.read_txn()?;
        self.scan(&rtxn, db)
    }

    fn take_sid(&self, wtxn: &mut RwTxn<'_>) -> LmdbResult<Sid> {
        let current = match self.meta.get(wtxn, NEXT_SID_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| LmdbRegistryError::CorruptCounter)?;
                i64::from_le_bytes(raw)
            }
            None => 1,
        };
        self.meta
            .put(wtxn, NEXT_SID_KEY, &(current + 1).to_le_bytes())?;
        Ok(current)
    }

    fn modify_instance<F>(&self, key: &InstanceKey, apply: F) -> StationResult<()>
    where
        F: FnOnce(&mut Instance),
    {
        let db_key = instance_key(key);
        let mut wtxn = self.env.write_txn().map_err(LmdbRegistryError::from)?;
        let mut stored: Instance = match self
            .instances
            .get(&wtxn, &db_key)
            .map_err(LmdbRegistryError::from)?
        {
            Some(bytes) => decode(bytes)?,
            None => return Err(StationError::not_found(EntityKind::Agent, key.to_string())),
        };
        apply(&mut stored);
        let bytes = encode(&stored)?;
        self.instances
            .put(&mut wtxn, &db_key, &bytes)
            .map_err(LmdbRegistryError::from)?;
        wtxn.commit().map_err(LmdbRegistryError::from)?;
        Ok(())
    }
}

impl Registry for LmdbRegistry {
    // === Instance Operations ===

    fn instance_exists(&self, key: &InstanceKey) -> StationResult<bool> {
        Ok(self.contains(self.instances, &instance_key(key))?)
    }

    fn instance_insert(&self, instance: &Instance) -> StationResult<Sid> {
        let key = instance.key();
        let db_key = instance_key(&key);
        let mut wtxn = self.env.write_txn().map_err(LmdbRegistryError::from)?;
        if self
            .instances
            .get(&wtxn, &db_key)
            .map_err(LmdbRegistryError::from)?
            .is_some()
        {
            return Err(StationError::Validation(ValidationError::Duplicate {
                entity: EntityKind::Agent,
                key: key.to_string(),
            }));
        }
        let sid = self.take_sid(&mut wtxn)?;
        let mut stored = instance.clone();
        stored.sid = Some(sid);
        let bytes = encode(&stored)?;
        self.instances
            .put(&mut wtxn, &db_key, &bytes)
            .map_err(LmdbRegistryError::from)?;
        wtxn.commit().map_err(LmdbRegistryError::from)?;
        Ok(sid)
    }

    fn instance_get(&self, key: &InstanceKey) -> StationResult<Option<Instance>> {
        Ok(self.get(self.instances, &instance_key(key))?)
    }

    fn instance_update(&self, instance: &Instance) -> StationResult<()> {
        self.modify_instance(&instance.key(), |stored| {
            let sid = stored.sid;
            *stored = instance.clone();
            stored.sid = sid;
        })
    }

    fn instance_update_state(&self, key: &InstanceKey, state: AgentState) -> StationResult<()> {
        self.modify_instance(key, |stored| stored.state = state)
    }

    fn instance_delete(&self, key: &InstanceKey) -> StationResult<bool> {
        Ok(self.delete(self.instances, &instance_key(key))?)
    }

    fn instance_list(&self) -> StationResult<Vec<Instance>> {
        Ok(self.list(self.instances)?)
    }

    fn instance_list_by_place(&self, place: &str) -> StationResult<Vec<Instance>> {
        let all: Vec<Instance> = self.list(self.instances)?;
        Ok(all.into_iter().filter(|i| i.place == place).collect())
    }

    fn lookup_agent_sid(&self, key: &InstanceKey) -> StationResult<Option<Sid>> {
        Ok(self.instance_get(key)?.and_then(|i| i.sid))
    }

    // === Place Operations ===

    fn place_exists(&self, name: &str) -> StationResult<bool> {
        Ok(self.contains(self.places, name)?)
    }

    fn place_insert(&self, place: &Place) -> StationResult<()> {
        let mut wtxn = self.env.write_txn().map_err(LmdbRegistryError::from)?;
        if self
            .places
            .get(&wtxn, &place.name)
            .map_err(LmdbRegistryError::from)?
            .is_some()
        {
            return Err(StationError::Validation(ValidationError::Duplicate {
                entity: EntityKind::Place,
                key: place.name.clone(),
            }));
        }
        let bytes = encode(place)?;
        self.places
            .put(&mut wtxn, &place.name, &bytes)
            .map_err(LmdbRegistryError::from)?;
        wtxn.commit().map_err(LmdbRegistryError::from)?;
        Ok(())
    }

    fn place_delete(&self, name: &str) -> StationResult<bool> {
        Ok(self.delete(self.places, name)?)
    }

    fn place_list(&self) -> StationResult<Vec<Place>> {
        Ok(self.list(self.places)?)
    }

    // === Permission Operations ===

    fn permission_get(&self, key: &PermissionKey) -> StationResult<Option<Permission>> {
        Ok(self.get(self.permissions, &permission_key(key))?)
    }

    fn permission_upsert(&self, permission: &Permission) -> StationResult<()> {
        Ok(self.put(self.permissions, &permission_key(&permission.key), permission)?)
    }

    fn permission_delete(&self, key: &PermissionKey) -> StationResult<bool> {
        Ok(self.delete(self.permissions, &permission_key(key))?)
    }

    fn permission_list_by_place(&self, place: &str) -> StationResult<Vec<Permission>> {
        let all: Vec<Permission> = self.list(self.permissions)?;
        Ok(all.into_iter().filter(|p| p.key.place == place).collect())
    }

    // === Schedule Operations ===

    fn schedule_get(&self, sid: Sid) -> StationResult<Option<Schedule>> {
        Ok(self.get(self.schedules, &sid.to_string())?)
    }

    fn schedule_upsert(&self, schedule: &Schedule) -> StationResult<()> {
        Ok(self.put(self.schedules, &schedule.sid.to_string(), schedule)?)
    }

    fn schedule_delete(&self, sid: Sid) -> StationResult<bool> {
        Ok(self.delete(self.schedules, &sid.to_string())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::instance;
    use chrono::{Duration, NaiveDate, Utc};
    use meridian_core::{RepeatPolicy, DEFAULT_PLACE};
    use tempfile::TempDir;

    fn create_test_registry() -> (LmdbRegistry, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let registry =
            LmdbRegistry::open(temp_dir.path(), 10).expect("registry creation should succeed");
        (registry, temp_dir)
    }

    #[test]
    fn test_instance_roundtrip_and_sid() {
        let (registry, _dir) = create_test_registry();
        let inst = instance(Utc::now());

        let sid = registry.instance_insert(&inst).unwrap();
        assert!(registry.instance_exists(&inst.key()).unwrap());
        assert_eq!(registry.lookup_agent_sid(&inst.key()).unwrap(), Some(sid));

        let stored = registry.instance_get(&inst.key()).unwrap().unwrap();
        assert_eq!(stored, inst);
        assert_eq!(stored.sid, Some(sid));
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let (registry, _dir) = create_test_registry();
        let inst = instance(Utc::now());
        registry.instance_insert(&inst).unwrap();
        assert!(matches!(
            registry.instance_insert(&inst),
            Err(StationError::Validation(ValidationError::Duplicate { .. }))
        ));
    }

    #[test]
    fn test_sid_counter_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let now = Utc::now();
        let first = {
            let registry = LmdbRegistry::open(temp_dir.path(), 10).unwrap();
            registry.instance_insert(&instance(now)).unwrap()
        };
        let registry = LmdbRegistry::open(temp_dir.path(), 10).unwrap();
        let second = registry
            .instance_insert(&instance(now + Duration::seconds(1)))
            .unwrap();
        assert!(second > first);
        assert_eq!(registry.instance_list().unwrap().len(), 2);
    }

    #[test]
    fn test_state_update_and_delete() {
        let (registry, _dir) = create_test_registry();
        let inst = instance(Utc::now());
        registry.instance_insert(&inst).unwrap();

        registry
            .instance_update_state(&inst.key(), AgentState::Active)
            .unwrap();
        let stored = registry.instance_get(&inst.key()).unwrap().unwrap();
        assert_eq!(stored.state, AgentState::Active);

        assert!(registry.instance_delete(&inst.key()).unwrap());
        assert!(!registry.instance_exists(&inst.key()).unwrap());
        assert!(matches!(
            registry.instance_update_state(&inst.key(), AgentState::Inactive),
            Err(StationError::NotFound(_))
        ));
    }

    #[test]
    fn test_permissions_and_places() {
        let (registry, _dir) = create_test_registry();
        registry.place_insert(&Place::new(DEFAULT_PLACE)).unwrap();
        assert!(registry.place_insert(&Place::new(DEFAULT_PLACE)).is_err());

        let key = PermissionKey::new("Ping", "abc123", DEFAULT_PLACE);
        registry
            .permission_upsert(&Permission::allow(key.clone(), false))
            .unwrap();
        registry
            .permission_upsert(&Permission::allow(
                PermissionKey::new("Pong", "def456", "Lab"),
                false,
            ))
            .unwrap();

        let in_default = registry.permission_list_by_place(DEFAULT_PLACE).unwrap();
        assert_eq!(in_default.len(), 1);
        assert_eq!(in_default[0].key, key);
    }

    #[test]
    fn test_schedule_upsert_and_delete() {
        let (registry, _dir) = create_test_registry();
        let start = NaiveDate::from_ymd_opt(2026, 1, 1)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .unwrap();
        let schedule = Schedule::recurring(42, start, RepeatPolicy::Daily, 1, 3);
        registry.schedule_upsert(&schedule).unwrap();
        assert_eq!(registry.schedule_get(42).unwrap(), Some(schedule));
        assert!(registry.schedule_delete(42).unwrap());
        assert_eq!(registry.schedule_get(42).unwrap(), None);
    }
}
