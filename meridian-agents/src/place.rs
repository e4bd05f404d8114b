//! Place existence, creation and removal.

use meridian_core::{
    validate_place_name, EntityKind, Place, StationError, StationResult, ValidationError,
    DEFAULT_PLACE,
};
use meridian_events::{StationEvent, StationMessenger};
use meridian_storage::Registry;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Owns the set of places of one station.
pub struct PlaceManager {
    registry: Arc<dyn Registry>,
    messenger: Arc<StationMessenger>,
    // serializes check-then-insert/delete
    guard: Mutex<()>,
}

impl PlaceManager {
    pub fn new(registry: Arc<dyn Registry>, messenger: Arc<StationMessenger>) -> Self {
        Self {
            registry,
            messenger,
            guard: Mutex::new(()),
        }
    }

    pub fn exists(&self, name: &str) -> StationResult<bool> {
        self.registry.place_exists(name)
    }

    pub fn list(&self) -> StationResult<Vec<Place>> {
        self.registry.place_list()
    }

    /// Create `name` if it does not exist yet. Returns true if it was
    /// created.
    pub fn ensure(&self, name: &str) -> StationResult<bool> {
        validate_place_name(name)?;
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        if self.registry.place_exists(name)? {
            return Ok(false);
        }
        self.insert(name)?;
        Ok(true)
    }

    /// Create a new place. Fails if it already exists.
    pub fn create(&self, name: &str) -> StationResult<()> {
        validate_place_name(name)?;
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.insert(name)
    }

    fn insert(&self, name: &str) -> StationResult<()> {
        self.registry.place_insert(&Place::new(name))?;
        info!(place = name, "Place created");
        self.messenger.publish(StationEvent::PlaceCreated {
            place: name.to_string(),
        });
        Ok(())
    }

    /// Remove an empty, non-default place together with its permissions.
    pub fn remove(&self, name: &str) -> StationResult<()> {
        validate_place_name(name)?;
        if name == DEFAULT_PLACE {
            return Err(StationError::Validation(ValidationError::ProtectedPlace {
                place: name.to_string(),
            }));
        }

        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.registry.place_exists(name)? {
            return Err(StationError::not_found(EntityKind::Place, name));
        }
        let count = self.registry.instance_list_by_place(name)?.len();
        if count > 0 {
            return Err(StationError::Validation(ValidationError::PlaceNotEmpty {
                place: name.to_string(),
                count,
            }));
        }

        self.registry.place_delete(name)?;
        for permission in self.registry.permission_list_by_place(name)? {
            self.registry.permission_delete(&permission.key)?;
        }
        info!(place = name, "Place removed");
        self.messenger.publish(StationEvent::PlaceRemoved {
            place: name.to_string(),
        });
        Ok(())
    }
}
