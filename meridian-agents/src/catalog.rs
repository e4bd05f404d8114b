//! Agent loading from cached packages.
//!
//! The station never reflects over code. A [`PackageLoader`] turns a cached
//! package plus implementation class name into a live [`Agent`]; the
//! default [`AgentCatalog`] resolves class names against factories that
//! were registered when the station was assembled.

use crate::capability::{Agent, AgentFactory};
use meridian_core::{EntityKind, StationError, StationResult};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Capability-typed plugin loading.
pub trait PackageLoader: Send + Sync {
    /// Build a fresh agent of `class_name` from `package`.
    fn load_agent(
        &self,
        package: &Path,
        class_name: &str,
        parameters: &[String],
    ) -> StationResult<Arc<dyn Agent>>;

    /// Rebuild a migrated agent from its snapshot.
    fn restore_agent(
        &self,
        package: &Path,
        class_name: &str,
        state: Value,
    ) -> StationResult<Arc<dyn Agent>>;
}

/// Class-name keyed registry of agent factories.
#[derive(Default)]
pub struct AgentCatalog {
    factories: RwLock<HashMap<String, Arc<dyn AgentFactory>>>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `class_name`, replacing any previous one.
    pub fn register(
        &self,
        class_name: impl Into<String>,
        factory: Arc<dyn AgentFactory>,
    ) -> Option<Arc<dyn AgentFactory>> {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(class_name.into(), factory)
    }

    /// Builder-style [`AgentCatalog::register`].
    pub fn with(self, class_name: impl Into<String>, factory: Arc<dyn AgentFactory>) -> Self {
        self.register(class_name, factory);
        self
    }

    pub fn deregister(&self, class_name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(class_name)
            .is_some()
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(class_name)
    }

    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn factory(&self, package: &Path, class_name: &str) -> StationResult<Arc<dyn AgentFactory>> {
        if !package.is_file() {
            return Err(StationError::not_found(
                EntityKind::Package,
                package.display().to_string(),
            ));
        }
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(class_name)
            .cloned()
            .ok_or_else(|| StationError::not_found(EntityKind::AgentClass, class_name))
    }
}

impl PackageLoader for AgentCatalog {
    fn load_agent(
        &self,
        package: &Path,
        class_name: &str,
        parameters: &[String],
    ) -> StationResult<Arc<dyn Agent>> {
        let factory = self.factory(package, class_name)?;
        debug!(class = class_name, package = %package.display(), "Instantiating agent");
        factory.create(parameters)
    }

    fn restore_agent(
        &self,
        package: &Path,
        class_name: &str,
        state: Value,
    ) -> StationResult<Arc<dyn Agent>> {
        let factory = self.factory(package, class_name)?;
        debug!(class = class_name, package = %package.display(), "Restoring agent from snapshot");
        factory.restore(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::OneShotFactory;
    use tempfile::TempDir;

    #[test]
    fn test_load_requires_cached_package() {
        let catalog = AgentCatalog::new().with("agents.Once", Arc::new(OneShotFactory));
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("once.pkg");

        let err = catalog.load_agent(&missing, "agents.Once", &[]).err().unwrap();
        assert!(matches!(err, StationError::NotFound(ref e) if e.entity == EntityKind::Package));

        std::fs::write(&missing, b"code").unwrap();
        assert!(catalog.load_agent(&missing, "agents.Once", &[]).is_ok());
    }

    #[test]
    fn test_unknown_class_is_not_found() {
        let catalog = AgentCatalog::new();
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("x.pkg");
        std::fs::write(&package, b"code").unwrap();

        let err = catalog
            .restore_agent(&package, "agents.Nope", Value::Null)
            .err()
            .unwrap();
        assert!(matches!(err, StationError::NotFound(ref e) if e.entity == EntityKind::AgentClass));
    }

    #[test]
    fn test_register_and_deregister() {
        let catalog = AgentCatalog::new();
        assert!(catalog.register("b.B", Arc::new(OneShotFactory)).is_none());
        assert!(catalog.register("a.A", Arc::new(OneShotFactory)).is_none());
        assert!(catalog.register("a.A", Arc::new(OneShotFactory)).is_some());
        assert_eq!(catalog.class_names(), vec!["a.A".to_string(), "b.B".to_string()]);
        assert!(catalog.deregister("a.A"));
        assert!(!catalog.contains("a.A"));
    }
}
