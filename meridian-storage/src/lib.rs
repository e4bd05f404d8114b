//! Meridian Storage - Registry Port and Package Cache
//!
//! Defines the `Registry` port the station persists through, two
//! implementations of it, and the on-disk package cache.
//!
//! - `InMemoryRegistry`: process-local, used by tests and ephemeral stations
//! - `LmdbRegistry`: durable, heed/LMDB backed
//! - `PackageStore`: SHA-256 verified agent package cache

mod lmdb;
mod memory;
mod package;
mod registry;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use lmdb::{LmdbRegistry, LmdbRegistryError};
pub use memory::InMemoryRegistry;
pub use package::PackageStore;
pub use registry::Registry;
