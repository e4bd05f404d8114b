//! Content-addressed package cache.
//!
//! Agent code packages are cached under the station data directory as
//! `<hash>/<file name>` and checked against the SHA-256 recorded in the
//! agent identity. Two builds sharing a file name therefore never share a
//! cache entry. Bytes that do not hash to the declared value are never
//! written into the cache.

use meridian_core::{
    compute_content_hash, AgentIdentity, EntityKind, Instance, IntegrityError, StationError,
    StationResult, StorageError, ValidationError,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Local package cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct PackageStore {
    root: PathBuf,
}

fn io_error(path: &Path, err: std::io::Error) -> StationError {
    StationError::Storage(StorageError::Io {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}

fn invalid(field: &str, reason: String) -> StationError {
    StationError::Validation(ValidationError::InvalidValue {
        field: field.to_string(),
        reason,
    })
}

fn hash_mismatch(name: &str, expected: &str, actual: String) -> StationError {
    IntegrityError::HashMismatch {
        package: name.to_string(),
        expected: expected.to_string(),
        actual,
    }
    .into()
}

impl PackageStore {
    /// Open the cache, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> StationResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every cached package whose content hashes to
    /// `hash`. Only hex digests are accepted.
    fn hash_dir(&self, hash: &str) -> StationResult<PathBuf> {
        let hash = hash.trim();
        if hash.is_empty() {
            return Err(StationError::missing("hash"));
        }
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("hash", format!("{} is not a hex digest", hash)));
        }
        Ok(self.root.join(hash.to_ascii_lowercase()))
    }

    /// Cache path for the package `name` built with content `hash`. Names
    /// carrying path components are rejected.
    pub fn path_for(&self, name: &str, hash: &str) -> StationResult<PathBuf> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(StationError::missing("package"));
        }
        if trimmed.contains('/') || trimmed.contains('\\') || trimmed == "." || trimmed == ".." {
            return Err(invalid(
                "package",
                format!("{} is not a plain file name", name),
            ));
        }
        Ok(self.hash_dir(hash)?.join(trimmed))
    }

    pub fn contains(&self, name: &str, hash: &str) -> bool {
        self.path_for(name, hash)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Copy the identity's package into the cache (unless already cached)
    /// and verify it. Returns the cache path.
    ///
    /// A source that does not match the declared hash is refused before
    /// anything is written. A cached copy that no longer verifies is left in
    /// place and reported.
    pub fn ensure_cached(&self, identity: &AgentIdentity) -> StationResult<PathBuf> {
        let name = identity.package_name();
        let cached = self.path_for(&name, &identity.hash)?;

        if cached.is_file() {
            self.verify(&name, &identity.hash)?;
            return Ok(cached);
        }

        let source = Path::new(&identity.package);
        if !source.is_file() {
            return Err(StationError::not_found(
                EntityKind::Package,
                identity.package.clone(),
            ));
        }
        let bytes = fs::read(source).map_err(|e| io_error(source, e))?;
        let path = self.store_bytes(&name, &bytes, &identity.hash)?;
        debug!(package = %name, source = %source.display(), "Copied package into cache");
        Ok(path)
    }

    /// Store received package bytes after checking them against
    /// `expected_hash`. Mismatching bytes are never written.
    pub fn store_bytes(
        &self,
        name: &str,
        bytes: &[u8],
        expected_hash: &str,
    ) -> StationResult<PathBuf> {
        let path = self.path_for(name, expected_hash)?;
        let actual = compute_content_hash(bytes);
        if !actual.eq_ignore_ascii_case(expected_hash.trim()) {
            return Err(hash_mismatch(name, expected_hash, actual));
        }

        let dir = self.hash_dir(expected_hash)?;
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        let staging = dir.join(format!(".{}.partial", name.trim()));
        fs::write(&staging, bytes).map_err(|e| io_error(&staging, e))?;
        if let Err(e) = fs::rename(&staging, &path) {
            if let Err(cleanup) = fs::remove_file(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "Failed to remove staged package");
            }
            return Err(io_error(&path, e));
        }
        info!(package = %name, bytes = bytes.len(), "Stored package");
        Ok(path)
    }

    pub fn read(&self, name: &str, hash: &str) -> StationResult<Vec<u8>> {
        let path = self.path_for(name, hash)?;
        if !path.is_file() {
            return Err(StationError::not_found(EntityKind::Package, name));
        }
        fs::read(&path).map_err(|e| io_error(&path, e))
    }

    /// Check a cached package against `expected_hash`.
    pub fn verify(&self, name: &str, expected_hash: &str) -> StationResult<()> {
        let actual = compute_content_hash(&self.read(name, expected_hash)?);
        if actual.eq_ignore_ascii_case(expected_hash.trim()) {
            Ok(())
        } else {
            warn!(package = %name, expected = %expected_hash, actual = %actual, "Cached package failed verification");
            Err(hash_mismatch(name, expected_hash, actual))
        }
    }

    /// Delete a cached package build unless one of `instances` still uses
    /// the same name and hash. Returns true if a file was removed.
    pub fn remove_if_unreferenced(
        &self,
        name: &str,
        hash: &str,
        instances: &[Instance],
    ) -> StationResult<bool> {
        let referenced = instances.iter().any(|i| {
            i.identity.package_name() == name && i.identity.hash.trim().eq_ignore_ascii_case(hash.trim())
        });
        if referenced {
            return Ok(false);
        }
        let path = self.path_for(name, hash)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(package = %name, hash = %hash, "Removed unreferenced package");
                self.prune_hash_dir(hash);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn prune_hash_dir(&self, hash: &str) {
        let Ok(dir) = self.hash_dir(hash) else {
            return;
        };
        let empty = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            if let Err(e) = fs::remove_dir(&dir) {
                debug!(path = %dir.display(), error = %e, "Package directory left in place");
            }
        }
    }
}
