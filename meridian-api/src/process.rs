//! Process conventions: application data directory layout and the
//! single-station-per-port lock.

use crate::error::{ServerError, ServerResult};
use fs2::FileExt;
use meridian_core::StationConfig;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Create the data directory and its `packages/`, `certs/`, `registry/`
/// and `locks/` children.
pub fn prepare_data_dir(config: &StationConfig) -> ServerResult<()> {
    let lock_dir = config
        .lock_path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.data_dir.join("locks"));
    for dir in [
        config.data_dir.clone(),
        config.package_dir(),
        config.cert_dir(),
        config.registry_dir(),
        lock_dir,
    ] {
        fs::create_dir_all(&dir).map_err(|e| ServerError::io(&dir, e))?;
    }
    debug!(data_dir = %config.data_dir.display(), "Data directory ready");
    Ok(())
}

/// Exclusive advisory lock held for the lifetime of a station process.
#[derive(Debug)]
pub struct StationLock {
    file: File,
    path: PathBuf,
}

impl StationLock {
    /// Take the lock for `port`. Fails fast if another process holds it.
    pub fn acquire(path: impl Into<PathBuf>, port: u16) -> ServerResult<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ServerError::io(&path, e))?;

        if file.try_lock_exclusive().is_err() {
            return Err(ServerError::AlreadyRunning { port, path });
        }

        file.set_len(0).map_err(|e| ServerError::io(&path, e))?;
        writeln!(file, "pid={}\nport={}", std::process::id(), port)
            .map_err(|e| ServerError::io(&path, e))?;
        info!(port, lock = %path.display(), "Station lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StationLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_creates_layout() {
        let dir = TempDir::new().unwrap();
        let config = StationConfig::new("alpha", 7000, dir.path().join("meridian"));

        prepare_data_dir(&config).unwrap();

        assert!(config.package_dir().is_dir());
        assert!(config.cert_dir().is_dir());
        assert!(config.registry_dir().is_dir());
        assert!(config.lock_path().parent().unwrap().is_dir());
    }

    #[test]
    fn test_second_lock_on_same_port_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("station-7000.lock");

        let first = StationLock::acquire(&path, 7000).unwrap();
        let second = StationLock::acquire(&path, 7000);
        assert!(matches!(
            second,
            Err(ServerError::AlreadyRunning { port: 7000, .. })
        ));

        drop(first);
        assert!(StationLock::acquire(&path, 7000).is_ok());
    }

    #[test]
    fn test_lock_records_pid() {
        let dir = TempDir::new().unwrap();
        let lock = StationLock::acquire(dir.path().join("station-7001.lock"), 7001).unwrap();
        let content = fs::read_to_string(lock.path()).unwrap();
        assert!(content.contains(&format!("pid={}", std::process::id())));
    }
}
