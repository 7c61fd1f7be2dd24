//! Lock registry: the persisted record naming the current Primary.
//!
//! The record lives in a small JSON file at a fixed per-user runtime path.
//! Exactly one process (the Primary) writes it; every other process only
//! reads. There is no cross-process locking: the single-host, last-write-wins
//! model is enough because readers re-read and re-probe on every recovery
//! attempt instead of caching.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, warn};
use webmux_protocol::LockRecord;

use crate::error::{Error, Result};

const LOCK_FILE_NAME: &str = "webmux.lock";

/// Returns the lock file path for the current user.
///
/// Uses `$XDG_RUNTIME_DIR/webmux.lock` if available (already user-permissioned),
/// otherwise falls back to `webmux-{user}.lock` in the temp directory.
pub fn default_lock_path() -> PathBuf {
    if let Some(runtime) = dirs::runtime_dir() {
        return runtime.join(LOCK_FILE_NAME);
    }

    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "default".to_string());
    std::env::temp_dir().join(format!("webmux-{user}.lock"))
}

/// Mints a fresh random instance id for a starting Primary.
pub fn mint_instance_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Builds a lock record for this process on `port` with a fresh instance id.
pub fn new_record(port: u16) -> LockRecord {
    LockRecord {
        pid: std::process::id(),
        port,
        instance_id: mint_instance_id(),
        timestamp_ms: now_ms(),
    }
}

/// Reader/writer for the lock record at one path.
#[derive(Debug, Clone)]
pub struct LockRegistry {
    path: PathBuf,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new(default_lock_path())
    }
}

impl LockRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current record.
    ///
    /// A missing or unparseable file means "no Primary recorded" and is never
    /// an error; a corrupt record is indistinguishable from a stale one and
    /// the caller proceeds as if absent.
    pub fn read(&self) -> Option<LockRecord> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                debug!(target = "webmux.lock", path = %self.path.display(), error = %err, "lock record unreadable");
                return None;
            }
        };

        match serde_json::from_str::<LockRecord>(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(target = "webmux.lock", path = %self.path.display(), error = %err, "lock record corrupt, treating as absent");
                None
            }
        }
    }

    /// Writes `record`, creating parent directories as needed.
    pub fn write(&self, record: &LockRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::LockRegistry {
                    path: self.path.display().to_string(),
                    source,
                })?;
            }
        }

        let payload = serde_json::to_string(record)?;
        std::fs::write(&self.path, payload).map_err(|source| Error::LockRegistry {
            path: self.path.display().to_string(),
            source,
        })?;
        debug!(
            target = "webmux.lock",
            path = %self.path.display(),
            port = record.port,
            instance = %record.instance_id,
            "lock record written"
        );
        Ok(())
    }

    /// Removes the record, but only if it still names `instance_id`.
    ///
    /// A Primary that lingered past a takeover must not clobber its
    /// successor's record on the way out.
    pub fn remove_if(&self, instance_id: &str) -> Result<()> {
        match self.read() {
            Some(record) if record.instance_id == instance_id => {
                std::fs::remove_file(&self.path).map_err(|source| Error::LockRegistry {
                    path: self.path.display().to_string(),
                    source,
                })
            }
            _ => Ok(()),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn registry_in(dir: &TempDir) -> LockRegistry {
        LockRegistry::new(dir.path().join("webmux.lock"))
    }

    #[test]
    fn read_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(registry_in(&dir).read().is_none());
    }

    #[test]
    fn read_corrupt_file_is_none() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        std::fs::write(registry.path(), "not json{").unwrap();
        assert!(registry.read().is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let record = new_record(9400);
        registry.write(&record).unwrap();
        assert_eq!(registry.read().unwrap(), record);
    }

    #[test]
    fn later_write_wins() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry.write(&new_record(9400)).unwrap();
        let newer = new_record(9500);
        registry.write(&newer).unwrap();
        assert_eq!(registry.read().unwrap().port, 9500);
    }

    #[test]
    fn remove_if_only_clears_own_record() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let successor = new_record(9500);
        registry.write(&successor).unwrap();

        registry.remove_if("some-older-instance").unwrap();
        assert_eq!(registry.read().unwrap(), successor, "successor record must survive");

        registry.remove_if(&successor.instance_id).unwrap();
        assert!(registry.read().is_none());
    }

    #[test]
    fn minted_instance_ids_differ() {
        assert_ne!(mint_instance_id(), mint_instance_id());
        assert_eq!(mint_instance_id().len(), 16);
    }
}
