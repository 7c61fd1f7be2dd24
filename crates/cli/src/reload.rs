//! Hot-reload collaborators wired into the serializer by the Primary.
//!
//! The detector watches the server and companion source roots by modification
//! time: the first check records a high-water mark, later checks report a
//! rebuild when anything under a root is newer. A build orchestrator signals
//! a failed build by leaving its log in a `.webmux-build-error` file at the
//! root; the marker's presence suppresses the rebuilt flag so a broken tree
//! never triggers a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use webmux_core::error::{Error, Result};
use webmux_core::lock::LockRegistry;
use webmux_core::serializer::{ChangeCheckResult, ChangeDetector, ShutdownHooks, SideChannel};

const BUILD_ERROR_MARKER: &str = ".webmux-build-error";
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "dist"];
const MAX_WALK_DEPTH: usize = 8;

struct ScanOutcome {
    newest: Option<SystemTime>,
    build_error: Option<String>,
}

/// Modification-time change detector over the two watched roots.
#[derive(Default)]
pub struct MtimeChangeDetector {
    high_water: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl MtimeChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns (changed, rebuilt) for one root and advances its high-water
    /// mark.
    fn account(
        seen: &mut HashMap<PathBuf, SystemTime>,
        root: &Path,
        scan: &ScanOutcome,
    ) -> (bool, bool) {
        let Some(newest) = scan.newest else {
            return (false, false);
        };
        let prev = seen.get(root).copied();
        let changed = prev.is_some_and(|prev| newest > prev);
        seen.insert(root.to_path_buf(), prev.map_or(newest, |prev| prev.max(newest)));
        (changed, changed && scan.build_error.is_none())
    }
}

#[async_trait]
impl ChangeDetector for MtimeChangeDetector {
    async fn check(&self, server_root: &Path, companion_root: &Path) -> Result<ChangeCheckResult> {
        let server = scan(server_root.to_path_buf()).await?;
        let companion = scan(companion_root.to_path_buf()).await?;

        let mut seen = self.high_water.lock().await;
        let (own_changed, own_rebuilt) = Self::account(&mut seen, server_root, &server);
        let (companion_changed, companion_rebuilt) =
            Self::account(&mut seen, companion_root, &companion);

        Ok(ChangeCheckResult {
            own_source_changed: own_changed,
            own_rebuilt,
            own_build_error: server.build_error,
            companion_changed,
            companion_rebuilt,
            companion_build_error: companion.build_error,
            reconnect_port: None,
            reconnect_timestamp: None,
        })
    }
}

async fn scan(root: PathBuf) -> Result<ScanOutcome> {
    tokio::task::spawn_blocking(move || {
        let mut outcome = ScanOutcome {
            newest: None,
            build_error: None,
        };
        if let Ok(log) = std::fs::read_to_string(root.join(BUILD_ERROR_MARKER)) {
            outcome.build_error = Some(log.trim().to_string());
        }
        walk(&root, 0, &mut outcome);
        outcome
    })
    .await
    .map_err(|err| Error::Handler(format!("source scan panicked: {err}")))
}

fn walk(dir: &Path, depth: usize, outcome: &mut ScanOutcome) {
    if depth > MAX_WALK_DEPTH {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            walk(&entry.path(), depth + 1, outcome);
        } else if let Ok(modified) = meta.modified() {
            if outcome.newest.is_none_or(|newest| modified > newest) {
                outcome.newest = Some(modified);
            }
        }
    }
}

/// Side channel for builds without a companion control link.
pub struct NoopSideChannel;

#[async_trait]
impl SideChannel for NoopSideChannel {
    async fn suspend(&self) -> Result<()> {
        Ok(())
    }

    async fn reconcile(&self, outcome: &ChangeCheckResult) -> Result<()> {
        debug!(
            target = "webmux.reload",
            own_rebuilt = outcome.own_rebuilt,
            companion_rebuilt = outcome.companion_rebuilt,
            "reconciled change check"
        );
        Ok(())
    }
}

/// Production shutdown hooks: drop the lock record, then exit.
pub struct ProcessHooks {
    registry: LockRegistry,
    instance_id: String,
}

impl ProcessHooks {
    pub fn new(registry: LockRegistry, instance_id: String) -> Self {
        Self {
            registry,
            instance_id,
        }
    }
}

#[async_trait]
impl ShutdownHooks for ProcessHooks {
    async fn notify_companion(&self) -> Result<()> {
        // No companion control link in this build; the supervisor restarting
        // us observes process exit instead.
        debug!(target = "webmux.reload", "no companion to notify");
        Ok(())
    }

    async fn release_resources(&self) -> Result<()> {
        self.registry.remove_if(&self.instance_id)
    }

    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn touch(path: &Path, contents: &str) {
        tokio::fs::write(path, contents).await.unwrap();
    }

    #[tokio::test]
    async fn first_check_is_the_baseline() {
        let server = tempfile::tempdir().unwrap();
        let companion = tempfile::tempdir().unwrap();
        touch(&server.path().join("main.rs"), "fn main() {}").await;

        let detector = MtimeChangeDetector::new();
        let outcome = detector.check(server.path(), companion.path()).await.unwrap();
        assert!(!outcome.own_source_changed);
        assert!(!outcome.own_rebuilt);
        assert!(outcome.own_build_error.is_none());
    }

    #[tokio::test]
    async fn write_after_baseline_reports_rebuild() {
        let server = tempfile::tempdir().unwrap();
        let companion = tempfile::tempdir().unwrap();
        touch(&server.path().join("main.rs"), "fn main() {}").await;

        let detector = MtimeChangeDetector::new();
        detector.check(server.path(), companion.path()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        touch(&server.path().join("lib.rs"), "pub fn f() {}").await;

        let outcome = detector.check(server.path(), companion.path()).await.unwrap();
        assert!(outcome.own_source_changed);
        assert!(outcome.own_rebuilt);
        assert!(!outcome.companion_changed);
    }

    #[tokio::test]
    async fn build_error_marker_suppresses_rebuilt() {
        let server = tempfile::tempdir().unwrap();
        let companion = tempfile::tempdir().unwrap();
        touch(&companion.path().join("index.ts"), "export {}").await;

        let detector = MtimeChangeDetector::new();
        detector.check(server.path(), companion.path()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        touch(&companion.path().join("index.ts"), "export default 1").await;
        touch(
            &companion.path().join(BUILD_ERROR_MARKER),
            "index.ts(1,1): type error",
        )
        .await;

        let outcome = detector.check(server.path(), companion.path()).await.unwrap();
        assert!(outcome.companion_changed);
        assert!(!outcome.companion_rebuilt);
        assert_eq!(
            outcome.companion_build_error.as_deref(),
            Some("index.ts(1,1): type error")
        );
    }

    #[tokio::test]
    async fn release_resources_drops_only_our_lock_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LockRegistry::new(dir.path().join("webmux.lock"));
        let record = webmux_core::lock::new_record(9400);
        registry.write(&record).unwrap();

        let hooks = ProcessHooks::new(
            LockRegistry::new(registry.path().to_path_buf()),
            "someone-else".to_string(),
        );
        hooks.release_resources().await.unwrap();
        assert!(registry.read().is_some(), "foreign record must survive");

        let hooks = ProcessHooks::new(
            LockRegistry::new(registry.path().to_path_buf()),
            record.instance_id.clone(),
        );
        hooks.release_resources().await.unwrap();
        assert!(registry.read().is_none());
    }
}
