//! Artifact janitor
//!
//! Periodic reaper for the artifact root: any file whose mtime is older
//! than the TTL goes away. Directories stay (active sessions re-populate
//! them); the generated proxy extension is exempt.

use crate::driver::proxy_ext::{EXTENSION_DIR, EXTENSION_ZIP};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// Delete files under `root` older than `ttl`. Returns how many went.
pub fn sweep(root: &Path, ttl: Duration) -> usize {
    let cutoff = SystemTime::now()
        .checked_sub(ttl)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    sweep_dir(root, cutoff, true)
}

fn sweep_dir(dir: &Path, cutoff: SystemTime, is_root: bool) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut deleted = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let name = entry.file_name();
        if is_root && (name == EXTENSION_DIR || name == EXTENSION_ZIP) {
            continue;
        }
        if path.is_dir() {
            deleted += sweep_dir(&path, cutoff, false);
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| mtime < cutoff)
            .unwrap_or(false);
        if expired {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "janitor removed expired artifact");
                    deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "janitor failed to remove file");
                }
            }
        }
    }
    deleted
}

/// Spawn the periodic sweep task. The handle is owned by the server and
/// aborted on shutdown.
pub fn spawn(root: std::path::PathBuf, ttl: Duration, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would sweep at startup; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = sweep(&root, ttl);
            if removed > 0 {
                tracing::info!(removed, "janitor sweep complete");
            }
        }
    })
}
