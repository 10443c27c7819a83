//! Pool entries
//!
//! A `BrowserSession` is one authenticated, long-lived browser owned by the
//! pool. Identity is the credentials hash; at most one live session exists
//! per identity.

use crate::artifacts::ArtifactStore;
use crate::driver::Drive;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Portal credentials. Username + password define the user identity; the
/// captcha key only matters while logging in.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub captcha_key: String,
}

impl Credentials {
    /// Pool lookup key: hex-truncated SHA-256 over username and password.
    pub fn pool_key(&self) -> String {
        credentials_hash(&self.username, &self.password)
    }
}

pub fn credentials_hash(username: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// One authenticated browser. Exclusive ownership of the driver; the pool
/// serializes access through the mutex wrapping this value.
pub struct BrowserSession {
    pub session_id: String,
    pub credentials_hash: String,
    pub username: String,
    pub driver: Box<dyn Drive>,
    pub download_dir: PathBuf,
    pub screenshot_dir: PathBuf,
}

impl BrowserSession {
    /// Cheap liveness probe; a driver that cannot report its URL is dead.
    pub async fn is_alive(&self) -> bool {
        self.driver.current_url().await.is_ok()
    }

    /// Screenshot into this session's screenshot dir. Failures are logged
    /// and swallowed; forensics never abort the operation they document.
    pub async fn capture(&self, store: &ArtifactStore, tag: &str) -> Option<String> {
        let path = match store.screenshot_path(&self.session_id, tag) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "could not allocate screenshot path");
                return None;
            }
        };
        match self.driver.screenshot_to(&path).await {
            Ok(()) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "screenshot failed");
                None
            }
        }
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.driver.close().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "error closing browser");
        }
    }
}

/// Snapshot row for `/health` and `/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_refreshed_at: DateTime<Utc>,
    pub keep_alive: bool,
    pub in_use: bool,
}
