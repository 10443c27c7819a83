//! Service configuration
//!
//! All knobs come from the process environment. Missing variables fall back
//! to defaults suitable for a single-host deployment; `validate()` rejects
//! values the rest of the service cannot operate with.

use regex::Regex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default pattern matching a container identifier in rendered row text:
/// four uppercase letters, six or seven digits, an optional check letter.
pub const DEFAULT_ROW_ID_PATTERN: &str = r"[A-Z]{4}\d{6,7}[A-Z]?";

/// Upstream proxy credentials, injected into the browser via a generated
/// extension so proxy-auth prompts never reach the UI.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,
    /// Hard cap on live browser sessions.
    pub max_sessions: usize,
    /// A keep-alive session is refreshed once its last refresh is older than this.
    pub session_refresh_interval: Duration,
    /// How often the background refresher wakes up.
    pub refresh_tick: Duration,
    /// Idle lifetime of an appointment sub-session.
    pub appt_ttl: Duration,
    /// Files under the artifact root older than this are reaped.
    pub file_ttl: Duration,
    /// How often the janitor sweeps.
    pub janitor_interval: Duration,
    /// Root directory for downloads, screenshots, and debug bundles.
    pub artifact_root: PathBuf,
    /// Base URL of the target portal.
    pub portal_url: String,
    /// Externally visible base URL used when building `file_url`s.
    pub public_url: String,
    /// Row-identifier pattern used by the listing engine's text counter.
    pub row_id_pattern: String,
    /// Captcha solver service endpoint.
    pub captcha_solver_url: String,
    /// Fallback captcha API key when a request supplies none.
    pub captcha_default_key: Option<String>,
    pub proxy: Option<ProxyConfig>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env_var(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    pub fn from_env() -> Self {
        let listen_addr = env_var("PORTSIDE_LISTEN_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8010)));

        let artifact_root = env_var("PORTSIDE_ARTIFACT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".portside").join("artifacts")
            });

        let proxy = match (env_var("PROXY_HOST"), env_var("PROXY_PORT")) {
            (Some(host), Some(port)) => port.parse().ok().map(|port| ProxyConfig {
                host,
                port,
                username: env_var("PROXY_USERNAME").unwrap_or_default(),
                password: env_var("PROXY_PASSWORD").unwrap_or_default(),
            }),
            _ => None,
        };

        Self {
            listen_addr,
            max_sessions: env_var("PORTSIDE_MAX_SESSIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            session_refresh_interval: env_secs("PORTSIDE_SESSION_REFRESH_INTERVAL", 300),
            refresh_tick: env_secs("PORTSIDE_REFRESH_TICK", 60),
            appt_ttl: env_secs("PORTSIDE_APPT_TTL", 600),
            file_ttl: env_secs("PORTSIDE_FILE_TTL", 86_400),
            janitor_interval: env_secs("PORTSIDE_JANITOR_INTERVAL", 3_600),
            artifact_root,
            portal_url: env_var("PORTSIDE_PORTAL_URL")
                .unwrap_or_else(|| "https://portal.example.com".to_string()),
            public_url: env_var("PORTSIDE_PUBLIC_URL")
                .unwrap_or_else(|| format!("http://{listen_addr}")),
            row_id_pattern: env_var("PORTSIDE_ROW_ID_PATTERN")
                .unwrap_or_else(|| DEFAULT_ROW_ID_PATTERN.to_string()),
            captcha_solver_url: env_var("PORTSIDE_CAPTCHA_SOLVER_URL")
                .unwrap_or_else(|| "https://api.captcha-solver.example.com".to_string()),
            captcha_default_key: env_var("PORTSIDE_CAPTCHA_DEFAULT_KEY"),
            proxy,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_sessions == 0 {
            return Err("PORTSIDE_MAX_SESSIONS must be greater than 0".to_string());
        }
        if self.session_refresh_interval.is_zero() || self.refresh_tick.is_zero() {
            return Err("session refresh intervals must be greater than 0".to_string());
        }
        if self.appt_ttl.is_zero() {
            return Err("PORTSIDE_APPT_TTL must be greater than 0".to_string());
        }
        if self.janitor_interval.is_zero() {
            return Err("PORTSIDE_JANITOR_INTERVAL must be greater than 0".to_string());
        }
        if let Err(e) = Regex::new(&self.row_id_pattern) {
            return Err(format!("PORTSIDE_ROW_ID_PATTERN is not a valid regex: {e}"));
        }
        if self.portal_url.is_empty() {
            return Err("PORTSIDE_PORTAL_URL cannot be empty".to_string());
        }
        Ok(())
    }

    /// Absolute URL under which a named artifact is served.
    pub fn file_url(&self, name: &str) -> String {
        format!("{}/files/{}", self.public_url.trim_end_matches('/'), name)
    }
}
