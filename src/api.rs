//! HTTP API

mod handlers;
mod types;

pub use handlers::create_router;
pub use types::*;

use crate::appointment::{SubSessionStore, WizardRunner};
use crate::artifacts::ArtifactStore;
use crate::auth::LoginFlow;
use crate::config::Config;
use crate::detail::DetailEngine;
use crate::listing::ListingEngine;
use crate::pool::{PoolConfig, SessionPool};
use std::sync::Arc;

/// Application state shared across handlers: the pool, the engines, the
/// artifact store, and the appointment sub-session store.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<SessionPool>,
    pub store: ArtifactStore,
    pub sub_sessions: Arc<SubSessionStore>,
    pub listing: Arc<ListingEngine>,
    pub detail: Arc<DetailEngine>,
    pub wizard: Arc<WizardRunner>,
}

impl AppState {
    pub fn new(
        config: Config,
        login: Arc<dyn LoginFlow>,
        store: ArtifactStore,
    ) -> Result<Self, regex::Error> {
        let pool = SessionPool::new(
            login,
            store.clone(),
            PoolConfig {
                max_sessions: config.max_sessions,
                refresh_interval: config.session_refresh_interval,
                portal_url: config.portal_url.clone(),
            },
        );
        let listing = Arc::new(ListingEngine::new(&config.row_id_pattern)?);
        let detail = Arc::new(DetailEngine::new(&config.row_id_pattern)?);
        let wizard = Arc::new(WizardRunner::new(config.portal_url.clone()));
        let sub_sessions = Arc::new(SubSessionStore::new(config.appt_ttl));

        Ok(Self {
            config: Arc::new(config),
            pool,
            store,
            sub_sessions,
            listing,
            detail,
            wizard,
        })
    }
}
