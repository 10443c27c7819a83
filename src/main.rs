//! portside - HTTP gateway to a drayage terminal portal
//!
//! Drives a pool of authenticated headless browsers on behalf of JSON
//! clients: container listings, gate-status timelines, booking lookups,
//! and the three-phase appointment workflow.

mod api;
mod appointment;
mod artifacts;
mod auth;
mod captcha;
mod config;
mod detail;
mod driver;
mod error;
mod janitor;
mod listing;
mod pool;
mod portal;
mod session;

use api::{create_router, AppState};
use artifacts::ArtifactStore;
use auth::PortalLogin;
use captcha::HttpCaptchaSolver;
use config::Config;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portside=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();
    config.validate()?;

    tracing::info!(root = %config.artifact_root.display(), "opening artifact store");
    let store = ArtifactStore::new(config.artifact_root.clone())?;

    // The proxy-auth extension is a pure function of the proxy config;
    // regenerating at startup keeps it in sync with the environment.
    let extension_dir = match &config.proxy {
        Some(proxy) => {
            let dir = driver::proxy_ext::materialize(proxy, store.root())?;
            tracing::info!(path = %dir.display(), "proxy extension materialized");
            Some(dir)
        }
        None => None,
    };

    let solver = Arc::new(HttpCaptchaSolver::new(config.captcha_solver_url.clone()));
    let login = Arc::new(PortalLogin::new(
        config.portal_url.clone(),
        solver,
        store.clone(),
        config.proxy.clone(),
        extension_dir,
    ));

    let state = AppState::new(config, login, store.clone())?;

    // Background workers, owned here and stopped on shutdown.
    let refresher = state.pool.spawn_refresher(state.config.refresh_tick);
    let janitor_task = janitor::spawn(
        store.root().to_path_buf(),
        state.config.file_ttl,
        state.config.janitor_interval,
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = state.config.listen_addr;
    tracing::info!(
        max_sessions = state.config.max_sessions,
        "portside listening on {addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    refresher.abort();
    janitor_task.abort();
    state.pool.shutdown().await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
