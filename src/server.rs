//! HTTP server assembly and startup sequencing.
//!
//! Grounded on the teacher's `server.rs`: one `AppState` passed to every
//! handler via axum's `State` extractor, router built once at startup,
//! background sweepers spawned alongside the bind/serve call.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::accept::AcceptEngine;
use crate::barrier::BarrierCoordinator;
use crate::carrier::{self, CarrierClient};
use crate::config::Config;
use crate::database::DatabaseManager;
use crate::diagnostics::{self, Diagnostics};
use crate::error::Result;
use crate::lifecycle::LifecycleCoordinator;
use crate::realtime::{self, RealtimeClient};
use crate::registry::IdentifierRegistry;
use crate::session_store::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: DatabaseManager,
    pub registry: Arc<IdentifierRegistry>,
    pub sessions: Arc<SessionStore>,
    pub barriers: Arc<BarrierCoordinator>,
    pub carrier: Arc<CarrierClient>,
    pub realtime: Arc<RealtimeClient>,
    pub lifecycle: Arc<LifecycleCoordinator>,
    pub diagnostics: Arc<Diagnostics>,
    pub accept_engine: Arc<AcceptEngine>,
}

/// Build the app state: DB connect + migrate, then every component wired
/// together the way `main.rs` needs them for both serving and startup
/// reload.
pub async fn build_state(config: Config) -> Result<AppState> {
    let config = Arc::new(config);
    let db = DatabaseManager::new(&config.database_url).await?;
    let registry = Arc::new(IdentifierRegistry::new());
    let sessions = Arc::new(SessionStore::new(db.clone(), registry.clone()));
    let barriers = Arc::new(BarrierCoordinator::new());
    let carrier = Arc::new(CarrierClient::new(config.carrier.clone()));
    let realtime = Arc::new(RealtimeClient::new(config.realtime.clone()));
    let diagnostics = Arc::new(Diagnostics::new());
    let lifecycle = Arc::new(LifecycleCoordinator::new(
        db.clone(),
        carrier.clone(),
        diagnostics.clone(),
        config.realtime_unit_rate_cents_per_min,
    ));
    let accept_engine = Arc::new(AcceptEngine::new(
        sessions.clone(),
        registry.clone(),
        barriers.clone(),
        carrier.clone(),
        realtime.clone(),
        diagnostics.clone(),
        lifecycle.clone(),
        db.clone(),
        config.clone(),
    ));

    crate::redact::set_phi_redaction(config.phi_redaction);

    let reloaded = sessions.reload_from_durable_store().await?;
    info!("🚀 startup reload found {} in-flight sessions", reloaded);

    Ok(AppState {
        config,
        db,
        registry,
        sessions,
        barriers,
        carrier,
        realtime,
        lifecycle,
        diagnostics,
        accept_engine,
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/incoming-call", post(carrier::webhooks::incoming_call))
        .route("/conference-events", post(carrier::webhooks::conference_events))
        .route("/recording-status", post(carrier::webhooks::recording_status))
        .route("/status-callback", post(carrier::webhooks::status_callback))
        .route("/realtime", post(realtime::webhook::handle_webhook))
        .route("/diagnostics", get(diagnostics::get_diagnostics))
        .route("/diagnostics/active", get(diagnostics::get_active))
        .route("/diagnostics/recent-failures", get(diagnostics::get_recent_failures))
        .route("/healthz", get(diagnostics::healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodic TTL sweep over the session store (spec §4.2).
fn spawn_session_sweeper(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            match state.sessions.sweep_expired().await {
                Ok(n) if n > 0 => info!("🧹 swept {} expired sessions", n),
                Ok(_) => {}
                Err(e) => error!("⚠️ session sweep failed: {}", e),
            }
        }
    });
}

/// Stale-call cleanup: any session sitting in a non-terminal state past the
/// 10-minute hard cap gets a synthesized `call-ended(outcome=timeout)`
/// (spec §4.5).
fn spawn_stale_call_sweeper(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now();
            let stale: Vec<String> = state
                .sessions
                .active_sessions()
                .into_iter()
                .filter(|s| !s.state.is_terminal() && now - s.created_at > chrono::Duration::minutes(10))
                .map(|s| s.conference_name)
                .collect();
            if !stale.is_empty() {
                info!("⏱️ sweeping {} stale calls past the 10-minute hard cap", stale.len());
                state.lifecycle.sweep_stale(&stale).await;
            }
        }
    });
}

pub async fn run(config: Config) -> Result<()> {
    let bind_addr = config.bind_addr.clone();
    let state = build_state(config).await?;

    spawn_session_sweeper(state.clone());
    spawn_stale_call_sweeper(state.clone());

    let app = build_router(state);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("🎧 listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("🛑 shutdown signal received");
}
