//! Account failover daemon
//!
//! Single-binary service that:
//! 1. Loads account profiles and credentials from file-backed stores
//! 2. Runs the usage poller (token refresh, usage polling, proactive and
//!    reactive account swaps)
//! 3. Logs every emitted event as structured tracing output
//! 4. Serves `/health`, `/usage` (consolidated view), and `/metrics`

mod config;
mod metrics;

use std::sync::Arc;

use account_auth::{
    Credential, CredentialKind, CredentialStore, FileCredentialStore, HttpTokenEndpoint,
    TokenRefreshEngine,
};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use common::{Clock, CooldownTracker, SystemClock};
use failover::{
    AccountStore, Event, EventBus, FileAccountStore, InMemoryOperationRegistry, PollerDeps,
    RateLimitTracker, UsagePoller, resolve_active,
};
use metrics_exporter_prometheus::PrometheusHandle;
use provider_usage::UsageFetcher;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    accounts: Arc<dyn AccountStore>,
    poller: Arc<UsagePoller>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/usage", get(usage_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting account-failover-daemon");

    // Install the Prometheus recorder before any counters are emitted
    let prometheus = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.daemon.listen_addr,
        poll_interval_secs = config.poller.interval_secs,
        proactive_swap = config.poller.proactive_swap,
        "configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let http = reqwest::Client::builder()
        .timeout(config.poller.http_timeout())
        .build()
        .context("building HTTP client")?;

    let credentials = Arc::new(
        FileCredentialStore::load(config.storage.credentials_path.clone())
            .await
            .context("loading credential store")?,
    );
    let accounts = Arc::new(
        FileAccountStore::load(config.storage.accounts_path.clone())
            .await
            .context("loading account store")?,
    );

    seed_api_key(&config, accounts.as_ref(), credentials.as_ref()).await?;

    let api_cooldown = Arc::new(CooldownTracker::new(
        config.poller.api_cooldown(),
        clock.clone(),
    ));
    let auth_cooldown = Arc::new(CooldownTracker::new(
        config.poller.auth_cooldown(),
        clock.clone(),
    ));
    let rate_limits = Arc::new(RateLimitTracker::new(clock.clone()));
    let refresh = Arc::new(
        TokenRefreshEngine::new(
            Arc::new(HttpTokenEndpoint::new(http.clone())),
            credentials.clone(),
            clock.clone(),
        )
        .with_lookahead(config.poller.refresh_lookahead()),
    );
    let fetcher = Arc::new(UsageFetcher::new(http, clock.clone(), api_cooldown.clone()));
    let registry = Arc::new(InMemoryOperationRegistry::new(clock.clone()));

    let events = EventBus::default();
    spawn_event_logger(&events);

    let poller = Arc::new(UsagePoller::new(
        config.poller.poller_config(),
        PollerDeps {
            accounts: accounts.clone(),
            credentials: credentials.clone(),
            refresh,
            usage: fetcher,
            api_cooldown,
            auth_cooldown,
            rate_limits,
            registry,
            events: events.clone(),
            clock,
        },
    ));
    poller.start();

    let state = AppState {
        accounts,
        poller: poller.clone(),
        prometheus,
    };
    let router = build_router(state, config.daemon.max_connections);

    let listener = TcpListener::bind(config.daemon.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.daemon.listen_addr))?;
    info!(addr = %config.daemon.listen_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    // Stop only the timer; an in-flight poll cycle completes on its own
    poller.stop();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received, draining");
}

/// Seed the credential store from the configured API key for any API-key
/// account that has no stored credential yet.
async fn seed_api_key(
    config: &Config,
    accounts: &FileAccountStore,
    credentials: &FileCredentialStore,
) -> Result<()> {
    let Some(ref key) = config.daemon.api_key else {
        return Ok(());
    };
    for account in accounts.list().await {
        if account.kind != CredentialKind::ApiKey {
            continue;
        }
        if credentials.get(&account.id).await.is_some() {
            continue;
        }
        credentials
            .set(
                &account.id,
                Credential {
                    kind: CredentialKind::ApiKey,
                    value: key.expose().clone(),
                    refresh_token: None,
                    expires_at: None,
                    email: None,
                    scopes: vec![],
                },
            )
            .await
            .with_context(|| format!("seeding credential for {}", account.id))?;
        info!(account_id = %account.id, "seeded api-key credential from environment");
    }
    Ok(())
}

/// Forward every engine event into the structured log.
fn spawn_event_logger(events: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event logger lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &Event) {
    match event {
        Event::UsageUpdated(snapshot) => info!(
            account_id = %snapshot.account_id,
            session = snapshot.session_percent,
            weekly = snapshot.weekly_percent,
            limit_type = snapshot.limit_type().as_str(),
            "usage updated"
        ),
        Event::AllAccountsUsageUpdated(summary) => debug!(
            accounts = summary.accounts.len(),
            "consolidated usage updated"
        ),
        Event::SwapCompleted {
            from,
            to,
            limit_type,
            ..
        } => info!(
            from = %from,
            to = %to,
            limit_type = limit_type.map(|l| l.as_str()).unwrap_or("none"),
            "account swap completed"
        ),
        Event::SwapFailed {
            reason,
            current_account,
            excluded_accounts,
        } => warn!(
            reason = %reason,
            current_account = %current_account,
            excluded = excluded_accounts.len(),
            "account swap failed"
        ),
        Event::OperationsRestarted { from, to, count } => info!(
            from = %from,
            to = %to,
            count,
            "operations restarted on new account"
        ),
        Event::QueueBlocked { reason, .. } => warn!(reason = %reason, "queue blocked"),
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let accounts = state.accounts.list().await;
    let active = resolve_active(&accounts);
    let status = if accounts.is_empty() {
        "unhealthy"
    } else if active.is_some() {
        "healthy"
    } else {
        "degraded"
    };

    let entries: Vec<serde_json::Value> = accounts
        .iter()
        .map(|a| {
            serde_json::json!({
                "id": a.id,
                "name": a.name,
                "provider": a.provider,
                "kind": a.kind,
                "active": a.active,
                "session_percent": a.session_percent,
                "weekly_percent": a.weekly_percent,
            })
        })
        .collect();

    Json(serde_json::json!({
        "status": status,
        "active_account": active.map(|a| a.id.clone()),
        "accounts_total": accounts.len(),
        "accounts": entries,
    }))
    .into_response()
}

/// The consolidated view: fans out over every inactive account (TTL
/// cached) and returns availability + snapshots for all accounts.
async fn usage_handler(State(state): State<AppState>) -> Response {
    Json(state.poller.refresh_all_accounts().await).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.prometheus.render()
}
