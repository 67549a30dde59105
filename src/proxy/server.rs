//! HTTP server setup and configuration.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use super::bookkeeping::Bookkeeper;
use super::handlers;
use super::rate_limit::{limit_by_client, ClientRateLimiter};
use super::upstream::UpstreamClients;
use crate::config::Config;
use crate::health::Scheduler;
use crate::router::Selector;
use crate::storage::{init_pool, AccountDirectory, LogStore, SqliteStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<dyn AccountDirectory>,
    pub selector: Selector,
    pub clients: Arc<UpstreamClients>,
    pub bookkeeper: Bookkeeper,
}

impl AppState {
    /// Wire the state around an existing directory.
    ///
    /// Returns the state and the handle of the bookkeeping worker.
    pub fn new(
        config: Config,
        directory: Arc<dyn AccountDirectory>,
        logs: Arc<dyn LogStore>,
    ) -> crate::error::Result<(Self, tokio::task::JoinHandle<()>)> {
        let clients = UpstreamClients::new(&config.relay)?;
        let pricing = Arc::new(config.pricing.table());
        let logs = config.logging.log_requests.then_some(logs);
        let (bookkeeper, worker) = Bookkeeper::spawn(
            directory.clone(),
            logs,
            pricing,
            config.relay.bookkeeping_queue_capacity,
        );

        let state = Self {
            config: Arc::new(config),
            selector: Selector::new(directory.clone()),
            directory,
            clients: Arc::new(clients),
            bookkeeper,
        };
        Ok((state, worker))
    }
}

/// Create the axum router with all endpoints.
///
/// `/v1/messages` is limited per client IP unless
/// `server.rate_limit_per_second` is 0.
pub fn create_router(state: AppState) -> Router {
    let per_second = state.config.server.rate_limit_per_second;
    let mut messages = post(handlers::messages);
    if per_second > 0 {
        let limiter = Arc::new(ClientRateLimiter::new(per_second, Duration::from_secs(1)));
        messages = messages.route_layer(middleware::from_fn_with_state(limiter, limit_by_client));
    }

    Router::new()
        .route("/v1/messages", messages)
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server and, unless disabled, the background health jobs.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    let pool = init_pool(&config.database.path).await?;
    tracing::info!(path = %config.database.path, "Database initialized");
    let store = Arc::new(SqliteStore::new(pool));

    let (state, _worker) = AppState::new(config, store.clone(), store.clone())?;

    let scheduler = if state.config.health.enabled {
        Some(Scheduler::start(
            state.config.clone(),
            store.clone(),
            store,
            state.clients.clone(),
        ))
    } else {
        tracing::info!("Background health jobs disabled");
        None
    };

    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting ccrelay server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown();
    }
    state.bookkeeper.flush().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
