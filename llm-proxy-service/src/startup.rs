//! Application startup and lifecycle management.
//!
//! Shutdown order: stop accepting connections, drain the dispatcher (queued
//! requests admitted, in-flight exchanges finished), wait for pending usage
//! writes, then close the store.

use crate::config::{ProxyConfig, StorageBackend};
use crate::handlers;
use crate::services::{
    Exchange, MemoryStore, SessionAccountant, SessionStore, SqliteStore, UpstreamClient,
};
use crate::workers::Dispatcher;
use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::get,
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub accountant: SessionAccountant,
    pub dispatcher: Arc<Dispatcher>,
    /// Forward-then-record tasks, detached from the request that started them.
    pub settlements: TaskTracker,
}

pub fn build_router(state: AppState) -> Router {
    let max_body_bytes = state.config.max_body_bytes;

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/sessions/status", get(handlers::list_sessions))
        .route(
            "/v1/session/:session_id/status",
            get(handlers::get_session).fallback(handlers::proxy),
        )
        .fallback(handlers::proxy)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_id_middleware))
}

/// Open the configured session store and run its initialization.
pub async fn connect_store(config: &ProxyConfig) -> Result<Arc<dyn SessionStore>, AppError> {
    let store: Arc<dyn SessionStore> = match config.storage.backend() {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory session storage");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::Sqlite => {
            tracing::info!(dsn = %config.storage.sqlite_dsn, "Using SQLite session storage");
            let store = SqliteStore::connect(
                &config.storage.sqlite_dsn,
                config.storage.sqlite_max_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!("Failed to open SQLite session store: {}", e);
                AppError::from(e)
            })?;
            Arc::new(store)
        }
    };

    store.init().await.map_err(|e| {
        tracing::error!("Failed to initialize session store: {}", e);
        AppError::from(e)
    })?;

    Ok(store)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    pub async fn build(config: ProxyConfig) -> Result<Self, AppError> {
        let store = connect_store(&config).await?;
        let upstream: Arc<dyn Exchange> = Arc::new(UpstreamClient::new(&config.upstream)?);
        Self::build_with(config, store, upstream).await
    }

    /// Build around an already-initialized store and upstream.
    pub async fn build_with(
        config: ProxyConfig,
        store: Arc<dyn SessionStore>,
        upstream: Arc<dyn Exchange>,
    ) -> Result<Self, AppError> {
        let dispatcher = Arc::new(Dispatcher::new(upstream, config.upstream.rate_limit_per_min));

        let state = AppState {
            config: config.clone(),
            accountant: SessionAccountant::new(store),
            dispatcher,
            settlements: TaskTracker::new(),
        };

        // port 0 binds a random port for tests
        let addr = config.common.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            upstream = %config.upstream.base_url,
            "LLM proxy listening"
        );

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then drain and release resources.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.state.clone();
        let app = build_router(self.state);

        let served = axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await;
        if let Err(e) = &served {
            tracing::error!("HTTP server error: {}", e);
        }

        state.dispatcher.shutdown().await;
        state.settlements.close();
        state.settlements.wait().await;
        if let Err(e) = state.accountant.close().await {
            tracing::error!("Failed to close session store: {}", e);
        }
        tracing::info!("LLM proxy stopped");

        served
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
