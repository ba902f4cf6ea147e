use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use finguard_auth::{
    AuthenticationFacade, CoreContext, require_auth, spawn_cleanup_task, system_clock,
};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::handlers::{self, AppState};

pub fn build_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/me", get(handlers::me))
        .route("/logout", post(handlers::logout))
        .route_layer(middleware::from_fn_with_state(
            state.facade.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct FinguardServer {
    addr: SocketAddr,
    app: Router,
    cleanup: JoinHandle<()>,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let config = AppConfig::default();
        Self {
            addr: config.addr(),
            config,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Connects the store, builds the security core, and starts the
    /// session sweeper.
    pub async fn build(self) -> anyhow::Result<FinguardServer> {
        let clock = system_clock();
        let store = finguard_auth_redis::create_store(&self.config.redis, clock.clone()).await?;
        let ctx = CoreContext::from_config(store.clone(), clock, &self.config.security);
        let facade = AuthenticationFacade::from_config(&self.config.security, ctx)?;

        let cleanup = spawn_cleanup_task(
            Arc::clone(facade.sessions()),
            self.config.server.session_cleanup_interval(),
        );

        let app = build_app(AppState { facade, store });
        Ok(FinguardServer {
            addr: self.addr,
            app,
            cleanup,
        })
    }
}

impl FinguardServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let result = axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;
        self.cleanup.abort();
        result?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
