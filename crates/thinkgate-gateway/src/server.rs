use crate::chat::chat_handler;
use crate::keys::{create_key_handler, list_keys_handler, revoke_key_handler};
use crate::middleware::{auth_middleware, rate_limit_middleware};
use crate::status::{health_handler, metrics_handler, ready_handler, startup_handler};
use axum::{
    middleware as axum_mw,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thinkgate_agent::{Dispatcher, RecursiveThinkingEngine};
use thinkgate_security::{ApiKeyManager, AuditLog, RateLimiter};
use tokio::net::TcpListener;
use tracing::info;

/// Shared application state.
pub struct AppState {
    /// Serves chat requests.
    pub engine: Arc<RecursiveThinkingEngine>,
    /// The engine's dispatcher, kept for status and metrics.
    pub dispatcher: Arc<Dispatcher>,
    /// Validates bearer tokens and manages keys.
    pub keys: Arc<ApiKeyManager>,
    /// Per-key request limiter.
    pub limiter: Arc<RateLimiter>,
    /// Access and key lifecycle log.
    pub audit: Arc<AuditLog>,
    /// For uptime.
    pub started: Instant,
    /// Reported by `/startup`.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Builds the state; the dispatcher is the one the engine thinks with.
    pub fn new(
        engine: Arc<RecursiveThinkingEngine>,
        keys: Arc<ApiKeyManager>,
        limiter: Arc<RateLimiter>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            dispatcher: engine.dispatcher().clone(),
            engine,
            keys,
            limiter,
            audit,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

/// The main gateway server.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router.
    ///
    /// Health endpoints (`/health`, `/ready`, `/startup`) are public. Everything else
    /// goes through auth and then per-key rate limiting.
    pub fn build(state: Arc<AppState>) -> Router {
        let protected = Router::new()
            .route("/api/v1/chat", post(chat_handler))
            .route(
                "/api/v1/keys",
                post(create_key_handler).get(list_keys_handler),
            )
            .route("/api/v1/keys/{id}", delete(revoke_key_handler))
            .route("/metrics", get(metrics_handler))
            .route_layer(axum_mw::from_fn_with_state(
                state.clone(),
                rate_limit_middleware,
            ))
            .route_layer(axum_mw::from_fn_with_state(state.clone(), auth_middleware));

        Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/startup", get(startup_handler))
            .merge(protected)
            .with_state(state)
    }

    /// Serve `router` on `listener` until `shutdown` resolves, then drain
    /// in-flight requests.
    pub async fn serve(
        listener: TcpListener,
        router: Router,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Gateway listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("Gateway stopped");
        Ok(())
    }
}
