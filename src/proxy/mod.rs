//! REST facade in front of the LLM session service.
//!
//! Requests are authenticated against a static API key table, forwarded
//! through an [`LlmBackend`], and the caller's open tabs are cached in a
//! [`SessionStore`].

mod auth;
mod error;
mod handlers;
mod sessions;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{delete, get, post};
use log::info;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::{ApiKeys, ServiceConfig};
use crate::service::LlmBackend;

pub use auth::{API_KEY_HEADER, ApiKey};
pub use error::ApiError;
pub use handlers::{SERVICE_NAME, provider_url};
pub use sessions::{SessionStore, TabSession};

/// Shared state of all proxy handlers.
pub struct AppState {
    pub backend: Arc<dyn LlmBackend>,
    pub sessions: SessionStore,
    pub api_keys: ApiKeys,
    /// Reported by `/health` and `/debug/sessions`.
    pub service: ServiceConfig,
}

impl AppState {
    pub fn new(backend: Arc<dyn LlmBackend>, api_keys: ApiKeys, service: ServiceConfig) -> Self {
        Self {
            backend,
            sessions: SessionStore::new(),
            api_keys,
            service,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tabs", post(handlers::create_tab).get(handlers::list_tabs))
        .route("/tabs/:provider", delete(handlers::close_tab))
        .route("/tabs/:provider/screenshot", post(handlers::take_screenshot))
        .route("/chat/:provider", post(handlers::chat))
        .route("/health", get(handlers::health))
        .route("/debug/sessions", get(handlers::debug_sessions))
        .route("/admin/cleanup", post(handlers::admin_cleanup))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the proxy on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!("Listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Proxy server failed")
}
