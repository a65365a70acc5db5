use anyhow::{Context, Result};
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::{ApiKeys, ServerConfig, ServiceConfig};
use crate::http::ClientHandle;
use crate::proxy::{self, AppState};
use crate::service::LlmService;

/// Runs the proxy until Ctrl-C.
#[tracing::instrument(skip(service, server))]
pub async fn serve(service: ServiceConfig, server: ServerConfig) -> Result<()> {
    let addr = server.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    serve_on(listener, service, server, shutdown_signal()).await
}

/// Runs the proxy on an already bound listener until `shutdown` resolves.
///
/// The LLM service must pass a health check first. The shared HTTP client
/// is closed once the server has drained.
pub async fn serve_on<F>(
    listener: TcpListener,
    service: ServiceConfig,
    server: ServerConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = Arc::new(ClientHandle::new(service.timeout()));
    let llm = LlmService::new(&service, Arc::clone(&handle));

    info!("Checking LLM service at {}", llm.base_url());
    if let Err(e) = llm.health().await {
        handle.close().await;
        return Err(e).with_context(|| {
            format!(
                "LLM service at {} is not available, refusing to start",
                llm.base_url()
            )
        });
    }
    info!("LLM service is healthy");

    let api_keys: ApiKeys = server.api_keys.into_iter().collect();
    if api_keys.is_empty() {
        warn!("No API keys configured, every authenticated route will answer 401");
    } else {
        info!("Accepting {} API keys", api_keys.len());
    }

    let state = Arc::new(AppState::new(Arc::new(llm), api_keys, service));
    let result = proxy::serve(listener, state, shutdown).await;

    handle.close().await;
    result
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            warn!("Cannot listen for Ctrl-C ({}), running until killed", e);
            std::future::pending::<()>().await
        }
    }
}
