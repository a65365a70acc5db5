use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::http::ClientHandle;
use crate::service::LlmService;

/// Checks the LLM service once and prints its health reply.
#[tracing::instrument(skip(service))]
pub async fn probe(service: ServiceConfig) -> Result<()> {
    let handle = Arc::new(ClientHandle::new(service.timeout()));
    let llm = LlmService::new(&service, Arc::clone(&handle));

    let health = llm.health().await;
    handle.close().await;

    let health =
        health.with_context(|| format!("LLM service at {} is not available", llm.base_url()))?;
    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}
