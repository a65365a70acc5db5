//! Route handlers translating proxy requests into LLM service calls.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::AppState;
use super::auth::ApiKey;
use super::error::ApiError;
use super::sessions::TabSession;
use crate::http::StreamEvent;
use crate::service::{OutboundRequest, probe};

/// Name reported by the health endpoint.
pub const SERVICE_NAME: &str = "LLM API Adapter (CDP Mode)";

/// Upstream sessions idle longer than this are removed by `/admin/cleanup`.
const CLEANUP_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Deserialize)]
pub struct TabRequest {
    pub provider: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub file_paths: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub new_chat: bool,
}

/// `session` object returned when the LLM service creates a session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSession {
    session_id: String,
    #[serde(default)]
    provider_name: String,
    #[serde(default)]
    created_at: Value,
    #[serde(default)]
    features: Value,
}

/// One entry of the LLM service's session list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedSession {
    session_id: String,
    provider: String,
    #[serde(default)]
    provider_name: String,
    #[serde(default)]
    status: Value,
    #[serde(default)]
    created_at: Value,
    #[serde(default)]
    last_used: Value,
    #[serde(default)]
    message_count: Value,
}

fn succeeded(data: &Value) -> bool {
    data.get("success").and_then(Value::as_bool).unwrap_or(false)
}

fn parse_field<T: serde::de::DeserializeOwned>(data: &Value, field: &str) -> Result<T, ApiError> {
    let value = data.get(field).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        ApiError::Failed(format!(
            "unexpected LLM service response ({}): {}",
            field, e
        ))
    })
}

/// Public chat URL of a provider.
pub fn provider_url(provider: &str) -> String {
    if provider == "claude" {
        "https://claude.ai/".to_string()
    } else {
        format!("https://{}.com/", provider)
    }
}

fn title_case(provider: &str) -> String {
    let mut chars = provider.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Whether the `status.sessions` value of a status reply lists `provider`.
fn lists_provider(sessions: Option<&Value>, provider: &str) -> bool {
    match sessions {
        Some(Value::Object(map)) => map.contains_key(provider),
        Some(Value::Array(items)) => items.iter().any(|v| v.as_str() == Some(provider)),
        _ => false,
    }
}

/// Reuses the caller's tab for `provider` if the LLM service still knows it,
/// otherwise asks the service for a new session.
async fn open_tab(state: &AppState, api_key: &ApiKey, provider: &str) -> Result<Value, ApiError> {
    info!("Create tab request: {} - {}", api_key.user, provider);

    if let Some(existing) = state.sessions.get(&api_key.key, provider) {
        info!("Found existing session {}", existing.session_id);
        let status = state
            .backend
            .call(OutboundRequest::get(format!("/api/llm/{}/status", api_key.key)))
            .await;

        match status {
            Ok(status) if lists_provider(status.pointer("/status/sessions"), provider) => {
                return Ok(json!({
                    "status": "success",
                    "message": format!("{} tab already open", provider),
                    "tab_id": existing.session_id,
                    "provider": provider,
                    "title": format!("{} Chat", title_case(provider)),
                    "url": provider_url(provider),
                    "reused": true,
                }));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Existing {} session check failed ({}), creating a new one", provider, e);
                state.sessions.remove(&api_key.key, provider);
            }
        }
    }

    let data = state
        .backend
        .call(
            OutboundRequest::post(format!("/api/llm/{}/sessions", api_key.key))
                .json(json!({ "provider": provider, "forceNew": false })),
        )
        .await?;

    if !succeeded(&data) {
        return Err(ApiError::upstream(&data, "failed to create session"));
    }

    let session: CreatedSession = parse_field(&data, "session")?;
    state.sessions.insert(
        &api_key.key,
        provider,
        TabSession {
            session_id: session.session_id.clone(),
            conversation_id: None,
            created_at: session.created_at,
            provider_name: session.provider_name.clone(),
        },
    );
    info!("Tab created: {}", session.session_id);

    Ok(json!({
        "status": "success",
        "tab_id": session.session_id,
        "provider": provider,
        "title": session.provider_name,
        "url": provider_url(provider),
        "created": data.get("created").cloned().unwrap_or(Value::Bool(true)),
        "features": if session.features.is_null() { json!({}) } else { session.features },
    }))
}

pub async fn create_tab(
    State(state): State<Arc<AppState>>,
    api_key: ApiKey,
    Json(request): Json<TabRequest>,
) -> Result<Json<Value>, ApiError> {
    open_tab(&state, &api_key, &request.provider).await.map(Json)
}

pub async fn close_tab(
    State(state): State<Arc<AppState>>,
    api_key: ApiKey,
    Path(provider): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let existing = state
        .sessions
        .get(&api_key.key, &provider)
        .ok_or_else(|| ApiError::TabNotFound(provider.clone()))?;

    info!("Close tab: {} - {}", api_key.user, provider);

    let data = state
        .backend
        .call(OutboundRequest::delete(format!(
            "/api/llm/{}/sessions/{}",
            api_key.key, provider
        )))
        .await?;

    if !succeeded(&data) {
        return Err(ApiError::upstream(&data, "failed to close tab"));
    }

    state.sessions.remove(&api_key.key, &provider);
    info!("Tab closed: {}", existing.session_id);

    Ok(Json(json!({
        "status": "success",
        "message": format!("{} tab closed", provider),
        "session_id": existing.session_id,
    })))
}

pub async fn list_tabs(
    State(state): State<Arc<AppState>>,
    api_key: ApiKey,
) -> Result<Json<Vec<Value>>, ApiError> {
    info!("List tabs: {}", api_key.user);

    let data = state
        .backend
        .call(OutboundRequest::get(format!("/api/llm/{}/sessions", api_key.key)))
        .await?;

    if !succeeded(&data) {
        return Err(ApiError::upstream(&data, "failed to list tabs"));
    }

    let sessions: Vec<ListedSession> = parse_field(&data, "sessions")?;
    let mut tabs = Vec::with_capacity(sessions.len());

    for session in sessions {
        // Keep the conversation id while the upstream session is unchanged.
        let conversation_id = state
            .sessions
            .get(&api_key.key, &session.provider)
            .filter(|local| local.session_id == session.session_id)
            .and_then(|local| local.conversation_id);

        state.sessions.insert(
            &api_key.key,
            &session.provider,
            TabSession {
                session_id: session.session_id.clone(),
                conversation_id,
                created_at: session.created_at.clone(),
                provider_name: session.provider_name.clone(),
            },
        );

        tabs.push(json!({
            "tab_id": session.session_id,
            "provider": session.provider,
            "title": session.provider_name,
            "url": provider_url(&session.provider),
            "status": session.status,
            "created_at": session.created_at,
            "last_used": session.last_used,
            "message_count": session.message_count,
        }));
    }

    info!("Listed {} tabs", tabs.len());
    Ok(Json(tabs))
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    api_key: ApiKey,
    Path(provider): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    info!("Chat request: {} - {}", api_key.user, provider);

    if !state.sessions.contains(&api_key.key, &provider) {
        open_tab(&state, &api_key, &provider).await?;
    }

    let outbound = OutboundRequest::post(format!("/api/llm/{}/chat/{}", api_key.key, provider))
        .json(json!({
            "prompt": request.prompt,
            "files": request.file_paths,
            "stream": request.stream,
            "newChat": request.new_chat,
        }));

    if request.stream {
        info!("Streaming chat response: {}", provider);
        let events = state.backend.stream(outbound);
        let state = Arc::clone(&state);
        let lines = events.map(move |event| {
            Ok::<_, Infallible>(stream_line(&state, &api_key.key, &provider, event))
        });

        return Ok((
            [(CONTENT_TYPE, "application/json"), (CACHE_CONTROL, "no-cache")],
            Body::from_stream(lines),
        )
            .into_response());
    }

    let data = state.backend.call(outbound).await?;
    if !succeeded(&data) {
        return Err(ApiError::upstream(&data, "chat failed"));
    }

    if let Some(conversation_id) = data.get("conversationId").and_then(Value::as_str) {
        state
            .sessions
            .set_conversation(&api_key.key, &provider, conversation_id);
    }
    info!("Chat completed: {}", provider);

    Ok(Json(json!({
        "status": "success",
        "content": data.get("response").cloned().unwrap_or(Value::Null),
        "conversation_id": data.get("conversationId").cloned().unwrap_or(Value::Null),
        "provider": provider,
        "timing": data.get("timing").cloned().unwrap_or_else(|| json!({})),
    }))
    .into_response())
}

/// Renders one stream event as a newline-terminated JSON line.
fn stream_line(state: &AppState, key: &str, provider: &str, event: StreamEvent) -> String {
    let line = match event {
        StreamEvent::Error(message) => json!({
            "status": "error",
            "message": message,
            "source": "transport",
        }),
        StreamEvent::Frame(chunk) => match chunk.get("type").and_then(Value::as_str) {
            Some("error") => json!({
                "status": "error",
                "message": chunk.get("error").cloned().unwrap_or_else(|| json!("Unknown error")),
                "source": "upstream",
            }),
            Some("complete") => {
                if let Some(conversation_id) = chunk.get("conversationId").and_then(Value::as_str) {
                    state.sessions.set_conversation(key, provider, conversation_id);
                }
                json!({
                    "status": "success",
                    "content": chunk.get("data").cloned().unwrap_or_else(|| json!({})),
                    "conversation_id": chunk.get("conversationId").cloned().unwrap_or(Value::Null),
                    "provider": provider,
                })
            }
            _ => chunk,
        },
    };
    format!("{}\n", line)
}

pub async fn take_screenshot(
    State(state): State<Arc<AppState>>,
    api_key: ApiKey,
    Path(provider): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.sessions.contains(&api_key.key, &provider) {
        return Err(ApiError::TabNotFound(provider));
    }

    info!("Screenshot request: {} - {}", api_key.user, provider);

    Ok(Json(json!({
        "status": "success",
        "screenshot_path": format!("/tmp/screenshot_{}_{}.png", provider, unix_timestamp() as u64),
        "message": "screenshots are not captured in CDP mode",
        "provider": provider,
    })))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    match probe(state.backend.as_ref()).await {
        Ok(llm_health) => Json(json!({
            "status": "healthy",
            "service": SERVICE_NAME,
            "timestamp": unix_timestamp(),
            "llm_service": {
                "available": true,
                "url": state.service.base_url,
                "health": llm_health,
            },
            "active_users": state.sessions.active_users(),
            "total_sessions": state.sessions.total_sessions(),
        })),
        Err(e) => Json(json!({
            "status": "unhealthy",
            "error": e.to_string(),
            "timestamp": unix_timestamp(),
        })),
    }
}

pub async fn debug_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    let local_sessions: serde_json::Map<String, Value> = state
        .sessions
        .snapshot()
        .into_iter()
        .map(|(key, tabs)| {
            let user = state.api_keys.user(&key).unwrap_or("unknown").to_string();
            (user, json!(tabs))
        })
        .collect();

    let stats = match state.backend.call(OutboundRequest::get("/api/admin/stats")).await {
        Ok(stats) => stats,
        Err(e) => {
            warn!("LLM service stats unavailable: {}", e);
            json!("LLM service statistics unavailable")
        }
    };

    Json(json!({
        "local_sessions": local_sessions,
        "users": state.api_keys.users(),
        "llm_service_config": state.service,
        "llm_service_stats": stats,
    }))
}

pub async fn admin_cleanup(State(state): State<Arc<AppState>>) -> Json<Value> {
    info!("Running admin cleanup");

    let result = state
        .backend
        .call(
            OutboundRequest::post("/api/admin/cleanup")
                .json(json!({ "maxAge": CLEANUP_MAX_AGE_MS, "dryRun": false })),
        )
        .await;

    match result {
        Ok(cleanup) => Json(json!({
            "success": true,
            "llm_service_cleanup": cleanup,
            "local_cleanup": { "cleaned": 0 },
            "timestamp": unix_timestamp(),
        })),
        Err(e) => {
            warn!("Admin cleanup failed: {}", e);
            Json(json!({ "success": false, "error": e.to_string() }))
        }
    }
}
