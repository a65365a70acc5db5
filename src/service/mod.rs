//! Outbound call adapter for the LLM session service.
//!
//! [`LlmService`] performs buffered calls with fixed-delay retry and
//! streaming calls that pass `data: ` frames through as [`StreamEvent`]s.
//! Callers depend on the [`LlmBackend`] trait so the proxy can be tested
//! against a mock.

mod request;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use log::{error, info, warn};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::config::ServiceConfig;
use crate::http::{
    BodyLineCodec, ClientHandle, EventStream, Failure, FailureKind, LlmError, RetryPolicy,
    StreamEvent, classify_status, error_stream, frames,
};

pub use request::OutboundRequest;

/// Path of the LLM service's health endpoint.
pub const HEALTH_PATH: &str = "/api/health";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Buffered call: retried on transient failures, body returned as JSON.
    async fn call(&self, request: OutboundRequest) -> Result<Value, LlmError>;

    /// Streaming call: never retried, transport failures arrive in-band.
    fn stream(&self, request: OutboundRequest) -> EventStream;
}

/// Checks the LLM service health endpoint.
///
/// Fails with [`LlmError::Unhealthy`] unless the reply carries `"success": true`.
#[tracing::instrument(skip(backend))]
pub async fn probe<B: LlmBackend + ?Sized>(backend: &B) -> Result<Value, LlmError> {
    let health = backend.call(OutboundRequest::get(HEALTH_PATH)).await?;
    if health.get("success").and_then(Value::as_bool) != Some(true) {
        warn!("LLM service health check did not report success: {}", health);
        return Err(LlmError::Unhealthy);
    }
    Ok(health)
}

/// HTTP implementation of [`LlmBackend`].
pub struct LlmService {
    base_url: String,
    timeout: Duration,
    policy: RetryPolicy,
    client: Arc<ClientHandle>,
}

impl LlmService {
    pub fn new(config: &ServiceConfig, client: Arc<ClientHandle>) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            policy: RetryPolicy::from_config(config),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn client_handle(&self) -> &Arc<ClientHandle> {
        &self.client
    }

    pub async fn health(&self) -> Result<Value, LlmError> {
        probe(self).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn build(&self, client: &Client, request: &OutboundRequest) -> RequestBuilder {
        let builder = client
            .request(request.method.clone(), self.url(&request.path))
            .headers(request.headers.clone());
        match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        }
    }

    /// One buffered attempt without retry.
    async fn attempt(
        &self,
        client: &Client,
        request: &OutboundRequest,
        attempt: u32,
    ) -> Result<Value, Failure> {
        info!(
            "[llm] {} {} (attempt {}/{})",
            request.method, request.path, attempt, self.policy.max_retries
        );

        let response = self
            .build(client, request)
            .timeout(request.timeout.unwrap_or(self.timeout))
            .send()
            .await
            .map_err(|e| self.log_failure(request, Failure::from_reqwest(&e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = if text.is_empty() { status.to_string() } else { text };
            return Err(self.log_failure(request, Failure::new(classify_status(status), detail)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.log_failure(request, Failure::from_reqwest(&e)))?;

        let value = serde_json::from_slice(&body).map_err(|e| {
            self.log_failure(
                request,
                Failure::new(FailureKind::Other, format!("invalid JSON response: {}", e)),
            )
        })?;

        info!("[llm] {} {} succeeded", request.method, request.path);
        Ok(value)
    }

    fn log_failure(&self, request: &OutboundRequest, failure: Failure) -> Failure {
        error!(
            "[llm] {} {} failed [{}]: {}",
            request.method, request.path, failure.kind, failure.detail
        );
        failure
    }
}

#[async_trait]
impl LlmBackend for LlmService {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn call(&self, request: OutboundRequest) -> Result<Value, LlmError> {
        let client = self.client.client().await?;
        let operation = format!("{} {}", request.method, request.path);

        self.policy
            .run(&operation, |attempt| self.attempt(&client, &request, attempt))
            .await
    }

    fn stream(&self, request: OutboundRequest) -> EventStream {
        info!("[llm stream] {} {}", request.method, request.path);

        let handle = Arc::clone(&self.client);
        let url = self.url(&request.path);

        let open = async move {
            let client = handle.client().await?;
            let mut builder = client
                .request(request.method.clone(), url)
                .headers(request.headers.clone());
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| Failure::from_reqwest(&e).into_error())?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                let detail = if text.is_empty() { status.to_string() } else { text };
                return Err(Failure::new(classify_status(status), detail).into_error());
            }

            let bytes = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other))
                .boxed();
            Ok::<_, LlmError>(FramedRead::new(StreamReader::new(bytes), BodyLineCodec::new()))
        };

        stream::once(open)
            .flat_map(|opened| match opened {
                Ok(lines) => frames(lines).boxed(),
                Err(e) => error_stream(e.to_string()),
            })
            .inspect(|event| {
                if let StreamEvent::Error(message) = event {
                    error!("[llm stream] stream failed: {}", message);
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{spawn_raw, spawn_scripted, unreachable_url};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn service(base_url: &str, max_retries: u32, delay_secs: f64) -> LlmService {
        let config = ServiceConfig {
            base_url: base_url.to_string(),
            timeout_secs: 5,
            max_retries,
            retry_delay_secs: delay_secs,
        };
        LlmService::new(&config, Arc::new(ClientHandle::new(config.timeout())))
    }

    #[tokio::test]
    async fn test_call_success_returns_body_verbatim() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/llm/k/sessions")
            .match_body(mockito::Matcher::Json(json!({"provider": "claude"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success": true, "session": {"sessionId": "s1"}, "extra": [1, 2]}"#)
            .expect(1)
            .create_async()
            .await;

        let llm = service(&server.url(), 3, 0.0);
        let result = llm
            .call(OutboundRequest::post("/api/llm/k/sessions").json(json!({"provider": "claude"})))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            result,
            json!({"success": true, "session": {"sessionId": "s1"}, "extra": [1, 2]})
        );
    }

    #[tokio::test]
    async fn test_call_not_found_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let llm = service(&server.url(), 3, 0.0);
        let result = llm.call(OutboundRequest::get("/missing")).await;

        mock.assert_async().await;
        assert_eq!(result.unwrap_err(), LlmError::NotFound);
    }

    #[tokio::test]
    async fn test_call_client_error_carries_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/llm/k/chat/claude")
            .with_status(422)
            .with_body("prompt required")
            .expect(1)
            .create_async()
            .await;

        let llm = service(&server.url(), 3, 0.0);
        let result = llm.call(OutboundRequest::post("/api/llm/k/chat/claude")).await;

        mock.assert_async().await;
        assert_eq!(
            result.unwrap_err(),
            LlmError::Rejected {
                status: 422,
                detail: "prompt required".into()
            }
        );
    }

    #[tokio::test]
    async fn test_call_server_error_exhausts_attempts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/health")
            .with_status(502)
            .expect(3)
            .create_async()
            .await;

        let llm = service(&server.url(), 3, 0.0);
        let result = llm.call(OutboundRequest::get("/api/health")).await;

        mock.assert_async().await;
        assert_eq!(result.unwrap_err(), LlmError::Internal);
    }

    #[tokio::test]
    async fn test_call_recovers_after_two_server_errors() {
        let (url, hits) = spawn_scripted(vec![
            (500, r#"{"error":"busy"}"#),
            (500, r#"{"error":"busy"}"#),
            (200, r#"{"success":true,"x":1}"#),
        ])
        .await;

        let llm = service(&url, 3, 0.0);
        let result = llm.call(OutboundRequest::get("/anything")).await.unwrap();

        assert_eq!(result, json!({"success": true, "x": 1}));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_call_invalid_json_is_call_failed() {
        let (url, hits) = spawn_scripted(vec![(200, "not json")]).await;

        let llm = service(&url, 2, 0.0);
        let result = llm.call(OutboundRequest::get("/x")).await;

        assert!(matches!(result, Err(LlmError::CallFailed(msg)) if msg.contains("invalid JSON")));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_call_unreachable_is_unavailable() {
        let llm = service(&unreachable_url().await, 3, 0.0);
        let start = std::time::Instant::now();

        let result = llm.call(OutboundRequest::get("/api/health")).await;

        assert_eq!(result.unwrap_err(), LlmError::Unavailable);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_call_after_close_fails_without_attempts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/x")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let llm = service(&server.url(), 3, 0.0);
        llm.client_handle().close().await;

        assert_eq!(
            llm.call(OutboundRequest::get("/x")).await.unwrap_err(),
            LlmError::ClientClosed
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_trailing_slash_in_base_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/health")
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;

        let llm = service(&format!("{}/", server.url()), 1, 0.0);
        llm.call(OutboundRequest::get("/api/health")).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_health_probe() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", HEALTH_PATH)
            .with_status(200)
            .with_body(r#"{"success":true,"uptime":12}"#)
            .create_async()
            .await;

        let llm = service(&server.url(), 1, 0.0);
        assert_eq!(llm.health().await.unwrap()["uptime"], 12);
    }

    #[tokio::test]
    async fn test_health_probe_unhealthy() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", HEALTH_PATH)
            .with_status(200)
            .with_body(r#"{"success":false}"#)
            .create_async()
            .await;

        let llm = service(&server.url(), 1, 0.0);
        assert_eq!(llm.health().await.unwrap_err(), LlmError::Unhealthy);
    }

    #[tokio::test]
    async fn test_health_probe_missing_flag_is_unhealthy() {
        let mut backend = MockLlmBackend::new();
        backend
            .expect_call()
            .returning(|_| Ok(json!({"status": "ok"})));

        assert_eq!(probe(&backend).await.unwrap_err(), LlmError::Unhealthy);
    }

    #[tokio::test]
    async fn test_health_probe_propagates_adapter_failure() {
        let llm = service(&unreachable_url().await, 1, 0.0);
        assert_eq!(llm.health().await.unwrap_err(), LlmError::Unavailable);
    }

    #[tokio::test]
    async fn test_stream_frames_until_sentinel() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/llm/k/chat/claude")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(
                "data: {\"type\":\"chunk\",\"text\":\"he\"}\n\n\
                 : keepalive\n\
                 data: not-json\n\n\
                 data: {\"type\":\"chunk\",\"text\":\"llo\"}\n\n\
                 data: [DONE]\n\n\
                 data: {\"type\":\"late\"}\n\n",
            )
            .expect(1)
            .create_async()
            .await;

        let llm = service(&server.url(), 3, 0.0);
        let events: Vec<_> = llm
            .stream(OutboundRequest::post("/api/llm/k/chat/claude").json(json!({"stream": true})))
            .collect()
            .await;

        mock.assert_async().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Frame(json!({"type": "chunk", "text": "he"})),
                StreamEvent::Frame(json!({"type": "chunk", "text": "llo"})),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_server_error_is_single_error_frame() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let llm = service(&server.url(), 3, 0.0);
        let events: Vec<_> = llm.stream(OutboundRequest::post("/chat")).collect().await;

        mock.assert_async().await;
        assert_eq!(events, vec![StreamEvent::Error(LlmError::Internal.to_string())]);
    }

    #[tokio::test]
    async fn test_stream_unreachable_is_single_error_frame() {
        let llm = service(&unreachable_url().await, 3, 0.0);
        let events: Vec<_> = llm.stream(OutboundRequest::get("/chat")).collect().await;

        assert_eq!(events, vec![StreamEvent::Error(LlmError::Unavailable.to_string())]);
    }

    #[tokio::test]
    async fn test_stream_drop_after_two_frames() {
        let url = spawn_raw(
            b"HTTP/1.1 200 OK\r\n\
             content-type: text/event-stream\r\n\
             content-length: 4096\r\n\
             \r\n\
             data: {\"n\":1}\n\n\
             data: {\"n\":2}\n\n",
        )
        .await;

        let llm = service(&url, 3, 0.0);
        let events: Vec<_> = llm.stream(OutboundRequest::get("/chat")).collect().await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::Frame(json!({"n": 1})));
        assert_eq!(events[1], StreamEvent::Frame(json!({"n": 2})));
        assert!(matches!(events[2], StreamEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_stream_skips_invalid_utf8_frame() {
        let url = spawn_raw(
            b"HTTP/1.1 200 OK\r\n\
             content-type: text/event-stream\r\n\
             connection: close\r\n\
             \r\n\
             data: {\"n\":1}\n\n\
             data: \xff\xfe garbage\n\n\
             data: {\"n\":2}\n\n\
             data: [DONE]\n\n",
        )
        .await;

        let llm = service(&url, 3, 0.0);
        let events: Vec<_> = llm.stream(OutboundRequest::get("/chat")).collect().await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Frame(json!({"n": 1})),
                StreamEvent::Frame(json!({"n": 2})),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_applies_request_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and never answer.
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let llm = service(&format!("http://{}", addr), 3, 0.0);
        let events: Vec<_> = llm
            .stream(OutboundRequest::get("/chat").timeout(Duration::from_millis(200)))
            .collect()
            .await;

        assert_eq!(events, vec![StreamEvent::Error(LlmError::Timeout.to_string())]);
    }
}
