use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use janus_completion::CompletionClient;
use janus_gateway::config::GatewayConfig;
use janus_gateway::router::{build_router, AppState, AuthConfig, GatewayServices};
use janus_sandbox::testing::FakeSandboxPlatform;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CLASSIFIER_MODEL: &str = "router-mini";
pub const FAST_MODEL: &str = "fast-mini";

pub struct TestApp {
    pub app: Router,
    pub platform: FakeSandboxPlatform,
    pub completion: MockServer,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with(AuthConfig::disabled(), |_| {}).await
    }

    /// The LLM classifier pass is off unless `configure` turns it back on.
    pub async fn with(auth: AuthConfig, configure: impl FnOnce(&mut GatewayConfig)) -> Self {
        let completion = MockServer::start().await;
        let platform = FakeSandboxPlatform::new();

        let mut config = GatewayConfig::default();
        config.classifier.model = CLASSIFIER_MODEL.to_string();
        config.classifier.llm_enabled = false;
        config.fast_path.model = FAST_MODEL.to_string();
        config.fast_path.retry_backoff = Duration::from_millis(10);
        config.pool.size = 0;
        configure(&mut config);

        let services = GatewayServices {
            completion: CompletionClient::new(&completion.uri(), None).expect("completion client"),
            platform: Arc::new(platform.clone()),
            sandbox_credential: "sandbox-token".to_string(),
            artifact_store: None,
            public_base_url: "http://janus.test".to_string(),
        };
        let app = build_router(AppState::new(&config, auth, services));

        Self {
            app,
            platform,
            completion,
        }
    }

    /// Answers fast-path calls with the given content tokens.
    pub async fn mock_fast_path(&self, tokens: &[&str], expected_calls: u64) {
        let mut frames: Vec<String> = tokens
            .iter()
            .map(|token| json!({"choices": [{"delta": {"content": token}}]}).to_string())
            .collect();
        frames.push("[DONE]".to_string());
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({ "model": FAST_MODEL })))
            .respond_with(sse_response(&frames))
            .expect(expected_calls)
            .mount(&self.completion)
            .await;
    }

    /// Answers the classifier's forced tool call.
    pub async fn mock_classifier(&self, needs_agent: bool, reason: &str) {
        let arguments = json!({ "needs_agent": needs_agent, "reason": reason }).to_string();
        let chunk = json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "function": { "name": "route_request", "arguments": arguments }
                    }]
                }
            }]
        });
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({ "model": CLASSIFIER_MODEL })))
            .respond_with(sse_response(&[chunk.to_string(), "[DONE]".to_string()]))
            .expect(1)
            .mount(&self.completion)
            .await;
    }
}

pub fn sse_response(frames: &[String]) -> ResponseTemplate {
    let body: String = frames.iter().map(|frame| format!("data: {frame}\n\n")).collect();
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

pub fn user_message(text: &str) -> Value {
    json!({ "messages": [{ "role": "user", "content": text }] })
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let (status, headers, bytes) = send_raw(app, method, path, body, None).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, headers, value)
}

pub async fn send_raw(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
    token: Option<&str>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec();
    (status, headers, bytes)
}

/// Splits an SSE body into its `data:` payloads, skipping comments.
pub fn sse_data(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .split("\n\n")
        .flat_map(|event| event.lines())
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}

/// Lets detached cleanup tasks run after a response has been read.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
