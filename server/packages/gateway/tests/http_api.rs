mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use janus_gateway::router::AuthConfig;
use janus_sandbox::testing::FakeStep;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use common::{send_json, send_raw, settle, user_message, TestApp};

fn cat_script() -> Vec<FakeStep> {
    vec![
        FakeStep::json(json!({"type": "tool_start", "id": "t1", "name": "python", "args": "draw()"})),
        FakeStep::WriteFile {
            path: "/workspace/artifacts/cat.png".to_string(),
            contents: vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a],
        },
        FakeStep::json(json!({"type": "tool_end", "id": "t1", "result": "saved"})),
        FakeStep::json(json!({"type": "artifact", "path": "cat.png", "display_name": "Cat"})),
        FakeStep::json(json!({"type": "text", "text": "Here is your cat."})),
        FakeStep::json(json!({"type": "result"})),
        FakeStep::Exit(Some(0)),
    ]
}

fn image_request(text: &str) -> Value {
    json!({
        "messages": [{ "role": "user", "content": text }],
        "generation_flags": { "generate_image": true }
    })
}

#[tokio::test]
async fn greeting_takes_the_fast_path_without_a_sandbox() {
    let test = TestApp::new().await;
    test.mock_fast_path(&["Hello", "!"], 1).await;

    let (status, headers, body) = send_json(
        &test.app,
        Method::POST,
        "/v1/chat/completions",
        Some(user_message("hello")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-janus-route"], "fast");
    assert_eq!(headers["x-janus-verdict"], "keyword");
    assert!(headers.contains_key("x-janus-request-id"));
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "janus-router");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["choices"][0]["message"]["artifacts"], json!([]));
    assert_eq!(test.platform.create_count(), 0);
}

#[tokio::test]
async fn llm_verdict_routes_ambiguous_text() {
    let test = TestApp::with(AuthConfig::disabled(), |config| {
        config.classifier.llm_enabled = true;
    })
    .await;
    test.mock_classifier(false, "small talk").await;
    test.mock_fast_path(&["Sure."], 1).await;

    let (status, headers, body) = send_json(
        &test.app,
        Method::POST,
        "/v1/chat/completions",
        Some(user_message("could you help me with something")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-janus-route"], "fast");
    assert_eq!(headers["x-janus-verdict"], "llm");
    assert_eq!(body["choices"][0]["message"]["content"], "Sure.");
    assert_eq!(test.platform.create_count(), 0);
}

#[tokio::test]
async fn image_flag_runs_the_agent_and_returns_an_artifact() {
    let test = TestApp::new().await;
    test.mock_fast_path(&["unused"], 0).await;
    test.platform.set_script(cat_script());

    let (status, headers, body) = send_json(
        &test.app,
        Method::POST,
        "/v1/chat/completions",
        Some(image_request("draw a cat")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-janus-route"], "agent");
    assert_eq!(headers["x-janus-verdict"], "explicit_flag");
    let message = &body["choices"][0]["message"];
    assert_eq!(message["content"], "Here is your cat.");
    let artifacts = message["artifacts"].as_array().expect("artifacts");
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0]["kind"], "image");
    assert_eq!(artifacts[0]["mime_type"], "image/png");
    assert_eq!(artifacts[0]["display_name"], "Cat");
    assert_eq!(artifacts[0]["payload"]["type"], "inline_base64");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");

    settle().await;
    assert_eq!(test.platform.create_count(), 1);
    let sandbox_id = test.platform.created_ids()[0].clone();
    assert_eq!(test.platform.terminate_count(&sandbox_id), 1);
    assert_eq!(test.platform.live_count(), 0);
}

#[tokio::test]
async fn keyword_match_routes_to_the_agent() {
    let test = TestApp::new().await;
    test.mock_fast_path(&["unused"], 0).await;
    test.platform.set_script(vec![
        FakeStep::json(json!({"type": "text", "text": "Rust 1.80 shipped."})),
        FakeStep::Exit(Some(0)),
    ]);

    let (status, headers, body) = send_json(
        &test.app,
        Method::POST,
        "/v1/chat/completions",
        Some(user_message("Please search the web for the latest Rust release")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-janus-route"], "agent");
    assert_eq!(headers["x-janus-verdict"], "keyword");
    assert_eq!(body["choices"][0]["message"]["content"], "Rust 1.80 shipped.");
}

#[tokio::test]
async fn provisioning_failure_is_a_503_and_never_falls_back() {
    let test = TestApp::new().await;
    test.mock_fast_path(&["fallback"], 0).await;
    test.platform.set_fail_create(true);

    let (status, headers, body) = send_json(
        &test.app,
        Method::POST,
        "/v1/chat/completions",
        Some(user_message("search the web for today's exchange rates")),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers[header::CONTENT_TYPE], "application/problem+json");
    assert_eq!(body["status"], 503);
    assert!(body["type"]
        .as_str()
        .expect("problem type")
        .ends_with("provisioning_failed"));
}

#[tokio::test]
async fn agent_failure_after_content_truncates_the_answer() {
    let test = TestApp::new().await;
    test.platform.set_script(vec![
        FakeStep::json(json!({"type": "text", "text": "Partial answer."})),
        FakeStep::Stderr("segfault".to_string()),
        FakeStep::Exit(Some(139)),
    ]);

    let (status, _, body) = send_json(
        &test.app,
        Method::POST,
        "/v1/chat/completions",
        Some(image_request("draw a cat")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .expect("content");
    assert!(content.starts_with("Partial answer.\n\n"));
    assert_eq!(body["choices"][0]["finish_reason"], "error");
}

#[tokio::test]
async fn url_referenced_artifact_is_downloadable() {
    let test = TestApp::with(AuthConfig::with_token("secret".to_string()), |config| {
        config.materializer.inline_threshold = 2;
    })
    .await;
    test.platform.set_script(cat_script());

    let (status, _, bytes) = send_raw(
        &test.app,
        Method::POST,
        "/v1/chat/completions",
        Some(image_request("draw a cat")),
        Some("secret"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    let artifact = &body["choices"][0]["message"]["artifacts"][0];
    assert_eq!(artifact["payload"]["type"], "url_reference");
    assert_eq!(artifact["ttl_seconds"], 3600);
    let url = artifact["payload"]["url"].as_str().expect("url");
    let path = url
        .strip_prefix("http://janus.test")
        .expect("public base url");

    let (status, headers, bytes) = send_raw(&test.app, Method::GET, path, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/png");
    assert_eq!(bytes, vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a]);

    let (status, headers, _) =
        send_raw(&test.app, Method::GET, "/v1/artifacts/missing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers[header::CONTENT_TYPE], "application/problem+json");
}

#[tokio::test]
async fn empty_messages_are_rejected() {
    let test = TestApp::new().await;
    test.mock_fast_path(&["unused"], 0).await;

    let (status, headers, body) = send_json(
        &test.app,
        Method::POST,
        "/v1/chat/completions",
        Some(json!({ "messages": [] })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(headers[header::CONTENT_TYPE], "application/problem+json");
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let test = TestApp::new().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"messages\": ["))
        .expect("request");

    let response = test.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("problem json");
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn bearer_token_guards_the_api() {
    let test = TestApp::with(AuthConfig::with_token("secret".to_string()), |_| {}).await;

    let (status, _, _) = send_raw(&test.app, Method::GET, "/v1/models", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) =
        send_raw(&test.app, Method::GET, "/v1/models", None, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) =
        send_raw(&test.app, Method::GET, "/v1/models", None, Some("secret")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send_raw(&test.app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_reports_platform_reachability() {
    let test = TestApp::new().await;

    let (status, _, body) = send_json(&test.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sandbox_platform"]["reachable"], true);
    assert_eq!(body["pool"]["target"], 0);
    assert_eq!(body["active_sandboxes"], 0);

    test.platform.set_unreachable(true);
    let (status, _, body) = send_json(&test.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["sandbox_platform"]["reachable"], false);
    assert!(body["sandbox_platform"]["error"].is_string());
}

#[tokio::test]
async fn models_and_openapi_are_served() {
    let test = TestApp::new().await;

    let (status, _, body) = send_json(&test.app, Method::GET, "/v1/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "janus-router");

    let (status, _, body) = send_json(&test.app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"].get("/v1/chat/completions").is_some());
    assert!(body["components"]["schemas"].get("ChatCompletionRequest").is_some());
}

#[tokio::test]
async fn unknown_routes_are_problem_404s() {
    let test = TestApp::new().await;

    let (status, headers, body) = send_json(&test.app, Method::GET, "/v2/nothing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers[header::CONTENT_TYPE], "application/problem+json");
    assert_eq!(body["status"], 404);
}
