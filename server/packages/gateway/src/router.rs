use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use futures::StreamExt;
use janus_agent_schema::{Artifact, ArtifactKind, ArtifactPayload};
use janus_completion::{ChatMessage, CompletionClient, ContentPart, ImageUrl, MessageContent};
use janus_error::{ErrorType, GatewayError, ProblemDetails};
use janus_sandbox::{PoolStats, SandboxAuth, SandboxOrchestrator, SandboxPlatform, WarmPool};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Span};
use utoipa::{Modify, OpenApi, ToSchema};

use crate::agent::{AgentAdapter, AgentRequest};
use crate::artifacts::{ArtifactMaterializer, ArtifactStore, LocalArtifactStore};
use crate::capability::GenerationFlags;
use crate::classifier::{Classifier, ComplexityVerdict, ConfidenceSource, LlmRouteVerifier, RouteVerifier};
use crate::config::GatewayConfig;
use crate::fast_path::FastPathInvoker;
use crate::multiplexer::{collect_completion, multiplex, Collected, ResponseMeta};

mod support;
mod types;

use support::*;
pub use types::*;

pub const ROUTE_HEADER: &str = "x-janus-route";
pub const VERDICT_HEADER: &str = "x-janus-verdict";
pub const REQUEST_ID_HEADER: &str = "x-janus-request-id";

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

/// External collaborators the gateway is wired to.
pub struct GatewayServices {
    pub completion: CompletionClient,
    pub platform: Arc<dyn SandboxPlatform>,
    /// Bearer presented to the sandbox platform on behalf of each request.
    pub sandbox_credential: String,
    /// `None` keeps URL-referenced artifacts in this process.
    pub artifact_store: Option<Arc<dyn ArtifactStore>>,
    /// Externally reachable origin, used in artifact URLs.
    pub public_base_url: String,
}

pub struct AppState {
    auth: AuthConfig,
    model_id: String,
    keepalive: Duration,
    classifier: Classifier,
    fast_path: FastPathInvoker,
    agent: AgentAdapter,
    orchestrator: SandboxOrchestrator,
    pool: Option<WarmPool>,
    local_artifacts: Option<LocalArtifactStore>,
}

impl AppState {
    pub fn new(config: &GatewayConfig, auth: AuthConfig, services: GatewayServices) -> Self {
        let orchestrator =
            SandboxOrchestrator::new(services.platform, config.orchestrator.clone());
        let pool = (config.pool.size > 0).then(|| {
            WarmPool::new(
                orchestrator.clone(),
                config.pool.clone(),
                SandboxAuth::new(services.sandbox_credential.clone(), "warm-pool"),
            )
        });

        let verifier: Option<Arc<dyn RouteVerifier>> = config.classifier.llm_enabled.then(|| {
            Arc::new(LlmRouteVerifier::new(
                services.completion.clone(),
                config.classifier.model.clone(),
            )) as Arc<dyn RouteVerifier>
        });
        let classifier = Classifier::new(config.classifier.clone(), verifier);
        let fast_path = FastPathInvoker::new(services.completion, config.fast_path.clone());

        let (store, local_artifacts) = match services.artifact_store {
            Some(store) => (store, None),
            None => {
                let local = LocalArtifactStore::new(&services.public_base_url);
                (Arc::new(local.clone()) as Arc<dyn ArtifactStore>, Some(local))
            }
        };
        let materializer = ArtifactMaterializer::new(config.materializer.clone(), store);
        let agent = AgentAdapter::new(
            orchestrator.clone(),
            pool.clone(),
            config.agent.clone(),
            materializer,
            services.sandbox_credential,
        );

        Self {
            auth,
            model_id: config.model_id.clone(),
            keepalive: config.multiplexer.keepalive,
            classifier,
            fast_path,
            agent,
            orchestrator,
            pool,
            local_artifacts,
        }
    }

    pub fn orchestrator(&self) -> &SandboxOrchestrator {
        &self.orchestrator
    }

    pub fn pool(&self) -> Option<&WarmPool> {
        self.pool.as_ref()
    }

    /// Set when URL-referenced artifacts are served by this process.
    pub fn local_artifacts(&self) -> Option<&LocalArtifactStore> {
        self.local_artifacts.as_ref()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut v1_router = Router::new()
        .route("/models", get(list_models))
        .route("/chat/completions", post(chat_completions))
        .route("/artifacts/:artifact_id", get(get_artifact))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let mut router = Router::new()
        .route("/health", get(get_health))
        .with_state(shared.clone())
        .nest("/v1", v1_router)
        .fallback(not_found);

    if http_logging_enabled() {
        let include_headers = std::env::var("JANUS_LOG_HTTP_HEADERS").is_ok();
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| {
                if include_headers {
                    let mut headers = Vec::new();
                    for (name, value) in req.headers().iter() {
                        let name_str = name.as_str();
                        let display_value = if name_str.eq_ignore_ascii_case("authorization") {
                            "<redacted>".to_string()
                        } else {
                            value.to_str().unwrap_or("<binary>").to_string()
                        };
                        headers.push((name_str.to_string(), display_value));
                    }
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri(),
                        headers = ?headers
                    )
                } else {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri()
                    )
                }
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Stops handing out warm sandboxes and terminates every live one.
pub async fn shutdown(state: &Arc<AppState>) {
    if let Some(pool) = &state.pool {
        pool.drain().await;
    }
    state.orchestrator.terminate_all().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, list_models, chat_completions, get_artifact),
    components(
        schemas(
            ChatCompletionRequest,
            ChatMessage,
            MessageContent,
            ContentPart,
            ImageUrl,
            GenerationFlags,
            ChatCompletion,
            CompletionChoice,
            AssistantMessage,
            Artifact,
            ArtifactKind,
            ArtifactPayload,
            ComplexityVerdict,
            ConfidenceSource,
            ModelList,
            ModelInfo,
            HealthResponse,
            PlatformHealth,
            PoolStatus,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "completions", description = "Routed chat completions")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8088")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("{}", .0.title)]
    Problem(ProblemDetails),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match self {
            ApiError::Gateway(err) => err.to_problem_details(),
            ApiError::Problem(problem) => problem,
        };
        problem_response(problem)
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, body = HealthResponse),
        (status = 503, body = HealthResponse)
    ),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let sandbox_platform = match state.orchestrator.health().await {
        Ok(()) => PlatformHealth {
            reachable: true,
            error: None,
        },
        Err(err) => {
            warn!(error = %err, "sandbox platform unreachable");
            PlatformHealth {
                reachable: false,
                error: Some(err.to_string()),
            }
        }
    };
    let pool = match &state.pool {
        Some(pool) => pool.stats().await.into(),
        None => PoolStatus::default(),
    };
    let (status, label) = if sandbox_platform.reachable {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let body = HealthResponse {
        status: label.to_string(),
        sandbox_platform,
        pool,
        active_sandboxes: state.orchestrator.active_count().await,
    };
    (status, Json(body))
}

#[utoipa::path(
    get,
    path = "/v1/models",
    responses((status = 200, body = ModelList)),
    tag = "meta"
)]
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList {
        object: "list".to_string(),
        data: vec![ModelInfo {
            id: state.model_id.clone(),
            object: "model".to_string(),
            created: 0,
            owned_by: "janus".to_string(),
        }],
    })
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, body = ChatCompletion, description = "Completion, or an SSE stream of chunks when `stream` is set"),
        (status = 400, body = ProblemDetails),
        (status = 401, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "completions"
)]
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|rejection| GatewayError::InvalidRequest {
        message: rejection.body_text(),
    })?;
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "messages must not be empty".to_string(),
        }
        .into());
    }

    let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
    let verdict = state
        .classifier
        .classify(&request.messages, &request.generation_flags)
        .await;
    let producer = Producer::for_verdict(&verdict);
    info!(
        request_id = %request_id,
        route = producer.as_str(),
        source = verdict.confidence_source.as_str(),
        stream = request.stream,
        "request routed"
    );

    let events = match producer {
        Producer::FastPath => state.fast_path.run(request.messages),
        Producer::Agent => state.agent.start(AgentRequest {
            request_id: request_id.clone(),
            messages: request.messages,
            flags: request.generation_flags,
        }),
    };
    let meta = ResponseMeta::new(state.model_id.clone());

    let mut response = if request.stream {
        let frames = multiplex(events, state.keepalive, meta)
            .map(|frame| Ok::<Event, Infallible>(frame.to_sse_event()));
        Sse::new(frames).into_response()
    } else {
        let collected = collect_completion(events).await;
        Json(completion_response(collected, meta)?).into_response()
    };
    insert_routing_headers(response.headers_mut(), producer, &verdict, &request_id);
    Ok(response)
}

#[utoipa::path(
    get,
    path = "/v1/artifacts/{artifact_id}",
    params(("artifact_id" = String, Path, description = "Artifact id")),
    responses(
        (status = 200, description = "Artifact bytes"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "completions"
)]
async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path(artifact_id): Path<String>,
) -> Response {
    let stored = state
        .local_artifacts
        .as_ref()
        .and_then(|store| store.get(&artifact_id));
    match stored {
        Some((mime_type, bytes)) => {
            ([(header::CONTENT_TYPE, mime_type)], bytes).into_response()
        }
        None => {
            let mut problem = ProblemDetails::new(
                ErrorType::InvalidRequest,
                Some(format!("artifact {artifact_id} not found or expired")),
            );
            problem.title = "Not Found".to_string();
            problem.status = 404;
            problem_response(problem)
        }
    }
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
