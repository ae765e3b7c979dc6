use super::*;

pub(super) async fn not_found() -> Response {
    let mut problem = ProblemDetails::new(
        ErrorType::InvalidRequest,
        Some("endpoint not found".to_string()),
    );
    problem.title = "Not Found".to_string();
    problem.status = 404;
    problem_response(problem)
}

pub(super) fn problem_response(problem: ProblemDetails) -> Response {
    let status = StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(problem),
    )
        .into_response()
}

/// Health and artifact downloads stay reachable without the token;
/// artifact ids are unguessable. Nested routers see the path without
/// its `/v1` prefix.
fn is_public(path: &str) -> bool {
    let path = path.strip_prefix("/v1").unwrap_or(path);
    path == "/health" || path.starts_with("/artifacts/")
}

pub(super) async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.auth.token.as_ref() else {
        return Ok(next.run(request).await);
    };
    if is_public(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if bearer == Some(expected.as_str()) {
        return Ok(next.run(request).await);
    }

    Err(ApiError::Gateway(GatewayError::TokenInvalid {
        message: Some("missing or invalid bearer token".to_string()),
    }))
}

pub(super) fn insert_routing_headers(
    headers: &mut HeaderMap,
    producer: Producer,
    verdict: &ComplexityVerdict,
    request_id: &str,
) {
    headers.insert(
        HeaderName::from_static(ROUTE_HEADER),
        HeaderValue::from_static(producer.as_str()),
    );
    headers.insert(
        HeaderName::from_static(VERDICT_HEADER),
        HeaderValue::from_static(verdict.confidence_source.as_str()),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}

/// Builds the non-streaming body. A failure before any content is a
/// problem response with the error's status; after content it becomes a
/// truncation notice.
pub(super) fn completion_response(
    collected: Collected,
    meta: ResponseMeta,
) -> Result<ChatCompletion, ApiError> {
    let Collected {
        mut content,
        reasoning,
        artifacts,
        error,
    } = collected;

    let finish_reason = match error {
        Some((kind, message)) if content.is_empty() => {
            return Err(ApiError::Problem(ProblemDetails::new(kind, Some(message))));
        }
        Some((_, message)) => {
            content.push_str("\n\n");
            content.push_str(&message);
            "error"
        }
        None => "stop",
    };

    Ok(ChatCompletion {
        id: meta.id,
        object: "chat.completion".to_string(),
        created: meta.created,
        model: meta.model,
        choices: vec![CompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content,
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                artifacts,
            },
            finish_reason: finish_reason.to_string(),
        }],
    })
}

pub(super) fn http_logging_enabled() -> bool {
    !matches!(
        std::env::var("JANUS_LOG_HTTP"),
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false")
    )
}
