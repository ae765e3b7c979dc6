use async_trait::async_trait;
use janus_completion::{ChatMessage, ChatRequest, CompletionClient, ToolDefinition};
use janus_error::GatewayError;
use serde::Deserialize;
use serde_json::json;

use crate::errors::map_completion_error;

pub const ROUTE_TOOL: &str = "route_request";

const SYSTEM_PROMPT: &str = "You route chat requests for an assistant. Call route_request with \
needs_agent=true only when answering requires running code, browsing or searching the web, \
reading or producing files, or generating images, audio or video. Plain questions, writing and \
explanations do not need an agent. Give a one-line reason.";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteDecision {
    pub needs_agent: bool,
    #[serde(default)]
    pub reason: String,
}

/// Second opinion consulted when no keyword matched.
#[async_trait]
pub trait RouteVerifier: Send + Sync {
    async fn verify(&self, text: &str) -> Result<RouteDecision, GatewayError>;
}

/// Asks a small model to call [`ROUTE_TOOL`] with a boolean decision.
pub struct LlmRouteVerifier {
    client: CompletionClient,
    model: String,
}

impl LlmRouteVerifier {
    pub fn new(client: CompletionClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn request(&self, text: &str) -> ChatRequest {
        let mut request = ChatRequest::new(
            self.model.clone(),
            vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(text)],
        );
        request.temperature = Some(0.0);
        request.max_tokens = Some(100);
        request.tools = vec![ToolDefinition::function(
            ROUTE_TOOL,
            "Decide whether the request needs a sandboxed agent.",
            json!({
                "type": "object",
                "properties": {
                    "needs_agent": { "type": "boolean" },
                    "reason": { "type": "string" }
                },
                "required": ["needs_agent", "reason"]
            }),
        )];
        request
    }
}

#[async_trait]
impl RouteVerifier for LlmRouteVerifier {
    async fn verify(&self, text: &str) -> Result<RouteDecision, GatewayError> {
        let arguments = self
            .client
            .complete_tool_call(&self.request(text), ROUTE_TOOL)
            .await
            .map_err(map_completion_error)?;
        serde_json::from_value(arguments).map_err(|err| GatewayError::ProviderError {
            message: format!("{ROUTE_TOOL} arguments did not match the schema: {err}"),
            status: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tool_call_sse(arguments: &str) -> ResponseTemplate {
        let chunk = json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "function": { "name": ROUTE_TOOL, "arguments": arguments }
                    }]
                }
            }]
        });
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(format!("data: {chunk}\n\ndata: [DONE]\n\n"))
    }

    #[tokio::test]
    async fn decision_is_read_from_forced_tool_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "model": "router-mini",
                "tool_choice": { "function": { "name": ROUTE_TOOL } }
            })))
            .respond_with(tool_call_sse(
                r#"{"needs_agent": true, "reason": "needs a chart"}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = CompletionClient::new(&server.uri(), None).expect("client");
        let verifier = LlmRouteVerifier::new(client, "router-mini");
        let decision = verifier.verify("sales by month").await.expect("decision");
        assert_eq!(
            decision,
            RouteDecision {
                needs_agent: true,
                reason: "needs a chart".to_string()
            }
        );
    }

    #[tokio::test]
    async fn schema_mismatch_is_a_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(tool_call_sse(r#"{"needs_agent": "maybe"}"#))
            .mount(&server)
            .await;

        let client = CompletionClient::new(&server.uri(), None).expect("client");
        let err = LlmRouteVerifier::new(client, "router-mini")
            .verify("hi")
            .await
            .expect_err("bad schema");
        assert!(matches!(err, GatewayError::ProviderError { .. }));
    }
}
