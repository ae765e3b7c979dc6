use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::types::{ChatRequest, CompletionChunk, StreamChunk};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Transport(String),
    #[error("completion provider returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed completion stream: {0}")]
    Protocol(String),
    #[error("model did not call tool `{0}`")]
    MissingToolCall(String),
    #[error("completion stream ended before [DONE]")]
    Truncated,
}

impl CompletionError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Connection failures, cut-off streams and 429/5xx answers are worth
    /// one retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Truncated => true,
            Self::Status { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 529),
            _ => false,
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk, CompletionError>> + Send>>;

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl CompletionClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, CompletionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| CompletionError::Transport(format!("failed to build client: {err}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, request: &ChatRequest) -> Result<reqwest::Response, CompletionError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| CompletionError::Transport(err.to_string()))?;
        let status = response.status();
        debug!(status = %status, model = %request.model, "completion response received");
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(CompletionError::Status {
            status: status.as_u16(),
            message,
        })
    }

    /// Opens a streaming completion. The stream ends at `[DONE]`; a body
    /// that closes without it yields a final [`CompletionError::Truncated`].
    pub async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, CompletionError> {
        let mut request = request.clone();
        request.stream = true;
        let response = self.post(&request).await?;
        Ok(parse_sse_stream(response))
    }

    /// Forces the model to call `tool_name` and returns its parsed arguments.
    pub async fn complete_tool_call(
        &self,
        request: &ChatRequest,
        tool_name: &str,
    ) -> Result<Value, CompletionError> {
        let mut request = request.clone();
        request.tool_choice = Some(json!({
            "type": "function",
            "function": { "name": tool_name }
        }));
        let mut stream = self.stream_chat(&request).await?;

        let mut calls: BTreeMap<usize, (Option<String>, String)> = BTreeMap::new();
        while let Some(chunk) = stream.next().await {
            for fragment in chunk?.tool_calls {
                let call = calls.entry(fragment.index).or_default();
                if fragment.name.is_some() {
                    call.0 = fragment.name;
                }
                call.1.push_str(&fragment.arguments);
            }
        }

        let arguments = calls
            .values()
            .find(|(name, _)| name.as_deref() == Some(tool_name))
            .or_else(|| calls.values().next())
            .map(|(_, arguments)| arguments.clone())
            .filter(|arguments| !arguments.trim().is_empty())
            .ok_or_else(|| CompletionError::MissingToolCall(tool_name.to_string()))?;
        serde_json::from_str(&arguments)
            .map_err(|err| CompletionError::Protocol(format!("tool arguments are not JSON: {err}")))
    }
}

fn parse_sse_stream(response: reqwest::Response) -> ChunkStream {
    let events = Box::pin(response.bytes_stream().eventsource());
    let chunks = futures::stream::unfold(Some(events), |events| async move {
        let mut events = events?;
        loop {
            match events.next().await {
                None => return Some((Err(CompletionError::Truncated), None)),
                Some(Ok(event)) if event.data.trim() == "[DONE]" => return None,
                Some(event) => {
                    if let Some(item) = parse_event(event) {
                        return Some((item, Some(events)));
                    }
                }
            }
        }
    });
    Box::pin(chunks)
}

fn parse_event<E: std::fmt::Display>(
    event: Result<eventsource_stream::Event, E>,
) -> Option<Result<CompletionChunk, CompletionError>> {
    let event = match event {
        Ok(event) => event,
        Err(err) => return Some(Err(CompletionError::Transport(err.to_string()))),
    };
    if event.data.trim().is_empty() {
        return None;
    }
    let chunk = match serde_json::from_str::<StreamChunk>(&event.data) {
        Ok(chunk) => chunk,
        Err(err) => return Some(Err(CompletionError::Protocol(format!("bad chunk: {err}")))),
    };
    if let Some(error) = &chunk.error {
        return Some(Err(CompletionError::Protocol(format!(
            "provider error in stream: {error}"
        ))));
    }
    let chunk = CompletionChunk::from(chunk);
    (!chunk.is_empty()).then_some(Ok(chunk))
}
