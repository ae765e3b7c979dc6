//! Renders one producer's [`InternalEvent`]s as OpenAI-style completion
//! chunks.
//!
//! Two guarantees hold for every stream built by [`multiplex`]: no gap
//! between frames exceeds the keep-alive ceiling, and the stream ends with
//! exactly one [`WireFrame::Done`].

use std::collections::VecDeque;
use std::time::Duration;

use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use janus_agent_schema::{Artifact, InternalEvent};
use janus_error::{ErrorType, GatewayError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::EventStream;

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Tool, artifact, and lifecycle notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub janus: Option<JanusDelta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JanusDelta {
    pub event: InternalEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Chunk(ChatCompletionChunk),
    KeepAlive,
    Done,
}

impl WireFrame {
    pub fn to_sse_event(&self) -> Event {
        match self {
            WireFrame::Chunk(chunk) => Event::default()
                .json_data(chunk)
                .unwrap_or_else(|_| Event::default().data("{}")),
            WireFrame::KeepAlive => Event::default().comment("keep-alive"),
            WireFrame::Done => Event::default().data("[DONE]"),
        }
    }
}

/// Identity shared by every chunk of one response.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub id: String,
    pub model: String,
    pub created: i64,
}

impl ResponseMeta {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

struct Multiplexer {
    events: EventStream,
    meta: ResponseMeta,
    keepalive: Duration,
    /// When the last frame left; events that render nothing do not move it.
    last_emit: Instant,
    pending: VecDeque<WireFrame>,
    role_sent: bool,
    content_sent: bool,
    errored: bool,
    finished: bool,
}

impl Multiplexer {
    fn chunk(&mut self, mut delta: ChunkDelta, finish_reason: Option<&str>) -> WireFrame {
        if !self.role_sent {
            delta.role = Some("assistant".to_string());
            self.role_sent = true;
        }
        WireFrame::Chunk(ChatCompletionChunk {
            id: self.meta.id.clone(),
            object: CHUNK_OBJECT.to_string(),
            created: self.meta.created,
            model: self.meta.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        })
    }

    fn push(&mut self, delta: ChunkDelta, finish_reason: Option<&str>) {
        let frame = self.chunk(delta, finish_reason);
        self.pending.push_back(frame);
    }

    fn accept(&mut self, event: InternalEvent) {
        if self.errored && !event.is_terminal() {
            debug!(event = ?event, "ignoring event after error");
            return;
        }
        match event {
            InternalEvent::ContentToken { text } => {
                self.content_sent = true;
                self.push(
                    ChunkDelta {
                        content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                );
            }
            InternalEvent::ReasoningToken { text } => self.push(
                ChunkDelta {
                    reasoning_content: Some(text),
                    ..ChunkDelta::default()
                },
                None,
            ),
            InternalEvent::Error { kind, message } => self.fail(kind, message),
            InternalEvent::Done => {
                if !self.errored {
                    self.push(ChunkDelta::default(), Some("stop"));
                }
                self.finish();
            }
            event => self.push(
                ChunkDelta {
                    janus: Some(JanusDelta { event }),
                    ..ChunkDelta::default()
                },
                None,
            ),
        }
    }

    /// The error becomes visible text plus a structured notice, then the
    /// choice is closed. Only `Done` is read afterwards.
    fn fail(&mut self, kind: ErrorType, message: String) {
        let text = if self.content_sent {
            format!("\n\n{message}")
        } else {
            message.clone()
        };
        self.push(
            ChunkDelta {
                content: Some(text),
                janus: Some(JanusDelta {
                    event: InternalEvent::error(kind, message),
                }),
                ..ChunkDelta::default()
            },
            None,
        );
        self.push(ChunkDelta::default(), Some("error"));
        self.errored = true;
    }

    fn finish(&mut self) {
        self.pending.push_back(WireFrame::Done);
        self.finished = true;
    }

    async fn next_frame(&mut self) -> Option<WireFrame> {
        let frame = self.produce().await?;
        self.last_emit = Instant::now();
        Some(frame)
    }

    async fn produce(&mut self) -> Option<WireFrame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            if self.finished {
                return None;
            }
            let deadline = self.last_emit + self.keepalive;
            match tokio::time::timeout_at(deadline, self.events.next()).await {
                Err(_) => {
                    debug!(response_id = %self.meta.id, "producer stalled; sending keep-alive");
                    return Some(WireFrame::KeepAlive);
                }
                Ok(Some(event)) => self.accept(event),
                Ok(None) => {
                    if !self.errored {
                        let err = GatewayError::StreamProtocolError {
                            message: "producer ended without a terminal event".to_string(),
                        };
                        warn!(response_id = %self.meta.id, error = %err, "closing stream");
                        self.fail(err.error_type(), err.user_message());
                    }
                    self.finish();
                }
            }
        }
    }
}

/// Consumes exactly one producer. Keep-alives are injected whenever the
/// producer is silent for `keepalive`.
pub fn multiplex(
    events: EventStream,
    keepalive: Duration,
    meta: ResponseMeta,
) -> impl Stream<Item = WireFrame> + Send {
    let state = Multiplexer {
        events,
        meta,
        keepalive,
        last_emit: Instant::now(),
        pending: VecDeque::new(),
        role_sent: false,
        content_sent: false,
        errored: false,
        finished: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        let frame = state.next_frame().await?;
        Some((frame, state))
    })
}

/// Everything a non-streaming response needs from one producer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collected {
    pub content: String,
    pub reasoning: String,
    pub artifacts: Vec<Artifact>,
    pub error: Option<(ErrorType, String)>,
}

impl Collected {
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }
}

pub async fn collect_completion(mut events: EventStream) -> Collected {
    let mut collected = Collected::default();
    while let Some(event) = events.next().await {
        match event {
            InternalEvent::ContentToken { text } => collected.content.push_str(&text),
            InternalEvent::ReasoningToken { text } => collected.reasoning.push_str(&text),
            InternalEvent::ArtifactReady { artifact } => collected.artifacts.push(artifact),
            InternalEvent::Error { kind, message } => {
                if collected.error.is_none() {
                    collected.error = Some((kind, message));
                }
            }
            InternalEvent::Done => return collected,
            _ => {}
        }
    }
    if collected.error.is_none() {
        let err = GatewayError::StreamProtocolError {
            message: "producer ended without a terminal event".to_string(),
        };
        warn!(error = %err, "non-streaming producer ended early");
        collected.error = Some((err.error_type(), err.user_message()));
    }
    collected
}
