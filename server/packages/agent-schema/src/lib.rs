use janus_error::ErrorType;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod agents;
pub mod transcript;

pub use transcript::{TranscriptError, TranscriptEvent, TranscriptFormat, TranscriptParser};

/// Normalized event produced by either execution path and consumed by the
/// response multiplexer. A well-formed stream ends with exactly one `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InternalEvent {
    ContentToken {
        text: String,
    },
    ReasoningToken {
        text: String,
    },
    ToolStart {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        args_preview: String,
    },
    ToolEnd {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        result_preview: String,
        is_error: bool,
    },
    ArtifactReady {
        artifact: Artifact,
    },
    /// Progress marker such as `sandbox.ready` or `agent.started`.
    Lifecycle {
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Error {
        kind: ErrorType,
        message: String,
    },
    Done,
}

impl InternalEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::ContentToken { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::ReasoningToken { text: text.into() }
    }

    pub fn lifecycle(stage: impl Into<String>, detail: Option<String>) -> Self {
        Self::Lifecycle {
            stage: stage.into(),
            detail,
        }
    }

    pub fn error(kind: ErrorType, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// True for events that put user-visible answer text on the wire.
    pub fn is_content(&self) -> bool {
        matches!(self, Self::ContentToken { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    File,
    Dataset,
    Binary,
}

impl ArtifactKind {
    pub fn from_mime(mime_type: &str) -> Self {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or(mime_type)
            .trim()
            .to_ascii_lowercase();
        if essence.starts_with("image/") {
            return Self::Image;
        }
        match essence.as_str() {
            "text/csv"
            | "text/tab-separated-values"
            | "application/json"
            | "application/x-ndjson"
            | "application/vnd.apache.parquet"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Self::Dataset,
            "application/octet-stream" | "application/zip" | "application/gzip"
            | "application/x-tar" => Self::Binary,
            _ => Self::File,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactPayload {
    InlineBase64 { data: String },
    UrlReference { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub mime_type: String,
    pub size_bytes: u64,
    pub display_name: String,
    pub payload: ArtifactPayload,
    /// Only set for URL references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl Artifact {
    pub fn is_inline(&self) -> bool {
        matches!(self.payload, ArtifactPayload::InlineBase64 { .. })
    }
}

/// Truncates `text` to at most `max_chars` characters, marking the cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
