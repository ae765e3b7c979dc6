use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agents::claude::{self, ClaudeState};
use crate::preview;

pub const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptFormat {
    /// One JSON object per line with `text`, `tool_start`, `tool_end`,
    /// `artifact` and `result` records. Non-JSON lines are answer text.
    #[default]
    Janus,
    /// `claude --output-format stream-json`.
    Claude,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptError {
    #[error("line is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("unsupported event type: {0}")]
    UnsupportedType(String),
    #[error("missing field `{field}` on {event_type} event")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
    #[error("artifact path {0} is outside the artifact directory")]
    OutsideArtifactDir(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    Content(String),
    Reasoning(String),
    ToolStarted {
        call_id: String,
        name: String,
        args_preview: String,
    },
    ToolFinished {
        call_id: String,
        name: String,
        result_preview: String,
        is_error: bool,
    },
    ArtifactFinalized {
        path: String,
        mime_type: Option<String>,
        display_name: Option<String>,
    },
    Finished {
        is_error: bool,
        message: Option<String>,
    },
    Unparsed {
        error: TranscriptError,
        raw: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserPhase {
    Idle,
    InTool,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTool {
    pub call_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
struct PendingArtifact {
    mime_type: Option<String>,
    display_name: Option<String>,
}

/// Line-oriented state machine over an agent's stdout.
///
/// The parser is time-agnostic: callers observe `ToolStarted` and
/// `ToolFinished` to enforce their own per-tool deadlines.
#[derive(Debug)]
pub struct TranscriptParser {
    format: TranscriptFormat,
    artifact_dir: String,
    phase: ParserPhase,
    open_tools: Vec<OpenTool>,
    pending_artifacts: HashMap<String, PendingArtifact>,
    finalized: HashSet<String>,
    claude: ClaudeState,
    next_call_id: u64,
}

impl TranscriptParser {
    pub fn new(format: TranscriptFormat, artifact_dir: impl Into<String>) -> Self {
        let artifact_dir = artifact_dir.into().trim_end_matches('/').to_string();
        Self {
            format,
            artifact_dir,
            phase: ParserPhase::Idle,
            open_tools: Vec::new(),
            pending_artifacts: HashMap::new(),
            finalized: HashSet::new(),
            claude: ClaudeState::default(),
            next_call_id: 1,
        }
    }

    pub fn phase(&self) -> ParserPhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase == ParserPhase::Finished
    }

    pub fn open_tools(&self) -> &[OpenTool] {
        &self.open_tools
    }

    pub fn artifact_dir(&self) -> &str {
        &self.artifact_dir
    }

    /// Marks `path` as delivered. Returns false when it already was.
    pub fn mark_finalized(&mut self, path: &str) -> bool {
        self.pending_artifacts.remove(path);
        self.finalized.insert(path.to_string())
    }

    pub fn is_finalized(&self, path: &str) -> bool {
        self.finalized.contains(path)
    }

    pub fn push_line(&mut self, line: &str) -> Vec<TranscriptEvent> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || self.is_finished() {
            return Vec::new();
        }

        let parsed = match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => match self.format {
                TranscriptFormat::Janus => self.parse_janus(&value),
                TranscriptFormat::Claude => {
                    claude::convert_line(&value, &mut self.claude, &self.artifact_dir)
                }
            },
            Ok(_) | Err(_) if self.format == TranscriptFormat::Janus => {
                Ok(vec![TranscriptEvent::Content(format!("{line}\n"))])
            }
            Ok(_) => Err(TranscriptError::UnsupportedType("non-object".to_string())),
            Err(err) => Err(TranscriptError::InvalidJson(err.to_string())),
        };

        match parsed {
            Ok(events) => self.track(events),
            Err(error) => vec![TranscriptEvent::Unparsed {
                error,
                raw: line.to_string(),
            }],
        }
    }

    fn parse_janus(&mut self, value: &Value) -> Result<Vec<TranscriptEvent>, TranscriptError> {
        let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        let missing = |field: &'static str| TranscriptError::MissingField {
            event_type: event_type.to_string(),
            field,
        };

        match event_type {
            "text" => {
                let text = value
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| missing("text"))?;
                let event = match value.get("channel").and_then(Value::as_str) {
                    Some("reasoning") => TranscriptEvent::Reasoning(text.to_string()),
                    _ => TranscriptEvent::Content(text.to_string()),
                };
                Ok(vec![event])
            }
            "tool_start" => {
                let name = value
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| missing("name"))?;
                let call_id = match value.get("id").and_then(Value::as_str) {
                    Some(id) => id.to_string(),
                    None => self.next_call_id(),
                };
                Ok(vec![TranscriptEvent::ToolStarted {
                    call_id,
                    name: name.to_string(),
                    args_preview: preview(&value_text(value.get("args")), PREVIEW_CHARS),
                }])
            }
            "tool_end" => {
                let name = value.get("name").and_then(Value::as_str);
                let call_id = match value.get("id").and_then(Value::as_str) {
                    Some(id) => id.to_string(),
                    None => {
                        let name = name.ok_or_else(|| missing("id"))?;
                        self.open_tools
                            .iter()
                            .rev()
                            .find(|tool| tool.name == name)
                            .map(|tool| tool.call_id.clone())
                            .unwrap_or_else(|| name.to_string())
                    }
                };
                Ok(vec![TranscriptEvent::ToolFinished {
                    call_id,
                    name: name.unwrap_or_default().to_string(),
                    result_preview: preview(&value_text(value.get("result")), PREVIEW_CHARS),
                    is_error: value
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }])
            }
            "artifact" => {
                let path = value
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| missing("path"))?;
                let path = self
                    .resolve_artifact_path(path)
                    .ok_or_else(|| TranscriptError::OutsideArtifactDir(path.to_string()))?;
                let mime_type = value
                    .get("mime_type")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let display_name = value
                    .get("display_name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match value.get("status").and_then(Value::as_str) {
                    Some("writing") => {
                        self.pending_artifacts.insert(
                            path,
                            PendingArtifact {
                                mime_type,
                                display_name,
                            },
                        );
                        Ok(Vec::new())
                    }
                    _ => {
                        let pending = self.pending_artifacts.remove(&path).unwrap_or_default();
                        Ok(vec![TranscriptEvent::ArtifactFinalized {
                            path,
                            mime_type: mime_type.or(pending.mime_type),
                            display_name: display_name.or(pending.display_name),
                        }])
                    }
                }
            }
            "result" => Ok(vec![TranscriptEvent::Finished {
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                message: value.get("text").and_then(Value::as_str).map(str::to_string),
            }]),
            other => Err(TranscriptError::UnsupportedType(other.to_string())),
        }
    }

    fn track(&mut self, events: Vec<TranscriptEvent>) -> Vec<TranscriptEvent> {
        let mut out = Vec::with_capacity(events.len());
        for mut event in events {
            match &mut event {
                TranscriptEvent::ToolStarted { call_id, name, .. } => {
                    self.open_tools.push(OpenTool {
                        call_id: call_id.clone(),
                        name: name.clone(),
                    });
                    self.phase = ParserPhase::InTool;
                }
                TranscriptEvent::ToolFinished { call_id, name, .. } => {
                    if let Some(idx) = self.open_tools.iter().position(|t| t.call_id == *call_id) {
                        let open = self.open_tools.remove(idx);
                        if name.is_empty() {
                            *name = open.name;
                        }
                    }
                    if name.is_empty() {
                        *name = "unknown".to_string();
                    }
                    if self.open_tools.is_empty() {
                        self.phase = ParserPhase::Idle;
                    }
                }
                TranscriptEvent::ArtifactFinalized { path, .. } => {
                    if !self.mark_finalized(path) {
                        continue;
                    }
                }
                TranscriptEvent::Finished { .. } => {
                    self.phase = ParserPhase::Finished;
                }
                _ => {}
            }
            out.push(event);
        }
        out
    }

    /// Relative paths are taken from the artifact directory. The result
    /// must name a file inside it.
    fn resolve_artifact_path(&self, path: &str) -> Option<String> {
        let joined = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.artifact_dir, path)
        };
        normalize_path(&joined).filter(|resolved| within_dir(resolved, &self.artifact_dir))
    }

    fn next_call_id(&mut self) -> String {
        let id = self.next_call_id;
        self.next_call_id += 1;
        format!("call_{id}")
    }
}

/// Resolves `.` and `..` in an absolute path. `None` when the path is
/// relative or climbs above the root.
pub(crate) fn normalize_path(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(format!("/{}", parts.join("/")))
}

pub(crate) fn within_dir(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir)
        .map(|rest| rest.starts_with('/') && rest.len() > 1)
        .unwrap_or(false)
}

pub(crate) fn value_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
