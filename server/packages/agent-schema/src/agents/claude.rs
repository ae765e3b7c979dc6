use std::collections::HashMap;

use serde_json::Value;

use crate::preview;
use crate::transcript::{normalize_path, value_text, within_dir, TranscriptError, TranscriptEvent, PREVIEW_CHARS};

/// `Write` calls into the artifact directory that have not reported back yet,
/// keyed by tool-use id.
#[derive(Debug, Default)]
pub struct ClaudeState {
    pending_writes: HashMap<String, String>,
}

pub fn convert_line(
    event: &Value,
    state: &mut ClaudeState,
    artifact_dir: &str,
) -> Result<Vec<TranscriptEvent>, TranscriptError> {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "system" | "stream_event" => Ok(Vec::new()),
        "assistant" => Ok(assistant_events(event, state, artifact_dir)),
        "user" => Ok(tool_result_events(event, state)),
        "result" => {
            let is_error = event
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let message = if is_error {
                event.get("result").and_then(Value::as_str).map(str::to_string)
            } else {
                None
            };
            Ok(vec![TranscriptEvent::Finished { is_error, message }])
        }
        other => Err(TranscriptError::UnsupportedType(other.to_string())),
    }
}

fn content_blocks(event: &Value) -> Vec<Value> {
    event
        .get("message")
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn assistant_events(
    event: &Value,
    state: &mut ClaudeState,
    artifact_dir: &str,
) -> Vec<TranscriptEvent> {
    let mut events = Vec::new();
    for block in content_blocks(event) {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    events.push(TranscriptEvent::Content(text.to_string()));
                }
            }
            "thinking" => {
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    events.push(TranscriptEvent::Reasoning(text.to_string()));
                }
            }
            "tool_use" => {
                let Some(name) = block.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let call_id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or(name)
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                if name == "Write" {
                    if let Some(path) = input.get("file_path").and_then(Value::as_str) {
                        if let Some(path) = normalize_path(path)
                            .filter(|path| within_dir(path, artifact_dir))
                        {
                            state.pending_writes.insert(call_id.clone(), path);
                        }
                    }
                }
                events.push(TranscriptEvent::ToolStarted {
                    call_id,
                    name: name.to_string(),
                    args_preview: preview(&value_text(Some(&input)), PREVIEW_CHARS),
                });
            }
            _ => {}
        }
    }
    events
}

fn tool_result_events(event: &Value, state: &mut ClaudeState) -> Vec<TranscriptEvent> {
    let mut events = Vec::new();
    for block in content_blocks(event) {
        if block.get("type").and_then(Value::as_str) != Some("tool_result") {
            continue;
        }
        let Some(call_id) = block.get("tool_use_id").and_then(Value::as_str) else {
            continue;
        };
        let is_error = block
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        events.push(TranscriptEvent::ToolFinished {
            call_id: call_id.to_string(),
            name: String::new(),
            result_preview: preview(&result_text(block.get("content")), PREVIEW_CHARS),
            is_error,
        });
        if let Some(path) = state.pending_writes.remove(call_id) {
            if !is_error {
                events.push(TranscriptEvent::ArtifactFinalized {
                    path,
                    mime_type: None,
                    display_name: None,
                });
            }
        }
    }
    events
}

fn result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => value_text(other),
    }
}
