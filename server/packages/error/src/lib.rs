use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TokenInvalid,
    ClassificationTimeout,
    ProvisioningFailed,
    QuotaExceeded,
    SandboxNotFound,
    AgentProcessTimeout,
    AgentProcessExited,
    ToolCallFailed,
    ProviderError,
    StreamProtocolError,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:janus:error:invalid_request",
            Self::TokenInvalid => "urn:janus:error:token_invalid",
            Self::ClassificationTimeout => "urn:janus:error:classification_timeout",
            Self::ProvisioningFailed => "urn:janus:error:provisioning_failed",
            Self::QuotaExceeded => "urn:janus:error:quota_exceeded",
            Self::SandboxNotFound => "urn:janus:error:sandbox_not_found",
            Self::AgentProcessTimeout => "urn:janus:error:agent_process_timeout",
            Self::AgentProcessExited => "urn:janus:error:agent_process_exited",
            Self::ToolCallFailed => "urn:janus:error:tool_call_failed",
            Self::ProviderError => "urn:janus:error:provider_error",
            Self::StreamProtocolError => "urn:janus:error:stream_protocol_error",
            Self::Timeout => "urn:janus:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::TokenInvalid => "Token Invalid",
            Self::ClassificationTimeout => "Classification Timeout",
            Self::ProvisioningFailed => "Provisioning Failed",
            Self::QuotaExceeded => "Quota Exceeded",
            Self::SandboxNotFound => "Sandbox Not Found",
            Self::AgentProcessTimeout => "Agent Process Timeout",
            Self::AgentProcessExited => "Agent Process Exited",
            Self::ToolCallFailed => "Tool Call Failed",
            Self::ProviderError => "Provider Error",
            Self::StreamProtocolError => "Stream Protocol Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::TokenInvalid => 401,
            Self::ClassificationTimeout => 504,
            Self::ProvisioningFailed => 503,
            Self::QuotaExceeded => 429,
            Self::SandboxNotFound => 404,
            Self::AgentProcessTimeout => 504,
            Self::AgentProcessExited => 502,
            Self::ToolCallFailed => 502,
            Self::ProviderError => 502,
            Self::StreamProtocolError => 500,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("classification timed out after {elapsed_ms}ms")]
    ClassificationTimeout { elapsed_ms: u64 },
    #[error("sandbox provisioning failed: {message}")]
    ProvisioningFailed {
        message: String,
        status: Option<u16>,
    },
    #[error("nested sandbox quota exceeded for {parent_id} (limit {limit})")]
    QuotaExceeded { parent_id: String, limit: usize },
    #[error("sandbox not found: {sandbox_id}")]
    SandboxNotFound { sandbox_id: String },
    #[error("agent process exceeded {budget_secs}s budget")]
    AgentProcessTimeout {
        budget_secs: u64,
        tool: Option<String>,
        partial_output: bool,
    },
    #[error("agent process exited with code {exit_code:?}")]
    AgentProcessExited {
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("tool call failed: {tool}: {message}")]
    ToolCallFailed { tool: String, message: String },
    #[error("provider error: {message}")]
    ProviderError {
        message: String,
        status: Option<u16>,
    },
    #[error("stream protocol error: {message}")]
    StreamProtocolError { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::ClassificationTimeout { .. } => ErrorType::ClassificationTimeout,
            Self::ProvisioningFailed { .. } => ErrorType::ProvisioningFailed,
            Self::QuotaExceeded { .. } => ErrorType::QuotaExceeded,
            Self::SandboxNotFound { .. } => ErrorType::SandboxNotFound,
            Self::AgentProcessTimeout { .. } => ErrorType::AgentProcessTimeout,
            Self::AgentProcessExited { .. } => ErrorType::AgentProcessExited,
            Self::ToolCallFailed { .. } => ErrorType::ToolCallFailed,
            Self::ProviderError { .. } => ErrorType::ProviderError,
            Self::StreamProtocolError { .. } => ErrorType::StreamProtocolError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    /// Only classifier timeouts are absorbed where they happen; everything
    /// else ends the request (or, for tool calls, surfaces inline).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ClassificationTimeout { .. } | Self::ToolCallFailed { .. }
        )
    }

    /// Text shown to the end user in place of (or after) the assistant reply.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidRequest { message } => format!("The request was rejected: {message}."),
            Self::TokenInvalid { .. } => "The request is not authorized.".to_string(),
            Self::ClassificationTimeout { .. } => {
                "Routing took too long; the request was answered directly.".to_string()
            }
            Self::ProvisioningFailed { .. } => "This request needs an isolated execution \
                 environment, but none could be provisioned right now. It was not answered \
                 with a plain model reply instead. Please try again shortly."
                .to_string(),
            Self::QuotaExceeded { limit, .. } => format!(
                "Too many nested environments are running for this task (limit {limit})."
            ),
            Self::SandboxNotFound { .. } => {
                "The execution environment for this request is no longer available.".to_string()
            }
            Self::AgentProcessTimeout {
                budget_secs,
                tool,
                partial_output,
            } => {
                let cause = match tool {
                    Some(tool) => format!("the `{tool}` step did not finish in time"),
                    None => format!("the task did not finish within {budget_secs} seconds"),
                };
                if *partial_output {
                    format!("The response above is incomplete: {cause}.")
                } else {
                    format!("No response could be produced: {cause}.")
                }
            }
            Self::AgentProcessExited { exit_code, .. } => match exit_code {
                Some(code) => format!("The agent stopped unexpectedly (exit code {code})."),
                None => "The agent stopped unexpectedly.".to_string(),
            },
            Self::ToolCallFailed { tool, message } => {
                format!("The `{tool}` step failed: {message}.")
            }
            Self::ProviderError { .. } => {
                "The language model provider could not be reached. Please try again.".to_string()
            }
            Self::StreamProtocolError { .. } => {
                "Something went wrong while producing the response.".to_string()
            }
            Self::Timeout { .. } => "The request timed out.".to_string(),
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.user_message()));

        let mut extensions = Map::new();
        extensions.insert("message".to_string(), Value::String(self.to_string()));
        match self {
            Self::ProvisioningFailed {
                status: Some(status),
                ..
            }
            | Self::ProviderError {
                status: Some(status),
                ..
            } => {
                extensions.insert(
                    "upstreamStatus".to_string(),
                    Value::Number(serde_json::Number::from(*status)),
                );
            }
            Self::QuotaExceeded { parent_id, limit } => {
                extensions.insert("parentId".to_string(), Value::String(parent_id.clone()));
                extensions.insert(
                    "limit".to_string(),
                    Value::Number(serde_json::Number::from(*limit as u64)),
                );
            }
            Self::SandboxNotFound { sandbox_id } => {
                extensions.insert("sandboxId".to_string(), Value::String(sandbox_id.clone()));
            }
            Self::AgentProcessExited {
                exit_code,
                stderr,
            } => {
                if let Some(code) = exit_code {
                    extensions.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    extensions.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            Self::AgentProcessTimeout {
                tool: Some(tool), ..
            } => {
                extensions.insert("tool".to_string(), Value::String(tool.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<GatewayError> for ProblemDetails {
    fn from(value: GatewayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&GatewayError> for ProblemDetails {
    fn from(value: &GatewayError) -> Self {
        value.to_problem_details()
    }
}
