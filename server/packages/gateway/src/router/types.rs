use super::*;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ChatCompletionRequest {
    /// Accepted for client compatibility; routing picks the backend model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub generation_flags: GenerationFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub sandbox_platform: PlatformHealth,
    pub pool: PoolStatus,
    pub active_sandboxes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PlatformHealth {
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PoolStatus {
    pub ready: usize,
    pub pending_replacements: usize,
    pub target: usize,
}

impl From<PoolStats> for PoolStatus {
    fn from(stats: PoolStats) -> Self {
        Self {
            ready: stats.ready,
            pending_replacements: stats.pending_replacements,
            target: stats.target,
        }
    }
}

/// The execution path chosen for one request. Picked once from the
/// verdict and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Producer {
    FastPath,
    Agent,
}

impl Producer {
    pub fn for_verdict(verdict: &ComplexityVerdict) -> Self {
        if verdict.is_complex {
            Self::Agent
        } else {
            Self::FastPath
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FastPath => "fast",
            Self::Agent => "agent",
        }
    }
}
