use std::collections::BTreeMap;
use std::time::Duration;

use janus_agent_schema::TranscriptFormat;
use janus_sandbox::{OrchestratorConfig, PoolConfig};
use thiserror::Error;

use crate::capability::Capability;

pub const DEFAULT_MODEL_ID: &str = "janus-router";

/// Minimum headroom between the agent budget and the sandbox TTL.
pub const CLEANUP_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("classifier timeout ({classifier:?}) must be shorter than the per-tool timeout ({tool:?})")]
    ClassifierTimeout { classifier: Duration, tool: Duration },
    #[error("per-tool timeout ({tool:?}) must be shorter than the agent budget ({budget:?})")]
    ToolTimeout { tool: Duration, budget: Duration },
    #[error("sandbox ttl ({ttl:?}) must be at least the agent budget ({budget:?}) plus {slack:?} cleanup slack")]
    SandboxTtl {
        ttl: Duration,
        budget: Duration,
        slack: Duration,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("agent command must not be empty")]
    EmptyAgentCommand,
    #[error("agent command must reference {{prompt_file}}")]
    MissingPromptPlaceholder,
    #[error("artifact dir {artifact_dir} must live under workspace {workspace}")]
    ArtifactDirOutsideWorkspace {
        artifact_dir: String,
        workspace: String,
    },
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub model: String,
    pub timeout: Duration,
    /// Characters of the last user message forwarded to the LLM pass.
    pub max_chars: usize,
    pub llm_enabled: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(3),
            max_chars: 4000,
            llm_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FastPathConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub retry_backoff: Duration,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Argv template. `{prompt_file}` is replaced by the uploaded prompt path.
    pub command: Vec<String>,
    pub transcript_format: TranscriptFormat,
    pub budget: Duration,
    pub tool_timeout: Duration,
    pub workspace_dir: String,
    pub artifact_dir: String,
    pub docs_dir: String,
    pub capabilities: Vec<Capability>,
    /// Environment variables pointing at secrets, never the secrets themselves.
    pub credential_refs: BTreeMap<String, String>,
    pub expose_ports: Vec<u16>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "janus-agent".to_string(),
                "--prompt-file".to_string(),
                "{prompt_file}".to_string(),
            ],
            transcript_format: TranscriptFormat::Janus,
            budget: Duration::from_secs(300),
            tool_timeout: Duration::from_secs(120),
            workspace_dir: "/workspace".to_string(),
            artifact_dir: "/workspace/artifacts".to_string(),
            docs_dir: "/opt/janus/docs".to_string(),
            capabilities: Capability::ALL.to_vec(),
            credential_refs: BTreeMap::new(),
            expose_ports: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn prompt_path(&self) -> String {
        format!("{}/.janus/prompt.md", self.workspace_dir.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Longest silence tolerated on the wire before a keep-alive is sent.
    pub keepalive: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    /// Files up to and including this size are inlined.
    pub inline_threshold: u64,
    pub url_ttl: Duration,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            inline_threshold: 1_000_000,
            url_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub model_id: String,
    pub classifier: ClassifierConfig,
    pub fast_path: FastPathConfig,
    pub agent: AgentConfig,
    pub orchestrator: OrchestratorConfig,
    pub pool: PoolConfig,
    pub multiplexer: MultiplexerConfig,
    pub materializer: MaterializerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            classifier: ClassifierConfig::default(),
            fast_path: FastPathConfig::default(),
            agent: AgentConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            pool: PoolConfig::default(),
            multiplexer: MultiplexerConfig::default(),
            materializer: MaterializerConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Checks the timeout layering: classifier < tool < budget < ttl - slack.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let classifier = self.classifier.timeout;
        let tool = self.agent.tool_timeout;
        let budget = self.agent.budget;
        let ttl = self.orchestrator.default_ttl;

        if classifier.is_zero() {
            return Err(ConfigError::Zero("classifier timeout"));
        }
        if self.multiplexer.keepalive.is_zero() {
            return Err(ConfigError::Zero("keep-alive interval"));
        }
        if self.pool.size > 0 && self.pool.max_idle.is_zero() {
            return Err(ConfigError::Zero("pool max idle"));
        }
        if classifier >= tool {
            return Err(ConfigError::ClassifierTimeout { classifier, tool });
        }
        if tool >= budget {
            return Err(ConfigError::ToolTimeout { tool, budget });
        }
        if ttl < budget + CLEANUP_SLACK {
            return Err(ConfigError::SandboxTtl {
                ttl,
                budget,
                slack: CLEANUP_SLACK,
            });
        }

        if self.agent.command.is_empty() {
            return Err(ConfigError::EmptyAgentCommand);
        }
        if !self
            .agent
            .command
            .iter()
            .any(|arg| arg.contains("{prompt_file}"))
        {
            return Err(ConfigError::MissingPromptPlaceholder);
        }
        let workspace = self.agent.workspace_dir.trim_end_matches('/');
        if !self
            .agent
            .artifact_dir
            .starts_with(&format!("{workspace}/"))
        {
            return Err(ConfigError::ArtifactDirOutsideWorkspace {
                artifact_dir: self.agent.artifact_dir.clone(),
                workspace: self.agent.workspace_dir.clone(),
            });
        }
        Ok(())
    }
}
