use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("sandbox platform unreachable: {0}")]
    Unreachable(String),
    #[error("sandbox platform returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("not found on sandbox platform: {0}")]
    NotFound(String),
    #[error("invalid sandbox platform response: {0}")]
    InvalidResponse(String),
}

impl PlatformError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::NotFound(_) => Some(404),
            _ => None,
        }
    }
}

/// Credential scoped to the request that owns a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxAuth {
    pub bearer: String,
    pub request_id: String,
}

impl SandboxAuth {
    pub fn new(bearer: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            bearer: bearer.into(),
            request_id: request_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose_ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSandbox {
    pub id: String,
    #[serde(default)]
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Caller-chosen id; used to kill the command later.
    pub exec_id: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl ExecRequest {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            exec_id: uuid::Uuid::new_v4().to_string(),
            command,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecFrame {
    Stdout { line: String },
    Stderr { line: String },
    Exit { code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size_bytes: u64,
}

pub type ExecStream = Pin<Box<dyn Stream<Item = Result<ExecFrame, PlatformError>> + Send>>;

/// Backing VM/container platform. Everything the orchestrator does to a
/// sandbox goes through this seam.
#[async_trait]
pub trait SandboxPlatform: Send + Sync + 'static {
    async fn create(
        &self,
        auth: &SandboxAuth,
        request: &CreateSandboxRequest,
    ) -> Result<CreatedSandbox, PlatformError>;

    async fn exec(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, PlatformError>;

    /// Streams output frames line by line; the last frame is `Exit`.
    async fn exec_stream(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecStream, PlatformError>;

    async fn kill_exec(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        exec_id: &str,
    ) -> Result<(), PlatformError>;

    async fn write_file(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), PlatformError>;

    async fn read_file(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<u8>, PlatformError>;

    async fn list_files(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        dir: &str,
    ) -> Result<Vec<FileEntry>, PlatformError>;

    /// Returns the public URL for `port`.
    async fn expose_port(
        &self,
        auth: &SandboxAuth,
        sandbox_id: &str,
        port: u16,
    ) -> Result<String, PlatformError>;

    async fn terminate(&self, auth: &SandboxAuth, sandbox_id: &str) -> Result<(), PlatformError>;

    async fn health(&self) -> Result<(), PlatformError>;
}
