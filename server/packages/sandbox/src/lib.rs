//! Ephemeral sandbox lifecycle: platform client, orchestrator, warm pool.

pub mod http;
pub mod orchestrator;
pub mod platform;
pub mod pool;
pub mod sandbox;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use http::HttpSandboxPlatform;
pub use orchestrator::{
    OrchestratorConfig, OrchestratorError, SandboxLease, SandboxOrchestrator, DEFAULT_NESTED_QUOTA,
    DEFAULT_TTL_SECS,
};
pub use platform::{
    CreateSandboxRequest, CreatedSandbox, ExecFrame, ExecOutput, ExecRequest, ExecStream,
    FileEntry, PlatformError, SandboxAuth, SandboxPlatform,
};
pub use pool::{PoolConfig, PoolStats, WarmPool};
pub use sandbox::{Sandbox, SandboxStatus};
