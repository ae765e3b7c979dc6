//! Conversions from component errors into [`GatewayError`].

use janus_agent_schema::{InternalEvent, TranscriptError};
use janus_completion::CompletionError;
use janus_error::GatewayError;
use janus_sandbox::{OrchestratorError, PlatformError};

pub fn map_orchestrator_error(err: OrchestratorError) -> GatewayError {
    match err {
        OrchestratorError::Provisioning(err) => GatewayError::ProvisioningFailed {
            status: err.status(),
            message: err.to_string(),
        },
        OrchestratorError::QuotaExceeded { parent_id, limit } => {
            GatewayError::QuotaExceeded { parent_id, limit }
        }
        OrchestratorError::NotFound(sandbox_id) => GatewayError::SandboxNotFound { sandbox_id },
        OrchestratorError::NotRunning { sandbox_id, .. } => {
            GatewayError::SandboxNotFound { sandbox_id }
        }
        OrchestratorError::ExecTimeout(elapsed) => GatewayError::Timeout {
            message: Some(format!("sandbox command killed after {elapsed:?}")),
        },
        OrchestratorError::Platform(err) => map_platform_error(err),
    }
}

/// Platform failures after provisioning mean the agent's environment died.
pub fn map_platform_error(err: PlatformError) -> GatewayError {
    match err {
        PlatformError::NotFound(sandbox_id) => GatewayError::SandboxNotFound { sandbox_id },
        other => GatewayError::AgentProcessExited {
            exit_code: None,
            stderr: Some(other.to_string()),
        },
    }
}

pub fn map_completion_error(err: CompletionError) -> GatewayError {
    GatewayError::ProviderError {
        status: err.status(),
        message: err.to_string(),
    }
}

pub fn map_transcript_error(err: TranscriptError) -> GatewayError {
    GatewayError::StreamProtocolError {
        message: err.to_string(),
    }
}

/// The event a producer emits when `err` ends its run.
pub fn error_event(err: &GatewayError) -> InternalEvent {
    InternalEvent::error(err.error_type(), err.user_message())
}
