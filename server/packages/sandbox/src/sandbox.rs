use std::collections::BTreeSet;

use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Terminating,
    Terminated,
}

impl SandboxStatus {
    /// Transitions run strictly forward, one state at a time.
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Running)
                | (Self::Running, Self::Terminating)
                | (Self::Terminating, Self::Terminated)
        )
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::Creating | Self::Running)
    }
}

/// Snapshot of one ephemeral environment as tracked by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sandbox {
    pub id: String,
    pub status: SandboxStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub ttl_seconds: u64,
    /// When the TTL watchdog fires. For pooled sandboxes the clock starts at
    /// handover, not at creation.
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub exposed_ports: BTreeSet<u16>,
    pub public_url: Option<String>,
    pub parent_id: Option<String>,
}
