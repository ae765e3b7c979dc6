use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::platform::{
    CreateSandboxRequest, ExecOutput, ExecRequest, ExecStream, FileEntry, PlatformError,
    SandboxAuth, SandboxPlatform,
};
use crate::sandbox::{Sandbox, SandboxStatus};

pub const DEFAULT_TTL_SECS: u64 = 600;
pub const DEFAULT_NESTED_QUOTA: usize = 5;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_ttl: Duration,
    /// Children one sandbox may own at the same time.
    pub nested_quota: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            nested_quota: DEFAULT_NESTED_QUOTA,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("sandbox provisioning failed: {0}")]
    Provisioning(#[source] PlatformError),
    #[error("nested sandbox quota exceeded for {parent_id} (limit {limit})")]
    QuotaExceeded { parent_id: String, limit: usize },
    #[error("sandbox not found: {0}")]
    NotFound(String),
    #[error("sandbox {sandbox_id} is not running ({status:?})")]
    NotRunning {
        sandbox_id: String,
        status: SandboxStatus,
    },
    #[error("command timed out after {0:?} and was killed")]
    ExecTimeout(Duration),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminateReason {
    Requested,
    TtlExpired,
    LeaseDropped,
    ParentTerminated,
    PoolEvicted,
    ProvisioningAborted,
}

impl TerminateReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::TtlExpired => "ttl_expired",
            Self::LeaseDropped => "lease_dropped",
            Self::ParentTerminated => "parent_terminated",
            Self::PoolEvicted => "pool_evicted",
            Self::ProvisioningAborted => "provisioning_aborted",
        }
    }
}

/// Sole owner of sandbox lifecycles, TTL watchdogs and nested quotas.
#[derive(Clone)]
pub struct SandboxOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    platform: Arc<dyn SandboxPlatform>,
    config: OrchestratorConfig,
    state: Mutex<OrchestratorState>,
}

#[derive(Default)]
struct OrchestratorState {
    sandboxes: HashMap<String, Entry>,
    nested: HashMap<String, usize>,
}

struct Entry {
    sandbox: Sandbox,
    auth: SandboxAuth,
    watchdog: Option<JoinHandle<()>>,
    pooled: bool,
}

struct Provision {
    auth: SandboxAuth,
    ttl: Duration,
    expose_ports: Vec<u16>,
    parent_id: Option<String>,
    pooled: bool,
}

impl SandboxOrchestrator {
    pub fn new(platform: Arc<dyn SandboxPlatform>, config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                config,
                state: Mutex::new(OrchestratorState::default()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Creates a sandbox owned by the returned lease. `ttl` defaults to the
    /// configured TTL.
    pub async fn create(
        &self,
        auth: SandboxAuth,
        ttl: Option<Duration>,
        expose_ports: &[u16],
    ) -> Result<SandboxLease, OrchestratorError> {
        let sandbox = self
            .provision_detached(Provision {
                auth,
                ttl: ttl.unwrap_or(self.inner.config.default_ttl),
                expose_ports: expose_ports.to_vec(),
                parent_id: None,
                pooled: false,
            })
            .await?;
        Ok(SandboxLease::new(self.clone(), sandbox))
    }

    /// Creates a sandbox on behalf of a process running inside `parent_id`.
    pub async fn create_child(
        &self,
        parent_id: &str,
        ttl: Option<Duration>,
        expose_ports: &[u16],
    ) -> Result<SandboxLease, OrchestratorError> {
        let limit = self.inner.config.nested_quota;
        let auth = {
            let mut state = self.inner.state.lock().await;
            let parent = state
                .sandboxes
                .get(parent_id)
                .ok_or_else(|| OrchestratorError::NotFound(parent_id.to_string()))?;
            if parent.sandbox.status != SandboxStatus::Running {
                return Err(OrchestratorError::NotRunning {
                    sandbox_id: parent_id.to_string(),
                    status: parent.sandbox.status,
                });
            }
            let auth = parent.auth.clone();
            let owned = state.nested.entry(parent_id.to_string()).or_insert(0);
            if *owned >= limit {
                warn!(parent_id, limit, "nested sandbox quota exceeded");
                return Err(OrchestratorError::QuotaExceeded {
                    parent_id: parent_id.to_string(),
                    limit,
                });
            }
            *owned += 1;
            auth
        };

        let sandbox = self
            .provision_detached(Provision {
                auth,
                ttl: ttl.unwrap_or(self.inner.config.default_ttl),
                expose_ports: expose_ports.to_vec(),
                parent_id: Some(parent_id.to_string()),
                pooled: false,
            })
            .await?;
        Ok(SandboxLease::new(self.clone(), sandbox))
    }

    /// Runs provisioning on its own task so a caller that goes away mid-create
    /// cannot leak the sandbox.
    async fn provision_detached(&self, request: Provision) -> Result<Sandbox, OrchestratorError> {
        let this = self.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = this.provision(request).await;
            if let Err(Ok(sandbox)) = tx.send(result) {
                warn!(sandbox_id = %sandbox.id, "requester went away during provisioning");
                if let Err(err) = this
                    .terminate_with(&sandbox.id, TerminateReason::ProvisioningAborted)
                    .await
                {
                    warn!(sandbox_id = %sandbox.id, error = %err, "failed to terminate abandoned sandbox");
                }
            }
        });
        rx.await.map_err(|_| {
            OrchestratorError::Provisioning(PlatformError::Unreachable(
                "provisioning task aborted".to_string(),
            ))
        })?
    }

    async fn provision(&self, request: Provision) -> Result<Sandbox, OrchestratorError> {
        let Provision {
            auth,
            ttl,
            expose_ports,
            parent_id,
            pooled,
        } = request;

        let create = CreateSandboxRequest {
            ttl_seconds: ttl.as_secs(),
            expose_ports: expose_ports.clone(),
            parent_id: parent_id.clone(),
        };
        let created = match self.inner.platform.create(&auth, &create).await {
            Ok(created) => created,
            Err(err) => {
                warn!(request_id = %auth.request_id, error = %err, "sandbox provisioning failed");
                if let Some(parent_id) = &parent_id {
                    let mut state = self.inner.state.lock().await;
                    release_nested_slot(&mut state, parent_id);
                }
                return Err(OrchestratorError::Provisioning(err));
            }
        };

        let sandbox_id = created.id.clone();
        {
            let mut state = self.inner.state.lock().await;
            state.sandboxes.insert(
                sandbox_id.clone(),
                Entry {
                    sandbox: Sandbox {
                        id: sandbox_id.clone(),
                        status: SandboxStatus::Creating,
                        created_at: OffsetDateTime::now_utc(),
                        ttl_seconds: ttl.as_secs(),
                        expires_at: None,
                        exposed_ports: BTreeSet::new(),
                        public_url: created.public_url.clone(),
                        parent_id: parent_id.clone(),
                    },
                    auth: auth.clone(),
                    watchdog: None,
                    pooled,
                },
            );
        }
        debug!(sandbox_id = %sandbox_id, "sandbox creating");

        for port in &expose_ports {
            match self.inner.platform.expose_port(&auth, &sandbox_id, *port).await {
                Ok(url) => {
                    let mut state = self.inner.state.lock().await;
                    if let Some(entry) = state.sandboxes.get_mut(&sandbox_id) {
                        entry.sandbox.exposed_ports.insert(*port);
                        entry.sandbox.public_url.get_or_insert(url);
                    }
                }
                Err(err) => {
                    warn!(sandbox_id = %sandbox_id, port, error = %err, "port exposure failed");
                    if let Err(term_err) = self
                        .terminate_with(&sandbox_id, TerminateReason::ProvisioningAborted)
                        .await
                    {
                        warn!(sandbox_id = %sandbox_id, error = %term_err, "cleanup after failed provisioning also failed");
                    }
                    return Err(OrchestratorError::Provisioning(err));
                }
            }
        }

        let mut state = self.inner.state.lock().await;
        let entry = state
            .sandboxes
            .get_mut(&sandbox_id)
            .ok_or_else(|| OrchestratorError::NotFound(sandbox_id.clone()))?;
        advance(&mut entry.sandbox, SandboxStatus::Running);
        // Pooled sandboxes get a backstop watchdog over their whole idle
        // window; handover replaces it with the request TTL.
        if !pooled {
            entry.sandbox.expires_at = Some(OffsetDateTime::now_utc() + ttl);
        }
        entry.watchdog = Some(self.spawn_watchdog(sandbox_id.clone(), ttl));
        info!(
            sandbox_id = %sandbox_id,
            ttl_secs = ttl.as_secs(),
            pooled,
            parent_id = parent_id.as_deref().unwrap_or(""),
            "sandbox running"
        );
        Ok(entry.sandbox.clone())
    }

    fn spawn_watchdog(&self, sandbox_id: String, ttl: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let orchestrator = SandboxOrchestrator { inner };
            warn!(sandbox_id = %sandbox_id, ttl_secs = ttl.as_secs(), "sandbox ttl expired");
            if let Err(err) = orchestrator
                .terminate_with(&sandbox_id, TerminateReason::TtlExpired)
                .await
            {
                warn!(sandbox_id = %sandbox_id, error = %err, "ttl terminate failed");
            }
        })
    }

    /// Idempotent. Unknown or already terminated ids succeed without
    /// contacting the platform.
    pub async fn terminate(&self, sandbox_id: &str) -> Result<(), OrchestratorError> {
        self.terminate_with(sandbox_id, TerminateReason::Requested)
            .await
    }

    pub(crate) fn terminate_with<'a>(
        &'a self,
        sandbox_id: &'a str,
        reason: TerminateReason,
    ) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move {
            let (auth, parent_id, children) = {
                let mut state = self.inner.state.lock().await;
                let Some(entry) = state.sandboxes.get_mut(sandbox_id) else {
                    debug!(sandbox_id, "terminate for unknown sandbox ignored");
                    return Ok(());
                };
                if !entry.sandbox.status.is_live() {
                    return Ok(());
                }
                if entry.sandbox.status == SandboxStatus::Creating {
                    advance(&mut entry.sandbox, SandboxStatus::Running);
                }
                advance(&mut entry.sandbox, SandboxStatus::Terminating);
                if let Some(watchdog) = entry.watchdog.take() {
                    // The watchdog may be the task running this terminate.
                    if reason != TerminateReason::TtlExpired {
                        watchdog.abort();
                    }
                }
                entry.sandbox.exposed_ports.clear();
                let auth = entry.auth.clone();
                let parent_id = entry.sandbox.parent_id.clone();
                let children: Vec<String> = state
                    .sandboxes
                    .values()
                    .filter(|child| {
                        child.sandbox.parent_id.as_deref() == Some(sandbox_id)
                            && child.sandbox.status.is_live()
                    })
                    .map(|child| child.sandbox.id.clone())
                    .collect();
                (auth, parent_id, children)
            };

            for child in children {
                if let Err(err) = self
                    .terminate_with(&child, TerminateReason::ParentTerminated)
                    .await
                {
                    warn!(sandbox_id = %child, error = %err, "child terminate failed");
                }
            }

            info!(sandbox_id, reason = reason.as_str(), "sandbox terminating");
            let result = self.inner.platform.terminate(&auth, sandbox_id).await;

            {
                let mut state = self.inner.state.lock().await;
                if let Some(mut entry) = state.sandboxes.remove(sandbox_id) {
                    advance(&mut entry.sandbox, SandboxStatus::Terminated);
                }
                if let Some(parent_id) = &parent_id {
                    release_nested_slot(&mut state, parent_id);
                }
                state.nested.remove(sandbox_id);
            }

            match result {
                Ok(()) => {
                    info!(sandbox_id, "sandbox terminated");
                    Ok(())
                }
                Err(err) => {
                    warn!(sandbox_id, error = %err, "platform terminate failed");
                    Err(err.into())
                }
            }
        })
    }

    /// Terminates every tracked sandbox. Used on shutdown.
    pub async fn terminate_all(&self) {
        let ids: Vec<String> = {
            let state = self.inner.state.lock().await;
            state
                .sandboxes
                .values()
                .filter(|entry| entry.sandbox.parent_id.is_none())
                .map(|entry| entry.sandbox.id.clone())
                .collect()
        };
        for id in ids {
            if let Err(err) = self.terminate(&id).await {
                warn!(sandbox_id = %id, error = %err, "shutdown terminate failed");
            }
        }
    }

    async fn live_auth(&self, sandbox_id: &str) -> Result<SandboxAuth, OrchestratorError> {
        let state = self.inner.state.lock().await;
        let entry = state
            .sandboxes
            .get(sandbox_id)
            .ok_or_else(|| OrchestratorError::NotFound(sandbox_id.to_string()))?;
        if !entry.sandbox.status.is_live() {
            return Err(OrchestratorError::NotRunning {
                sandbox_id: sandbox_id.to_string(),
                status: entry.sandbox.status,
            });
        }
        Ok(entry.auth.clone())
    }

    pub async fn exec(
        &self,
        sandbox_id: &str,
        command: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecOutput, OrchestratorError> {
        self.exec_request(sandbox_id, ExecRequest::new(command), timeout)
            .await
    }

    /// On timeout the command is killed; the sandbox stays running.
    pub async fn exec_request(
        &self,
        sandbox_id: &str,
        request: ExecRequest,
        timeout: Duration,
    ) -> Result<ExecOutput, OrchestratorError> {
        let auth = self.live_auth(sandbox_id).await?;
        match tokio::time::timeout(timeout, self.inner.platform.exec(&auth, sandbox_id, &request))
            .await
        {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(
                    sandbox_id,
                    exec_id = %request.exec_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "exec timed out; killing command"
                );
                if let Err(err) = self.kill_exec(sandbox_id, &request.exec_id).await {
                    warn!(sandbox_id, error = %err, "kill after exec timeout failed");
                }
                Err(OrchestratorError::ExecTimeout(timeout))
            }
        }
    }

    pub async fn exec_stream(
        &self,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecStream, OrchestratorError> {
        let auth = self.live_auth(sandbox_id).await?;
        Ok(self
            .inner
            .platform
            .exec_stream(&auth, sandbox_id, request)
            .await?)
    }

    pub async fn kill_exec(&self, sandbox_id: &str, exec_id: &str) -> Result<(), OrchestratorError> {
        let auth = self.live_auth(sandbox_id).await?;
        Ok(self
            .inner
            .platform
            .kill_exec(&auth, sandbox_id, exec_id)
            .await?)
    }

    pub async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), OrchestratorError> {
        let auth = self.live_auth(sandbox_id).await?;
        Ok(self
            .inner
            .platform
            .write_file(&auth, sandbox_id, path, contents)
            .await?)
    }

    pub async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, OrchestratorError> {
        let auth = self.live_auth(sandbox_id).await?;
        Ok(self.inner.platform.read_file(&auth, sandbox_id, path).await?)
    }

    pub async fn list_files(
        &self,
        sandbox_id: &str,
        dir: &str,
    ) -> Result<Vec<FileEntry>, OrchestratorError> {
        let auth = self.live_auth(sandbox_id).await?;
        Ok(self.inner.platform.list_files(&auth, sandbox_id, dir).await?)
    }

    pub async fn expose_port(&self, sandbox_id: &str, port: u16) -> Result<String, OrchestratorError> {
        let auth = self.live_auth(sandbox_id).await?;
        let url = self
            .inner
            .platform
            .expose_port(&auth, sandbox_id, port)
            .await?;
        let mut state = self.inner.state.lock().await;
        if let Some(entry) = state.sandboxes.get_mut(sandbox_id) {
            entry.sandbox.exposed_ports.insert(port);
            entry.sandbox.public_url.get_or_insert_with(|| url.clone());
        }
        debug!(sandbox_id, port, url = %url, "port exposed");
        Ok(url)
    }

    pub async fn get(&self, sandbox_id: &str) -> Option<Sandbox> {
        let state = self.inner.state.lock().await;
        state
            .sandboxes
            .get(sandbox_id)
            .map(|entry| entry.sandbox.clone())
    }

    /// Live sandboxes currently serving requests; idle pooled ones excluded.
    pub async fn active_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state
            .sandboxes
            .values()
            .filter(|entry| !entry.pooled && entry.sandbox.status.is_live())
            .count()
    }

    pub async fn health(&self) -> Result<(), PlatformError> {
        self.inner.platform.health().await
    }

    /// Provisions an idle sandbox whose request TTL is not yet running. A
    /// backstop watchdog reclaims it after `max_idle` plus the default TTL
    /// if the pool never hands it over or evicts it.
    pub(crate) async fn create_pooled(
        &self,
        auth: SandboxAuth,
        max_idle: Duration,
    ) -> Result<Sandbox, OrchestratorError> {
        self.provision(Provision {
            auth,
            ttl: max_idle + self.inner.config.default_ttl,
            expose_ports: Vec::new(),
            parent_id: None,
            pooled: true,
        })
        .await
    }

    /// Hands a pooled sandbox to a request and starts its TTL clock.
    pub(crate) async fn handover(
        &self,
        sandbox_id: &str,
        request_id: &str,
        ttl: Duration,
        expose_ports: &[u16],
    ) -> Result<SandboxLease, OrchestratorError> {
        let sandbox = {
            let mut state = self.inner.state.lock().await;
            let entry = state
                .sandboxes
                .get_mut(sandbox_id)
                .ok_or_else(|| OrchestratorError::NotFound(sandbox_id.to_string()))?;
            if entry.sandbox.status != SandboxStatus::Running {
                return Err(OrchestratorError::NotRunning {
                    sandbox_id: sandbox_id.to_string(),
                    status: entry.sandbox.status,
                });
            }
            entry.pooled = false;
            entry.auth.request_id = request_id.to_string();
            entry.sandbox.ttl_seconds = ttl.as_secs();
            entry.sandbox.expires_at = Some(OffsetDateTime::now_utc() + ttl);
            if let Some(backstop) = entry
                .watchdog
                .replace(self.spawn_watchdog(sandbox_id.to_string(), ttl))
            {
                backstop.abort();
            }
            entry.sandbox.clone()
        };
        let mut lease = SandboxLease::new(self.clone(), sandbox);
        for port in expose_ports {
            self.expose_port(sandbox_id, *port).await?;
        }
        if let Some(refreshed) = self.get(sandbox_id).await {
            lease.sandbox = refreshed;
        }
        info!(sandbox_id, request_id, ttl_secs = ttl.as_secs(), "pooled sandbox handed over");
        Ok(lease)
    }
}

fn release_nested_slot(state: &mut OrchestratorState, parent_id: &str) {
    if let Some(owned) = state.nested.get_mut(parent_id) {
        *owned = owned.saturating_sub(1);
        if *owned == 0 {
            state.nested.remove(parent_id);
        }
    }
}

fn advance(sandbox: &mut Sandbox, next: SandboxStatus) {
    if sandbox.status.can_transition_to(next) {
        debug!(sandbox_id = %sandbox.id, from = ?sandbox.status, to = ?next, "sandbox transition");
        sandbox.status = next;
    } else {
        warn!(sandbox_id = %sandbox.id, from = ?sandbox.status, to = ?next, "invalid sandbox transition ignored");
    }
}

/// Right to terminate one sandbox. Dropping an unreleased lease schedules
/// `terminate` on the current runtime.
pub struct SandboxLease {
    orchestrator: SandboxOrchestrator,
    sandbox: Sandbox,
    released: bool,
}

impl SandboxLease {
    fn new(orchestrator: SandboxOrchestrator, sandbox: Sandbox) -> Self {
        Self {
            orchestrator,
            sandbox,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.sandbox.id
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn orchestrator(&self) -> &SandboxOrchestrator {
        &self.orchestrator
    }

    /// Terminates on a spawned task so the call completes even if the
    /// awaiting future is dropped.
    pub async fn terminate(mut self) -> Result<(), OrchestratorError> {
        self.released = true;
        let orchestrator = self.orchestrator.clone();
        let sandbox_id = self.sandbox.id.clone();
        let handle = tokio::spawn(async move { orchestrator.terminate(&sandbox_id).await });
        handle.await.map_err(|err| {
            OrchestratorError::Platform(PlatformError::Unreachable(format!(
                "terminate task failed: {err}"
            )))
        })?
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let orchestrator = self.orchestrator.clone();
        let sandbox_id = self.sandbox.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(sandbox_id = %sandbox_id, "lease dropped; scheduling terminate");
                handle.spawn(async move {
                    if let Err(err) = orchestrator
                        .terminate_with(&sandbox_id, TerminateReason::LeaseDropped)
                        .await
                    {
                        warn!(sandbox_id = %sandbox_id, error = %err, "terminate after lease drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(sandbox_id = %sandbox_id, "lease dropped outside a runtime; ttl watchdog will reclaim it");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSandboxPlatform;

    fn orchestrator(platform: &FakeSandboxPlatform, nested_quota: usize) -> SandboxOrchestrator {
        SandboxOrchestrator::new(
            Arc::new(platform.clone()),
            OrchestratorConfig {
                default_ttl: Duration::from_secs(600),
                nested_quota,
            },
        )
    }

    fn auth() -> SandboxAuth {
        SandboxAuth::new("scoped", "req-1")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_reaches_platform_once() {
        let platform = FakeSandboxPlatform::new();
        let orchestrator = orchestrator(&platform, 5);
        let lease = orchestrator.create(auth(), None, &[]).await.expect("create");
        let id = lease.id().to_string();
        assert_eq!(lease.sandbox().status, SandboxStatus::Running);
        assert!(lease.sandbox().expires_at.is_some());

        orchestrator.terminate(&id).await.expect("first terminate");
        orchestrator.terminate(&id).await.expect("second terminate");
        lease.terminate().await.expect("lease terminate");

        assert_eq!(platform.terminate_count(&id), 1);
        assert!(orchestrator.get(&id).await.is_none());
        assert_eq!(orchestrator.active_count().await, 0);
    }

    #[tokio::test]
    async fn provisioning_failure_registers_nothing() {
        let platform = FakeSandboxPlatform::new();
        platform.set_fail_create(true);
        let orchestrator = orchestrator(&platform, 5);
        let err = orchestrator
            .create(auth(), None, &[])
            .await
            .err()
            .expect("create should fail");
        assert!(matches!(err, OrchestratorError::Provisioning(_)));
        assert_eq!(orchestrator.active_count().await, 0);
    }

    #[tokio::test]
    async fn nested_quota_is_enforced_per_parent() {
        let platform = FakeSandboxPlatform::new();
        let orchestrator = orchestrator(&platform, 2);
        let parent = orchestrator.create(auth(), None, &[]).await.expect("parent");

        let first = orchestrator
            .create_child(parent.id(), None, &[])
            .await
            .expect("first child");
        let _second = orchestrator
            .create_child(parent.id(), None, &[])
            .await
            .expect("second child");
        let third = orchestrator.create_child(parent.id(), None, &[]).await;
        assert!(matches!(
            third,
            Err(OrchestratorError::QuotaExceeded { limit: 2, .. })
        ));

        first.terminate().await.expect("terminate child");
        let _replacement = orchestrator
            .create_child(parent.id(), None, &[])
            .await
            .expect("slot released");

        let parent_id = parent.id().to_string();
        parent.terminate().await.expect("terminate parent");
        assert_eq!(platform.terminate_count(&parent_id), 1);
        assert_eq!(platform.live_count(), 0);
        assert_eq!(platform.total_terminate_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_watchdog_terminates_expired_sandbox() {
        let platform = FakeSandboxPlatform::new();
        let orchestrator = orchestrator(&platform, 5);
        let lease = orchestrator
            .create(auth(), Some(Duration::from_secs(10)), &[])
            .await
            .expect("create");
        let id = lease.id().to_string();

        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        assert_eq!(platform.terminate_count(&id), 1);
        assert!(orchestrator.get(&id).await.is_none());
        lease.terminate().await.expect("already gone");
        assert_eq!(platform.terminate_count(&id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn orphaned_pooled_sandbox_is_reclaimed_by_backstop_watchdog() {
        let platform = FakeSandboxPlatform::new();
        let orchestrator = orchestrator(&platform, 5);
        let pooled = orchestrator
            .create_pooled(auth(), Duration::from_secs(60))
            .await
            .expect("pooled");
        assert!(pooled.expires_at.is_none());
        assert_eq!(orchestrator.active_count().await, 0);

        tokio::time::sleep(Duration::from_secs(659)).await;
        settle().await;
        assert_eq!(platform.terminate_count(&pooled.id), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(platform.terminate_count(&pooled.id), 1);
        assert!(orchestrator.get(&pooled.id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn handover_replaces_the_backstop_with_the_request_ttl() {
        let platform = FakeSandboxPlatform::new();
        let orchestrator = orchestrator(&platform, 5);
        let pooled = orchestrator
            .create_pooled(auth(), Duration::from_secs(60))
            .await
            .expect("pooled");

        tokio::time::sleep(Duration::from_secs(600)).await;
        let lease = orchestrator
            .handover(&pooled.id, "req-2", Duration::from_secs(300), &[])
            .await
            .expect("handover");
        assert!(lease.sandbox().expires_at.is_some());

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(platform.terminate_count(&pooled.id), 0);

        tokio::time::sleep(Duration::from_secs(181)).await;
        settle().await;
        assert_eq!(platform.terminate_count(&pooled.id), 1);
        lease.terminate().await.expect("already gone");
    }

    #[tokio::test(start_paused = true)]
    async fn exec_timeout_kills_command_but_keeps_sandbox() {
        let platform = FakeSandboxPlatform::new();
        platform.set_exec_delay(Some(Duration::from_secs(60)));
        let orchestrator = orchestrator(&platform, 5);
        let lease = orchestrator.create(auth(), None, &[]).await.expect("create");

        let result = orchestrator
            .exec(lease.id(), vec!["sleep".to_string(), "60".to_string()], Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(OrchestratorError::ExecTimeout(_))));
        assert_eq!(platform.killed_execs().len(), 1);
        let sandbox = orchestrator.get(lease.id()).await.expect("still tracked");
        assert_eq!(sandbox.status, SandboxStatus::Running);
        lease.terminate().await.expect("terminate");
    }

    #[tokio::test]
    async fn dropped_lease_schedules_terminate() {
        let platform = FakeSandboxPlatform::new();
        let orchestrator = orchestrator(&platform, 5);
        let lease = orchestrator.create(auth(), None, &[]).await.expect("create");
        let id = lease.id().to_string();
        drop(lease);
        settle().await;
        assert_eq!(platform.terminate_count(&id), 1);
    }

    #[tokio::test]
    async fn exposed_ports_are_recorded_and_cleared() {
        let platform = FakeSandboxPlatform::new();
        let orchestrator = orchestrator(&platform, 5);
        let lease = orchestrator
            .create(auth(), None, &[8080])
            .await
            .expect("create");
        assert!(lease.sandbox().exposed_ports.contains(&8080));
        let url = orchestrator
            .expose_port(lease.id(), 3000)
            .await
            .expect("expose");
        assert!(url.contains("3000"));
        let sandbox = orchestrator.get(lease.id()).await.expect("tracked");
        assert_eq!(sandbox.exposed_ports.len(), 2);
        lease.terminate().await.expect("terminate");
    }

    #[tokio::test]
    async fn file_transfer_is_byte_exact() {
        let platform = FakeSandboxPlatform::new();
        let orchestrator = orchestrator(&platform, 5);
        let lease = orchestrator.create(auth(), None, &[]).await.expect("create");
        let bytes = vec![0u8, 159, 146, 150, 255];
        orchestrator
            .write_file(lease.id(), "/workspace/blob.bin", &bytes)
            .await
            .expect("write");
        let read = orchestrator
            .read_file(lease.id(), "/workspace/blob.bin")
            .await
            .expect("read");
        assert_eq!(read, bytes);
        lease.terminate().await.expect("terminate");
    }
}
