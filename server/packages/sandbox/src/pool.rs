//! Warm pool of idle sandboxes.
//!
//! Acquisition pops an idle sandbox atomically and hands it to exactly one
//! request. Every acquisition or eviction leaves a slot that the replenisher
//! refills; a failed refill keeps the slot open for the next round, so the
//! pool never shrinks below its target silently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::orchestrator::{SandboxLease, SandboxOrchestrator, TerminateReason};
use crate::platform::SandboxAuth;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of idle sandboxes. Zero disables the pool.
    pub size: usize,
    /// Idle sandboxes older than this are terminated and replaced.
    pub max_idle: Duration,
    pub replenish_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 0,
            max_idle: Duration::from_secs(300),
            replenish_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub ready: usize,
    pub pending_replacements: usize,
    pub target: usize,
}

#[derive(Clone)]
pub struct WarmPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    orchestrator: SandboxOrchestrator,
    config: PoolConfig,
    auth: SandboxAuth,
    state: Mutex<PoolState>,
    wake: Notify,
}

#[derive(Default)]
struct PoolState {
    ready: VecDeque<IdleSandbox>,
    in_flight: usize,
}

struct IdleSandbox {
    id: String,
    since: Instant,
}

impl WarmPool {
    /// `auth` is the service credential idle sandboxes are created with.
    pub fn new(orchestrator: SandboxOrchestrator, config: PoolConfig, auth: SandboxAuth) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                orchestrator,
                config,
                auth,
                state: Mutex::new(PoolState::default()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.size > 0
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        PoolStats {
            ready: state.ready.len(),
            pending_replacements: self.inner.config.size.saturating_sub(state.ready.len()),
            target: self.inner.config.size,
        }
    }

    /// Takes an idle sandbox for `request_id`, or `None` when the pool is
    /// empty. The sandbox's TTL starts now.
    pub async fn acquire(
        &self,
        request_id: &str,
        ttl: Duration,
        expose_ports: &[u16],
    ) -> Option<SandboxLease> {
        loop {
            let idle = {
                let mut state = self.inner.state.lock().await;
                state.ready.pop_back()?
            };
            self.inner.wake.notify_one();

            match self
                .inner
                .orchestrator
                .handover(&idle.id, request_id, ttl, expose_ports)
                .await
            {
                Ok(lease) => return Some(lease),
                Err(err) => {
                    warn!(sandbox_id = %idle.id, error = %err, "pooled sandbox unusable; discarding");
                    if let Err(err) = self
                        .inner
                        .orchestrator
                        .terminate_with(&idle.id, TerminateReason::PoolEvicted)
                        .await
                    {
                        warn!(sandbox_id = %idle.id, error = %err, "discard terminate failed");
                    }
                }
            }
        }
    }

    /// Evicts stale idle sandboxes and refills up to the target. Returns the
    /// number of sandboxes created.
    pub async fn replenish(&self) -> usize {
        self.evict_idle().await;

        let deficit = {
            let mut state = self.inner.state.lock().await;
            let have = state.ready.len() + state.in_flight;
            let deficit = self.inner.config.size.saturating_sub(have);
            state.in_flight += deficit;
            deficit
        };
        if deficit == 0 {
            return 0;
        }

        let mut created = 0;
        for _ in 0..deficit {
            let result = self
                .inner
                .orchestrator
                .create_pooled(self.inner.auth.clone(), self.inner.config.max_idle)
                .await;
            let mut state = self.inner.state.lock().await;
            state.in_flight = state.in_flight.saturating_sub(1);
            match result {
                Ok(sandbox) => {
                    state.ready.push_back(IdleSandbox {
                        id: sandbox.id,
                        since: Instant::now(),
                    });
                    created += 1;
                }
                Err(err) => {
                    warn!(error = %err, "warm pool replenishment failed; slot stays pending");
                }
            }
        }

        let ready = self.inner.state.lock().await.ready.len();
        info!(created, ready, target = self.inner.config.size, "warm pool replenished");
        created
    }

    async fn evict_idle(&self) {
        let max_idle = self.inner.config.max_idle;
        let stale: Vec<String> = {
            let mut state = self.inner.state.lock().await;
            let mut stale = Vec::new();
            while state
                .ready
                .front()
                .map(|idle| idle.since.elapsed() >= max_idle)
                .unwrap_or(false)
            {
                if let Some(idle) = state.ready.pop_front() {
                    stale.push(idle.id);
                }
            }
            stale
        };
        for id in stale {
            debug!(sandbox_id = %id, "evicting idle pooled sandbox");
            if let Err(err) = self
                .inner
                .orchestrator
                .terminate_with(&id, TerminateReason::PoolEvicted)
                .await
            {
                warn!(sandbox_id = %id, error = %err, "idle eviction terminate failed");
            }
        }
    }

    pub fn start_replenisher(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                pool.replenish().await;
                tokio::select! {
                    _ = tokio::time::sleep(pool.inner.config.replenish_interval) => {}
                    _ = pool.inner.wake.notified() => {}
                }
            }
        })
    }

    /// Terminates all idle sandboxes.
    pub async fn drain(&self) {
        let ids: Vec<String> = {
            let mut state = self.inner.state.lock().await;
            state.ready.drain(..).map(|idle| idle.id).collect()
        };
        for id in ids {
            if let Err(err) = self
                .inner
                .orchestrator
                .terminate_with(&id, TerminateReason::PoolEvicted)
                .await
            {
                warn!(sandbox_id = %id, error = %err, "drain terminate failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorConfig;
    use crate::testing::FakeSandboxPlatform;

    fn pool(platform: &FakeSandboxPlatform, size: usize, max_idle: Duration) -> WarmPool {
        let orchestrator = SandboxOrchestrator::new(
            Arc::new(platform.clone()),
            OrchestratorConfig::default(),
        );
        WarmPool::new(
            orchestrator,
            PoolConfig {
                size,
                max_idle,
                replenish_interval: Duration::from_secs(5),
            },
            SandboxAuth::new("service", "pool"),
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn acquisition_is_exclusive_and_capacity_is_restored() {
        let platform = FakeSandboxPlatform::new();
        let pool = pool(&platform, 2, Duration::from_secs(300));
        assert_eq!(pool.replenish().await, 2);

        let first = pool
            .acquire("req-a", Duration::from_secs(60), &[])
            .await
            .expect("first");
        let second = pool
            .acquire("req-b", Duration::from_secs(60), &[])
            .await
            .expect("second");
        assert_ne!(first.id(), second.id());
        assert!(pool.acquire("req-c", Duration::from_secs(60), &[]).await.is_none());
        assert_eq!(
            pool.stats().await,
            PoolStats {
                ready: 0,
                pending_replacements: 2,
                target: 2
            }
        );

        assert_eq!(pool.replenish().await, 2);
        assert_eq!(platform.create_count(), 4);
        first.terminate().await.expect("terminate");
        second.terminate().await.expect("terminate");
    }

    #[tokio::test]
    async fn failed_replenishment_keeps_the_deficit() {
        let platform = FakeSandboxPlatform::new();
        platform.set_fail_create(true);
        let pool = pool(&platform, 2, Duration::from_secs(300));
        assert_eq!(pool.replenish().await, 0);
        assert_eq!(pool.stats().await.pending_replacements, 2);

        platform.set_fail_create(false);
        assert_eq!(pool.replenish().await, 2);
        assert_eq!(pool.stats().await.ready, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_clock_starts_at_handover() {
        let platform = FakeSandboxPlatform::new();
        let pool = pool(&platform, 1, Duration::from_secs(10_000));
        pool.replenish().await;

        tokio::time::sleep(Duration::from_secs(900)).await;
        let lease = pool
            .acquire("req-a", Duration::from_secs(60), &[8080])
            .await
            .expect("pooled sandbox");
        let id = lease.id().to_string();
        assert!(lease.sandbox().exposed_ports.contains(&8080));
        assert_eq!(lease.sandbox().ttl_seconds, 60);

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(platform.terminate_count(&id), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(platform.terminate_count(&id), 1);
        lease.terminate().await.expect("idempotent");
        assert_eq!(platform.terminate_count(&id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_idle_sandboxes_are_replaced() {
        let platform = FakeSandboxPlatform::new();
        let pool = pool(&platform, 1, Duration::from_secs(30));
        pool.replenish().await;
        let original = platform.created_ids()[0].clone();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(pool.replenish().await, 1);
        assert_eq!(platform.terminate_count(&original), 1);
        assert_eq!(pool.stats().await.ready, 1);
    }
}
