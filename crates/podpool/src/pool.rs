//! The cluster pool façade.
//!
//! [`ClusterPool`] is what the session layer talks to. It composes the
//! backend, the pod cache, the environment registry and the claim protocol.
//! It holds no pod state of its own; ownership lives in backend labels.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use rand::Rng;
use tokio::time::Instant;

use crate::backend::{self, BackendClient, PodTemplate};
use crate::cache::{PodSnapshot, PodStateCache};
use crate::claim::{ClaimProtocol, occupy_labels};
use crate::config::PoolConfig;
use crate::environment::{EnvironmentRegistry, validate_label_value};
use crate::error::{PoolError, PoolResult};
use crate::pod::{
    CLAIMED_AT_LABEL, CLAIMER_LABEL, ENVIRONMENT_LABEL, Labels, POOL_LABEL, Pod, PodPhase,
    PoolState, REASON_LABEL, SESSION_TYPE, SPAWNER_LABEL, TYPE_LABEL, timestamp_label,
};
use crate::scheduler::PoolScheduler;

/// Why a pod is being spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnReason {
    /// Topping up the standby pool.
    Filling,
    /// Requested by an acquirer that found no standby pod.
    Demanded,
}

impl SpawnReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnReason::Filling => "filling",
            SpawnReason::Demanded => "demanded",
        }
    }
}

impl std::fmt::Display for SpawnReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Random lowercase hex string of `bytes` random bytes.
fn random_hex(bytes: usize) -> String {
    let mut rng = rand::rng();
    let buf: Vec<u8> = (0..bytes).map(|_| rng.random()).collect();
    hex::encode(buf)
}

/// Generate a manager identity such as `pool-0f3a...` (24 hex digits).
pub fn generate_manager_id() -> String {
    format!("pool-{}", random_hex(12))
}

/// Generate a pod name such as `session-20240501103000123-<16 hex>`.
pub fn generate_pod_name() -> String {
    format!(
        "session-{}-{}",
        Utc::now().format("%Y%m%d%H%M%S%3f"),
        random_hex(8)
    )
}

/// Pool of session pods on one backend.
pub struct ClusterPool {
    backend: Arc<dyn BackendClient>,
    cache: PodStateCache,
    registry: EnvironmentRegistry,
    claim: ClaimProtocol,
    config: PoolConfig,
    manager_id: String,
}

impl ClusterPool {
    /// Create a pool on `backend`, validating `config`.
    pub fn new(backend: Arc<dyn BackendClient>, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let registry = config.registry()?;
        let manager_id = match &config.manager_id {
            Some(id) => id.clone(),
            None => generate_manager_id(),
        };
        validate_label_value(&manager_id, "manager id")?;

        info!(
            "pool manager {} using {} backend",
            manager_id,
            backend.name()
        );

        Ok(Self {
            cache: PodStateCache::new(backend.clone(), config.cache_ttl()),
            claim: ClaimProtocol::new(config.acquire_max_attempts),
            backend,
            registry,
            config,
            manager_id,
        })
    }

    /// Create a pool on the backend selected by `config`.
    pub fn connect(config: PoolConfig) -> PoolResult<Self> {
        let backend = backend::connect(&config)?;
        Self::new(backend, config)
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn BackendClient> {
        &self.backend
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    /// Every managed pod, possibly up to one cache TTL old.
    pub async fn list(&self) -> PoolResult<Arc<PodSnapshot>> {
        self.cache.list().await
    }

    /// Every managed pod, fetched now.
    pub async fn refresh(&self) -> PoolResult<Arc<PodSnapshot>> {
        self.cache.refresh().await
    }

    /// Look up a pod, falling back to the backend on a cache miss.
    pub async fn get(&self, id: &str) -> PoolResult<Pod> {
        self.cache.get(id).await
    }

    /// Phase of a pod; a pod that no longer exists has finished.
    pub async fn status(&self, id: &str) -> PoolResult<PodPhase> {
        match self.get(id).await {
            Ok(pod) => Ok(pod.phase),
            Err(PoolError::NotFound(_)) => Ok(PodPhase::Succeeded),
            Err(e) => Err(e),
        }
    }

    /// Base URL of a running pod.
    pub async fn resolve(&self, id: &str) -> PoolResult<String> {
        let pod = self.get(id).await?;
        if let Some(url) = pod.url() {
            return Ok(url);
        }
        Err(match pod.phase {
            PodPhase::Pending => PoolError::NotReady {
                pod_id: pod.id,
                phase: pod.phase.to_string(),
            },
            phase => PoolError::PodFailure {
                pod_id: pod.id,
                phase: phase.to_string(),
            },
        })
    }

    /// Resolve the environment id to use, defaulting when `None`.
    fn environment_id<'a>(&'a self, environment: Option<&'a str>) -> PoolResult<&'a str> {
        let id = environment.unwrap_or_else(|| self.registry.default_id());
        self.registry.get(id)?;
        Ok(id)
    }

    /// Create a pod of `environment` in ownership state `pool`.
    ///
    /// With `wait_for_ready`, polls until the pod runs or the ready timeout
    /// passes. A claimed or occupied pod that fails to start is deleted, since
    /// the caller never gets its id.
    pub async fn spawn(
        &self,
        environment: Option<&str>,
        pool: PoolState,
        reason: SpawnReason,
        wait_for_ready: bool,
    ) -> PoolResult<Pod> {
        let environment = self.environment_id(environment)?;
        let template = self.registry.get(environment)?;

        let mut labels = Labels::new();
        labels.insert(TYPE_LABEL.to_string(), SESSION_TYPE.to_string());
        labels.insert(POOL_LABEL.to_string(), pool.to_string());
        labels.insert(ENVIRONMENT_LABEL.to_string(), environment.to_string());
        labels.insert(REASON_LABEL.to_string(), reason.to_string());
        labels.insert(SPAWNER_LABEL.to_string(), self.manager_id.clone());
        match pool {
            PoolState::Claimed => {
                labels.insert(CLAIMER_LABEL.to_string(), self.manager_id.clone());
                labels.insert(CLAIMED_AT_LABEL.to_string(), timestamp_label(Utc::now()));
            }
            PoolState::Occupied => {
                labels.extend(occupy_labels(&self.manager_id, Utc::now()));
            }
            PoolState::Standby | PoolState::Deleting => {}
        }

        let request = PodTemplate::from_environment(
            generate_pod_name(),
            template,
            self.config.resources,
            labels,
            self.config.container_port,
        );
        let pod = self.backend.create_pod(&request).await?;
        info!(
            "created pod {} (environment {}, pool {}, reason {})",
            pod.id, environment, pool, reason
        );

        if !wait_for_ready {
            return Ok(pod);
        }

        let id = pod.id.clone();
        match self.wait_until_running(pod).await {
            Ok(pod) => Ok(pod),
            Err(e) => {
                if pool != PoolState::Standby {
                    warn!("pod {} did not start ({}); deleting it", id, e);
                    self.stop(&id).await;
                }
                Err(e)
            }
        }
    }

    async fn wait_until_running(&self, mut pod: Pod) -> PoolResult<Pod> {
        let deadline = Instant::now() + self.config.ready_timeout();
        loop {
            match pod.phase {
                PodPhase::Running => {
                    info!("started pod {}", pod.id);
                    return Ok(pod);
                }
                PodPhase::Pending => {}
                phase => {
                    return Err(PoolError::PodFailure {
                        pod_id: pod.id,
                        phase: phase.to_string(),
                    });
                }
            }

            if Instant::now() >= deadline {
                return Err(PoolError::NotReady {
                    pod_id: pod.id,
                    phase: pod.phase.to_string(),
                });
            }
            tokio::time::sleep(self.config.ready_poll_interval()).await;
            pod = self.backend.get_pod(&pod.id).await?;
        }
    }

    /// Hand out a pod of `environment`, claiming a standby pod if possible.
    pub async fn acquire(&self, environment: Option<&str>) -> PoolResult<Pod> {
        let environment = self.environment_id(environment)?;

        if let Some(pod) = self
            .claim
            .claim(self.backend.as_ref(), &self.manager_id, environment)
            .await?
        {
            return Ok(pod);
        }

        self.spawn(
            Some(environment),
            PoolState::Occupied,
            SpawnReason::Demanded,
            self.config.wait_for_ready,
        )
        .await
    }

    /// Delete a pod with the configured grace period. Never fails.
    pub async fn stop(&self, id: &str) {
        match self
            .backend
            .delete_pod(id, Some(self.config.delete_grace_period_secs))
            .await
        {
            Ok(()) => info!("deleted pod {}", id),
            Err(e) if e.is_not_found() => debug!("pod {} already deleted", id),
            Err(e) => warn!("failed to delete pod {}: {}", id, e),
        }
    }

    /// Check the backend is reachable.
    pub async fn health(&self) -> PoolResult<String> {
        self.backend.health_check().await
    }

    /// Launch the filler and reaper loops. Stop them with [`PoolScheduler::stop`].
    pub fn start(self: &Arc<Self>) -> PoolScheduler {
        PoolScheduler::start(Arc::clone(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::pod::PodAddress;
    use std::time::Duration;

    fn pool_with(backend: Arc<MemoryBackend>, config: PoolConfig) -> ClusterPool {
        ClusterPool::new(
            backend,
            PoolConfig {
                manager_id: Some("pool-test".to_string()),
                ..config
            },
        )
        .unwrap()
    }

    fn pod(id: &str, phase: PodPhase) -> Pod {
        let mut labels = Labels::new();
        labels.insert(TYPE_LABEL.into(), SESSION_TYPE.into());
        let address = (phase == PodPhase::Running).then(|| PodAddress::new("10.0.0.9", 2000));
        Pod::new(id, phase, address, labels, None)
    }

    #[test]
    fn test_generated_names() {
        let id = generate_manager_id();
        assert!(id.starts_with("pool-"));
        assert_eq!(id.len(), "pool-".len() + 24);

        let name = generate_pod_name();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts[0], "session");
        assert_eq!(parts[1].len(), 17);
        assert_eq!(parts[2].len(), 16);
    }

    #[tokio::test]
    async fn test_resolve_semantics() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(pod("running", PodPhase::Running));
        backend.insert(pod("pending", PodPhase::Pending));
        backend.insert(pod("failed", PodPhase::Failed));
        let pool = pool_with(backend, PoolConfig::default());

        assert_eq!(pool.resolve("running").await.unwrap(), "http://10.0.0.9:2000");
        assert!(matches!(
            pool.resolve("pending").await,
            Err(PoolError::NotReady { .. })
        ));
        assert!(matches!(
            pool.resolve("failed").await,
            Err(PoolError::PodFailure { .. })
        ));
        assert!(pool.resolve("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_status_of_missing_pod_is_succeeded() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(pod("p1", PodPhase::Pending));
        let pool = pool_with(backend, PoolConfig::default());

        assert_eq!(pool.status("p1").await.unwrap(), PodPhase::Pending);
        assert_eq!(pool.status("gone").await.unwrap(), PodPhase::Succeeded);
    }

    #[tokio::test]
    async fn test_spawn_labels() {
        let backend = Arc::new(MemoryBackend::new());
        let pool = pool_with(backend.clone(), PoolConfig::default());

        let pod = pool
            .spawn(Some("alpine"), PoolState::Occupied, SpawnReason::Demanded, false)
            .await
            .unwrap();
        assert_eq!(pod.pool(), Some(PoolState::Occupied));
        assert_eq!(pod.environment(), Some("alpine"));
        assert_eq!(pod.acquirer(), Some("pool-test"));
        assert!(pod.acquired_at().is_some());
        assert_eq!(pod.labels.get(REASON_LABEL).map(String::as_str), Some("demanded"));
        assert_eq!(pod.labels.get(SPAWNER_LABEL).map(String::as_str), Some("pool-test"));

        assert!(matches!(
            pool.spawn(Some("python"), PoolState::Standby, SpawnReason::Filling, false)
                .await,
            Err(PoolError::UnknownEnvironment(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_waits_until_running() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_create_phase(PodPhase::Pending);
        let pool = Arc::new(pool_with(backend.clone(), PoolConfig::default()));

        let task = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.spawn(None, PoolState::Standby, SpawnReason::Filling, true)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        let id = backend.pods()[0].id.clone();
        backend.set_phase(&id, PodPhase::Running);

        let pod = task.await.unwrap().unwrap();
        assert_eq!(pod.phase, PodPhase::Running);
        assert!(backend.get_calls() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_ready_timeout_is_not_ready() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_create_phase(PodPhase::Pending);
        let pool = pool_with(
            backend.clone(),
            PoolConfig {
                ready_timeout_secs: 2,
                ..PoolConfig::default()
            },
        );

        let err = pool
            .spawn(None, PoolState::Standby, SpawnReason::Filling, true)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NotReady { .. }));
        // Still a usable standby pod once it starts
        assert_eq!(backend.pods().len(), 1);
        assert_eq!(backend.delete_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_deletes_pod_that_never_starts() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_create_phase(PodPhase::Pending);
        let pool = pool_with(
            backend.clone(),
            PoolConfig {
                ready_timeout_secs: 2,
                ..PoolConfig::default()
            },
        );

        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, PoolError::NotReady { .. }));
        assert_eq!(backend.create_calls(), 1);
        assert!(backend.pods().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_deletes_failed_pod() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_create_phase(PodPhase::Failed);
        let pool = pool_with(backend.clone(), PoolConfig::default());

        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, PoolError::PodFailure { .. }));
        assert!(backend.pods().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_terminal_phase_is_pod_failure() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_create_phase(PodPhase::Failed);
        let pool = pool_with(backend, PoolConfig::default());

        let err = pool
            .spawn(None, PoolState::Standby, SpawnReason::Filling, true)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::PodFailure { .. }));
    }

    #[tokio::test]
    async fn test_acquire_falls_back_to_spawn() {
        let backend = Arc::new(MemoryBackend::new());
        let pool = pool_with(backend.clone(), PoolConfig::default());

        let pod = pool.acquire(None).await.unwrap();
        assert_eq!(backend.create_calls(), 1);
        assert_eq!(pod.pool(), Some(PoolState::Occupied));
        assert_eq!(pod.environment(), Some("base-node"));
        assert_eq!(pod.labels.get(REASON_LABEL).map(String::as_str), Some("demanded"));
    }

    #[tokio::test]
    async fn test_acquire_propagates_spawn_failure() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_fail_creates(true);
        let pool = pool_with(backend, PoolConfig::default());

        assert!(matches!(
            pool.acquire(None).await,
            Err(PoolError::SpawnFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(pod("p1", PodPhase::Running));
        let pool = pool_with(backend.clone(), PoolConfig::default());

        pool.stop("p1").await;
        pool.stop("p1").await;
        assert_eq!(backend.delete_calls(), 2);
        assert!(backend.pod("p1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_loops_until_stopped() {
        let backend = Arc::new(MemoryBackend::new());
        let pool = Arc::new(pool_with(
            backend.clone(),
            PoolConfig {
                standby_size: 1,
                ..PoolConfig::default()
            },
        ));

        assert_eq!(pool.health().await.unwrap(), "memory");
        let scheduler = pool.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.stop().await;
        assert_eq!(backend.create_calls(), 1);
    }
}
