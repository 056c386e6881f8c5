//! Test utilities and common setup.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use podpool::pod::{
    ACQUIRED_AT_LABEL, ACQUIRER_LABEL, ENVIRONMENT_LABEL, Labels, POOL_LABEL, PodAddress,
    SESSION_TYPE, TYPE_LABEL, timestamp_label,
};
use podpool::{ClusterPool, MemoryBackend, Pod, PodPhase, PoolConfig};

/// Create a pool on a fresh in-memory backend.
pub fn test_pool(config: PoolConfig) -> (Arc<MemoryBackend>, Arc<ClusterPool>) {
    let backend = Arc::new(MemoryBackend::new());
    let pool = test_pool_on(backend.clone(), config);
    (backend, pool)
}

/// Create another manager instance sharing `backend`.
pub fn test_pool_on(backend: Arc<MemoryBackend>, config: PoolConfig) -> Arc<ClusterPool> {
    Arc::new(ClusterPool::new(backend, config).unwrap())
}

/// A managed pod of the default environment in pool state `pool`.
pub fn session_pod(id: &str, phase: PodPhase, pool: &str) -> Pod {
    let mut labels = Labels::new();
    labels.insert(TYPE_LABEL.into(), SESSION_TYPE.into());
    labels.insert(POOL_LABEL.into(), pool.into());
    labels.insert(ENVIRONMENT_LABEL.into(), "base-node".into());
    let address = (phase == PodPhase::Running).then(|| PodAddress::new("10.0.0.7", 2000));
    Pod::new(id, phase, address, labels, Some(Utc::now()))
}

/// A running pod occupied since `since`.
pub fn occupied_pod(id: &str, since: DateTime<Utc>) -> Pod {
    let mut pod = session_pod(id, PodPhase::Running, "occupied");
    pod.labels.insert(ACQUIRER_LABEL.into(), "pool-other".into());
    pod.labels
        .insert(ACQUIRED_AT_LABEL.into(), timestamp_label(since));
    pod
}
