//! Short-lived cache of the pod listing.
//!
//! The snapshot is rebuilt wholesale and swapped in behind an `Arc`, so
//! readers always see a complete listing. Concurrent refreshes are
//! single-flighted: callers that arrive while a fetch is running wait for it
//! and share its result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::backend::BackendClient;
use crate::error::PoolResult;
use crate::pod::{LabelSelector, Pod, PodPhase};

/// Immutable pod listing taken at one point in time.
#[derive(Debug)]
pub struct PodSnapshot {
    pods: HashMap<String, Pod>,
    fetched_at: Instant,
}

impl PodSnapshot {
    /// Build a snapshot, numbering pending pods by creation time.
    pub fn new(pods: Vec<Pod>, fetched_at: Instant) -> Self {
        let mut pending: Vec<&Pod> = pods
            .iter()
            .filter(|pod| pod.phase == PodPhase::Pending)
            .collect();
        // Pods without a creation time queue last
        pending.sort_by(|a, b| {
            (a.created_at.is_none(), a.created_at, &a.id).cmp(&(
                b.created_at.is_none(),
                b.created_at,
                &b.id,
            ))
        });
        let positions: HashMap<String, usize> = pending
            .into_iter()
            .enumerate()
            .map(|(position, pod)| (pod.id.clone(), position))
            .collect();

        let pods = pods
            .into_iter()
            .map(|mut pod| {
                pod.pending_position = positions.get(&pod.id).copied();
                (pod.id.clone(), pod)
            })
            .collect();

        Self { pods, fetched_at }
    }

    pub fn get(&self, id: &str) -> Option<&Pod> {
        self.pods.get(id)
    }

    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    /// Pods sorted by id, for stable output.
    pub fn sorted(&self) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self.pods.values().cloned().collect();
        pods.sort_by(|a, b| a.id.cmp(&b.id));
        pods
    }
}

/// Cache of every pod the pool manages.
pub struct PodStateCache {
    backend: Arc<dyn BackendClient>,
    selector: LabelSelector,
    ttl: Duration,
    current: RwLock<Option<Arc<PodSnapshot>>>,
    refresh_lock: Mutex<()>,
}

impl PodStateCache {
    pub fn new(backend: Arc<dyn BackendClient>, ttl: Duration) -> Self {
        Self {
            backend,
            selector: LabelSelector::sessions(),
            ttl,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The current snapshot if it is younger than the TTL.
    async fn fresh(&self) -> Option<Arc<PodSnapshot>> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|snapshot| snapshot.fetched_at.elapsed() < self.ttl)
            .cloned()
    }

    /// Cached listing, fetched from the backend when expired.
    pub async fn list(&self) -> PoolResult<Arc<PodSnapshot>> {
        if let Some(snapshot) = self.fresh().await {
            return Ok(snapshot);
        }

        let _guard = self.refresh_lock.lock().await;
        // Whoever held the lock before us may have refreshed already
        if let Some(snapshot) = self.fresh().await {
            return Ok(snapshot);
        }
        self.fetch().await
    }

    /// Listing fetched after this call started, bypassing the TTL.
    ///
    /// A fetch that completes while this call waits for the refresh lock
    /// satisfies it.
    pub async fn refresh(&self) -> PoolResult<Arc<PodSnapshot>> {
        let requested_at = Instant::now();
        let _guard = self.refresh_lock.lock().await;

        let latest = self.current.read().await.clone();
        if let Some(snapshot) = latest
            && snapshot.fetched_at > requested_at
        {
            return Ok(snapshot);
        }
        self.fetch().await
    }

    async fn fetch(&self) -> PoolResult<Arc<PodSnapshot>> {
        let pods = self.backend.list_pods(&self.selector).await?;
        let snapshot = Arc::new(PodSnapshot::new(pods, Instant::now()));
        debug!("refreshed pod cache: {} pods", snapshot.len());
        *self.current.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Look up one pod, asking the backend directly when the snapshot lacks it.
    pub async fn get(&self, id: &str) -> PoolResult<Pod> {
        let snapshot = self.list().await?;
        if let Some(pod) = snapshot.get(id) {
            return Ok(pod.clone());
        }
        self.backend.get_pod(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::pod::{Labels, SESSION_TYPE, TYPE_LABEL};
    use chrono::TimeZone;

    fn session_labels() -> Labels {
        let mut labels = Labels::new();
        labels.insert(TYPE_LABEL.into(), SESSION_TYPE.into());
        labels
    }

    fn pending(id: &str, created_secs: Option<i64>) -> Pod {
        Pod::new(
            id,
            PodPhase::Pending,
            None,
            session_labels(),
            created_secs.and_then(|s| chrono::Utc.timestamp_opt(s, 0).single()),
        )
    }

    fn setup() -> (Arc<MemoryBackend>, PodStateCache) {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert(pending("p1", Some(100)));
        let cache = PodStateCache::new(backend.clone(), Duration::from_secs(10));
        (backend, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_within_ttl_is_cached() {
        let (backend, cache) = setup();

        let first = cache.list().await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let second = cache.list().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_refresh_is_single_flight() {
        let (backend, cache) = setup();
        let cache = Arc::new(cache);
        cache.list().await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        backend.set_list_delay(Some(Duration::from_millis(50)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.list().await.unwrap() }));
        }
        let snapshots: Vec<Arc<PodSnapshot>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(backend.list_calls(), 2);
        assert!(snapshots.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_falls_back_to_backend() {
        let (backend, cache) = setup();
        cache.list().await.unwrap();

        backend.insert(pending("p2", Some(200)));
        let pod = cache.get("p2").await.unwrap();
        assert_eq!(pod.id, "p2");
        assert_eq!(backend.get_calls(), 1);
        assert_eq!(backend.list_calls(), 1);

        assert!(cache.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_bypasses_ttl() {
        let (backend, cache) = setup();
        cache.list().await.unwrap();
        cache.refresh().await.unwrap();
        assert_eq!(backend.list_calls(), 2);

        // The forced fetch restarts the TTL window
        cache.list().await.unwrap();
        assert_eq!(backend.list_calls(), 2);
    }

    #[test]
    fn test_pending_positions_follow_creation_order() {
        let running = Pod::new(
            "r",
            PodPhase::Running,
            Some(crate::pod::PodAddress::new("10.0.0.1", 2000)),
            session_labels(),
            None,
        );
        let snapshot = PodSnapshot::new(
            vec![
                pending("late", Some(300)),
                pending("early", Some(100)),
                pending("unknown", None),
                running,
            ],
            Instant::now(),
        );

        assert_eq!(snapshot.get("early").unwrap().pending_position, Some(0));
        assert_eq!(snapshot.get("late").unwrap().pending_position, Some(1));
        assert_eq!(snapshot.get("unknown").unwrap().pending_position, Some(2));
        assert_eq!(snapshot.get("r").unwrap().pending_position, None);
    }
}
