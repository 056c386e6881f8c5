//! In-process backend.
//!
//! Keeps pods in a map and honors the same compare-and-swap contract as the
//! real backends. Counts calls per operation so tests can assert on backend
//! traffic.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{BackendClient, PodTemplate, labels_match};
use crate::error::{PoolError, PoolResult};
use crate::pod::{LabelSelector, Labels, Pod, PodAddress, PodPhase};

/// Backend keeping pods in memory.
#[derive(Debug)]
pub struct MemoryBackend {
    pods: Mutex<BTreeMap<String, Pod>>,
    /// Phase newly created pods start in.
    create_phase: Mutex<PodPhase>,
    list_delay: Mutex<Option<Duration>>,
    fail_creates: AtomicBool,
    /// 1-based patch call numbers that fail with `BackendUnavailable`.
    failing_patches: Mutex<BTreeSet<usize>>,
    /// Remaining delete failures per pod id.
    failing_deletes: Mutex<BTreeMap<String, usize>>,
    /// Every delete request with its grace period.
    delete_log: Mutex<Vec<(String, Option<u32>)>>,
    next_ip: AtomicUsize,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    create_calls: AtomicUsize,
    patch_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(BTreeMap::new()),
            create_phase: Mutex::new(PodPhase::Running),
            list_delay: Mutex::new(None),
            fail_creates: AtomicBool::new(false),
            failing_patches: Mutex::new(BTreeSet::new()),
            failing_deletes: Mutex::new(BTreeMap::new()),
            delete_log: Mutex::new(Vec::new()),
            next_ip: AtomicUsize::new(1),
            list_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            patch_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    /// Make newly created pods start in `phase`.
    pub fn set_create_phase(&self, phase: PodPhase) {
        *lock(&self.create_phase) = phase;
    }

    /// Delay every list call, to widen race windows.
    pub fn set_list_delay(&self, delay: Option<Duration>) {
        *lock(&self.list_delay) = delay;
    }

    /// Make create calls fail with `SpawnFailure`.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make the `call`-th patch (counting from 1) fail with `BackendUnavailable`.
    pub fn fail_patch_call(&self, call: usize) {
        lock(&self.failing_patches).insert(call);
    }

    /// Make the next `times` deletes of `id` fail with `BackendUnavailable`.
    pub fn fail_deletes(&self, id: &str, times: usize) {
        lock(&self.failing_deletes).insert(id.to_string(), times);
    }

    /// Insert or replace a pod as is.
    pub fn insert(&self, pod: Pod) {
        lock(&self.pods).insert(pod.id.clone(), pod);
    }

    /// Move a pod to `phase`, assigning an address when it starts running.
    pub fn set_phase(&self, id: &str, phase: PodPhase) {
        let address = (phase == PodPhase::Running).then(|| self.next_address());
        if let Some(pod) = lock(&self.pods).get_mut(id) {
            let updated = Pod::new(
                pod.id.clone(),
                phase,
                address,
                pod.labels.clone(),
                pod.created_at,
            );
            *pod = updated;
        }
    }

    /// Overwrite labels without any precondition.
    pub fn set_labels(&self, id: &str, labels: Labels) {
        if let Some(pod) = lock(&self.pods).get_mut(id) {
            pod.labels.extend(labels);
        }
    }

    pub fn pod(&self, id: &str) -> Option<Pod> {
        lock(&self.pods).get(id).cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        lock(&self.pods).values().cloned().collect()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn patch_calls(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Delete requests so far, as `(pod id, grace period)`.
    pub fn delete_log(&self) -> Vec<(String, Option<u32>)> {
        lock(&self.delete_log).clone()
    }

    fn next_address(&self) -> PodAddress {
        let n = self.next_ip.fetch_add(1, Ordering::SeqCst);
        PodAddress::new(format!("10.0.{}.{}", n / 250, n % 250 + 1), 2000)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave the map half-updated
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BackendClient for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list_pods(&self, selector: &LabelSelector) -> PoolResult<Vec<Pod>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.list_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(lock(&self.pods)
            .values()
            .filter(|pod| selector.matches(&pod.labels))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, id: &str) -> PoolResult<Pod> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.pod(id)
            .ok_or_else(|| PoolError::NotFound(id.to_string()))
    }

    async fn create_pod(&self, template: &PodTemplate) -> PoolResult<Pod> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(PoolError::SpawnFailure("creates disabled".to_string()));
        }

        let phase = *lock(&self.create_phase);
        let address = (phase == PodPhase::Running).then(|| self.next_address());
        let pod = Pod::new(
            template.name.clone(),
            phase,
            address,
            template.labels.clone(),
            Some(Utc::now()),
        );

        let mut pods = lock(&self.pods);
        if pods.contains_key(&pod.id) {
            return Err(PoolError::SpawnFailure(format!(
                "pod {} already exists",
                pod.id
            )));
        }
        pods.insert(pod.id.clone(), pod.clone());
        Ok(pod)
    }

    async fn patch_labels(
        &self,
        id: &str,
        labels: &Labels,
        expected: Option<&Labels>,
    ) -> PoolResult<Pod> {
        let call = self.patch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if lock(&self.failing_patches).remove(&call) {
            return Err(PoolError::BackendUnavailable(format!(
                "patch {} of pod {} dropped",
                call, id
            )));
        }
        let mut pods = lock(&self.pods);
        let pod = pods
            .get_mut(id)
            .ok_or_else(|| PoolError::NotFound(id.to_string()))?;

        if let Some(expected) = expected
            && !labels_match(&pod.labels, expected)
        {
            return Err(PoolError::Conflict {
                pod_id: id.to_string(),
            });
        }

        pod.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(pod.clone())
    }

    async fn delete_pod(&self, id: &str, grace_period_seconds: Option<u32>) -> PoolResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.delete_log).push((id.to_string(), grace_period_seconds));
        if let Some(remaining) = lock(&self.failing_deletes).get_mut(id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(PoolError::BackendUnavailable(format!(
                "delete of pod {} dropped",
                id
            )));
        }
        lock(&self.pods)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| PoolError::NotFound(id.to_string()))
    }

    async fn health_check(&self) -> PoolResult<String> {
        Ok("memory".to_string())
    }
}
