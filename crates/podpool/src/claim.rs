//! Claiming standby pods.
//!
//! A standby pod changes hands in two steps. A conditional patch moves it from
//! `standby` to `claimed` under this manager's id. The pod is then re-read and
//! the claimer checked. Only after that is it patched to `occupied`. If that
//! last patch fails the pod is handed back to the standby pool. The label
//! logic is kept in pure functions so it can be tested without a backend.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::backend::BackendClient;
use crate::error::{PoolError, PoolResult};
use crate::pod::{
    ACQUIRED_AT_LABEL, ACQUIRER_LABEL, CLAIMED_AT_LABEL, CLAIMER_LABEL, ENVIRONMENT_LABEL, LabelSelector, Labels,
    POOL_LABEL, Pod, PodPhase, PoolState, timestamp_label,
};

/// The claim lost against another writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimConflict;

/// Labels that claim a pod currently labeled `current` for `claimer` at `now`.
pub fn try_claim(
    current: &Labels,
    claimer: &str,
    now: DateTime<Utc>,
) -> Result<Labels, ClaimConflict> {
    if current.get(POOL_LABEL).map(String::as_str) != Some(PoolState::Standby.as_str()) {
        return Err(ClaimConflict);
    }

    let mut labels = Labels::new();
    labels.insert(POOL_LABEL.to_string(), PoolState::Claimed.to_string());
    labels.insert(CLAIMER_LABEL.to_string(), claimer.to_string());
    labels.insert(CLAIMED_AT_LABEL.to_string(), timestamp_label(now));
    Ok(labels)
}

/// Precondition for the claim patch.
pub fn standby_precondition() -> Labels {
    let mut labels = Labels::new();
    labels.insert(POOL_LABEL.to_string(), PoolState::Standby.to_string());
    labels
}

/// Precondition for patches made while `claimer` holds the claim.
pub fn claimed_by(claimer: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(POOL_LABEL.to_string(), PoolState::Claimed.to_string());
    labels.insert(CLAIMER_LABEL.to_string(), claimer.to_string());
    labels
}

/// Whether a re-read pod is claimed by `claimer`.
pub fn claim_verified(pod: &Pod, claimer: &str) -> bool {
    pod.pool() == Some(PoolState::Claimed) && pod.claimer() == Some(claimer)
}

/// Labels marking a pod as occupied by `acquirer` since `now`.
pub fn occupy_labels(acquirer: &str, now: DateTime<Utc>) -> Labels {
    let mut labels = Labels::new();
    labels.insert(POOL_LABEL.to_string(), PoolState::Occupied.to_string());
    labels.insert(ACQUIRER_LABEL.to_string(), acquirer.to_string());
    labels.insert(ACQUIRED_AT_LABEL.to_string(), timestamp_label(now));
    labels
}

/// Standby candidates in the order they should be tried.
///
/// Running pods come before pending ones, and older pods before newer ones,
/// so concurrent acquirers converge on the same order.
pub fn order_candidates(pods: impl IntoIterator<Item = Pod>) -> Vec<Pod> {
    let rank = |phase: PodPhase| match phase {
        PodPhase::Running => 0,
        _ => 1,
    };

    let mut candidates: Vec<Pod> = pods
        .into_iter()
        .filter(|pod| pod.pool() == Some(PoolState::Standby) && pod.phase.is_live())
        .collect();
    candidates.sort_by(|a, b| {
        rank(a.phase)
            .cmp(&rank(b.phase))
            .then_with(|| match (a.created_at, b.created_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates
}

/// Outcome of one claim attempt on one candidate.
enum Attempt {
    Acquired(Pod),
    Lost,
}

/// Bounded claim loop against a backend.
#[derive(Debug, Clone, Copy)]
pub struct ClaimProtocol {
    max_attempts: u32,
}

impl ClaimProtocol {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Claim and occupy a standby pod of `environment` for `manager_id`.
    ///
    /// Returns `None` when no standby pod is available or every attempt lost
    /// its race; the caller should spawn a pod instead.
    pub async fn claim(
        &self,
        backend: &dyn BackendClient,
        manager_id: &str,
        environment: &str,
    ) -> PoolResult<Option<Pod>> {
        let selector = LabelSelector::sessions()
            .equals(POOL_LABEL, PoolState::Standby.as_str())
            .equals(ENVIRONMENT_LABEL, environment);

        for attempt in 1..=self.max_attempts {
            let candidates = order_candidates(backend.list_pods(&selector).await?);
            let Some(candidate) = candidates.into_iter().next() else {
                debug!("no standby pods for environment {}", environment);
                return Ok(None);
            };

            match self.attempt(backend, manager_id, &candidate).await? {
                Attempt::Acquired(pod) => return Ok(Some(pod)),
                Attempt::Lost => {
                    debug!(
                        "lost claim on pod {} (attempt {}/{})",
                        candidate.id, attempt, self.max_attempts
                    );
                }
            }
        }

        info!(
            "giving up claiming after {} attempts; spawning instead",
            self.max_attempts
        );
        Ok(None)
    }

    async fn attempt(
        &self,
        backend: &dyn BackendClient,
        manager_id: &str,
        candidate: &Pod,
    ) -> PoolResult<Attempt> {
        let Ok(claim) = try_claim(&candidate.labels, manager_id, Utc::now()) else {
            return Ok(Attempt::Lost);
        };

        info!("claiming pod {}", candidate.id);
        match backend
            .patch_labels(&candidate.id, &claim, Some(&standby_precondition()))
            .await
        {
            Ok(_) => {}
            // Someone else claimed it, or it vanished between list and patch
            Err(PoolError::Conflict { .. }) | Err(PoolError::NotFound(_)) => {
                return Ok(Attempt::Lost);
            }
            Err(e) => return Err(e),
        }

        let current = match backend.get_pod(&candidate.id).await {
            Ok(pod) => pod,
            Err(PoolError::NotFound(_)) => return Ok(Attempt::Lost),
            Err(e) => return Err(e),
        };
        if !claim_verified(&current, manager_id) {
            return Ok(Attempt::Lost);
        }

        // Conflicts if the reaper expired the claim in the meantime
        match backend
            .patch_labels(
                &candidate.id,
                &occupy_labels(manager_id, Utc::now()),
                Some(&claimed_by(manager_id)),
            )
            .await
        {
            Ok(pod) => {
                info!("acquired pod {}", pod.id);
                Ok(Attempt::Acquired(pod))
            }
            Err(PoolError::Conflict { .. }) | Err(PoolError::NotFound(_)) => Ok(Attempt::Lost),
            Err(e) => {
                release(backend, manager_id, &candidate.id).await;
                Err(e)
            }
        }
    }
}

/// Hand a claimed pod back to the standby pool, deleting it if that fails.
///
/// Best effort: a pod left claimed is deleted by the reaper once its claim
/// times out.
async fn release(backend: &dyn BackendClient, manager_id: &str, id: &str) {
    let mut standby = Labels::new();
    standby.insert(POOL_LABEL.to_string(), PoolState::Standby.to_string());

    match backend
        .patch_labels(id, &standby, Some(&claimed_by(manager_id)))
        .await
    {
        Ok(_) => info!("released pod {} back to standby", id),
        Err(PoolError::Conflict { .. }) | Err(PoolError::NotFound(_)) => {
            debug!("pod {} changed hands before release", id)
        }
        Err(e) => {
            warn!("failed to release pod {}: {}; deleting it", id, e);
            if let Err(e) = backend.delete_pod(id, Some(0)).await
                && !e.is_not_found()
            {
                warn!("failed to delete claimed pod {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;

    use crate::backend::MemoryBackend;
    use crate::pod::{PodAddress, SESSION_TYPE, TYPE_LABEL};

    fn standby_pod(id: &str, phase: PodPhase, created: i64) -> Pod {
        let mut labels = Labels::new();
        labels.insert(TYPE_LABEL.into(), SESSION_TYPE.into());
        labels.insert(POOL_LABEL.into(), "standby".into());
        labels.insert(ENVIRONMENT_LABEL.into(), "base-node".into());
        let address = (phase == PodPhase::Running).then(|| PodAddress::new("10.0.0.1", 2000));
        Pod::new(
            id,
            phase,
            address,
            labels,
            Utc.timestamp_opt(created, 0).single(),
        )
    }

    #[test]
    fn test_try_claim_requires_standby() {
        let pod = standby_pod("p1", PodPhase::Running, 0);
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let claim = try_claim(&pod.labels, "pool-a", now).unwrap();
        assert_eq!(claim.get(POOL_LABEL).map(String::as_str), Some("claimed"));
        assert_eq!(claim.get(CLAIMER_LABEL).map(String::as_str), Some("pool-a"));
        assert_eq!(
            claim.get(CLAIMED_AT_LABEL).map(String::as_str),
            Some("1700000000")
        );

        let mut claimed = pod.labels.clone();
        claimed.extend(claim);
        assert_eq!(try_claim(&claimed, "pool-b", now), Err(ClaimConflict));
        assert_eq!(try_claim(&Labels::new(), "pool-b", now), Err(ClaimConflict));
    }

    #[test]
    fn test_claim_verified_checks_claimer() {
        let mut pod = standby_pod("p1", PodPhase::Running, 0);
        pod.labels.insert(POOL_LABEL.into(), "claimed".into());
        pod.labels.insert(CLAIMER_LABEL.into(), "pool-a".into());
        assert!(claim_verified(&pod, "pool-a"));
        assert!(!claim_verified(&pod, "pool-b"));

        pod.labels.insert(POOL_LABEL.into(), "occupied".into());
        assert!(!claim_verified(&pod, "pool-a"));
    }

    #[test]
    fn test_occupy_labels() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let labels = occupy_labels("pool-a", now);
        assert_eq!(labels.get(POOL_LABEL).map(String::as_str), Some("occupied"));
        assert_eq!(labels.get(ACQUIRER_LABEL).map(String::as_str), Some("pool-a"));
        assert_eq!(
            labels.get(ACQUIRED_AT_LABEL).map(String::as_str),
            Some("1700000000")
        );
    }

    #[test]
    fn test_order_prefers_running_then_oldest() {
        let mut failed = standby_pod("failed", PodPhase::Failed, 0);
        failed.labels.insert(POOL_LABEL.into(), "standby".into());
        let mut occupied = standby_pod("occupied", PodPhase::Running, 0);
        occupied.labels.insert(POOL_LABEL.into(), "occupied".into());

        let ordered = order_candidates(vec![
            standby_pod("pending-old", PodPhase::Pending, 1),
            standby_pod("running-new", PodPhase::Running, 30),
            standby_pod("running-old", PodPhase::Running, 10),
            failed,
            occupied,
        ]);
        let ids: Vec<&str> = ordered.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["running-old", "running-new", "pending-old"]);
    }

    #[tokio::test]
    async fn test_claim_occupies_best_candidate() {
        let backend = MemoryBackend::new();
        backend.insert(standby_pod("pending", PodPhase::Pending, 1));
        backend.insert(standby_pod("running", PodPhase::Running, 5));

        let pod = ClaimProtocol::new(3)
            .claim(&backend, "pool-a", "base-node")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pod.id, "running");
        assert_eq!(pod.pool(), Some(PoolState::Occupied));
        assert_eq!(pod.acquirer(), Some("pool-a"));
        assert_eq!(pod.claimer(), Some("pool-a"));
        assert!(pod.acquired_at().is_some());
    }

    #[tokio::test]
    async fn test_claim_ignores_other_environments() {
        let backend = MemoryBackend::new();
        backend.insert(standby_pod("p1", PodPhase::Running, 1));

        let claimed = ClaimProtocol::new(3)
            .claim(&backend, "pool-a", "alpine")
            .await
            .unwrap();
        assert!(claimed.is_none());
        assert_eq!(backend.patch_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_occupy_returns_pod_to_standby() {
        let backend = MemoryBackend::new();
        backend.insert(standby_pod("warm", PodPhase::Running, 1));
        // 1: claim, 2: occupy
        backend.fail_patch_call(2);

        let protocol = ClaimProtocol::new(3);
        let err = protocol
            .claim(&backend, "pool-a", "base-node")
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::BackendUnavailable(_)));
        assert_eq!(backend.pod("warm").unwrap().pool(), Some(PoolState::Standby));

        let pod = protocol
            .claim(&backend, "pool-b", "base-node")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pod.id, "warm");
        assert_eq!(pod.acquirer(), Some("pool-b"));
    }

    #[tokio::test]
    async fn test_unreleasable_claim_deletes_pod() {
        let backend = MemoryBackend::new();
        backend.insert(standby_pod("warm", PodPhase::Running, 1));
        backend.fail_patch_call(2);
        backend.fail_patch_call(3);

        let result = ClaimProtocol::new(3)
            .claim(&backend, "pool-a", "base-node")
            .await;
        assert!(result.is_err());
        assert!(backend.pod("warm").is_none());
        assert_eq!(backend.delete_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_share_a_pod() {
        let backend = Arc::new(MemoryBackend::new());
        for i in 0..3 {
            backend.insert(standby_pod(&format!("p{}", i), PodPhase::Running, i));
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                ClaimProtocol::new(10)
                    .claim(backend.as_ref(), &format!("pool-{}", i), "base-node")
                    .await
                    .unwrap()
                    .map(|pod| pod.id)
            }));
        }

        let mut won: Vec<String> = Vec::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                won.push(id);
            }
        }
        won.sort();
        assert_eq!(won, vec!["p0", "p1", "p2"]);
    }
}
