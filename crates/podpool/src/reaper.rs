//! Reaping finished and overdue pods.
//!
//! Pods whose process has exited are deleted right away. Pods occupied for
//! longer than the time limit, or claimed and never occupied, are first
//! relabeled `deleting` and then deleted with a grace period. A `deleting`
//! pod whose delete failed is deleted again on later ticks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{PoolError, PoolResult};
use crate::pod::{CLAIMER_LABEL, Labels, POOL_LABEL, Pod, PoolState};
use crate::pool::ClusterPool;

/// What the reaper does with a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapAction {
    Keep,
    /// The process exited; delete without grace.
    Delete,
    /// Held past its limit; mark `deleting`, then delete with grace.
    Expire,
    /// Already marked `deleting`; delete with grace again.
    Finish,
}

/// How long a pod may hold each ownership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapLimits {
    pub occupied: Duration,
    pub claimed: Duration,
}

fn held_longer_than(since: Option<DateTime<Utc>>, now: DateTime<Utc>, limit: Duration) -> bool {
    // Negative when the clock is behind the label; never overdue then
    since.is_some_and(|since| {
        now.signed_duration_since(since)
            .to_std()
            .is_ok_and(|held| held > limit)
    })
}

/// Decide what to do with `pod` at `now`.
///
/// Occupied and claimed pods missing their timestamp label are timed from
/// their creation.
pub fn decide(pod: &Pod, now: DateTime<Utc>, limits: ReapLimits) -> ReapAction {
    if pod.phase.is_terminal() {
        return ReapAction::Delete;
    }
    match pod.pool() {
        Some(PoolState::Deleting) => ReapAction::Finish,
        Some(PoolState::Occupied)
            if held_longer_than(pod.acquired_at().or(pod.created_at), now, limits.occupied) =>
        {
            ReapAction::Expire
        }
        Some(PoolState::Claimed)
            if held_longer_than(pod.claimed_at().or(pod.created_at), now, limits.claimed) =>
        {
            ReapAction::Expire
        }
        _ => ReapAction::Keep,
    }
}

/// Result of one reap tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Pods deleted because they had exited.
    pub deleted: Vec<String>,
    /// Pods deleted because they went over a time limit.
    pub expired: Vec<String>,
    pub failed: usize,
}

/// Deletes terminated and overdue pods.
pub struct Reaper {
    pool: Arc<ClusterPool>,
    limits: ReapLimits,
    grace_period_secs: u32,
}

impl Reaper {
    pub fn new(pool: Arc<ClusterPool>) -> Self {
        let limits = ReapLimits {
            occupied: pool.config().occupied_time_limit(),
            claimed: pool.config().claim_timeout(),
        };
        let grace_period_secs = pool.config().delete_grace_period_secs;
        Self {
            pool,
            limits,
            grace_period_secs,
        }
    }

    /// Reap every pod that needs it. Errors on one pod do not stop the others.
    pub async fn tick(&self) -> PoolResult<ReapReport> {
        let snapshot = self.pool.refresh().await?;
        let now = Utc::now();
        let mut report = ReapReport::default();

        for pod in snapshot.pods() {
            let result = match decide(pod, now, self.limits) {
                ReapAction::Keep => continue,
                ReapAction::Delete => self.delete(pod).await.map(|deleted| {
                    if deleted {
                        report.deleted.push(pod.id.clone());
                    }
                }),
                ReapAction::Expire => self.expire(pod).await.map(|expired| {
                    if expired {
                        report.expired.push(pod.id.clone());
                    }
                }),
                ReapAction::Finish => self.finish(pod).await.map(|()| {
                    report.expired.push(pod.id.clone());
                }),
            };
            if let Err(e) = result {
                warn!("failed to reap pod {}: {}", pod.id, e);
                report.failed += 1;
            }
        }

        if !report.deleted.is_empty() || !report.expired.is_empty() {
            info!(
                "deleted_pods: {} terminated, {} over time limit",
                report.deleted.len(),
                report.expired.len()
            );
        }
        Ok(report)
    }

    /// Delete an exited pod. Returns false if it was already gone.
    async fn delete(&self, pod: &Pod) -> PoolResult<bool> {
        match self.pool.backend().delete_pod(&pod.id, Some(0)).await {
            Ok(()) => {
                info!("deleted pod {} ({})", pod.id, pod.phase);
                Ok(true)
            }
            Err(PoolError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Mark an overdue pod `deleting` and delete it. Returns false if another
    /// writer changed it first.
    async fn expire(&self, pod: &Pod) -> PoolResult<bool> {
        let Some(state) = pod.pool() else {
            return Ok(false);
        };
        let mut deleting = Labels::new();
        deleting.insert(POOL_LABEL.to_string(), PoolState::Deleting.to_string());
        let mut expected = Labels::new();
        expected.insert(POOL_LABEL.to_string(), state.to_string());
        if let Some(claimer) = pod.claimer()
            && state == PoolState::Claimed
        {
            expected.insert(CLAIMER_LABEL.to_string(), claimer.to_string());
        }

        match self
            .pool
            .backend()
            .patch_labels(&pod.id, &deleting, Some(&expected))
            .await
        {
            Ok(_) => {}
            Err(PoolError::Conflict { .. }) | Err(PoolError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }

        if state == PoolState::Claimed {
            info!("claim on pod {} was never completed", pod.id);
        }
        self.finish(pod).await?;
        Ok(true)
    }

    /// Gracefully delete a pod labeled `deleting`; a missing pod is done.
    async fn finish(&self, pod: &Pod) -> PoolResult<()> {
        match self
            .pool
            .backend()
            .delete_pod(&pod.id, Some(self.grace_period_secs))
            .await
        {
            Ok(()) | Err(PoolError::NotFound(_)) => {
                info!("deleted pod {} (went over time limit)", pod.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Tick every `interval` until `shutdown` is cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("reap failed: {}", e);
                    }
                }
            }
        }
    }
}
