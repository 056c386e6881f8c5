//! Standby pool filling.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::PodSnapshot;
use crate::error::PoolResult;
use crate::pod::PoolState;
use crate::pool::{ClusterPool, SpawnReason};

/// Result of one fill tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FillReport {
    pub desired: usize,
    /// Standby pods counted before spawning.
    pub actual: usize,
    /// Pods successfully requested from the backend.
    pub spawned: Vec<String>,
    pub failed: usize,
}

/// Keeps the standby pool of the default environment at its desired size.
pub struct PoolFiller {
    pool: Arc<ClusterPool>,
    desired: usize,
    environment: String,
}

impl PoolFiller {
    pub fn new(pool: Arc<ClusterPool>) -> Self {
        let desired = pool.config().standby_size;
        let environment = pool.registry().default_id().to_string();
        Self {
            pool,
            desired,
            environment,
        }
    }

    /// Live standby pods of the filled environment in `snapshot`.
    pub fn count_standby(&self, snapshot: &PodSnapshot) -> usize {
        snapshot
            .pods()
            .filter(|pod| {
                pod.pool() == Some(PoolState::Standby)
                    && pod.phase.is_live()
                    && pod.environment() == Some(self.environment.as_str())
            })
            .count()
    }

    /// Spawn the current deficit, without waiting for the pods to run.
    ///
    /// Spawn failures are logged and counted; the next tick retries them.
    pub async fn tick(&self) -> PoolResult<FillReport> {
        let snapshot = self.pool.refresh().await?;
        let actual = self.count_standby(&snapshot);
        let deficit = self.desired.saturating_sub(actual);

        let mut report = FillReport {
            desired: self.desired,
            actual,
            ..FillReport::default()
        };
        if deficit == 0 {
            debug!("standby pool full ({}/{})", actual, self.desired);
            return Ok(report);
        }

        info!(
            "filling {} standby pods ({}/{})",
            deficit, actual, self.desired
        );
        let spawns = (0..deficit).map(|_| {
            self.pool.spawn(
                Some(self.environment.as_str()),
                PoolState::Standby,
                SpawnReason::Filling,
                false,
            )
        });
        for result in join_all(spawns).await {
            match result {
                Ok(pod) => report.spawned.push(pod.id),
                Err(e) => {
                    warn!("failed to spawn standby pod: {}", e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Tick every `interval` until `shutdown` is cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("pool filler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("pool fill failed: {}", e);
                    }
                }
            }
        }
    }
}
