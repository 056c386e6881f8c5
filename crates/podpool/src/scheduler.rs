//! Background loops of a running pool.

use std::sync::Arc;

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::filler::PoolFiller;
use crate::pool::ClusterPool;
use crate::reaper::Reaper;

/// Owns the filler and reaper tasks of one pool.
pub struct PoolScheduler {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolScheduler {
    /// Spawn the filler and reaper loops on the current runtime.
    pub fn start(pool: Arc<ClusterPool>) -> Self {
        let shutdown = CancellationToken::new();
        let config = pool.config();
        info!(
            "starting pool loops (fill every {:?}, reap every {:?})",
            config.fill_interval(),
            config.reap_interval()
        );

        let filler = PoolFiller::new(pool.clone());
        let reaper = Reaper::new(pool.clone());
        let tasks = vec![
            tokio::spawn(filler.run(config.fill_interval(), shutdown.clone())),
            tokio::spawn(reaper.run(config.reap_interval(), shutdown.clone())),
        ];

        Self { shutdown, tasks }
    }

    /// Token cancelled when the scheduler stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Cancel the loops and wait for them to finish their current tick.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("pool loop ended abnormally: {}", e);
            }
        }
        info!("pool loops stopped");
    }
}
