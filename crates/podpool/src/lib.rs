//! Pool manager for ephemeral session pods.
//!
//! A [`ClusterPool`] keeps a standby pool of pre-warmed pods on a local
//! container runtime or a Kubernetes cluster, hands them out to acquirers
//! at most once, and reaps pods that finished or overstayed their budget.

pub mod backend;
pub mod cache;
pub mod claim;
pub mod config;
pub mod environment;
pub mod error;
pub mod filler;
pub mod pod;
pub mod pool;
pub mod reaper;
pub mod scheduler;
pub mod session;

pub use backend::{BackendClient, BackendKind, MemoryBackend};
pub use config::PoolConfig;
pub use environment::{EnvironmentRegistry, EnvironmentTemplate};
pub use error::{PoolError, PoolResult};
pub use pod::{Pod, PodPhase, PoolState};
pub use pool::{ClusterPool, SpawnReason};
pub use scheduler::PoolScheduler;
pub use session::SessionManager;
