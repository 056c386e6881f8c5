//! Backend capability interface.
//!
//! A backend lists, creates, relabels and deletes pods on a container
//! platform. Two implementations are selected by configuration:
//! - [`local::LocalBackend`] drives docker or podman (development)
//! - [`kubernetes::KubernetesBackend`] talks to a Kubernetes API server (production)
//!
//! [`memory::MemoryBackend`] keeps pods in process and is used by tests.
//!
//! Every backend must implement [`BackendClient::patch_labels`] as a
//! compare-and-swap when expected labels are supplied; the claim protocol
//! depends on it for correctness.

pub mod kubernetes;
pub mod local;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PoolConfig;
use crate::environment::{EnvironmentTemplate, PullPolicy};
use crate::error::PoolResult;
use crate::pod::{LabelSelector, Labels, Pod};

pub use kubernetes::{KubernetesBackend, KubernetesConfig};
pub use local::{LocalBackend, LocalBackendConfig, RuntimeType};
pub use memory::MemoryBackend;

/// Which backend the pool runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local docker/podman runtime.
    #[default]
    Local,
    /// Kubernetes API server.
    Kubernetes,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Per-pod resource requests and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu_request_millis: u32,
    pub cpu_limit_millis: u32,
    pub memory_request_bytes: u64,
    pub memory_limit_bytes: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu_request_millis: 50,
            cpu_limit_millis: 1000,
            memory_request_bytes: 50 * 1024 * 1024,
            // 1.2 GiB
            memory_limit_bytes: 1_288_490_188,
        }
    }
}

impl Resources {
    /// CPU quantity in orchestrator notation, e.g. `50m`.
    pub fn cpu_quantity(millis: u32) -> String {
        format!("{}m", millis)
    }

    /// Fractional CPU count for `--cpus`, e.g. `1.000`.
    pub fn cpus(&self) -> String {
        format!("{:.3}", f64::from(self.cpu_limit_millis) / 1000.0)
    }

    /// Relative CPU weight for `--cpu-shares` derived from the request.
    pub fn cpu_shares(&self) -> u64 {
        (u64::from(self.cpu_request_millis) * 1024 / 1000).max(2)
    }
}

/// Backend-neutral description of a pod to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTemplate {
    /// Name requested for the pod.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub pull_policy: PullPolicy,
    pub resources: Resources,
    /// Initial labels.
    pub labels: Labels,
    /// Port the session server listens on inside the pod.
    pub container_port: u16,
}

impl PodTemplate {
    pub fn from_environment(
        name: impl Into<String>,
        environment: &EnvironmentTemplate,
        resources: Resources,
        labels: Labels,
        container_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            image: environment.image.clone(),
            command: environment.command.clone(),
            env: environment.env.clone(),
            pull_policy: environment.pull_policy,
            resources,
            labels,
            container_port,
        }
    }
}

/// Capability interface to the underlying container platform.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// List pods whose labels match `selector`.
    async fn list_pods(&self, selector: &LabelSelector) -> PoolResult<Vec<Pod>>;

    /// Fetch one pod, failing with `NotFound` if it does not exist.
    async fn get_pod(&self, id: &str) -> PoolResult<Pod>;

    /// Create a pod; rejections surface as `SpawnFailure`.
    async fn create_pod(&self, template: &PodTemplate) -> PoolResult<Pod>;

    /// Merge `labels` into the pod's labels.
    ///
    /// With `expected`, the update only applies if every expected label
    /// currently has the expected value, otherwise it fails with `Conflict`.
    async fn patch_labels(
        &self,
        id: &str,
        labels: &Labels,
        expected: Option<&Labels>,
    ) -> PoolResult<Pod>;

    /// Delete a pod, optionally letting it terminate gracefully.
    async fn delete_pod(&self, id: &str, grace_period_seconds: Option<u32>) -> PoolResult<()>;

    /// Check that the platform is reachable, returning a version string.
    async fn health_check(&self) -> PoolResult<String>;
}

/// Whether `current` carries every label in `expected` with the same value.
pub fn labels_match(current: &Labels, expected: &Labels) -> bool {
    expected.iter().all(|(k, v)| current.get(k) == Some(v))
}

/// Build the backend selected by `config`.
pub fn connect(config: &PoolConfig) -> PoolResult<Arc<dyn BackendClient>> {
    match config.backend {
        BackendKind::Local => Ok(Arc::new(LocalBackend::new(
            &config.local,
            config.container_port,
        ))),
        BackendKind::Kubernetes => Ok(Arc::new(KubernetesBackend::new(
            &config.kubernetes,
            config.container_port,
        )?)),
    }
}
