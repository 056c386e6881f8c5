//! Local container runtime backend.
//!
//! Drives docker or podman through their CLI. The runtime is auto-detected or
//! can be configured explicitly.
//!
//! Container labels are immutable after creation, so labels patched later are
//! kept in an in-process overlay merged over the creation labels. Patches are
//! serialized per container and read back before they are reported as applied.

use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{BackendClient, PodTemplate, labels_match};
use crate::environment::{PullPolicy, validate_image_name};
use crate::error::{PoolError, PoolResult};
use crate::pod::{LabelSelector, Labels, Pod, PodAddress, PodPhase, SESSION_TYPE, TYPE_LABEL};

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Local backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBackendConfig {
    /// Container runtime type (auto-detected if not set).
    pub runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary.
    pub binary: Option<String>,
    /// Host address session ports are published on.
    pub host_ip: String,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            host_ip: "127.0.0.1".to_string(),
        }
    }
}

/// Validate a container ID or name before passing it to the CLI.
fn validate_container_id(id: &str) -> PoolResult<()> {
    if id.is_empty() {
        return Err(PoolError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(PoolError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(PoolError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Whether CLI stderr says the container does not exist.
fn is_missing_container(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container")
        || stderr.contains("no such object")
        || stderr.contains("no container with name or id")
}

/// Pods backed by docker or podman containers.
#[derive(Debug)]
pub struct LocalBackend {
    runtime_type: RuntimeType,
    binary: String,
    host_ip: String,
    container_port: u16,
    /// Labels patched after creation, keyed by container id.
    overlay: DashMap<String, Labels>,
    /// Serializes label patches per container.
    patch_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalBackend {
    /// Create a backend, auto-detecting the runtime unless configured.
    ///
    /// Podman is preferred when both are installed, except on macOS.
    pub fn new(config: &LocalBackendConfig, container_port: u16) -> Self {
        let runtime_type = config.runtime.unwrap_or_else(Self::detect_runtime);
        let binary = config
            .binary
            .clone()
            .unwrap_or_else(|| runtime_type.default_binary().to_string());

        Self {
            runtime_type,
            binary,
            host_ip: config.host_ip.clone(),
            container_port,
            overlay: DashMap::new(),
            patch_locks: DashMap::new(),
        }
    }

    fn detect_runtime() -> RuntimeType {
        #[cfg(target_os = "macos")]
        {
            if Self::is_binary_available("docker") {
                return RuntimeType::Docker;
            }
        }

        if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else {
            // Fall back to podman, will fail at runtime
            RuntimeType::Podman
        }
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Run the runtime binary. Only a failure to execute it is an error here.
    async fn exec(&self, args: &[String]) -> PoolResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                PoolError::BackendUnavailable(format!("failed to run {}: {}", self.binary, e))
            })
    }

    fn command_failed(&self, command: &str, output: &Output) -> String {
        format!(
            "{} {} failed: {}",
            self.binary,
            command,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }

    /// Arguments for `run` that create and start a container from `template`.
    fn run_args(&self, template: &PodTemplate) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".into(), "-d".into()];

        args.push("--name".into());
        args.push(template.name.clone());

        for (key, value) in &template.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }

        // Let the runtime pick a free host port on the configured address
        args.push("-p".into());
        args.push(format!("{}::{}", self.host_ip, template.container_port));

        for (key, value) in &template.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        args.push("--cpus".into());
        args.push(template.resources.cpus());
        args.push("--cpu-shares".into());
        args.push(template.resources.cpu_shares().to_string());
        args.push("--memory".into());
        args.push(template.resources.memory_limit_bytes.to_string());

        args.push("--pull".into());
        args.push(
            match template.pull_policy {
                PullPolicy::Always => "always",
                PullPolicy::IfNotPresent => "missing",
                PullPolicy::Never => "never",
            }
            .into(),
        );

        args.push(template.image.clone());
        args.extend(template.command.iter().cloned());
        args
    }

    /// Inspect containers; ids that no longer exist are skipped.
    async fn inspect(&self, ids: &[String]) -> PoolResult<Vec<Pod>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args: Vec<String> = vec!["inspect".into(), "--type".into(), "container".into()];
        args.extend(ids.iter().cloned());
        let output = self.exec(&args).await?;

        // With several ids, inspect exits non-zero if any is missing but still
        // prints the ones it found.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && !is_missing_container(&stderr) {
            return Err(PoolError::BackendUnavailable(
                self.command_failed("inspect", &output),
            ));
        }

        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let inspected: Vec<InspectedContainer> =
            serde_json::from_str(trimmed).map_err(|e| PoolError::ParseError(e.to_string()))?;

        Ok(inspected
            .into_iter()
            .map(|container| {
                let mut pod = container.into_pod(&self.host_ip, self.container_port);
                if let Some(patched) = self.overlay.get(&pod.id) {
                    pod.labels
                        .extend(patched.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                pod
            })
            .collect())
    }

    /// Resolve a possibly abbreviated id or name to the full container id.
    async fn resolve_id(&self, id: &str) -> PoolResult<Pod> {
        validate_container_id(id)?;
        self.inspect(&[id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PoolError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl BackendClient for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn list_pods(&self, selector: &LabelSelector) -> PoolResult<Vec<Pod>> {
        let args: Vec<String> = vec![
            "ps".into(),
            "-a".into(),
            "-q".into(),
            "--no-trunc".into(),
            "--filter".into(),
            format!("label={}={}", TYPE_LABEL, SESSION_TYPE),
        ];
        let output = self.exec(&args).await?;
        if !output.status.success() {
            return Err(PoolError::BackendUnavailable(
                self.command_failed("ps", &output),
            ));
        }

        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        // Forget overlays of containers that are gone
        self.overlay.retain(|id, _| ids.contains(id));
        self.patch_locks.retain(|id, _| ids.contains(id));

        let pods = self.inspect(&ids).await?;
        Ok(pods
            .into_iter()
            .filter(|pod| selector.matches(&pod.labels))
            .collect())
    }

    async fn get_pod(&self, id: &str) -> PoolResult<Pod> {
        self.resolve_id(id).await
    }

    async fn create_pod(&self, template: &PodTemplate) -> PoolResult<Pod> {
        validate_image_name(&template.image)?;
        validate_container_id(&template.name)?;

        let output = self.exec(&self.run_args(template)).await?;
        if !output.status.success() {
            return Err(PoolError::SpawnFailure(self.command_failed("run", &output)));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        self.resolve_id(&id).await
    }

    async fn patch_labels(
        &self,
        id: &str,
        labels: &Labels,
        expected: Option<&Labels>,
    ) -> PoolResult<Pod> {
        let current = self.resolve_id(id).await?;

        let lock = self.patch_locks.entry(current.id.clone()).or_default().clone();
        let _guard = lock.lock().await;

        // Re-read under the lock; a concurrent patch may have landed meanwhile
        let current = self.resolve_id(&current.id).await?;
        if let Some(expected) = expected
            && !labels_match(&current.labels, expected)
        {
            return Err(PoolError::Conflict { pod_id: current.id });
        }

        self.overlay
            .entry(current.id.clone())
            .or_default()
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        let updated = self.resolve_id(&current.id).await?;
        if !labels_match(&updated.labels, labels) {
            return Err(PoolError::Conflict { pod_id: updated.id });
        }
        Ok(updated)
    }

    async fn delete_pod(&self, id: &str, grace_period_seconds: Option<u32>) -> PoolResult<()> {
        validate_container_id(id)?;

        // Zero grace means kill right away, which `rm -f` does
        if let Some(grace) = grace_period_seconds.filter(|grace| *grace > 0) {
            let args: Vec<String> = vec![
                "stop".into(),
                "-t".into(),
                grace.to_string(),
                id.to_string(),
            ];
            let output = self.exec(&args).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if is_missing_container(&stderr) {
                    return Err(PoolError::NotFound(id.to_string()));
                }
                return Err(PoolError::BackendUnavailable(
                    self.command_failed("stop", &output),
                ));
            }
        }

        let args: Vec<String> = vec!["rm".into(), "-f".into(), id.to_string()];
        let output = self.exec(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_container(&stderr) {
                return Err(PoolError::NotFound(id.to_string()));
            }
            return Err(PoolError::BackendUnavailable(
                self.command_failed("rm", &output),
            ));
        }

        self.overlay.remove(id);
        self.patch_locks.remove(id);
        Ok(())
    }

    async fn health_check(&self) -> PoolResult<String> {
        let args: Vec<String> = vec![
            "version".into(),
            "--format".into(),
            "{{.Client.Version}}".into(),
        ];
        let output = self.exec(&args).await?;
        if !output.status.success() {
            return Err(PoolError::BackendUnavailable(
                self.command_failed("version", &output),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Subset of `inspect` output shared by docker and podman.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    state: InspectedState,
    #[serde(default)]
    config: InspectedConfig,
    #[serde(default)]
    network_settings: InspectedNetwork,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    exit_code: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    #[serde(default)]
    labels: Option<Labels>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

impl InspectedState {
    fn phase(&self) -> PodPhase {
        match self.status.to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" | "restarting" => PodPhase::Pending,
            "running" => PodPhase::Running,
            "exited" | "stopped" | "dead" => {
                if self.exit_code == 0 {
                    PodPhase::Succeeded
                } else {
                    PodPhase::Failed
                }
            }
            _ => PodPhase::Unknown,
        }
    }
}

impl InspectedContainer {
    fn into_pod(self, default_host_ip: &str, container_port: u16) -> Pod {
        let phase = self.state.phase();
        let key = format!("{}/tcp", container_port);
        let address = self
            .network_settings
            .ports
            .as_ref()
            .and_then(|ports| ports.get(&key))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.first())
            .and_then(|binding| {
                let port = binding.host_port.parse::<u16>().ok()?;
                let ip = match binding.host_ip.as_str() {
                    "" | "0.0.0.0" | "::" => default_host_ip.to_string(),
                    ip => ip.to_string(),
                };
                Some(PodAddress::new(ip, port))
            });
        let created_at = DateTime::parse_from_rfc3339(&self.created)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));

        Pod::new(
            self.id,
            phase,
            address,
            self.config.labels.unwrap_or_default(),
            created_at,
        )
    }
}
