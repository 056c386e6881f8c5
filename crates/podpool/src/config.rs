//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendKind, KubernetesConfig, LocalBackendConfig, Resources};
use crate::environment::{EnvironmentRegistry, EnvironmentTemplate};
use crate::error::{PoolError, PoolResult};

/// Settings of one pool manager instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Which backend to run against.
    pub backend: BackendKind,
    /// Identity used in `claimer`/`acquirer`/`spawner` labels (generated if not set).
    pub manager_id: Option<String>,
    /// Desired number of standby pods of the default environment.
    pub standby_size: usize,
    pub fill_interval_secs: u64,
    pub reap_interval_secs: u64,
    /// How long a pod may stay occupied before it is reclaimed.
    pub occupied_time_limit_secs: u64,
    /// How long a pod may stay claimed before the reaper deletes it.
    pub claim_timeout_secs: u64,
    pub delete_grace_period_secs: u32,
    pub cache_ttl_ms: u64,
    pub default_environment: String,
    /// Claim attempts before `acquire` falls back to spawning.
    pub acquire_max_attempts: u32,
    /// Whether `acquire` waits for a spawned pod to run.
    pub wait_for_ready: bool,
    pub ready_poll_interval_ms: u64,
    pub ready_timeout_secs: u64,
    /// Port the session server listens on inside each pod.
    pub container_port: u16,
    pub resources: Resources,
    pub environments: Vec<EnvironmentTemplate>,
    pub local: LocalBackendConfig,
    pub kubernetes: KubernetesConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            manager_id: None,
            standby_size: 10,
            fill_interval_secs: 30,
            reap_interval_secs: 60,
            occupied_time_limit_secs: 4 * 60 * 60,
            claim_timeout_secs: 60,
            delete_grace_period_secs: 30,
            cache_ttl_ms: 10_000,
            default_environment: "base-node".to_string(),
            acquire_max_attempts: 5,
            wait_for_ready: true,
            ready_poll_interval_ms: 300,
            ready_timeout_secs: 120,
            container_port: 2000,
            resources: Resources::default(),
            environments: EnvironmentTemplate::defaults(),
            local: LocalBackendConfig::default(),
            kubernetes: KubernetesConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn fill_interval(&self) -> Duration {
        Duration::from_secs(self.fill_interval_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn occupied_time_limit(&self) -> Duration {
        Duration::from_secs(self.occupied_time_limit_secs)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Build the environment registry from the configured templates.
    pub fn registry(&self) -> PoolResult<EnvironmentRegistry> {
        EnvironmentRegistry::new(self.environments.iter().cloned(), &self.default_environment)
    }

    /// Check settings the pool cannot run with.
    pub fn validate(&self) -> PoolResult<()> {
        if self.fill_interval_secs == 0 || self.reap_interval_secs == 0 {
            return Err(PoolError::InvalidInput(
                "fill and reap intervals must be positive".to_string(),
            ));
        }
        if self.claim_timeout_secs == 0 {
            return Err(PoolError::InvalidInput(
                "claim_timeout_secs must be positive".to_string(),
            ));
        }
        if self.acquire_max_attempts == 0 {
            return Err(PoolError::InvalidInput(
                "acquire_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.ready_poll_interval_ms == 0 {
            return Err(PoolError::InvalidInput(
                "ready_poll_interval_ms must be positive".to_string(),
            ));
        }
        if let Some(id) = &self.manager_id {
            crate::environment::validate_label_value(id, "manager id")?;
        }
        self.registry().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.standby_size, 10);
        assert_eq!(config.fill_interval(), Duration::from_secs(30));
        assert_eq!(config.occupied_time_limit(), Duration::from_secs(14_400));
        assert_eq!(config.claim_timeout(), Duration::from_secs(60));
        assert_eq!(config.cache_ttl(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: PoolConfig = toml::from_str(
            r#"
            backend = "kubernetes"
            standby_size = 3

            [kubernetes]
            namespace = "sessions"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Kubernetes);
        assert_eq!(config.standby_size, 3);
        assert_eq!(config.kubernetes.namespace, "sessions");
        assert_eq!(config.kubernetes.api_url, "http://127.0.0.1:8001");
        assert_eq!(config.reap_interval_secs, 60);
    }

    #[test]
    fn test_validate_rejects_unknown_default_environment() {
        let config = PoolConfig {
            default_environment: "python".to_string(),
            ..PoolConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PoolError::UnknownEnvironment(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = PoolConfig {
            acquire_max_attempts: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
