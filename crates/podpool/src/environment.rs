//! Execution environment templates.
//!
//! An environment id selects the image, command and variables a pod is
//! spawned with. Ids end up in pod labels, so they must be valid label values.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// When the backend should pull the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

/// Template a pod is spawned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentTemplate {
    /// Environment id, also used as the `environment` label value.
    pub id: String,
    /// Container image reference.
    pub image: String,
    /// Command and arguments; empty means the image default.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables passed to the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl EnvironmentTemplate {
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            pull_policy: PullPolicy::default(),
        }
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    /// Validate every field before the template is used to spawn pods.
    pub fn validate(&self) -> PoolResult<()> {
        validate_label_value(&self.id, "environment id")?;
        validate_image_name(&self.image)?;
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        Ok(())
    }

    /// The templates shipped by default.
    pub fn defaults() -> Vec<EnvironmentTemplate> {
        vec![
            EnvironmentTemplate::new("core", "stencila/core")
                .command(["stencila-cmd"])
                .env("STENCILA_AUTH", "false"),
            EnvironmentTemplate::new("base-node", "stencila/base-node")
                .command(["stencila-cmd"])
                .env("STENCILA_AUTH", "false")
                .pull_policy(PullPolicy::Always),
            EnvironmentTemplate::new("alpine", "alpine").command(["sleep", "90"]),
        ]
    }
}

/// Lookup table of templates keyed by environment id.
#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    templates: HashMap<String, EnvironmentTemplate>,
    default_id: String,
}

impl EnvironmentRegistry {
    /// Build a registry, validating every template and the default id.
    pub fn new(
        templates: impl IntoIterator<Item = EnvironmentTemplate>,
        default_id: impl Into<String>,
    ) -> PoolResult<Self> {
        let mut map = HashMap::new();
        for template in templates {
            template.validate()?;
            if map.insert(template.id.clone(), template).is_some() {
                return Err(PoolError::InvalidInput(
                    "duplicate environment id in templates".to_string(),
                ));
            }
        }

        let default_id = default_id.into();
        if !map.contains_key(&default_id) {
            return Err(PoolError::UnknownEnvironment(default_id));
        }

        Ok(Self {
            templates: map,
            default_id,
        })
    }

    pub fn get(&self, id: &str) -> PoolResult<&EnvironmentTemplate> {
        self.templates
            .get(id)
            .ok_or_else(|| PoolError::UnknownEnvironment(id.to_string()))
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}

impl Default for EnvironmentRegistry {
    fn default() -> Self {
        Self {
            templates: EnvironmentTemplate::defaults()
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
            default_id: "base-node".to_string(),
        }
    }
}

/// Validate a value that will be stored as a backend label.
///
/// Label values are at most 63 characters, start and end with an
/// alphanumeric character, and otherwise contain only `-`, `_` and `.`.
pub fn validate_label_value(value: &str, what: &str) -> PoolResult<()> {
    if value.is_empty() {
        return Err(PoolError::InvalidInput(format!("{} cannot be empty", what)));
    }

    if value.len() > 63 {
        return Err(PoolError::InvalidInput(format!(
            "{} exceeds maximum length of 63 characters",
            what
        )));
    }

    let starts_ok = value.starts_with(|c: char| c.is_ascii_alphanumeric());
    let ends_ok = value.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Err(PoolError::InvalidInput(format!(
            "{} '{}' must start and end with an alphanumeric character",
            what, value
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !value.chars().all(valid_chars) {
        return Err(PoolError::InvalidInput(format!(
            "{} '{}' contains invalid characters; only alphanumeric, '-', '_', '.' are allowed",
            what, value
        )));
    }

    Ok(())
}

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> PoolResult<()> {
    if image.is_empty() {
        return Err(PoolError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(PoolError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid_chars) {
        return Err(PoolError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(PoolError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate an environment variable key (POSIX style).
pub fn validate_env_var_key(key: &str) -> PoolResult<()> {
    let mut chars = key.chars();
    match chars.next() {
        None => {
            return Err(PoolError::InvalidInput(
                "environment variable key cannot be empty".to_string(),
            ));
        }
        Some(first) if !first.is_ascii_alphabetic() && first != '_' => {
            return Err(PoolError::InvalidInput(format!(
                "environment variable key '{}' must start with a letter or underscore",
                key
            )));
        }
        Some(_) => {}
    }

    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(PoolError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_resolves_default() {
        let registry = EnvironmentRegistry::default();
        let template = registry.get(registry.default_id()).unwrap();
        assert_eq!(template.image, "stencila/base-node");
        assert_eq!(template.pull_policy, PullPolicy::Always);
        assert!(matches!(
            registry.get("nope"),
            Err(PoolError::UnknownEnvironment(_))
        ));
    }

    #[test]
    fn test_defaults_are_valid() {
        for template in EnvironmentTemplate::defaults() {
            assert!(template.validate().is_ok(), "{}", template.id);
        }
    }

    #[test]
    fn test_registry_rejects_unknown_default() {
        let result = EnvironmentRegistry::new(EnvironmentTemplate::defaults(), "missing");
        assert!(matches!(result, Err(PoolError::UnknownEnvironment(_))));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let templates = vec![
            EnvironmentTemplate::new("alpine", "alpine"),
            EnvironmentTemplate::new("alpine", "alpine:3"),
        ];
        assert!(EnvironmentRegistry::new(templates, "alpine").is_err());
    }

    #[test]
    fn test_validate_label_value() {
        assert!(validate_label_value("base-node", "id").is_ok());
        assert!(validate_label_value("v1.2_x", "id").is_ok());
        assert!(validate_label_value("", "id").is_err());
        assert!(validate_label_value("stencila/base-node", "id").is_err());
        assert!(validate_label_value("-leading", "id").is_err());
        assert!(validate_label_value(&"a".repeat(64), "id").is_err());
    }

    #[test]
    fn test_validate_image_name() {
        assert!(validate_image_name("ubuntu:latest").is_ok());
        assert!(validate_image_name("gcr.io/project/image@sha256:abc123").is_ok());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_env_var_key() {
        assert!(validate_env_var_key("STENCILA_AUTH").is_ok());
        assert!(validate_env_var_key("_X").is_ok());
        assert!(validate_env_var_key("1X").is_err());
        assert!(validate_env_var_key("MY-VAR").is_err());
        assert!(validate_env_var_key("").is_err());
    }
}
