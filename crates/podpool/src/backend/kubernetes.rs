//! Kubernetes backend.
//!
//! Talks to the API server's REST interface. Conditional label patches carry
//! the pod's `resourceVersion`, so the server itself rejects a patch that
//! raced another writer with `409 Conflict`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{BackendClient, PodTemplate, Resources, labels_match};
use crate::error::{PoolError, PoolResult};
use crate::pod::{LabelSelector, Labels, Pod, PodAddress, PodPhase, SESSION_TYPE, TYPE_LABEL};

/// Name of the single container in every session pod.
pub const CONTAINER_NAME: &str = "session-container";

/// Kubernetes backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// API server base URL, e.g. a `kubectl proxy` endpoint.
    pub api_url: String,
    pub namespace: String,
    /// File holding a bearer token (service account token in-cluster).
    pub token_file: Option<String>,
    /// PEM file of an extra CA to trust.
    pub ca_file: Option<String>,
    /// Weight (1-100) of the preference to co-locate session pods; 0 disables it.
    pub session_affinity: u8,
    /// UID session containers run as.
    pub run_as_user: i64,
    pub request_timeout_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8001".to_string(),
            namespace: "default".to_string(),
            token_file: None,
            ca_file: None,
            session_affinity: 0,
            run_as_user: 1000,
            request_timeout_secs: 30,
        }
    }
}

/// Pods backed by Kubernetes pods.
#[derive(Debug, Clone)]
pub struct KubernetesBackend {
    client: Client,
    /// Base URL of the namespace's pod collection.
    pods_url: String,
    version_url: String,
    token: Option<String>,
    session_affinity: u8,
    run_as_user: i64,
    container_port: u16,
}

impl KubernetesBackend {
    pub fn new(config: &KubernetesConfig, container_port: u16) -> PoolResult<Self> {
        let mut builder =
            Client::builder().timeout(Duration::from_secs(config.request_timeout_secs));

        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(shellexpand::tilde(ca_file).as_ref())?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| PoolError::InvalidInput(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let token = match &config.token_file {
            Some(path) => Some(
                std::fs::read_to_string(shellexpand::tilde(path).as_ref())?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        let client = builder
            .build()
            .map_err(|e| PoolError::BackendUnavailable(format!("failed to build client: {}", e)))?;

        let api_url = config.api_url.trim_end_matches('/');
        Ok(Self {
            client,
            pods_url: format!("{}/api/v1/namespaces/{}/pods", api_url, config.namespace),
            version_url: format!("{}/version", api_url),
            token,
            session_affinity: config.session_affinity.min(100),
            run_as_user: config.run_as_user,
            container_port,
        })
    }

    fn pod_url(&self, id: &str) -> String {
        format!("{}/{}", self.pods_url, id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Map a response to a value or to the error kind its status means.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        pod_id: &str,
    ) -> PoolResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| PoolError::ParseError(format!("failed to parse response: {}", e)));
        }

        let message = api_message(response).await;
        Err(match status {
            StatusCode::NOT_FOUND => PoolError::NotFound(pod_id.to_string()),
            StatusCode::CONFLICT => PoolError::Conflict {
                pod_id: pod_id.to_string(),
            },
            s if s.is_server_error() => PoolError::BackendUnavailable(message),
            _ => PoolError::InvalidInput(message),
        })
    }

    async fn fetch(&self, id: &str) -> PoolResult<KubePod> {
        let response = self
            .authorize(self.client.get(self.pod_url(id)))
            .send()
            .await?;
        self.handle_response(response, id).await
    }

    /// Pod manifest for `template`.
    pub fn manifest(&self, template: &PodTemplate) -> Value {
        let resources = &template.resources;
        let mut container = json!({
            "name": CONTAINER_NAME,
            "image": template.image,
            "imagePullPolicy": template.pull_policy.as_str(),
            "env": template
                .env
                .iter()
                .map(|(name, value)| json!({ "name": name, "value": value }))
                .collect::<Vec<_>>(),
            "resources": {
                "requests": {
                    "cpu": Resources::cpu_quantity(resources.cpu_request_millis),
                    "memory": resources.memory_request_bytes.to_string(),
                },
                "limits": {
                    "cpu": Resources::cpu_quantity(resources.cpu_limit_millis),
                    "memory": resources.memory_limit_bytes.to_string(),
                },
            },
            "ports": [{ "containerPort": template.container_port }],
        });

        if let Some((command, args)) = template.command.split_first() {
            container["command"] = json!([command]);
            container["args"] = json!(args);
        }

        let mut pod_spec = json!({
            "containers": [container],
            "restartPolicy": "Never",
            "securityContext": { "runAsUser": self.run_as_user },
            "automountServiceAccountToken": false,
        });

        if self.session_affinity > 0 {
            pod_spec["affinity"] = json!({
                "podAffinity": {
                    "preferredDuringSchedulingIgnoredDuringExecution": [{
                        "weight": self.session_affinity,
                        "podAffinityTerm": {
                            "labelSelector": {
                                "matchExpressions": [{
                                    "key": TYPE_LABEL,
                                    "operator": "In",
                                    "values": [SESSION_TYPE],
                                }],
                            },
                            "topologyKey": "kubernetes.io/hostname",
                        },
                    }],
                },
            });
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": template.name,
                "labels": template.labels,
            },
            "spec": pod_spec,
        })
    }
}

/// Best-effort extraction of the `message` field of an API `Status` body.
async fn api_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<Value>().await {
        Ok(body) => body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    }
}

#[async_trait]
impl BackendClient for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn list_pods(&self, selector: &LabelSelector) -> PoolResult<Vec<Pod>> {
        let mut request = self.authorize(self.client.get(&self.pods_url));
        if !selector.is_empty() {
            request = request.query(&[("labelSelector", selector.to_query())]);
        }
        let response = request.send().await?;
        let list: KubePodList = self.handle_response(response, "").await?;
        Ok(list
            .items
            .into_iter()
            .map(|pod| pod.into_pod(self.container_port))
            .collect())
    }

    async fn get_pod(&self, id: &str) -> PoolResult<Pod> {
        Ok(self.fetch(id).await?.into_pod(self.container_port))
    }

    async fn create_pod(&self, template: &PodTemplate) -> PoolResult<Pod> {
        let response = self
            .authorize(self.client.post(&self.pods_url))
            .json(&self.manifest(template))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = api_message(response).await;
            return Err(if status.is_server_error() {
                PoolError::BackendUnavailable(message)
            } else {
                PoolError::SpawnFailure(message)
            });
        }

        let pod: KubePod = response
            .json()
            .await
            .map_err(|e| PoolError::ParseError(format!("failed to parse response: {}", e)))?;
        Ok(pod.into_pod(self.container_port))
    }

    async fn patch_labels(
        &self,
        id: &str,
        labels: &Labels,
        expected: Option<&Labels>,
    ) -> PoolResult<Pod> {
        let mut metadata = json!({ "labels": labels });

        if let Some(expected) = expected {
            let current = self.fetch(id).await?;
            let current_labels = current.metadata.labels.clone().unwrap_or_default();
            if !labels_match(&current_labels, expected) {
                return Err(PoolError::Conflict {
                    pod_id: id.to_string(),
                });
            }
            // The server rejects the patch if the pod changed since this read
            metadata["resourceVersion"] = json!(current.metadata.resource_version);
        }

        debug!("patching labels of pod {}: {:?}", id, labels);
        let response = self
            .authorize(self.client.patch(self.pod_url(id)))
            .header("Content-Type", "application/merge-patch+json")
            .body(json!({ "metadata": metadata }).to_string())
            .send()
            .await?;
        let pod: KubePod = self.handle_response(response, id).await?;
        Ok(pod.into_pod(self.container_port))
    }

    async fn delete_pod(&self, id: &str, grace_period_seconds: Option<u32>) -> PoolResult<()> {
        let mut request = self.authorize(self.client.delete(self.pod_url(id)));
        if let Some(grace) = grace_period_seconds {
            request = request.query(&[("gracePeriodSeconds", grace)]);
        }
        let response = request.send().await?;
        let _: Value = self.handle_response(response, id).await?;
        Ok(())
    }

    async fn health_check(&self) -> PoolResult<String> {
        let response = self
            .authorize(self.client.get(&self.version_url))
            .send()
            .await?;
        let version: Value = self.handle_response(response, "").await?;
        Ok(version
            .get("gitVersion")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }
}

#[derive(Debug, Deserialize)]
struct KubePodList {
    #[serde(default)]
    items: Vec<KubePod>,
}

#[derive(Debug, Deserialize)]
struct KubePod {
    metadata: KubeMetadata,
    #[serde(default)]
    status: KubeStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeMetadata {
    name: String,
    #[serde(default)]
    labels: Option<Labels>,
    #[serde(default)]
    creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
}

impl KubePod {
    fn into_pod(self, container_port: u16) -> Pod {
        let phase = self
            .status
            .phase
            .as_deref()
            .map(PodPhase::from_backend)
            .unwrap_or(PodPhase::Pending);
        let address = self
            .status
            .pod_ip
            .filter(|ip| !ip.is_empty())
            .map(|ip| PodAddress::new(ip, container_port));

        Pod::new(
            self.metadata.name,
            phase,
            address,
            self.metadata.labels.unwrap_or_default(),
            self.metadata.creation_timestamp,
        )
    }
}
