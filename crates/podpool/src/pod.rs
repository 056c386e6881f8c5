//! Pod model shared by every backend.
//!
//! A pod's ownership state lives in its backend labels so that it survives
//! restarts of the manager and is visible to every manager instance. The
//! accessors on [`Pod`] read those labels; nothing here talks to a backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Backend labels attached to a pod.
pub type Labels = BTreeMap<String, String>;

/// Label marking pods managed by the pool.
pub const TYPE_LABEL: &str = "type";
/// Value of [`TYPE_LABEL`] on managed pods.
pub const SESSION_TYPE: &str = "session";
/// Ownership state, see [`PoolState`].
pub const POOL_LABEL: &str = "pool";
/// Manager instance that claimed the pod.
pub const CLAIMER_LABEL: &str = "claimer";
/// Unix seconds at which the pod was claimed.
pub const CLAIMED_AT_LABEL: &str = "claimedAt";
/// Manager instance that acquired the pod.
pub const ACQUIRER_LABEL: &str = "acquirer";
/// Unix seconds at which the pod became occupied.
pub const ACQUIRED_AT_LABEL: &str = "acquiredAt";
/// Environment template the pod was spawned from.
pub const ENVIRONMENT_LABEL: &str = "environment";
/// Why the pod was spawned (`filling` or `demanded`).
pub const REASON_LABEL: &str = "reason";
/// Manager instance that spawned the pod.
pub const SPAWNER_LABEL: &str = "spawner";

/// Pod lifecycle phase, normalized across backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodPhase {
    /// Created but not yet running.
    Pending,
    /// Running and reachable.
    Running,
    /// Exited successfully.
    Succeeded,
    /// Exited with an error.
    Failed,
    /// The backend could not report a phase.
    #[default]
    Unknown,
}

impl PodPhase {
    /// Parse a backend phase string, case-insensitively.
    pub fn from_backend(phase: &str) -> Self {
        match phase.to_ascii_lowercase().as_str() {
            "pending" => PodPhase::Pending,
            "running" => PodPhase::Running,
            "succeeded" => PodPhase::Succeeded,
            "failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// The process has exited and will not come back.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Running, or on its way to running.
    pub fn is_live(&self) -> bool {
        matches!(self, PodPhase::Running | PodPhase::Pending)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "pending"),
            PodPhase::Running => write!(f, "running"),
            PodPhase::Succeeded => write!(f, "succeeded"),
            PodPhase::Failed => write!(f, "failed"),
            PodPhase::Unknown => write!(f, "unknown"),
        }
    }
}

/// Ownership state stored in the [`POOL_LABEL`] label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Warm and unclaimed.
    Standby,
    /// Reserved by one acquirer, not yet occupied.
    Claimed,
    /// Handed out to a session.
    Occupied,
    /// Being deleted by the reaper.
    Deleting,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Standby => "standby",
            PoolState::Claimed => "claimed",
            PoolState::Occupied => "occupied",
            PoolState::Deleting => "deleting",
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolState {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standby" => Ok(PoolState::Standby),
            "claimed" => Ok(PoolState::Claimed),
            "occupied" => Ok(PoolState::Occupied),
            "deleting" => Ok(PoolState::Deleting),
            other => Err(PoolError::InvalidInput(format!(
                "unknown pool state '{}'",
                other
            ))),
        }
    }
}

/// Network address of a running pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAddress {
    pub ip: String,
    pub port: u16,
}

impl PodAddress {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Base URL of the pod, e.g. `http://10.0.0.4:2000`.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

/// A unit of compute capacity as seen by the pool manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    /// Backend-assigned identifier (container id or pod name).
    pub id: String,
    pub phase: PodPhase,
    /// Present if and only if the pod is running.
    pub address: Option<PodAddress>,
    pub labels: Labels,
    pub created_at: Option<DateTime<Utc>>,
    /// Position among pending pods ordered by creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_position: Option<usize>,
}

impl Pod {
    /// Build a pod, keeping `address` and `phase` consistent.
    ///
    /// A pod reported as running without an address is not reachable yet and
    /// is treated as pending; an address reported for any other phase is dropped.
    pub fn new(
        id: impl Into<String>,
        phase: PodPhase,
        address: Option<PodAddress>,
        labels: Labels,
        created_at: Option<DateTime<Utc>>,
    ) -> Self {
        let (phase, address) = match (phase, address) {
            (PodPhase::Running, Some(address)) => (PodPhase::Running, Some(address)),
            (PodPhase::Running, None) => (PodPhase::Pending, None),
            (phase, _) => (phase, None),
        };

        Self {
            id: id.into(),
            phase,
            address,
            labels,
            created_at,
            pending_position: None,
        }
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Ownership state, `None` when the label is missing or unrecognized.
    pub fn pool(&self) -> Option<PoolState> {
        self.label(POOL_LABEL).and_then(|v| v.parse().ok())
    }

    pub fn claimer(&self) -> Option<&str> {
        self.label(CLAIMER_LABEL)
    }

    pub fn acquirer(&self) -> Option<&str> {
        self.label(ACQUIRER_LABEL)
    }

    pub fn environment(&self) -> Option<&str> {
        self.label(ENVIRONMENT_LABEL)
    }

    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.label(CLAIMED_AT_LABEL).and_then(parse_timestamp_label)
    }

    pub fn acquired_at(&self) -> Option<DateTime<Utc>> {
        self.label(ACQUIRED_AT_LABEL).and_then(parse_timestamp_label)
    }

    /// Base URL when the pod is reachable.
    pub fn url(&self) -> Option<String> {
        self.address.as_ref().map(PodAddress::url)
    }
}

/// Encode a timestamp as a label value (Unix seconds).
pub fn timestamp_label(at: DateTime<Utc>) -> String {
    at.timestamp().to_string()
}

/// Decode a label written by [`timestamp_label`].
///
/// RFC 3339 values are accepted too, since older pods carry them.
pub fn parse_timestamp_label(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(secs) = value.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Label-equality filter, rendered in the orchestrator's selector syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<(String, String)>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector matching every pod managed by the pool.
    pub fn sessions() -> Self {
        Self::new().equals(TYPE_LABEL, SESSION_TYPE)
    }

    /// Require `key == value`.
    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Selector string such as `type=session,pool=standby`.
    pub fn to_query(&self) -> String {
        self.requirements
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}
