//! Shared types used by the FLApp CRD

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// FLApp lifecycle phase
///
/// Every reconciliation pass recomputes the phase from what it observes;
/// only `Succeeded` and `Failed` are sticky.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FLAppPhase {
    /// Accepted but not yet reconciled
    #[default]
    Created,
    /// Replica pods are being created or are not all ready
    Bootstrapping,
    /// All pods are ready; waiting for the peer to pair every group
    Pairing,
    /// All groups are ready and fully paired
    Running,
    /// Training finished on every worker
    Succeeded,
    /// A replica group exhausted its restart budget or the spec is invalid
    Failed,
}

impl FLAppPhase {
    /// Terminal phases are never left again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for FLAppPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Bootstrapping => write!(f, "Bootstrapping"),
            Self::Pairing => write!(f, "Pairing"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Replica group tag
///
/// The built-in groups are `ps`, `master` and `worker`; additional groups
/// use the same type with any DNS-1123 label as name.
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct ReplicaType(String);

impl ReplicaType {
    /// Parameter server group
    pub const PS: &'static str = "ps";
    /// Master group
    pub const MASTER: &'static str = "master";
    /// Worker group
    pub const WORKER: &'static str = "worker";

    /// Create a replica type from any name (see [`ReplicaType::validate`])
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The parameter server group
    pub fn ps() -> Self {
        Self::new(Self::PS)
    }

    /// The master group
    pub fn master() -> Self {
        Self::new(Self::MASTER)
    }

    /// The worker group
    pub fn worker() -> Self {
        Self::new(Self::WORKER)
    }

    /// Name of the group
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is one of `ps`, `master`, `worker`
    pub fn is_builtin(&self) -> bool {
        matches!(self.0.as_str(), Self::PS | Self::MASTER | Self::WORKER)
    }

    /// Groups pair with the peer by default when they are `ps` or `worker`
    pub fn pairs_by_default(&self) -> bool {
        matches!(self.0.as_str(), Self::PS | Self::WORKER)
    }

    /// The name ends up in pod names, labels and registry keys, so it must
    /// be a lowercase DNS-1123 label without dots.
    pub fn validate(&self) -> Result<(), crate::Error> {
        let name = self.0.as_str();
        let valid = !name.is_empty()
            && name.len() <= 30
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && name.starts_with(|c: char| c.is_ascii_lowercase())
            && !name.ends_with('-');
        if valid {
            Ok(())
        } else {
            Err(crate::Error::validation(format!(
                "replica type '{name}' must be a lowercase DNS label of at most 30 characters"
            )))
        }
    }
}

impl fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Pairing state of one replica group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pair {
    /// Ready local replica identifiers (e.g. `worker-0`), sorted by ordinal
    #[serde(default)]
    pub local: Vec<String>,
    /// Identifiers the peer reported for the same group, sorted by ordinal
    #[serde(default)]
    pub remote: Vec<String>,
    /// Local identifier to remote network address
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
}

impl Pair {
    /// Whether every one of `desired` replicas is ready locally and mapped
    pub fn is_fully_paired(&self, desired: usize) -> bool {
        self.local.len() == desired && self.mapping.len() == desired
    }
}

/// Per-group replica counters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    /// Desired replica count
    #[serde(default)]
    pub desired: i32,
    /// Pods that exist and are neither succeeded nor failed
    #[serde(default)]
    pub active: i32,
    /// Pods running and ready
    #[serde(default)]
    pub ready: i32,
    /// Pods that completed successfully
    #[serde(default)]
    pub succeeded: i32,
    /// Pods currently in Failed phase
    #[serde(default)]
    pub failed: i32,
    /// Failed pods replaced so far
    #[serde(default)]
    pub restarts: i32,
    /// UIDs of the failed pods counted in `restarts`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaced_pods: Vec<String>,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g. `Ready`, `Retrying`, `WorkerSpecError`)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the status flipped
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert or update a condition by type
///
/// The transition time is kept when the status did not change, so writing
/// the same observation twice produces an identical list.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.last_transition_time = condition.last_transition_time;
            }
            existing.status = condition.status;
            existing.reason = condition.reason;
            existing.message = condition.message;
        }
        None => conditions.push(condition),
    }
}
