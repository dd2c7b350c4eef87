//! FLApp Custom Resource Definition
//!
//! An FLApp describes one side of a federated training job: the replica
//! groups to run in this cluster. The peer cluster runs an FLApp with the
//! same name describing its own side.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, Condition, FLAppPhase, Pair, ReplicaStatus, ReplicaType};
use crate::Error;

/// Restarts allowed per replica group when `restartLimit` is unset
pub const DEFAULT_RESTART_LIMIT: i32 = 3;

/// Specification for an FLApp
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fedlearner.k8s.io",
    version = "v1alpha1",
    kind = "FLApp",
    plural = "flapps",
    shortname = "fla",
    status = "FLAppStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FLAppSpec {
    /// Parameter server group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ps: Option<ReplicaSpec>,

    /// Master group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<ReplicaSpec>,

    /// Worker group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<ReplicaSpec>,

    /// Additional replica groups keyed by type name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fl_replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,
}

/// Desired state of one replica group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Number of replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Pod template for every replica of the group
    pub template: PodTemplateSpec,

    /// Whether the group pairs with the peer; defaults to true for `ps` and `worker`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<bool>,

    /// Failed pods replaced before the group is declared failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_limit: Option<i32>,
}

fn default_replicas() -> i32 {
    1
}

impl ReplicaSpec {
    /// Desired replica count, clamped at zero
    pub fn desired(&self) -> usize {
        usize::try_from(self.replicas).unwrap_or(0)
    }

    /// Restart budget for the group
    pub fn restart_limit(&self) -> i32 {
        self.restart_limit.unwrap_or(DEFAULT_RESTART_LIMIT)
    }

    /// Whether this group takes part in cross-cluster pairing
    pub fn needs_pairing(&self, replica_type: &ReplicaType) -> bool {
        self.pair.unwrap_or_else(|| replica_type.pairs_by_default())
    }

    /// Validate a single group
    pub fn validate(&self, replica_type: &ReplicaType) -> Result<(), Error> {
        replica_type.validate()?;
        if self.replicas < 0 {
            return Err(Error::validation(format!(
                "{replica_type}: replicas must be >= 0, got {}",
                self.replicas
            )));
        }
        if let Some(limit) = self.restart_limit {
            if limit < 0 {
                return Err(Error::validation(format!(
                    "{replica_type}: restartLimit must be >= 0, got {limit}"
                )));
            }
        }
        let has_containers = self
            .template
            .spec
            .as_ref()
            .map(|s| !s.containers.is_empty())
            .unwrap_or(false);
        if !has_containers {
            return Err(Error::validation(format!(
                "{replica_type}: pod template must declare at least one container"
            )));
        }
        Ok(())
    }
}

impl FLAppSpec {
    /// Every desired replica group, built-ins included, keyed by type
    pub fn replica_groups(&self) -> BTreeMap<ReplicaType, &ReplicaSpec> {
        let mut groups: BTreeMap<ReplicaType, &ReplicaSpec> = self
            .fl_replica_specs
            .iter()
            .map(|(rt, spec)| (rt.clone(), spec))
            .collect();
        let builtins = [
            (ReplicaType::ps(), self.ps.as_ref()),
            (ReplicaType::master(), self.master.as_ref()),
            (ReplicaType::worker(), self.worker.as_ref()),
        ];
        for (rt, spec) in builtins {
            if let Some(spec) = spec {
                groups.insert(rt, spec);
            }
        }
        groups
    }

    /// Structural validation of the whole spec
    ///
    /// Group-level problems (bad counts, empty templates) are reported per
    /// group by [`ReplicaSpec::validate`] and do not fail the whole FLApp.
    pub fn validate(&self) -> Result<(), Error> {
        for rt in self.fl_replica_specs.keys() {
            rt.validate()?;
            if rt.is_builtin() {
                return Err(Error::validation(format!(
                    "flReplicaSpecs key '{rt}' collides with the built-in {rt} group"
                )));
            }
        }
        if self.replica_groups().is_empty() {
            return Err(Error::validation("FLApp must declare at least one replica group"));
        }
        Ok(())
    }
}

/// Status for an FLApp
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FLAppStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: FLAppPhase,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Addresses of ready local parameter servers, by ordinal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ps_address: Vec<String>,

    /// Pairing state per replica group
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pair_status: BTreeMap<ReplicaType, Pair>,

    /// Replica counters per group
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replica_status: BTreeMap<ReplicaType, ReplicaStatus>,

    /// Ports allocated to pods, by pod name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub assigned_ports: BTreeMap<String, u16>,

    /// Conditions representing the FLApp state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Spec generation this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl FLAppStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: FLAppPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: FLAppPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Insert or update a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
