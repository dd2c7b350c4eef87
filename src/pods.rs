//! Replica pods
//!
//! Construction of the pod for one replica and classification of observed
//! pods. Pods are named `<app>-<type>-<index>`, labelled with their replica
//! identity and owned by their FLApp so deleting the FLApp garbage-collects
//! them.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ContainerPort, EnvVar, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::{FLApp, ReplicaSpec, ReplicaType};
use crate::registry::ReplicaKey;
use crate::{Error, Result};

/// Label carrying the owning FLApp name
pub const APP_LABEL: &str = "fedlearner.k8s.io/app-name";
/// Label carrying the replica type
pub const REPLICA_TYPE_LABEL: &str = "fedlearner.k8s.io/replica-type";
/// Label carrying the replica ordinal
pub const REPLICA_INDEX_LABEL: &str = "fedlearner.k8s.io/replica-index";
/// Annotation carrying the port the replica serves on
pub const PORT_ANNOTATION: &str = "fedlearner.k8s.io/port";
/// Name of the container port added for the replica port
pub const PORT_NAME: &str = "flapp-port";

/// Observed state of a replica pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodState {
    /// Scheduled or starting, not ready yet
    Pending,
    /// Running and passing readiness
    Ready,
    /// Running but not ready
    NotReady,
    /// Being deleted
    Terminating,
    /// Exited successfully
    Succeeded,
    /// Exited with failure or evicted
    Failed,
}

impl PodState {
    /// Whether the pod still occupies its replica slot
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Ready | Self::NotReady)
    }
}

/// Classify an observed pod
pub fn pod_state(pod: &Pod) -> PodState {
    if pod.metadata.deletion_timestamp.is_some() {
        return PodState::Terminating;
    }
    let status = pod.status.as_ref();
    match status.and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => PodState::Succeeded,
        Some("Failed") => PodState::Failed,
        Some("Running") => {
            let ready = status
                .and_then(|s| s.conditions.as_ref())
                .map(|conds| {
                    conds
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
                .unwrap_or(false);
            if ready {
                PodState::Ready
            } else {
                PodState::NotReady
            }
        }
        _ => PodState::Pending,
    }
}

/// Replica identity of a pod, from its labels
pub fn replica_key(pod: &Pod) -> Option<ReplicaKey> {
    let labels = pod.metadata.labels.as_ref()?;
    let app = labels.get(APP_LABEL)?;
    let replica_type = labels.get(REPLICA_TYPE_LABEL)?;
    let index = labels.get(REPLICA_INDEX_LABEL)?.parse().ok()?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    Some(ReplicaKey::new(
        namespace,
        app.as_str(),
        ReplicaType::new(replica_type.as_str()),
        index,
    ))
}

/// Port the replica serves on: the annotation, else the first container port
pub fn pod_port(pod: &Pod) -> Option<u16> {
    let annotated = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PORT_ANNOTATION))
        .and_then(|p| p.parse().ok());
    annotated.or_else(|| {
        pod.spec
            .as_ref()?
            .containers
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .find_map(|p| u16::try_from(p.container_port).ok())
    })
}

/// Address to publish for a pod, if it is ready to receive traffic
pub fn ready_address(pod: &Pod) -> Option<String> {
    if pod_state(pod) != PodState::Ready {
        return None;
    }
    let ip = pod.status.as_ref()?.pod_ip.as_deref()?;
    if ip.is_empty() {
        return None;
    }
    Some(format!("{ip}:{}", pod_port(pod)?))
}

/// Port a group's replicas serve on when ports are not allocated
pub fn template_port(spec: &ReplicaSpec) -> u16 {
    spec.template
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|p| u16::try_from(p.container_port).ok())
        .unwrap_or(crate::DEFAULT_REPLICA_PORT)
}

/// Build the pod for replica `key` of `app`
///
/// The template is copied as-is; the operator adds its labels, the port
/// annotation, an owner reference, replica environment variables and, when
/// `add_container_port` is set, a named container port on the first
/// container. Restarts are handled by the operator, so the restart policy
/// is forced to `Never`.
pub fn build_pod(
    app: &FLApp,
    key: &ReplicaKey,
    spec: &ReplicaSpec,
    port: u16,
    add_container_port: bool,
) -> Result<Pod> {
    let owner = app
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal(format!("FLApp {} has no uid yet", app.name_any())))?;
    let template_meta = spec.template.metadata.clone().unwrap_or_default();
    let mut pod_spec = spec.template.spec.clone().ok_or_else(|| {
        Error::pod_creation(key.replica_type.as_str(), "pod template has no spec")
    })?;

    let mut labels = template_meta.labels.unwrap_or_default();
    labels.insert(APP_LABEL.to_string(), key.app.clone());
    labels.insert(REPLICA_TYPE_LABEL.to_string(), key.replica_type.to_string());
    labels.insert(REPLICA_INDEX_LABEL.to_string(), key.index.to_string());

    let mut annotations = template_meta.annotations.unwrap_or_default();
    annotations.insert(PORT_ANNOTATION.to_string(), port.to_string());

    let env = replica_env(key, port);
    for container in pod_spec.containers.iter_mut() {
        let vars = container.env.get_or_insert_with(Vec::new);
        vars.retain(|v| !env.iter().any(|e| e.name == v.name));
        vars.extend(env.iter().cloned());
    }

    if add_container_port {
        if let Some(first) = pod_spec.containers.first_mut() {
            let ports = first.ports.get_or_insert_with(Vec::new);
            ports.retain(|p| p.name.as_deref() != Some(PORT_NAME));
            ports.push(ContainerPort {
                name: Some(PORT_NAME.to_string()),
                container_port: i32::from(port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
    }

    pod_spec.restart_policy = Some("Never".to_string());

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(key.pod_name()),
            namespace: Some(key.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(pod_spec),
        status: None,
    })
}

fn replica_env(key: &ReplicaKey, port: u16) -> Vec<EnvVar> {
    let var = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    };
    vec![
        var("FL_APP_NAME", key.app.clone()),
        var("FL_REPLICA_TYPE", key.replica_type.to_string()),
        var("FL_REPLICA_INDEX", key.index.to_string()),
        var("FL_PORT", port.to_string()),
        var(
            "FL_PEER_HOST",
            format!("{}.{}.svc", key.alias_name(), key.namespace),
        ),
    ]
}

/// Group pods of one FLApp by replica type and ordinal
pub fn index_pods(pods: &[Pod]) -> BTreeMap<ReplicaType, BTreeMap<u32, &Pod>> {
    let mut groups: BTreeMap<ReplicaType, BTreeMap<u32, &Pod>> = BTreeMap::new();
    for pod in pods {
        if let Some(key) = replica_key(pod) {
            groups
                .entry(key.replica_type)
                .or_default()
                .insert(key.index, pod);
        }
    }
    groups
}

/// Label selector matching every pod of one FLApp
pub fn app_selector(app: &str) -> String {
    format!("{APP_LABEL}={app}")
}

#[cfg(test)]
pub(crate) mod testing {
    //! Pod fixtures shared by unit tests

    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    /// A pod for `key` in the given phase; `ready` sets the Ready condition
    pub fn pod(key: &ReplicaKey, phase: &str, ready: bool, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(key.pod_name()),
                namespace: Some(key.namespace.clone()),
                uid: Some(format!("{}-uid", key.pod_name())),
                labels: Some(BTreeMap::from([
                    (APP_LABEL.to_string(), key.app.clone()),
                    (REPLICA_TYPE_LABEL.to_string(), key.replica_type.to_string()),
                    (REPLICA_INDEX_LABEL.to_string(), key.index.to_string()),
                ])),
                annotations: Some(BTreeMap::from([(
                    PORT_ANNOTATION.to_string(),
                    (10000 + key.index).to_string(),
                )])),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(str::to_string),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    /// A running, ready pod with IP `10.0.0.<index + 1>`
    pub fn ready_pod(key: &ReplicaKey) -> Pod {
        let ip = format!("10.0.0.{}", key.index + 1);
        pod(key, "Running", true, Some(&ip))
    }
}
