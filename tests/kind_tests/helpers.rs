//! Shared fixtures for cluster-backed tests

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use flapp_operator::crd::{FLApp, FLAppSpec, ReplicaSpec};

/// Namespace used by every cluster test
pub const TEST_NAMESPACE: &str = "default";

/// Connect to the cluster and make sure the FLApp CRD is installed
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let client = Client::try_default()
        .await
        .map_err(|e| format!("no cluster reachable: {e}"))?;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = FLApp::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();
    crds.patch(
        &name,
        &PatchParams::apply("flapp-operator-tests").force(),
        &Patch::Apply(&crd),
    )
    .await
    .map_err(|e| format!("failed to install CRD: {e}"))?;

    // give the API server a moment to serve the new resource
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(client)
}

/// A replica group running a short-lived busybox container
pub fn replica_spec(replicas: i32) -> ReplicaSpec {
    ReplicaSpec {
        replicas,
        template: PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "trainer".to_string(),
                    image: Some("busybox:1.36".to_string()),
                    command: Some(vec!["sleep".to_string(), "3600".to_string()]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

/// An FLApp with `workers` worker replicas and one parameter server
pub fn sample_flapp(name: &str, workers: i32) -> FLApp {
    let mut app = FLApp::new(
        name,
        FLAppSpec {
            ps: Some(replica_spec(1)),
            worker: Some(replica_spec(workers)),
            fl_replica_specs: BTreeMap::new(),
            ..Default::default()
        },
    );
    app.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    app
}

/// Delete an FLApp, ignoring a missing one
pub async fn cleanup_flapp(client: &Client, name: &str) {
    let api: Api<FLApp> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let _ = api.delete(name, &DeleteParams::foreground()).await;
}
