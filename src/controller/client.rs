//! Cluster access used by the FLApp reconciler

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::reflector::Store;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::crd::{FLApp, FLAppStatus};
use crate::error::api_status;
use crate::pods::{APP_LABEL, REPLICA_TYPE_LABEL};
use crate::{Error, Result, FIELD_MANAGER};

/// Trait abstracting Kubernetes operations for FLApps
///
/// Reads come from the watch cache; writes go to the API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Pods of one FLApp, from the cache
    async fn list_app_pods(&self, namespace: &str, app: &str) -> Result<Vec<Pod>>;

    /// Every pod in a namespace, from the cache
    async fn list_all_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    /// Create a pod; an already existing pod counts as created
    ///
    /// Rejections by admission or quota come back as
    /// [`Error::PodCreation`].
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()>;

    /// Delete a pod; a missing pod counts as deleted
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Replace the status of `app`, conditional on its resourceVersion
    ///
    /// A stale version yields [`Error::Conflict`].
    async fn update_status(&self, app: &FLApp, status: &FLAppStatus) -> Result<()>;
}

/// [`ClusterApi`] over a pod reflector and the Kubernetes API
pub struct KubeClusterApi {
    client: Client,
    pods: Store<Pod>,
}

impl KubeClusterApi {
    /// Create from a client and a pod reflector store
    pub fn new(client: Client, pods: Store<Pod>) -> Self {
        Self { client, pods }
    }

    fn cached_pods(&self, namespace: &str, app: Option<&str>) -> Vec<Pod> {
        self.pods
            .state()
            .into_iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .filter(|pod| match app {
                Some(app) => pod.labels().get(APP_LABEL).map(String::as_str) == Some(app),
                None => true,
            })
            .map(|pod| (*pod).clone())
            .collect()
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_app_pods(&self, namespace: &str, app: &str) -> Result<Vec<Pod>> {
        Ok(self.cached_pods(namespace, Some(app)))
    }

    async fn list_all_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self.cached_pods(namespace, None))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match api.create(&params, pod).await {
            Ok(_) => Ok(()),
            Err(e) => match api_status(&e) {
                Some(409) => {
                    debug!(pod = %pod.name_any(), "pod already exists");
                    Ok(())
                }
                Some(400 | 403 | 422) => {
                    let replica_type = pod
                        .labels()
                        .get(REPLICA_TYPE_LABEL)
                        .cloned()
                        .unwrap_or_default();
                    Err(Error::pod_creation(replica_type, e.to_string()))
                }
                _ => Err(e.into()),
            },
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if api_status(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, app: &FLApp, status: &FLAppStatus) -> Result<()> {
        let name = app.name_any();
        let namespace = app
            .namespace()
            .ok_or_else(|| Error::internal(format!("FLApp {name} has no namespace")))?;
        let api: Api<FLApp> = Api::namespaced(self.client.clone(), &namespace);

        let mut body = FLApp::new(&name, app.spec.clone());
        body.metadata = ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace),
            resource_version: app.resource_version(),
            ..Default::default()
        };
        body.status = Some(status.clone());
        let data = serde_json::to_vec(&body).map_err(|e| Error::serialization(e.to_string()))?;

        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match api.replace_status(&name, &params, data).await {
            Ok(_) => Ok(()),
            Err(e) => match api_status(&e) {
                Some(409) => Err(Error::conflict(format!(
                    "FLApp {name} changed since resourceVersion {}",
                    app.resource_version().unwrap_or_default()
                ))),
                // deleted while we were reconciling
                Some(404) => Ok(()),
                _ => Err(e.into()),
            },
        }
    }
}
