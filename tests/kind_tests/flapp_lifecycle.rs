//! The reconciler running in-process against a real cluster
//!
//! No peer operator is running, so every FLApp stays short of `Running`;
//! these stories cover what one side does on its own.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flapp_operator::config::OperatorConfig;
use flapp_operator::controller::{run_controllers, ControllerDeps};
use flapp_operator::crd::{FLApp, FLAppPhase};
use flapp_operator::discovery::KubeAliasClient;
use flapp_operator::leader_election::LeadershipHandle;
use flapp_operator::pairing::{HttpPeerClient, PairingProtocol};
use flapp_operator::pods::app_selector;
use flapp_operator::registry::{EndpointRegistry, MemoryStore};

use super::helpers::{cleanup_flapp, ensure_test_cluster, sample_flapp, TEST_NAMESPACE};

/// Only one in-process operator may manage the test namespace at a time
static OPERATOR: LazyLock<tokio::sync::Mutex<()>> =
    LazyLock::new(|| tokio::sync::Mutex::new(()));

/// Start both controllers with an in-process registry and an absent peer
fn start_operator(client: Client) -> (CancellationToken, JoinHandle<()>) {
    let config = OperatorConfig {
        namespace: TEST_NAMESPACE.to_string(),
        // nothing listens here; pairing rounds fail and are retried
        peer_url: "http://127.0.0.1:9".to_string(),
        resync_interval: Duration::from_secs(5),
        ..Default::default()
    };
    let registry = Arc::new(EndpointRegistry::new(
        Arc::new(MemoryStore::new()),
        config.registry_lease_ttl,
    ));
    let deps = ControllerDeps {
        registry,
        aliases: Arc::new(KubeAliasClient::new(client.clone(), TEST_NAMESPACE)),
        pairing: PairingProtocol::new(Arc::new(
            HttpPeerClient::new(config.peer_url.clone()).unwrap(),
        )),
        leadership: LeadershipHandle::always(),
    };

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let task = tokio::spawn(async move {
        run_controllers(client, &config, deps, stop).await.unwrap();
    });
    (shutdown, task)
}

async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn app_pods(pods: &Api<Pod>, app: &str) -> Vec<Pod> {
    pods.list(&ListParams::default().labels(&app_selector(app)))
        .await
        .map(|list| list.items)
        .unwrap_or_default()
}

/// Story: a new FLApp gets one pod per replica and a status report
///
/// Without a peer the app cannot finish pairing, so it settles in
/// `Bootstrapping` or `Pairing` with the Retrying condition set.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_operator_creates_replica_pods_and_reports_status() {
    let _serial = OPERATOR.lock().await;
    let client = ensure_test_cluster().await.unwrap();
    let name = "lifecycle-create";
    cleanup_flapp(&client, name).await;

    let (shutdown, operator) = start_operator(client.clone());
    let apps: Api<FLApp> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let pods: Api<Pod> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    apps.create(&PostParams::default(), &sample_flapp(name, 2))
        .await
        .unwrap();

    wait_for("three replica pods", Duration::from_secs(60), || async {
        app_pods(&pods, name).await.len() == 3
    })
    .await;

    let mut names: Vec<String> = app_pods(&pods, name)
        .await
        .into_iter()
        .filter_map(|p| p.metadata.name)
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            format!("{name}-ps-0"),
            format!("{name}-worker-0"),
            format!("{name}-worker-1"),
        ]
    );

    wait_for("a status report", Duration::from_secs(60), || async {
        apps.get(name)
            .await
            .ok()
            .and_then(|app| app.status)
            .map(|status| !status.replica_status.is_empty())
            .unwrap_or(false)
    })
    .await;
    let status = apps.get(name).await.unwrap().status.unwrap();
    assert!(matches!(
        status.phase,
        FLAppPhase::Bootstrapping | FLAppPhase::Pairing
    ));

    shutdown.cancel();
    operator.await.unwrap();
    cleanup_flapp(&client, name).await;
}

/// Story: a user deletes a replica pod by hand and the operator replaces it
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deleted_pod_is_recreated() {
    let _serial = OPERATOR.lock().await;
    let client = ensure_test_cluster().await.unwrap();
    let name = "lifecycle-recreate";
    cleanup_flapp(&client, name).await;

    let (shutdown, operator) = start_operator(client.clone());
    let apps: Api<FLApp> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let pods: Api<Pod> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    apps.create(&PostParams::default(), &sample_flapp(name, 1))
        .await
        .unwrap();

    let victim = format!("{name}-worker-0");
    wait_for("the worker pod", Duration::from_secs(60), || async {
        pods.get_opt(&victim).await.ok().flatten().is_some()
    })
    .await;
    let original_uid = pods.get(&victim).await.unwrap().metadata.uid;

    pods.delete(&victim, &Default::default()).await.unwrap();

    wait_for("a replacement pod", Duration::from_secs(90), || async {
        match pods.get_opt(&victim).await.ok().flatten() {
            Some(pod) => {
                pod.metadata.uid != original_uid && pod.metadata.deletion_timestamp.is_none()
            }
            None => false,
        }
    })
    .await;

    shutdown.cancel();
    operator.await.unwrap();
    cleanup_flapp(&client, name).await;
}
