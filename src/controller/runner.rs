//! Controller runner - wires the FLApp and discovery controllers together
//!
//! Both controllers share one pod watch: its events feed the discovery
//! controller and a reflector store that serves the reconciler's pod reads.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::KubeClusterApi;
use super::flapp::{error_policy, reconcile, Context};
use super::ports::PortAllocator;
use crate::config::OperatorConfig;
use crate::crd::FLApp;
use crate::discovery::{AliasClient, DiscoveryController};
use crate::leader_election::LeadershipHandle;
use crate::pairing::PairingProtocol;
use crate::pods::APP_LABEL;
use crate::registry::EndpointRegistry;
use crate::{Error, Result};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
///
/// The API server closes idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Age below which an allocated port survives a sync without a matching pod
const PORT_SYNC_GRACE: Duration = Duration::from_secs(30);

/// Everything the controllers need besides the Kubernetes client
pub struct ControllerDeps {
    /// Endpoint registry shared with the peer RPC server
    pub registry: Arc<EndpointRegistry>,
    /// Alias Service management
    pub aliases: Arc<dyn AliasClient>,
    /// Pairing rounds against the peer operator
    pub pairing: PairingProtocol,
    /// Leadership gate for every mutation
    pub leadership: LeadershipHandle,
}

fn pod_watcher_config() -> WatcherConfig {
    WatcherConfig::default()
        .labels(APP_LABEL)
        .timeout(WATCH_TIMEOUT_SECS)
}

/// Run the FLApp controller and the discovery controller until `shutdown`
///
/// In-flight reconciliations finish before this returns.
pub async fn run_controllers(
    client: Client,
    config: &OperatorConfig,
    deps: ControllerDeps,
    shutdown: CancellationToken,
) -> Result<()> {
    let namespace = config.namespace.as_str();
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    let (store, writer) = reflector::store();
    let pod_events = watcher::watcher(pods.clone(), pod_watcher_config())
        .default_backoff()
        .reflect(writer);

    let discovery = Arc::new(DiscoveryController::new(
        deps.registry.clone(),
        deps.aliases,
        namespace,
    ));
    let discovery_task = tokio::spawn(discovery.run(
        pod_events,
        config.registry_refresh_interval(),
        shutdown.clone(),
    ));

    store
        .wait_until_ready()
        .await
        .map_err(|e| Error::internal(format!("pod cache never became ready: {e}")))?;
    info!(pods = store.state().len(), "pod cache ready");

    let mut ctx = Context::builder(
        Arc::new(KubeClusterApi::new(client.clone(), store.clone())),
        deps.pairing,
        deps.registry,
    )
    .leadership(deps.leadership)
    .resync_interval(config.resync_interval)
    .max_backoff(config.max_backoff);

    let mut port_sync_task = None;
    if config.assign_worker_port {
        let ports = Arc::new(PortAllocator::new(config.worker_port_range));
        ports.sync(&cached_pods(&store), PORT_SYNC_GRACE);
        info!(
            range = %config.worker_port_range,
            allocated = ports.allocated(),
            "worker port assignment enabled"
        );
        port_sync_task = Some(tokio::spawn(sync_ports(
            ports.clone(),
            store.clone(),
            config.resync_interval,
            shutdown.clone(),
        )));
        ctx = ctx.ports(ports);
    }
    let ctx = Arc::new(ctx.build());

    // graceful_shutdown_on needs a Sync trigger
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        trigger.cancelled().await;
        let _ = stop_tx.send(());
    });

    info!(namespace, workers = config.worker_num, "starting FLApp controller");
    let flapps: Api<FLApp> = Api::namespaced(client, namespace);
    Controller::new(flapps, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(pods, pod_watcher_config())
        .with_config(controller::Config::default().concurrency(config.worker_num))
        .graceful_shutdown_on(stop_rx.map(|_| ()))
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("FLApp"))
        .await;

    shutdown.cancel();
    if let Some(task) = port_sync_task {
        let _ = task.await;
    }
    let _ = discovery_task.await;
    info!("controllers stopped");
    Ok(())
}

fn cached_pods(store: &Store<Pod>) -> Vec<Pod> {
    store.state().iter().map(|pod| (**pod).clone()).collect()
}

/// Periodically release ports of pods that no longer exist
async fn sync_ports(
    ports: Arc<PortAllocator>,
    store: Store<Pod>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let released = ports.sync(&cached_pods(&store), PORT_SYNC_GRACE);
                debug!(released, allocated = ports.allocated(), "port allocations synced");
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Create a closure that logs reconciliation results
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
