//! Service discovery controller
//!
//! Watches FLApp pods and keeps the endpoint registry's local scope equal to
//! the set of ready pods: an entry appears when a pod becomes ready and is
//! revoked when it stops being ready or goes away. In the other direction it
//! mirrors the registry's peer scope into alias Services.
//!
//! When the registry cannot be reached the controller enters a degraded
//! state and stops applying changes. Every tick probes the registry; once it
//! answers again a full resync restores the local scope from the pods it has
//! kept observing in the meantime.

mod alias;

use std::collections::{BTreeMap, BTreeSet};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pods::{ready_address, replica_key};
use crate::registry::{EndpointRegistry, PeerEvent, ReplicaKey};
use crate::Result;

pub use alias::{alias_objects, AliasClient, AliasTarget, KubeAliasClient, ALIAS_LABEL};
#[cfg(test)]
pub use alias::MockAliasClient;

/// Registry entries for every ready FLApp pod in `pods`
pub fn desired_endpoints<'a>(
    pods: impl IntoIterator<Item = &'a Pod>,
) -> BTreeMap<ReplicaKey, String> {
    pods.into_iter()
        .filter_map(|pod| Some((replica_key(pod)?, ready_address(pod)?)))
        .collect()
}

/// Last observed state of a replica pod
#[derive(Clone, Debug, PartialEq, Eq)]
struct TrackedPod {
    key: ReplicaKey,
    address: Option<String>,
}

impl TrackedPod {
    fn from_pod(pod: &Pod) -> Option<Self> {
        Some(Self {
            key: replica_key(pod)?,
            address: ready_address(pod),
        })
    }
}

#[derive(Default)]
struct Observed {
    pods: BTreeMap<String, TrackedPod>,
    /// Pods listed during a watcher (re)list, swapped in on `InitDone`
    relist: Option<BTreeMap<String, TrackedPod>>,
}

impl Observed {
    fn desired(&self) -> BTreeMap<ReplicaKey, String> {
        self.pods
            .values()
            .filter_map(|t| Some((t.key.clone(), t.address.clone()?)))
            .collect()
    }
}

/// Keeps the endpoint registry and peer aliases in step with the cluster
pub struct DiscoveryController {
    registry: Arc<EndpointRegistry>,
    aliases: Arc<dyn AliasClient>,
    namespace: String,
    degraded: AtomicBool,
    observed: Mutex<Observed>,
    applied_aliases: DashMap<String, String>,
}

impl DiscoveryController {
    /// Create a controller for FLApp pods in `namespace`
    pub fn new(
        registry: Arc<EndpointRegistry>,
        aliases: Arc<dyn AliasClient>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            aliases,
            namespace: namespace.into(),
            degraded: AtomicBool::new(false),
            observed: Mutex::new(Observed::default()),
            applied_aliases: DashMap::new(),
        }
    }

    /// Whether registry writes are suspended
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn enter_degraded(&self, error: &crate::Error) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(error = %error, "registry unreachable, suspending endpoint updates");
        }
    }

    /// Apply one pod watch event
    pub async fn handle_event(&self, event: watcher::Event<Pod>) -> Result<()> {
        match event {
            watcher::Event::Init => {
                self.observed.lock().await.relist = Some(BTreeMap::new());
                Ok(())
            }
            watcher::Event::InitApply(pod) => {
                if let Some(tracked) = TrackedPod::from_pod(&pod) {
                    let mut observed = self.observed.lock().await;
                    observed
                        .relist
                        .get_or_insert_with(BTreeMap::new)
                        .insert(pod.name_any(), tracked);
                }
                Ok(())
            }
            watcher::Event::InitDone => {
                {
                    let mut observed = self.observed.lock().await;
                    if let Some(relist) = observed.relist.take() {
                        observed.pods = relist;
                    }
                }
                self.resync().await.map(|_| ())
            }
            watcher::Event::Apply(pod) => self.apply_pod(&pod).await,
            watcher::Event::Delete(pod) => self.delete_pod(&pod).await,
        }
    }

    async fn apply_pod(&self, pod: &Pod) -> Result<()> {
        let Some(tracked) = TrackedPod::from_pod(pod) else {
            return Ok(());
        };
        let previous = self
            .observed
            .lock()
            .await
            .pods
            .insert(pod.name_any(), tracked.clone());
        if self.is_degraded() || previous.as_ref() == Some(&tracked) {
            return Ok(());
        }

        let result = match &tracked.address {
            Some(address) => self.registry.publish(&tracked.key, address).await.map(|_| ()),
            None => self.registry.withdraw(&tracked.key).await.map(|_| ()),
        };
        if let Err(e) = &result {
            self.enter_degraded(e);
        }
        result
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let removed = self.observed.lock().await.pods.remove(&pod.name_any());
        let Some(tracked) = removed.or_else(|| TrackedPod::from_pod(pod)) else {
            return Ok(());
        };
        if self.is_degraded() {
            return Ok(());
        }

        let result = async {
            self.registry.withdraw(&tracked.key).await?;
            self.registry.withdraw_peer(&tracked.key).await?;
            debug!(replica = %tracked.key, "pod deleted, endpoint withdrawn");
            Ok::<(), crate::Error>(())
        }
        .await;
        if let Err(e) = &result {
            self.enter_degraded(e);
        }
        result
    }

    /// Converge the registry to every observed ready pod
    ///
    /// Also drops peer entries of replicas whose pod no longer exists.
    pub async fn resync(&self) -> Result<usize> {
        let (desired, existing): (_, BTreeSet<ReplicaKey>) = {
            let observed = self.observed.lock().await;
            (
                observed.desired(),
                observed.pods.values().map(|t| t.key.clone()).collect(),
            )
        };

        let result = async {
            let report = self.registry.resync(&desired).await?;
            let peers = self.registry.list_peers(&self.namespace, None).await?;
            let mut orphaned = 0;
            for key in peers.keys().filter(|k| !existing.contains(*k)) {
                if self.registry.withdraw_peer(key).await? {
                    orphaned += 1;
                }
            }
            if orphaned > 0 {
                info!(orphaned, "dropped peer entries of deleted pods");
            }
            Ok::<usize, crate::Error>(report.published + report.withdrawn)
        }
        .await;

        match &result {
            Ok(_) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("registry reachable again, endpoint updates resumed");
                }
            }
            Err(e) => self.enter_degraded(e),
        }
        result
    }

    /// Periodic maintenance: lease keep-alive, recovery from degraded state
    pub async fn tick(&self) -> Result<()> {
        if self.is_degraded() {
            if !self.registry.is_reachable().await {
                debug!("registry still unreachable");
                return Ok(());
            }
            self.resync().await?;
            return self.reconcile_aliases().await;
        }

        match self.registry.keep_alive_all().await {
            Ok(0) => Ok(()),
            Ok(lost) => {
                warn!(lost, "registry leases lost, republishing endpoints");
                self.resync().await.map(|_| ())
            }
            Err(e) => {
                self.enter_degraded(&e);
                Err(e)
            }
        }
    }

    /// Converge alias Services to the registry's peer scope
    pub async fn reconcile_aliases(&self) -> Result<()> {
        let peers = self.registry.list_peers(&self.namespace, None).await?;
        let desired: BTreeMap<String, String> = peers
            .into_iter()
            .map(|(key, address)| (key.alias_name(), address))
            .collect();

        // one broken alias must not hold back the others; the first
        // retryable failure is reported once every alias was attempted
        let mut first_error = None;
        let mut note = |name: &str, e: crate::Error| {
            if e.is_retryable() {
                warn!(alias = %name, error = %e, "peer alias not converged");
                first_error.get_or_insert(e);
            } else {
                error!(alias = %name, error = %e, "peer alias cannot be applied, skipping");
            }
        };

        for name in self.aliases.list_aliases().await? {
            if !desired.contains_key(&name) {
                match self.aliases.delete_alias(&name).await {
                    Ok(()) => {
                        self.applied_aliases.remove(&name);
                        debug!(alias = %name, "stale peer alias removed");
                    }
                    Err(e) => note(&name, e),
                }
            }
        }
        for (name, address) in &desired {
            if let Err(e) = self.apply_alias(name, address).await {
                note(name, e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn apply_alias(&self, name: &str, address: &str) -> Result<()> {
        if self.applied_aliases.get(name).is_some_and(|a| a.value() == address) {
            return Ok(());
        }
        self.aliases.apply_alias(name, address).await?;
        self.applied_aliases
            .insert(name.to_string(), address.to_string());
        Ok(())
    }

    /// Apply one change of the registry's peer scope
    pub async fn handle_peer_event(&self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Upsert(key, address) => self.apply_alias(&key.alias_name(), &address).await,
            PeerEvent::Removed(key) => {
                let name = key.alias_name();
                self.aliases.delete_alias(&name).await?;
                self.applied_aliases.remove(&name);
                Ok(())
            }
        }
    }

    /// Drive the controller until `shutdown` fires or the pod stream ends
    pub async fn run<S>(self: Arc<Self>, pods: S, tick_interval: Duration, shutdown: CancellationToken)
    where
        S: Stream<Item = std::result::Result<watcher::Event<Pod>, watcher::Error>> + Send,
    {
        let mut pods = pin!(pods);
        let mut peers = self.watch_peers().await;
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(namespace = %self.namespace, "service discovery started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = pods.next() => match event {
                    Some(Ok(event)) => {
                        if let Err(e) = self.handle_event(event).await {
                            debug!(error = %e, "pod event not applied");
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "pod watch error"),
                    None => break,
                },
                event = next_peer_event(&mut peers) => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_peer_event(event).await {
                            warn!(error = %e, "failed to update peer alias");
                        }
                    }
                    None => peers = None,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        debug!(error = %e, "discovery tick failed");
                    }
                    if peers.is_none() && !self.is_degraded() {
                        peers = self.watch_peers().await;
                        if let Err(e) = self.reconcile_aliases().await {
                            warn!(error = %e, "failed to reconcile peer aliases");
                        }
                    }
                }
            }
        }
        info!("service discovery stopped");
    }

    async fn watch_peers(&self) -> Option<BoxStream<'static, PeerEvent>> {
        match self.registry.watch_peers(&self.namespace).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "cannot watch peer entries, retrying on next tick");
                None
            }
        }
    }
}

async fn next_peer_event(peers: &mut Option<BoxStream<'static, PeerEvent>>) -> Option<PeerEvent> {
    match peers {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
