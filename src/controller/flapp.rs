//! FLApp reconciliation
//!
//! Every pass recomputes the FLApp from what is observed right now:
//!
//! 1. pods of each replica group are created, replaced or removed until the
//!    group matches its desired count
//! 2. ready replicas of every pairing group are exchanged with the peer and
//!    mapped by ordinal
//! 3. the phase is derived from replica readiness and pairing completeness
//! 4. the status is written only when it changed, conditional on the
//!    resourceVersion the pass started from
//!
//! Nothing is carried over between passes except what the status records.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::client::ClusterApi;
use super::ports::{port_owner, PortAllocator};
use crate::crd::{
    set_condition, Condition, ConditionStatus, FLApp, FLAppPhase, FLAppStatus, Pair, ReplicaSpec,
    ReplicaStatus, ReplicaType,
};
use crate::leader_election::LeadershipHandle;
use crate::pairing::{ordinal, sort_by_ordinal, PairingProtocol, PeerEndpoint};
use crate::pods::{build_pod, index_pods, pod_port, pod_state, template_port, PodState};
use crate::registry::{EndpointRegistry, ReplicaKey};
use crate::retry::BackoffTracker;
use crate::{Error, ErrorClass, Result};

/// First requeue delay after a failed pass
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Condition set while transient errors keep the FLApp from converging
pub const CONDITION_RETRYING: &str = "Retrying";
/// Condition describing an invalid FLApp spec
pub const CONDITION_SPEC_VALID: &str = "SpecValid";

/// Shared state for FLApp reconciliation
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(cluster, pairing, registry)
///     .ports(allocator)
///     .leadership(handle)
///     .build();
/// ```
pub struct Context {
    /// Cluster reads and writes (trait object for testability)
    pub cluster: Arc<dyn ClusterApi>,
    /// Pairing rounds against the peer operator
    pub pairing: PairingProtocol,
    /// Endpoint registry holding local and mirrored peer addresses
    pub registry: Arc<EndpointRegistry>,
    /// Port allocator, present when replica ports are assigned
    pub ports: Option<Arc<PortAllocator>>,
    /// Whether this instance may mutate cluster state
    pub leadership: LeadershipHandle,
    /// Consecutive failures per FLApp
    pub backoff: BackoffTracker,
    /// Requeue interval of healthy FLApps
    pub resync_interval: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        cluster: Arc<dyn ClusterApi>,
        pairing: PairingProtocol,
        registry: Arc<EndpointRegistry>,
    ) -> ContextBuilder {
        ContextBuilder {
            cluster,
            pairing,
            registry,
            ports: None,
            leadership: LeadershipHandle::always(),
            resync_interval: Duration::from_secs(crate::DEFAULT_RESYNC_INTERVAL_SECS),
            max_backoff: Duration::from_secs(crate::DEFAULT_MAX_BACKOFF_SECS),
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        cluster: Arc<dyn ClusterApi>,
        peer: Arc<dyn crate::pairing::PeerClient>,
        registry: Arc<EndpointRegistry>,
    ) -> Self {
        Self::builder(cluster, PairingProtocol::new(peer), registry).build()
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.leadership.is_leader() {
            Ok(())
        } else {
            Err(Error::NotLeader)
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    cluster: Arc<dyn ClusterApi>,
    pairing: PairingProtocol,
    registry: Arc<EndpointRegistry>,
    ports: Option<Arc<PortAllocator>>,
    leadership: LeadershipHandle,
    resync_interval: Duration,
    max_backoff: Duration,
}

impl ContextBuilder {
    /// Assign replica ports from `allocator`
    pub fn ports(mut self, allocator: Arc<PortAllocator>) -> Self {
        self.ports = Some(allocator);
        self
    }

    /// Gate mutations on `leadership`
    pub fn leadership(mut self, leadership: LeadershipHandle) -> Self {
        self.leadership = leadership;
        self
    }

    /// Requeue interval of healthy FLApps
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Ceiling of the retry backoff
    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            cluster: self.cluster,
            pairing: self.pairing,
            registry: self.registry,
            ports: self.ports,
            leadership: self.leadership,
            backoff: BackoffTracker::new(INITIAL_BACKOFF, self.max_backoff),
            resync_interval: self.resync_interval,
        }
    }
}

/// Observation of one replica group after its pods were synced
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupView {
    /// Desired replica count
    pub desired: usize,
    /// Ready replicas
    pub ready: usize,
    /// Replicas that completed successfully
    pub succeeded: usize,
    /// Restart budget spent with a failed pod left over
    pub exhausted: bool,
    /// Whether the group pairs with the peer
    pub pairs: bool,
}

impl GroupView {
    fn healthy(&self) -> bool {
        self.ready + self.succeeded == self.desired
    }
}

/// Derive the phase from group observations and their pairing
pub fn compute_phase(
    groups: &BTreeMap<ReplicaType, GroupView>,
    pairs: &BTreeMap<ReplicaType, Pair>,
) -> FLAppPhase {
    if groups.values().any(|g| g.exhausted) {
        return FLAppPhase::Failed;
    }

    let finished = |g: &GroupView| g.desired > 0 && g.succeeded == g.desired;
    let succeeded = match groups.get(&ReplicaType::worker()) {
        Some(worker) if worker.desired > 0 => finished(worker),
        _ => {
            groups.values().any(|g| g.desired > 0)
                && groups.values().all(|g| g.desired == 0 || finished(g))
        }
    };
    if succeeded {
        return FLAppPhase::Succeeded;
    }

    if !groups.values().all(GroupView::healthy) {
        return FLAppPhase::Bootstrapping;
    }
    let paired = groups.iter().filter(|(_, g)| g.pairs).all(|(rt, g)| {
        pairs
            .get(rt)
            .is_some_and(|pair| pair.is_fully_paired(g.ready))
    });
    if paired {
        FLAppPhase::Running
    } else {
        FLAppPhase::Pairing
    }
}

/// Condition type recording a terminal problem with one replica group
pub fn spec_error_condition(replica_type: &ReplicaType) -> String {
    let camel: String = replica_type
        .as_str()
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    format!("{camel}SpecError")
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// State of one reconciliation pass
struct Pass<'a> {
    app: &'a FLApp,
    ctx: &'a Context,
    namespace: String,
    name: String,
    status: FLAppStatus,
    transient: Option<Error>,
    /// Failed pods to delete once their restart is on record
    replacements: Vec<Pod>,
}

impl<'a> Pass<'a> {
    fn key(&self, replica_type: &ReplicaType, index: u32) -> ReplicaKey {
        ReplicaKey::new(&self.namespace, &self.name, replica_type.clone(), index)
    }

    fn record_transient(&mut self, error: Error) {
        warn!(error = %error, "transient error, will retry");
        if self.transient.is_none() {
            self.transient = Some(error);
        }
    }

    /// Run a mutation, aborting the pass when leadership is gone
    fn check_mutation(&mut self, result: Result<()>) -> Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(Error::NotLeader) => Err(Error::NotLeader),
            Err(e) => {
                self.record_transient(e);
                Ok(false)
            }
        }
    }

    fn release_port(&self, pod_name: &str) {
        if let Some(ports) = &self.ctx.ports {
            ports.release(&port_owner(&self.namespace, pod_name));
        }
    }

    async fn delete_pod(&mut self, pod: &Pod) -> Result<bool> {
        let pod_name = pod.name_any();
        let result = match self.ctx.ensure_leader() {
            Ok(()) => self.ctx.cluster.delete_pod(&self.namespace, &pod_name).await,
            Err(e) => Err(e),
        };
        let deleted = self.check_mutation(result)?;
        if deleted {
            self.release_port(&pod_name);
            self.status.assigned_ports.remove(&pod_name);
            debug!(pod = %pod_name, "pod deleted");
        }
        Ok(deleted)
    }

    async fn create_replica(&mut self, spec: &ReplicaSpec, key: &ReplicaKey) -> Result<()> {
        self.ctx.ensure_leader()?;
        let pod_name = key.pod_name();
        let (port, allocated) = match &self.ctx.ports {
            Some(ports) => (ports.allocate(&port_owner(&self.namespace, &pod_name))?, true),
            None => (template_port(spec), false),
        };

        let result: Result<()> = async {
            let pod = build_pod(self.app, key, spec, port, allocated)?;
            self.ctx.cluster.create_pod(&self.namespace, &pod).await
        }
        .await;

        match result {
            Ok(()) => {
                if allocated {
                    self.status.assigned_ports.insert(pod_name.clone(), port);
                }
                info!(pod = %pod_name, port, "replica pod created");
                Ok(())
            }
            Err(e) => {
                self.release_port(&pod_name);
                Err(e)
            }
        }
    }

    /// Bring one group's pods to its desired count
    async fn sync_group(
        &mut self,
        replica_type: &ReplicaType,
        spec: &ReplicaSpec,
        pods: &BTreeMap<u32, &Pod>,
    ) -> Result<(GroupView, BTreeSet<u32>)> {
        let desired = spec.desired();
        let mut replaced = self
            .status
            .replica_status
            .get(replica_type)
            .map(|s| s.replaced_pods.clone())
            .unwrap_or_default();
        let mut view = GroupView {
            desired,
            pairs: spec.needs_pairing(replica_type),
            ..Default::default()
        };
        let mut counters = ReplicaStatus {
            desired: count(desired),
            ..Default::default()
        };
        let mut ready = BTreeSet::new();

        let condition_type = spec_error_condition(replica_type);
        let blocked = self
            .status
            .get_condition(&condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
            && self.status.observed_generation == self.app.metadata.generation;

        if let Err(e) = spec.validate(replica_type) {
            self.mark_group_invalid(replica_type, &e);
            counters.restarts = count(replaced.len());
            counters.replaced_pods = replaced;
            self.status.replica_status.insert(replica_type.clone(), counters);
            return Ok((view, ready));
        }

        for (&index, pod) in pods {
            if index as usize >= desired {
                self.delete_pod(pod).await?;
                continue;
            }
            if let Some(port) = pod_port(pod).filter(|_| self.ctx.ports.is_some()) {
                self.status.assigned_ports.insert(pod.name_any(), port);
            }
            match pod_state(pod) {
                PodState::Ready => {
                    counters.active += 1;
                    counters.ready += 1;
                    ready.insert(index);
                }
                PodState::Pending | PodState::NotReady => counters.active += 1,
                PodState::Terminating => {}
                PodState::Succeeded => counters.succeeded += 1,
                PodState::Failed => {
                    counters.failed += 1;
                    let uid = pod.metadata.uid.clone().unwrap_or_else(|| pod.name_any());
                    if replaced.contains(&uid) {
                        // counted by an earlier pass whose delete did not go through
                        self.replacements.push((*pod).clone());
                    } else if count(replaced.len()) < spec.restart_limit() {
                        replaced.push(uid);
                        info!(
                            pod = %pod.name_any(),
                            restarts = replaced.len(),
                            "replacing failed replica"
                        );
                        self.replacements.push((*pod).clone());
                    } else {
                        view.exhausted = true;
                    }
                }
            }
        }
        counters.restarts = count(replaced.len());
        counters.replaced_pods = replaced;

        if !blocked && !view.exhausted {
            let missing: Vec<u32> = (0..desired as u32)
                .filter(|i| !pods.contains_key(i))
                .collect();
            let mut rejected = None;
            for index in missing {
                let key = self.key(replica_type, index);
                match self.create_replica(spec, &key).await {
                    Ok(()) => {}
                    Err(Error::NotLeader) => return Err(Error::NotLeader),
                    Err(e) if e.class() == ErrorClass::Spec => {
                        rejected = Some(e);
                        break;
                    }
                    Err(e) => self.record_transient(e),
                }
            }
            match rejected {
                Some(e) => self.mark_group_invalid(replica_type, &e),
                None => self.clear_group_error(replica_type),
            }
        }

        view.ready = ready.len();
        view.succeeded = counters.succeeded as usize;
        self.status
            .replica_status
            .insert(replica_type.clone(), counters);
        Ok((view, ready))
    }

    fn mark_group_invalid(&mut self, replica_type: &ReplicaType, error: &Error) {
        error!(%replica_type, error = %error, "replica group cannot be created");
        set_condition(
            &mut self.status.conditions,
            Condition::new(
                spec_error_condition(replica_type),
                ConditionStatus::True,
                "PodCreationRejected",
                error.to_string(),
            ),
        );
    }

    fn clear_group_error(&mut self, replica_type: &ReplicaType) {
        let condition_type = spec_error_condition(replica_type);
        if self.status.get_condition(&condition_type).is_some() {
            set_condition(
                &mut self.status.conditions,
                Condition::new(condition_type, ConditionStatus::False, "PodsCreated", ""),
            );
        }
    }

    /// Ready local endpoints of a group, as published in the registry
    async fn local_endpoints(
        &mut self,
        replica_type: &ReplicaType,
        ready: &BTreeSet<u32>,
    ) -> Option<Vec<(ReplicaKey, String)>> {
        match self
            .ctx
            .registry
            .list_group(&self.namespace, &self.name, replica_type)
            .await
        {
            Ok(entries) => Some(
                entries
                    .into_iter()
                    .filter(|(key, _)| ready.contains(&key.index))
                    .collect(),
            ),
            Err(e) => {
                self.record_transient(e);
                None
            }
        }
    }

    async fn pair_group(
        &mut self,
        replica_type: &ReplicaType,
        local: Vec<(ReplicaKey, String)>,
    ) -> Result<()> {
        let endpoints: Vec<PeerEndpoint> = local
            .iter()
            .map(|(key, address)| PeerEndpoint::new(key.identifier(), address.clone()))
            .collect();
        let previous = self.status.pair_status.get(replica_type).cloned();

        match self
            .ctx
            .pairing
            .pair(&self.name, replica_type, previous.as_ref(), endpoints)
            .await
        {
            Ok(pair) => {
                self.mirror_peers(replica_type, &pair).await?;
                self.status.pair_status.insert(replica_type.clone(), pair);
            }
            Err(e) => {
                if previous.is_none() {
                    let mut ids: Vec<String> = local.iter().map(|(k, _)| k.identifier()).collect();
                    sort_by_ordinal(&mut ids);
                    self.status.pair_status.insert(
                        replica_type.clone(),
                        Pair {
                            local: ids,
                            ..Default::default()
                        },
                    );
                }
                self.record_transient(e);
            }
        }
        Ok(())
    }

    /// Record agreed remote addresses in the registry's peer scope
    async fn mirror_peers(&mut self, replica_type: &ReplicaType, pair: &Pair) -> Result<()> {
        let mapped: Vec<(ReplicaKey, &String)> = pair
            .mapping
            .iter()
            .filter_map(|(id, address)| Some((self.key(replica_type, ordinal(id)?), address)))
            .collect();
        let keep: BTreeSet<ReplicaKey> = mapped.iter().map(|(k, _)| k.clone()).collect();

        let result = async {
            self.ctx.ensure_leader()?;
            for (key, address) in &mapped {
                self.ctx.registry.publish_peer(key, address).await?;
            }
            self.ctx
                .registry
                .prune_peers(&self.namespace, &self.name, replica_type, &keep)
                .await?;
            Ok::<(), Error>(())
        }
        .await;
        self.check_mutation(result).map(|_| ())
    }

    /// Stop everything left running once the FLApp finished
    async fn clean_up(
        &mut self,
        groups: &BTreeMap<ReplicaType, BTreeMap<u32, &Pod>>,
    ) -> Result<()> {
        for pods in groups.values() {
            for pod in pods.values() {
                if pod_state(pod).is_active() {
                    self.delete_pod(pod).await?;
                }
            }
        }
        let pairing_groups: Vec<ReplicaType> = self.status.pair_status.keys().cloned().collect();
        for replica_type in pairing_groups {
            let result = async {
                self.ctx.ensure_leader()?;
                self.ctx
                    .registry
                    .prune_peers(&self.namespace, &self.name, &replica_type, &BTreeSet::new())
                    .await?;
                Ok::<(), Error>(())
            }
            .await;
            self.check_mutation(result)?;
        }
        Ok(())
    }
}

/// Reconcile an FLApp
///
/// Returns the requeue action of a converged pass. Transient errors are
/// recorded on the status and then returned so [`error_policy`] backs off.
#[instrument(skip(app, ctx), fields(app = %app.name_any()))]
pub async fn reconcile(app: Arc<FLApp>, ctx: Arc<Context>) -> Result<Action> {
    let name = app.name_any();
    let namespace = app
        .namespace()
        .unwrap_or_else(|| crate::DEFAULT_NAMESPACE.to_string());
    let backoff_key = format!("{namespace}/{name}");
    let current = app.status.clone().unwrap_or_default();

    if current.phase.is_terminal() {
        debug!(phase = %current.phase, "FLApp finished");
        return Ok(Action::await_change());
    }

    if let Err(e) = app.spec.validate() {
        warn!(error = %e, "FLApp spec invalid");
        let mut status = current
            .clone()
            .phase(FLAppPhase::Failed)
            .message(e.to_string())
            .condition(Condition::new(
                CONDITION_SPEC_VALID,
                ConditionStatus::False,
                "ValidationFailed",
                e.to_string(),
            ));
        status.observed_generation = app.metadata.generation;
        return match write_status(&app, &current, &status, &ctx).await {
            Err(e) if e.class() == ErrorClass::Conflict => Ok(Action::requeue(ctx.resync_interval)),
            other => other.map(|_| Action::await_change()),
        };
    }

    let pods = ctx.cluster.list_app_pods(&namespace, &name).await?;
    let indexed = index_pods(&pods);
    let desired_groups = app.spec.replica_groups();

    let mut pass = Pass {
        app: &app,
        ctx: &ctx,
        namespace,
        name,
        status: current.clone(),
        transient: None,
        replacements: Vec::new(),
    };
    // rebuilt from the pods seen in this pass
    pass.status.assigned_ports.clear();

    for (replica_type, group_pods) in &indexed {
        if !desired_groups.contains_key(replica_type) {
            info!(%replica_type, "replica group removed from spec, deleting its pods");
            for pod in group_pods.values() {
                pass.delete_pod(pod).await?;
            }
        }
    }

    let empty = BTreeMap::new();
    let mut views = BTreeMap::new();
    for (replica_type, spec) in &desired_groups {
        let group_pods = indexed.get(replica_type).unwrap_or(&empty);
        let (view, ready) = pass.sync_group(replica_type, spec, group_pods).await?;

        let needs_endpoints = view.pairs || *replica_type == ReplicaType::ps();
        if needs_endpoints {
            if let Some(local) = pass.local_endpoints(replica_type, &ready).await {
                if *replica_type == ReplicaType::ps() {
                    pass.status.ps_address = local.iter().map(|(_, a)| a.clone()).collect();
                }
                if view.pairs {
                    pass.pair_group(replica_type, local).await?;
                }
            }
        }
        views.insert(replica_type.clone(), view);
    }

    let status = &mut pass.status;
    status
        .replica_status
        .retain(|rt, _| desired_groups.contains_key(rt));
    status
        .pair_status
        .retain(|rt, _| views.get(rt).is_some_and(|v| v.pairs));
    if !desired_groups.contains_key(&ReplicaType::ps()) {
        status.ps_address.clear();
    }

    let phase = compute_phase(&views, &pass.status.pair_status);
    if phase.is_terminal() {
        info!(%phase, "FLApp finished, cleaning up");
        pass.clean_up(&indexed).await?;
        for pods in indexed.values() {
            for pod in pods.values() {
                pass.release_port(&pod.name_any());
            }
        }
        pass.status.assigned_ports.clear();
        pass.replacements.clear();
        let condition = match phase {
            FLAppPhase::Succeeded => Condition::new(
                "Succeeded",
                ConditionStatus::True,
                "ReplicasSucceeded",
                "all replicas completed",
            ),
            _ => Condition::new(
                "Failed",
                ConditionStatus::True,
                "RestartLimitExceeded",
                "a replica group exhausted its restart budget",
            ),
        };
        set_condition(&mut pass.status.conditions, condition);
    }

    match &pass.transient {
        Some(e) => set_condition(
            &mut pass.status.conditions,
            Condition::new(
                CONDITION_RETRYING,
                ConditionStatus::True,
                "TransientError",
                e.to_string(),
            ),
        ),
        None => {
            if pass.status.get_condition(CONDITION_RETRYING).is_some() {
                set_condition(
                    &mut pass.status.conditions,
                    Condition::new(CONDITION_RETRYING, ConditionStatus::False, "Converged", ""),
                );
            }
        }
    }
    pass.status.phase = phase.clone();
    pass.status.message = Some(phase_message(&phase).to_string());
    pass.status.observed_generation = app.metadata.generation;

    match write_status(&app, &current, &pass.status, &ctx).await {
        Ok(_) => {}
        Err(e) if e.class() == ErrorClass::Conflict => {
            debug!(error = %e, "status changed concurrently, waiting for the next notification");
            return Ok(Action::requeue(ctx.resync_interval));
        }
        Err(e) => return Err(e),
    }

    // failed pods go only after the restart counting them is written
    for failed in std::mem::take(&mut pass.replacements) {
        pass.delete_pod(&failed).await?;
    }

    if let Some(e) = pass.transient {
        return Err(e);
    }
    ctx.backoff.reset(&backoff_key);
    if phase.is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(ctx.resync_interval))
    }
}

fn phase_message(phase: &FLAppPhase) -> &'static str {
    match phase {
        FLAppPhase::Created => "FLApp created",
        FLAppPhase::Bootstrapping => "waiting for replicas to become ready",
        FLAppPhase::Pairing => "waiting for the peer to pair every replica",
        FLAppPhase::Running => "all replicas ready and paired",
        FLAppPhase::Succeeded => "training completed",
        FLAppPhase::Failed => "training failed",
    }
}

/// Write `status` when it differs from `current`; returns whether it wrote
async fn write_status(
    app: &FLApp,
    current: &FLAppStatus,
    status: &FLAppStatus,
    ctx: &Context,
) -> Result<bool> {
    if status == current {
        return Ok(false);
    }
    ctx.ensure_leader()?;
    ctx.cluster.update_status(app, status).await?;
    if status.phase != current.phase {
        info!(from = %current.phase, to = %status.phase, "FLApp phase changed");
    }
    Ok(true)
}

/// Error policy for the FLApp controller
///
/// Retryable errors requeue with per-FLApp exponential backoff; spec errors
/// wait for the next change of the resource.
pub fn error_policy(app: Arc<FLApp>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = format!(
        "{}/{}",
        app.namespace().unwrap_or_default(),
        app.name_any()
    );
    match error.class() {
        ErrorClass::Spec | ErrorClass::Fatal => {
            error!(error = %error, app = %key, "reconciliation failed permanently");
            Action::await_change()
        }
        ErrorClass::Conflict => {
            debug!(error = %error, app = %key, "reconciliation conflicted");
            Action::requeue(ctx.resync_interval)
        }
        ErrorClass::Transient | ErrorClass::Protocol => {
            let delay = ctx.backoff.next_delay(&key);
            warn!(
                error = %error,
                app = %key,
                failures = ctx.backoff.failures(&key),
                delay_ms = delay.as_millis() as u64,
                "reconciliation failed, backing off"
            );
            Action::requeue(delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::MockClusterApi;
    use crate::crd::FLAppSpec;
    use crate::pairing::{MockPeerClient, PairResponse};
    use crate::pods::testing::{pod, ready_pod};
    use crate::registry::MemoryStore;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use rstest::rstest;
    use std::sync::Mutex;

    const RESYNC: Duration = Duration::from_secs(30);

    fn replica_spec(replicas: i32) -> ReplicaSpec {
        ReplicaSpec {
            replicas,
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "main".to_string(),
                        image: Some("trainer".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }

    fn flapp(spec: FLAppSpec, status: Option<FLAppStatus>) -> Arc<FLApp> {
        let mut app = FLApp::new("mnist", spec);
        app.metadata.namespace = Some("default".to_string());
        app.metadata.uid = Some("uid-1".to_string());
        app.metadata.generation = Some(1);
        app.metadata.resource_version = Some("100".to_string());
        app.status = status;
        Arc::new(app)
    }

    fn workers(replicas: i32) -> FLAppSpec {
        FLAppSpec {
            worker: Some(replica_spec(replicas)),
            ..Default::default()
        }
    }

    fn worker(index: u32) -> ReplicaKey {
        ReplicaKey::new("default", "mnist", ReplicaType::worker(), index)
    }

    fn registry() -> Arc<EndpointRegistry> {
        Arc::new(EndpointRegistry::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(10),
        ))
    }

    /// Cluster mock serving `pods` and capturing status writes
    fn cluster(pods: Vec<Pod>, written: Arc<Mutex<Vec<FLAppStatus>>>) -> MockClusterApi {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list_app_pods()
            .returning(move |_, _| Ok(pods.clone()));
        cluster.expect_update_status().returning(move |_, status| {
            written.lock().unwrap().push(status.clone());
            Ok(())
        });
        cluster
    }

    fn peer_reporting(addresses: Vec<(&'static str, &'static str)>) -> MockPeerClient {
        let mut peer = MockPeerClient::new();
        peer.expect_exchange().returning(move |request| {
            Ok(PairResponse {
                app: request.app.clone(),
                replica_type: request.replica_type.clone(),
                local: addresses
                    .iter()
                    .map(|(id, addr)| PeerEndpoint::new(*id, *addr))
                    .collect(),
            })
        });
        peer
    }

    fn unreachable_peer() -> MockPeerClient {
        let mut peer = MockPeerClient::new();
        peer.expect_exchange()
            .returning(|_| Err(Error::pairing("connection refused")));
        peer
    }

    async fn publish_ready(registry: &EndpointRegistry, indices: &[u32]) {
        for &i in indices {
            registry
                .publish(&worker(i), &format!("10.0.0.{}:{}", i + 1, 10000 + i))
                .await
                .unwrap();
        }
    }

    fn last(written: &Arc<Mutex<Vec<FLAppStatus>>>) -> FLAppStatus {
        written.lock().unwrap().last().cloned().expect("status written")
    }

    #[rstest]
    #[case::worker("worker", "WorkerSpecError")]
    #[case::ps("ps", "PsSpecError")]
    #[case::custom("embedding-server", "EmbeddingServerSpecError")]
    fn spec_error_condition_is_camel_case(#[case] rt: &str, #[case] expected: &str) {
        assert_eq!(spec_error_condition(&ReplicaType::new(rt)), expected);
    }

    fn view(desired: usize, ready: usize, succeeded: usize, pairs: bool) -> GroupView {
        GroupView {
            desired,
            ready,
            succeeded,
            exhausted: false,
            pairs,
        }
    }

    fn paired(n: usize) -> Pair {
        let ids: Vec<String> = (0..n).map(|i| format!("worker-{i}")).collect();
        Pair {
            local: ids.clone(),
            remote: ids.clone(),
            mapping: ids.iter().map(|id| (id.clone(), format!("{id}:1"))).collect(),
        }
    }

    #[rstest]
    #[case::not_ready(view(2, 1, 0, true), Some(paired(1)), FLAppPhase::Bootstrapping)]
    #[case::ready_unpaired(view(2, 2, 0, true), Some(paired(1)), FLAppPhase::Pairing)]
    #[case::ready_paired(view(2, 2, 0, true), Some(paired(2)), FLAppPhase::Running)]
    #[case::partly_done(view(2, 1, 1, true), Some(paired(1)), FLAppPhase::Running)]
    #[case::all_done(view(2, 0, 2, true), None, FLAppPhase::Succeeded)]
    #[case::no_pairing_needed(view(2, 2, 0, false), None, FLAppPhase::Running)]
    fn phase_follows_readiness_and_pairing(
        #[case] worker_view: GroupView,
        #[case] pair: Option<Pair>,
        #[case] expected: FLAppPhase,
    ) {
        let groups = BTreeMap::from([(ReplicaType::worker(), worker_view)]);
        let pairs: BTreeMap<_, _> = pair
            .into_iter()
            .map(|p| (ReplicaType::worker(), p))
            .collect();
        assert_eq!(compute_phase(&groups, &pairs), expected);
    }

    #[test]
    fn exhausted_group_fails_the_app_and_workers_decide_success() {
        let mut groups = BTreeMap::from([
            (ReplicaType::worker(), view(1, 0, 1, true)),
            (ReplicaType::ps(), view(1, 1, 0, true)),
        ]);
        // ps still running does not hold back success
        assert_eq!(compute_phase(&groups, &BTreeMap::new()), FLAppPhase::Succeeded);

        groups.get_mut(&ReplicaType::ps()).unwrap().exhausted = true;
        assert_eq!(compute_phase(&groups, &BTreeMap::new()), FLAppPhase::Failed);
    }

    /// Story: a fresh FLApp with two workers and no answer from the peer yet.
    /// Both pods are created, the phase is Bootstrapping and the worker
    /// pairing is recorded with an empty mapping.
    #[tokio::test]
    async fn story_new_flapp_bootstraps_without_peer() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut cluster = cluster(vec![], written.clone());
        let created = Arc::new(Mutex::new(Vec::new()));
        let created_in_mock = created.clone();
        cluster.expect_create_pod().times(2).returning(move |_, pod| {
            created_in_mock.lock().unwrap().push(pod.name_any());
            Ok(())
        });
        let ctx = Arc::new(Context::for_testing(
            Arc::new(cluster),
            Arc::new(unreachable_peer()),
            registry(),
        ));

        let result = reconcile(flapp(workers(2), None), ctx).await;
        assert!(result.unwrap_err().is_retryable());

        assert_eq!(
            *created.lock().unwrap(),
            vec!["mnist-worker-0".to_string(), "mnist-worker-1".to_string()]
        );
        let status = last(&written);
        assert_eq!(status.phase, FLAppPhase::Bootstrapping);
        assert!(status.pair_status[&ReplicaType::worker()].mapping.is_empty());
        assert_eq!(
            status.get_condition(CONDITION_RETRYING).map(|c| &c.status),
            Some(&ConditionStatus::True)
        );
    }

    /// Story: both sides report worker-0 and worker-1 ready. The mapping
    /// pairs them by ordinal, the FLApp goes Running and the remote addresses
    /// are mirrored into the registry for alias resolution.
    #[tokio::test]
    async fn story_both_sides_ready_runs() {
        let registry = registry();
        publish_ready(&registry, &[0, 1]).await;
        let written = Arc::new(Mutex::new(Vec::new()));
        let cluster = cluster(vec![ready_pod(&worker(0)), ready_pod(&worker(1))], written.clone());
        let peer = peer_reporting(vec![("worker-0", "peer-0:5000"), ("worker-1", "peer-1:5000")]);
        let ctx = Arc::new(Context::for_testing(
            Arc::new(cluster),
            Arc::new(peer),
            registry.clone(),
        ));

        let action = reconcile(flapp(workers(2), None), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(RESYNC));

        let status = last(&written);
        assert_eq!(status.phase, FLAppPhase::Running);
        assert_eq!(
            status.pair_status[&ReplicaType::worker()].mapping,
            BTreeMap::from([
                ("worker-0".to_string(), "peer-0:5000".to_string()),
                ("worker-1".to_string(), "peer-1:5000".to_string()),
            ])
        );
        let peers = registry.list_peers("default", Some("mnist")).await.unwrap();
        assert_eq!(peers[&worker(1)], "peer-1:5000");
    }

    /// Story: worker-0 crashes after pairing. Its registry entry is gone, so
    /// the next round only offers worker-1, which keeps its partner. The
    /// failed pod is replaced within the restart budget.
    #[tokio::test]
    async fn story_crashed_worker_is_replaced_and_survivor_stays_paired() {
        let registry = registry();
        publish_ready(&registry, &[1]).await;
        let previous = FLAppStatus {
            phase: FLAppPhase::Running,
            pair_status: BTreeMap::from([(ReplicaType::worker(), paired_with_addrs())]),
            observed_generation: Some(1),
            ..Default::default()
        };

        let written = Arc::new(Mutex::new(Vec::new()));
        let crashed = pod(&worker(0), "Failed", false, Some("10.0.0.1"));
        let mut cluster = cluster(vec![crashed, ready_pod(&worker(1))], written.clone());
        cluster
            .expect_delete_pod()
            .withf(|_, name| name == "mnist-worker-0")
            .times(1)
            .returning(|_, _| Ok(()));
        let peer = peer_reporting(vec![("worker-0", "peer-0:5000"), ("worker-1", "peer-1:5000")]);
        let ctx = Arc::new(Context::for_testing(
            Arc::new(cluster),
            Arc::new(peer),
            registry,
        ));

        reconcile(flapp(workers(2), Some(previous)), ctx).await.unwrap();

        let status = last(&written);
        let pair = &status.pair_status[&ReplicaType::worker()];
        assert_eq!(pair.local, vec!["worker-1".to_string()]);
        assert_eq!(
            pair.mapping,
            BTreeMap::from([("worker-1".to_string(), "peer-1:5000".to_string())])
        );
        assert_eq!(status.replica_status[&ReplicaType::worker()].restarts, 1);
        assert_eq!(status.phase, FLAppPhase::Bootstrapping);
    }

    fn crashed_worker_pods() -> Vec<Pod> {
        vec![pod(&worker(0), "Failed", false, None), ready_pod(&worker(1))]
    }

    /// Story: worker-0 fails while its status write keeps losing races, and
    /// the first delete that follows does not go through. The pod is counted
    /// as one restart no matter how many passes see it.
    #[tokio::test]
    async fn story_failed_pod_is_counted_once_across_dropped_writes() {
        let peer = || {
            Arc::new(peer_reporting(vec![
                ("worker-0", "peer-0:5000"),
                ("worker-1", "peer-1:5000"),
            ]))
        };

        // the write conflicts: the failed pod stays until its restart is recorded
        let mut racing = MockClusterApi::new();
        racing
            .expect_list_app_pods()
            .returning(|_, _| Ok(crashed_worker_pods()));
        racing
            .expect_update_status()
            .times(1)
            .returning(|_, _| Err(Error::conflict("resourceVersion 100 is stale")));
        racing.expect_delete_pod().never();
        let ctx = Arc::new(Context::for_testing(Arc::new(racing), peer(), registry()));
        reconcile(flapp(workers(2), None), ctx).await.unwrap();

        // the write lands, the delete fails
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut flaky = cluster(crashed_worker_pods(), written.clone());
        flaky
            .expect_delete_pod()
            .times(1)
            .returning(|_, _| Err(Error::internal("connection reset")));
        let ctx = Arc::new(Context::for_testing(Arc::new(flaky), peer(), registry()));
        assert!(reconcile(flapp(workers(2), None), ctx).await.is_err());
        let recorded = last(&written);
        let group = &recorded.replica_status[&ReplicaType::worker()];
        assert_eq!(group.restarts, 1);
        assert_eq!(group.replaced_pods, vec!["mnist-worker-0-uid".to_string()]);

        // the same pod is seen again: deleted, not counted twice
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut healthy = cluster(crashed_worker_pods(), written.clone());
        healthy
            .expect_delete_pod()
            .withf(|_, name| name == "mnist-worker-0")
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = Arc::new(Context::for_testing(Arc::new(healthy), peer(), registry()));
        reconcile(flapp(workers(2), Some(recorded)), ctx)
            .await
            .unwrap();
        for status in written.lock().unwrap().iter() {
            assert_eq!(status.replica_status[&ReplicaType::worker()].restarts, 1);
        }
    }

    fn paired_with_addrs() -> Pair {
        Pair {
            local: vec!["worker-0".into(), "worker-1".into()],
            remote: vec!["worker-0".into(), "worker-1".into()],
            mapping: BTreeMap::from([
                ("worker-0".to_string(), "peer-0:5000".to_string()),
                ("worker-1".to_string(), "peer-1:5000".to_string()),
            ]),
        }
    }

    /// Story: the status write hits a stale resourceVersion. The pass makes
    /// no other mutation and the key is requeued instead of retried blindly.
    #[tokio::test]
    async fn story_stale_status_write_is_dropped_and_requeued() {
        let registry = registry();
        publish_ready(&registry, &[0]).await;
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list_app_pods()
            .returning(|_, _| Ok(vec![ready_pod(&worker(0))]));
        cluster
            .expect_update_status()
            .times(1)
            .returning(|_, _| Err(Error::conflict("resourceVersion 100 is stale")));
        cluster.expect_create_pod().never();
        cluster.expect_delete_pod().never();
        let peer = peer_reporting(vec![("worker-0", "peer-0:5000")]);
        let ctx = Arc::new(Context::for_testing(
            Arc::new(cluster),
            Arc::new(peer),
            registry,
        ));

        let action = reconcile(flapp(workers(1), None), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(RESYNC));
        assert_eq!(ctx.backoff.failures("default/mnist"), 0);
    }

    /// Story: a second pass over an unchanged world changes nothing.
    #[tokio::test]
    async fn story_second_pass_is_a_no_op() {
        let registry = registry();
        publish_ready(&registry, &[0, 1]).await;
        let pods = vec![ready_pod(&worker(0)), ready_pod(&worker(1))];
        let peer = Arc::new(peer_reporting(vec![("worker-0", "peer-0:5000"), ("worker-1", "peer-1:5000")]));

        let written = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(Context::for_testing(
            Arc::new(cluster(pods.clone(), written.clone())),
            peer.clone(),
            registry.clone(),
        ));
        reconcile(flapp(workers(2), None), first).await.unwrap();
        let converged = last(&written);

        let mut quiet = MockClusterApi::new();
        quiet
            .expect_list_app_pods()
            .returning(move |_, _| Ok(pods.clone()));
        quiet.expect_update_status().never();
        quiet.expect_create_pod().never();
        quiet.expect_delete_pod().never();
        let second = Arc::new(Context::for_testing(Arc::new(quiet), peer, registry));

        let action = reconcile(flapp(workers(2), Some(converged)), second)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(RESYNC));
    }

    /// Story: the worker pods are rejected by admission. The rejection is a
    /// terminal condition on the worker group only; ps pods are still
    /// created, and the next pass at the same generation does not retry.
    #[tokio::test]
    async fn story_rejected_group_does_not_block_others() {
        let spec = FLAppSpec {
            ps: Some(replica_spec(1)),
            worker: Some(replica_spec(1)),
            ..Default::default()
        };
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut cluster = cluster(vec![], written.clone());
        cluster
            .expect_create_pod()
            .withf(|_, pod| pod.name_any() == "mnist-worker-0")
            .times(1)
            .returning(|_, _| Err(Error::pod_creation("worker", "exceeded quota")));
        cluster
            .expect_create_pod()
            .withf(|_, pod| pod.name_any() == "mnist-ps-0")
            .times(2)
            .returning(|_, _| Ok(()));
        let ctx = Arc::new(Context::for_testing(
            Arc::new(cluster),
            Arc::new(unreachable_peer()),
            registry(),
        ));

        let _ = reconcile(flapp(spec.clone(), None), ctx.clone()).await;
        let status = last(&written);
        assert_eq!(
            status.get_condition("WorkerSpecError").map(|c| &c.status),
            Some(&ConditionStatus::True)
        );
        assert!(status.get_condition("PsSpecError").is_none());
        assert_ne!(status.phase, FLAppPhase::Failed);

        // same generation: worker creation is not attempted again
        let _ = reconcile(flapp(spec, Some(status)), ctx).await;
    }

    #[tokio::test]
    async fn exhausted_restart_budget_fails_and_cleans_up() {
        let mut spec = replica_spec(2);
        spec.restart_limit = Some(0);
        let app_spec = FLAppSpec {
            worker: Some(spec),
            ..Default::default()
        };
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut cluster = cluster(
            vec![
                pod(&worker(0), "Failed", false, None),
                ready_pod(&worker(1)),
            ],
            written.clone(),
        );
        cluster
            .expect_delete_pod()
            .withf(|_, name| name == "mnist-worker-1")
            .times(1)
            .returning(|_, _| Ok(()));
        cluster.expect_create_pod().never();
        let ctx = Arc::new(Context::for_testing(
            Arc::new(cluster),
            Arc::new(unreachable_peer()),
            registry(),
        ));

        let result = reconcile(flapp(app_spec, None), ctx).await;
        // the peer being down is still reported, but the phase is final
        assert!(result.is_err());
        let status = last(&written);
        assert_eq!(status.phase, FLAppPhase::Failed);
        assert!(status.get_condition("Failed").is_some());
    }

    #[tokio::test]
    async fn terminal_flapp_is_left_alone() {
        let cluster = MockClusterApi::new();
        let ctx = Arc::new(Context::for_testing(
            Arc::new(cluster),
            Arc::new(MockPeerClient::new()),
            registry(),
        ));
        let status = FLAppStatus::with_phase(FLAppPhase::Succeeded);
        let action = reconcile(flapp(workers(1), Some(status)), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn invalid_spec_fails_without_touching_pods() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut cluster = MockClusterApi::new();
        let written_in_mock = written.clone();
        cluster.expect_update_status().returning(move |_, s| {
            written_in_mock.lock().unwrap().push(s.clone());
            Ok(())
        });
        cluster.expect_list_app_pods().never();
        let ctx = Arc::new(Context::for_testing(
            Arc::new(cluster),
            Arc::new(MockPeerClient::new()),
            registry(),
        ));

        let action = reconcile(flapp(FLAppSpec::default(), None), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        let status = last(&written);
        assert_eq!(status.phase, FLAppPhase::Failed);
        assert_eq!(
            status.get_condition(CONDITION_SPEC_VALID).map(|c| &c.status),
            Some(&ConditionStatus::False)
        );
    }

    #[tokio::test]
    async fn removed_group_pods_are_deleted_and_pairing_pruned() {
        let registry = registry();
        publish_ready(&registry, &[0]).await;
        let ps0 = ReplicaKey::new("default", "mnist", ReplicaType::ps(), 0);
        let previous = FLAppStatus {
            pair_status: BTreeMap::from([(ReplicaType::ps(), Pair::default())]),
            ..Default::default()
        };
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut cluster = cluster(vec![ready_pod(&worker(0)), ready_pod(&ps0)], written.clone());
        cluster
            .expect_delete_pod()
            .withf(|_, name| name == "mnist-ps-0")
            .times(1)
            .returning(|_, _| Ok(()));
        let peer = peer_reporting(vec![("worker-0", "peer-0:5000")]);
        let ctx = Arc::new(Context::for_testing(
            Arc::new(cluster),
            Arc::new(peer),
            registry,
        ));

        reconcile(flapp(workers(1), Some(previous)), ctx).await.unwrap();
        let status = last(&written);
        assert!(!status.pair_status.contains_key(&ReplicaType::ps()));
        assert!(status.ps_address.is_empty());
        assert_eq!(status.phase, FLAppPhase::Running);
    }

    #[tokio::test]
    async fn lost_leadership_aborts_before_mutating() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_list_app_pods().returning(|_, _| Ok(vec![]));
        cluster.expect_create_pod().never();
        cluster.expect_update_status().never();
        let leadership = LeadershipHandle::new();
        let ctx = Arc::new(
            Context::builder(
                Arc::new(cluster),
                PairingProtocol::new(Arc::new(unreachable_peer())),
                registry(),
            )
            .leadership(leadership)
            .build(),
        );

        let err = reconcile(flapp(workers(1), None), ctx).await.unwrap_err();
        assert!(matches!(err, Error::NotLeader));
    }

    #[tokio::test]
    async fn allocated_ports_are_recorded_on_status() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut cluster = cluster(vec![], written.clone());
        cluster.expect_create_pod().times(2).returning(|_, _| Ok(()));
        let ports = Arc::new(PortAllocator::new(
            crate::config::PortRange::new(20000, 20010).unwrap(),
        ));
        let ctx = Arc::new(
            Context::builder(
                Arc::new(cluster),
                PairingProtocol::new(Arc::new(unreachable_peer())),
                registry(),
            )
            .ports(ports.clone())
            .build(),
        );

        let _ = reconcile(flapp(workers(2), None), ctx).await;
        let status = last(&written);
        assert_eq!(
            status.assigned_ports,
            BTreeMap::from([
                ("mnist-worker-0".to_string(), 20000),
                ("mnist-worker-1".to_string(), 20001),
            ])
        );
        assert_eq!(ports.allocated(), 2);
    }

    #[test]
    fn error_policy_backs_off_transient_errors() {
        let ctx = Arc::new(Context::for_testing(
            Arc::new(MockClusterApi::new()),
            Arc::new(MockPeerClient::new()),
            registry(),
        ));
        let app = flapp(workers(1), None);

        let spec_action = error_policy(app.clone(), &Error::validation("bad"), ctx.clone());
        assert_eq!(spec_action, Action::await_change());

        error_policy(app.clone(), &Error::registry("down"), ctx.clone());
        error_policy(app, &Error::pairing("down"), ctx.clone());
        assert_eq!(ctx.backoff.failures("default/mnist"), 2);
    }
}
