//! Leader election over a versioned lock
//!
//! Exactly one operator instance per cluster may create pods, write FLApp
//! status or mirror peer addresses. Instances compete for a lock record
//! holding `(holderIdentity, leaseDuration, renewTime)`; the holder renews it
//! every retry period and every other instance waits for it to expire.
//!
//! # Atomicity
//!
//! Every write carries the version read before it. If the record changed in
//! between, the write is rejected and the attempt counts as lost, so two
//! instances can never both believe they took the same lease.
//!
//! # Expiry
//!
//! Expiry is judged on the local monotonic clock: a record is expired when it
//! has not changed for `leaseDuration` since this instance first observed its
//! current version. Wall-clock skew between instances therefore does not
//! matter; the renew deadline is the margin for it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeaderElectionConfig;
use crate::FIELD_MANAGER;

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Lock record unreadable or lock backend unavailable
    #[error("lock error: {0}")]
    Lock(String),
}

/// Shared view of whether this instance currently leads
///
/// Cloned into every component that mutates cluster state; checked before
/// each mutation.
#[derive(Clone, Debug, Default)]
pub struct LeadershipHandle(Arc<AtomicBool>);

impl LeadershipHandle {
    /// A handle that does not lead until told otherwise
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that always leads, for single-instance deployments
    pub fn always() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Whether mutations are currently allowed
    pub fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Flip leadership
    pub fn set_leading(&self, leading: bool) {
        self.0.store(leading, Ordering::SeqCst);
    }
}

/// Content of the leader lock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderRecord {
    /// Current holder; `None` after a graceful release
    pub holder_identity: Option<String>,
    /// How long the record stays valid without renewal
    pub lease_duration: Duration,
    /// When the current holder acquired the lock
    pub acquire_time: DateTime<Utc>,
    /// Last renewal by the holder
    pub renew_time: DateTime<Utc>,
    /// Number of holder changes
    pub transitions: i32,
}

/// A lock record together with the version it was read at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedRecord {
    /// Record content
    pub record: LeaderRecord,
    /// Opaque version for compare-and-swap writes
    pub version: String,
}

/// Storage of the leader lock record
///
/// `create` and `replace` return `Ok(false)` when another writer won the
/// race; that is a normal outcome, not an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Read the current record
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaderElectionError>;
    /// Create the record if none exists
    async fn create(&self, record: &LeaderRecord) -> Result<bool, LeaderElectionError>;
    /// Replace the record if it is still at `version`
    async fn replace(
        &self,
        record: &LeaderRecord,
        version: &str,
    ) -> Result<bool, LeaderElectionError>;
}

/// [`LockBackend`] on a coordination.k8s.io/v1 Lease
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseLock {
    /// Lock on the Lease `namespace/name`
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn lease(&self, record: &LeaderRecord, version: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            spec: Some(lease_spec(record)),
        }
    }
}

/// Lease spec carrying `record`
pub fn lease_spec(record: &LeaderRecord) -> LeaseSpec {
    LeaseSpec {
        holder_identity: record.holder_identity.clone(),
        lease_duration_seconds: Some(
            i32::try_from(record.lease_duration.as_secs()).unwrap_or(i32::MAX),
        ),
        acquire_time: Some(MicroTime(record.acquire_time)),
        renew_time: Some(MicroTime(record.renew_time)),
        lease_transitions: Some(record.transitions),
        ..Default::default()
    }
}

/// Record stored in a Lease spec; missing times read as the epoch
pub fn record_from_lease(spec: &LeaseSpec) -> LeaderRecord {
    let time = |t: &Option<MicroTime>| t.as_ref().map(|t| t.0).unwrap_or_default();
    LeaderRecord {
        holder_identity: spec.holder_identity.clone().filter(|h| !h.is_empty()),
        lease_duration: Duration::from_secs(
            spec.lease_duration_seconds
                .and_then(|s| u64::try_from(s).ok())
                .unwrap_or(0),
        ),
        acquire_time: time(&spec.acquire_time),
        renew_time: time(&spec.renew_time),
        transitions: spec.lease_transitions.unwrap_or(0),
    }
}

#[async_trait]
impl LockBackend for KubeLeaseLock {
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaderElectionError> {
        let lease = match self.api.get(&self.name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let version = lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::Lock("lease missing resourceVersion".into()))?;
        let record = lease
            .spec
            .as_ref()
            .map(record_from_lease)
            .ok_or_else(|| LeaderElectionError::Lock("lease has no spec".into()))?;
        Ok(Some(VersionedRecord { record, version }))
    }

    async fn create(&self, record: &LeaderRecord) -> Result<bool, LeaderElectionError> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self.api.create(&params, &self.lease(record, None)).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(
        &self,
        record: &LeaderRecord,
        version: &str,
    ) -> Result<bool, LeaderElectionError> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self
            .api
            .replace(&self.name, &params, &self.lease(record, Some(version)))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process [`LockBackend`]
///
/// Shared by several electors in the same process, e.g. to exercise
/// handovers in tests.
#[derive(Default)]
pub struct MemoryLock {
    state: Mutex<Option<(LeaderRecord, u64)>>,
}

impl MemoryLock {
    /// An empty lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(|(record, _)| record.holder_identity.clone())
    }
}

#[async_trait]
impl LockBackend for MemoryLock {
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaderElectionError> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Ok(state.as_ref().map(|(record, version)| VersionedRecord {
            record: record.clone(),
            version: version.to_string(),
        }))
    }

    async fn create(&self, record: &LeaderRecord) -> Result<bool, LeaderElectionError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.is_some() {
            return Ok(false);
        }
        *state = Some((record.clone(), 1));
        Ok(true)
    }

    async fn replace(
        &self,
        record: &LeaderRecord,
        version: &str,
    ) -> Result<bool, LeaderElectionError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match state.as_mut() {
            Some((current, current_version)) if current_version.to_string() == version => {
                *current = record.clone();
                *current_version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Version of the lock record last seen, and when it was first seen
struct Observed {
    version: String,
    at: Instant,
}

/// Competes for the leader lock on behalf of one operator instance
pub struct LeaderElector {
    lock: Arc<dyn LockBackend>,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    leadership: LeadershipHandle,
    observed: Mutex<Option<Observed>>,
}

impl LeaderElector {
    /// Create an elector for `identity` with the timings from `config`
    pub fn new(
        lock: Arc<dyn LockBackend>,
        identity: impl Into<String>,
        config: &LeaderElectionConfig,
    ) -> Self {
        Self {
            lock,
            identity: identity.into(),
            lease_duration: config.lease_duration,
            renew_deadline: config.renew_deadline,
            retry_period: config.retry_period,
            leadership: LeadershipHandle::new(),
            observed: Mutex::new(None),
        }
    }

    /// Identity written into the lock while leading
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Handle reflecting this elector's leadership
    pub fn leadership(&self) -> LeadershipHandle {
        self.leadership.clone()
    }

    /// When the current version of the record was first seen locally
    fn observe(&self, version: &str) -> Instant {
        let mut observed = self.observed.lock().unwrap_or_else(|p| p.into_inner());
        match observed.as_ref() {
            Some(o) if o.version == version => o.at,
            _ => {
                let now = Instant::now();
                *observed = Some(Observed {
                    version: version.to_string(),
                    at: now,
                });
                now
            }
        }
    }

    fn record(&self, acquire_time: DateTime<Utc>, transitions: i32) -> LeaderRecord {
        LeaderRecord {
            holder_identity: Some(self.identity.clone()),
            lease_duration: self.lease_duration,
            acquire_time,
            renew_time: Utc::now(),
            transitions,
        }
    }

    /// One acquire-or-renew attempt; `Ok(true)` when this instance holds the lock
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let Some(current) = self.lock.get().await? else {
            let created = self.lock.create(&self.record(Utc::now(), 0)).await?;
            if created {
                info!(identity = %self.identity, "created leader lock");
            }
            return Ok(created);
        };

        let observed_at = self.observe(&current.version);
        let record = &current.record;

        if record.holder_identity.as_deref() == Some(self.identity.as_str()) {
            let renewed = self.record(record.acquire_time, record.transitions);
            return self.lock.replace(&renewed, &current.version).await;
        }

        let expired = record.holder_identity.is_none()
            || Instant::now() >= observed_at + record.lease_duration;
        if !expired {
            debug!(
                identity = %self.identity,
                holder = record.holder_identity.as_deref().unwrap_or_default(),
                "leader lock held by another instance"
            );
            return Ok(false);
        }

        let taken = self.record(Utc::now(), record.transitions + 1);
        let acquired = self.lock.replace(&taken, &current.version).await?;
        if acquired {
            info!(
                identity = %self.identity,
                transitions = taken.transitions,
                "took over leader lock"
            );
        }
        Ok(acquired)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lock; [`LeaderGuard::lost`] resolves when
    /// renewal fails past the renew deadline.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, "waiting for leadership");
        loop {
            let attempt = tokio::time::timeout(self.renew_deadline, self.try_acquire_or_renew())
                .await
                .unwrap_or_else(|_| {
                    Err(LeaderElectionError::Lock(
                        "lock request timed out".to_string(),
                    ))
                });
            match attempt {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    self.leadership.set_leading(true);
                    return self.create_guard();
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_period.as_secs(),
                        "failed to acquire leader lock, retrying"
                    );
                }
            }
            tokio::time::sleep(self.retry_period).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewal = Instant::now();
        loop {
            tokio::time::sleep(self.retry_period).await;

            // a hung lock backend must not outlive the renew deadline
            let remaining = self.renew_deadline.saturating_sub(last_renewal.elapsed());
            let attempt = tokio::time::timeout(remaining, self.try_acquire_or_renew()).await;
            match attempt {
                Ok(Ok(true)) => last_renewal = Instant::now(),
                Ok(Ok(false)) => {
                    warn!(identity = %self.identity, "leader lock taken by another instance");
                    break;
                }
                Ok(Err(e)) if last_renewal.elapsed() < self.renew_deadline => {
                    warn!(identity = %self.identity, error = %e, "lease renewal failed, retrying");
                }
                Ok(Err(e)) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "no successful renewal within the renew deadline"
                    );
                    break;
                }
                Err(_) => {
                    warn!(
                        identity = %self.identity,
                        deadline_secs = self.renew_deadline.as_secs(),
                        "lease renewal still pending at the renew deadline"
                    );
                    break;
                }
            }
        }
        warn!(identity = %self.identity, "leadership lost");
        self.leadership.set_leading(false);
        let _ = lost_tx.send(());
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let Some(current) = self.lock.get().await? else {
            return Ok(());
        };
        if current.record.holder_identity.as_deref() != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "not the lock holder, nothing to release");
            return Ok(());
        }
        let released = LeaderRecord {
            holder_identity: None,
            renew_time: Utc::now(),
            ..current.record
        };
        if self.lock.replace(&released, &current.version).await? {
            info!(identity = %self.identity, "leader lock released for fast failover");
        }
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted and leadership cleared when the guard is
/// dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release the lock for a standby; call during graceful shutdown
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.elector.leadership.set_leading(false);
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.leadership.set_leading(false);
        self.renewal_task.abort();
        debug!(identity = %self.elector.identity, "leader guard dropped");
    }
}

/// Campaign for leadership until `shutdown` fires
///
/// `on_acquire` runs once per acquisition and `on_lose` once per loss, so
/// every call of one is matched by a call of the other. Losing leadership
/// does not end the campaign; the instance becomes a candidate again. On
/// shutdown a held lock is released so a standby takes over immediately.
pub async fn run_with_leadership<A, L, Fut>(
    elector: Arc<LeaderElector>,
    mut on_acquire: A,
    mut on_lose: L,
    shutdown: CancellationToken,
) where
    A: FnMut() -> Fut,
    Fut: Future<Output = ()>,
    L: FnMut(),
{
    loop {
        let mut guard = tokio::select! {
            guard = Arc::clone(&elector).acquire() => guard,
            _ = shutdown.cancelled() => return,
        };
        on_acquire().await;

        tokio::select! {
            _ = guard.lost() => {
                on_lose();
            }
            _ = shutdown.cancelled() => {
                on_lose();
                if let Err(e) = guard.release_leadership().await {
                    warn!(error = %e, "failed to release leader lock");
                }
                return;
            }
        }
    }
}
