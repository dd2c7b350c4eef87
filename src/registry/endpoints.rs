//! Endpoint registry
//!
//! Maps replica identities to network addresses on top of a
//! [`CoordinationStore`]. Every local entry is attached to its own lease,
//! granted by this registry; the registry only ever revokes leases it
//! granted itself. Entries written by a previous leader keep their lease
//! until they are overwritten or expire.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::key::{ReplicaKey, Scope};
use super::store::{CoordinationStore, LeaseId, PutOutcome, WatchEvent};
use crate::crd::ReplicaType;
use crate::Result;

/// Result of publishing a local endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Entry written under a lease owned by this registry
    Published,
    /// Entry already present with the same address under our lease
    Unchanged,
    /// Another writer changed the key concurrently; left untouched
    Contended,
}

/// Counts from a [`EndpointRegistry::resync`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Entries written
    pub published: usize,
    /// Owned entries revoked because their pod is gone or not ready
    pub withdrawn: usize,
}

/// Change in the peer scope
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local replica was paired with `address`
    Upsert(ReplicaKey, String),
    /// A local replica lost its pairing
    Removed(ReplicaKey),
}

/// Lease-backed directory of replica addresses
pub struct EndpointRegistry {
    store: Arc<dyn CoordinationStore>,
    lease_ttl: Duration,
    owned: DashMap<String, LeaseId>,
}

impl EndpointRegistry {
    /// Create a registry whose entries live for `lease_ttl` without keep-alive
    pub fn new(store: Arc<dyn CoordinationStore>, lease_ttl: Duration) -> Self {
        Self {
            store,
            lease_ttl,
            owned: DashMap::new(),
        }
    }

    /// TTL of leases granted for local entries
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Whether the backing store answers
    pub async fn is_reachable(&self) -> bool {
        self.store.ping().await.is_ok()
    }

    /// Number of local entries this registry holds a lease for
    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    /// Publish the address of a ready local replica
    pub async fn publish(&self, key: &ReplicaKey, address: &str) -> Result<PublishOutcome> {
        let path = key.path(Scope::Local);
        let existing = self.store.get(&path).await?;
        let owned_lease = self.owned.get(&path).map(|l| *l);

        if let (Some(kv), Some(lease)) = (&existing, owned_lease) {
            if kv.lease == Some(lease) && kv.value == address {
                return Ok(PublishOutcome::Unchanged);
            }
        }

        let (lease, fresh) = match owned_lease {
            Some(lease) if self.store.keep_alive(lease).await? => (lease, false),
            _ => (self.store.grant_lease(self.lease_ttl).await?, true),
        };
        let expected = existing.as_ref().map(|kv| kv.version).unwrap_or(0);

        match self
            .store
            .compare_and_put(&path, address, Some(lease), expected)
            .await?
        {
            PutOutcome::Applied(_) => {
                self.owned.insert(path, lease);
                debug!(replica = %key, %address, lease, "endpoint published");
                Ok(PublishOutcome::Published)
            }
            PutOutcome::VersionMismatch => {
                if fresh {
                    self.store.revoke_lease(lease).await?;
                }
                debug!(replica = %key, "endpoint changed concurrently, leaving it");
                Ok(PublishOutcome::Contended)
            }
        }
    }

    /// Revoke the local entry for `key` if this registry owns it
    ///
    /// Returns `false` when the entry was not ours; it is then left to expire.
    pub async fn withdraw(&self, key: &ReplicaKey) -> Result<bool> {
        let path = key.path(Scope::Local);
        let Some((_, lease)) = self.owned.remove(&path) else {
            return Ok(false);
        };
        if let Err(e) = self.store.revoke_lease(lease).await {
            self.owned.insert(path, lease);
            return Err(e);
        }
        debug!(replica = %key, lease, "endpoint withdrawn");
        Ok(true)
    }

    /// Refresh every owned lease
    ///
    /// Leases the store no longer knows are forgotten so the next publish or
    /// resync grants a new one. Returns how many were lost.
    pub async fn keep_alive_all(&self) -> Result<usize> {
        let held: Vec<(String, LeaseId)> = self
            .owned
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        let mut lost = 0;
        for (path, lease) in held {
            if !self.store.keep_alive(lease).await? {
                warn!(key = %path, lease, "registry lease expired");
                self.owned.remove_if(&path, |_, l| *l == lease);
                lost += 1;
            }
        }
        Ok(lost)
    }

    /// Converge local entries to `desired`
    ///
    /// Publishes missing or changed entries and withdraws owned entries whose
    /// replica is no longer desired.
    pub async fn resync(&self, desired: &BTreeMap<ReplicaKey, String>) -> Result<ResyncReport> {
        let mut report = ResyncReport::default();
        for (key, address) in desired {
            if self.publish(key, address).await? == PublishOutcome::Published {
                report.published += 1;
            }
        }

        let wanted: BTreeSet<String> = desired.keys().map(|k| k.path(Scope::Local)).collect();
        let stale: Vec<String> = self
            .owned
            .iter()
            .map(|e| e.key().clone())
            .filter(|path| !wanted.contains(path))
            .collect();
        for path in stale {
            if let Some((_, key)) = ReplicaKey::parse(&path) {
                if self.withdraw(&key).await? {
                    report.withdrawn += 1;
                }
            }
        }

        if report != ResyncReport::default() {
            info!(
                published = report.published,
                withdrawn = report.withdrawn,
                "registry resynced"
            );
        }
        Ok(report)
    }

    async fn list_scope(&self, prefix: &str) -> Result<BTreeMap<ReplicaKey, String>> {
        Ok(self
            .store
            .list(prefix)
            .await?
            .into_iter()
            .filter_map(|kv| ReplicaKey::parse(&kv.key).map(|(_, key)| (key, kv.value)))
            .collect())
    }

    /// Every local entry of one FLApp
    pub async fn list_app(
        &self,
        namespace: &str,
        app: &str,
    ) -> Result<BTreeMap<ReplicaKey, String>> {
        self.list_scope(&Scope::Local.app_prefix(namespace, app))
            .await
    }

    /// Local entries of one replica group, ordered by ordinal
    pub async fn list_group(
        &self,
        namespace: &str,
        app: &str,
        replica_type: &ReplicaType,
    ) -> Result<Vec<(ReplicaKey, String)>> {
        Ok(self
            .list_scope(&Scope::Local.group_prefix(namespace, app, replica_type))
            .await?
            .into_iter()
            .collect())
    }

    /// Record the remote address paired with a local replica
    pub async fn publish_peer(&self, key: &ReplicaKey, address: &str) -> Result<bool> {
        let path = key.path(Scope::Peer);
        if let Some(kv) = self.store.get(&path).await? {
            if kv.value == address {
                return Ok(false);
            }
        }
        self.store.put(&path, address, None).await?;
        debug!(replica = %key, %address, "peer address mirrored");
        Ok(true)
    }

    /// Drop the remote address paired with a local replica
    pub async fn withdraw_peer(&self, key: &ReplicaKey) -> Result<bool> {
        self.store.delete(&key.path(Scope::Peer)).await
    }

    /// Every peer entry in a namespace, or of one FLApp when `app` is given
    pub async fn list_peers(
        &self,
        namespace: &str,
        app: Option<&str>,
    ) -> Result<BTreeMap<ReplicaKey, String>> {
        let prefix = match app {
            Some(app) => Scope::Peer.app_prefix(namespace, app),
            None => Scope::Peer.namespace_prefix(namespace),
        };
        self.list_scope(&prefix).await
    }

    /// Delete peer entries of a group except those in `keep`
    pub async fn prune_peers(
        &self,
        namespace: &str,
        app: &str,
        replica_type: &ReplicaType,
        keep: &BTreeSet<ReplicaKey>,
    ) -> Result<usize> {
        let existing = self
            .list_scope(&Scope::Peer.group_prefix(namespace, app, replica_type))
            .await?;
        let mut removed = 0;
        for key in existing.keys().filter(|k| !keep.contains(*k)) {
            if self.withdraw_peer(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Stream changes of the peer scope in a namespace
    pub async fn watch_peers(&self, namespace: &str) -> Result<BoxStream<'static, PeerEvent>> {
        let events = self
            .store
            .watch(&Scope::Peer.namespace_prefix(namespace))
            .await?;
        Ok(events
            .filter_map(|event| {
                let mapped = match event {
                    WatchEvent::Put(kv) => ReplicaKey::parse(&kv.key)
                        .map(|(_, key)| PeerEvent::Upsert(key, kv.value)),
                    WatchEvent::Delete { key } => {
                        ReplicaKey::parse(&key).map(|(_, key)| PeerEvent::Removed(key))
                    }
                };
                futures::future::ready(mapped)
            })
            .boxed())
    }
}
