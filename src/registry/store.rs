//! Coordination store abstraction
//!
//! A consistent, watchable key-value store with leases. Keys attached to a
//! lease disappear when the lease is revoked or expires. Revoking an unknown
//! lease and deleting a missing key both succeed: "already gone" is a normal
//! outcome for callers racing with expiry.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;

/// Identifier of a lease granted by the store
pub type LeaseId = i64;

/// A stored key with its metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key path
    pub key: String,
    /// Stored value
    pub value: String,
    /// Lease the key is attached to, if any
    pub lease: Option<LeaseId>,
    /// Store revision of the last modification of this key
    pub version: u64,
}

/// Change notification delivered by [`CoordinationStore::watch`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// Key created or updated
    Put(KeyValue),
    /// Key deleted, explicitly or through lease expiry
    Delete {
        /// Full key path
        key: String,
    },
}

impl WatchEvent {
    /// Key the event refers to
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key } => key,
        }
    }
}

/// Result of a compare-and-put
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The write happened; carries the new key version
    Applied(u64),
    /// Someone else modified the key first
    VersionMismatch,
}

/// Key-value store with leases and prefix watches
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease that expires unless kept alive within `ttl`
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refresh a lease; `Ok(false)` if it no longer exists
    async fn keep_alive(&self, lease: LeaseId) -> Result<bool>;

    /// Revoke a lease and delete every key attached to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Unconditionally write a key, returning its new version
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<u64>;

    /// Write a key only if its current version is `expected_version`
    /// (0 means the key must not exist)
    async fn compare_and_put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        expected_version: u64,
    ) -> Result<PutOutcome>;

    /// Read a single key
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Read every key under `prefix`, sorted by key
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Delete a key; `Ok(false)` if it did not exist
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Stream changes under `prefix` from now on
    async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, WatchEvent>>;

    /// Cheap connectivity probe
    async fn ping(&self) -> Result<()>;
}
