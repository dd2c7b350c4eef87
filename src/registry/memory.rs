//! In-process coordination store
//!
//! Used when no etcd endpoints are configured and in tests. Lease deadlines
//! follow the tokio clock, so tests can drive expiry with paused time.
//! Expired leases are collected lazily on every operation and by the
//! optional reaper task, which is what delivers their delete events to
//! watchers when the store is otherwise idle.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::store::{CoordinationStore, KeyValue, LeaseId, PutOutcome, WatchEvent};
use crate::{Error, Result};

const WATCH_BUFFER: usize = 1024;

struct Lease {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    revision: u64,
    next_lease: LeaseId,
    entries: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Drop a lease and its keys, returning the delete events to publish
    fn drop_lease(&mut self, lease: LeaseId) -> Vec<WatchEvent> {
        self.leases.remove(&lease);
        let keys: Vec<String> = self
            .entries
            .values()
            .filter(|kv| kv.lease == Some(lease))
            .map(|kv| kv.key.clone())
            .collect();
        if !keys.is_empty() {
            self.next_revision();
        }
        keys.into_iter()
            .map(|key| {
                self.entries.remove(&key);
                WatchEvent::Delete { key }
            })
            .collect()
    }

    fn expire(&mut self, now: Instant) -> Vec<WatchEvent> {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .flat_map(|id| {
                debug!(lease = id, "lease expired");
                self.drop_lease(id)
            })
            .collect()
    }

    fn write(&mut self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<KeyValue> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(Error::registry(format!("lease {id} not found")));
            }
        }
        let version = self.next_revision();
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            lease,
            version,
        };
        self.entries.insert(key.to_string(), kv.clone());
        Ok(kv)
    }
}

/// Coordination store living in the operator process
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<WatchEvent>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            state: Arc::new(Mutex::new(State {
                next_lease: 1,
                ..Default::default()
            })),
            events,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate losing or regaining connectivity
    ///
    /// While unavailable every operation fails with [`Error::Registry`] and
    /// leases keep ticking towards expiry.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Collect expired leases now
    pub async fn purge_expired(&self) {
        let events = self.state.lock().await.expire(Instant::now());
        self.publish(events);
    }

    /// Periodically collect expired leases so watchers see their deletions
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.purge_expired().await;
            }
        })
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::registry("coordination store unavailable"))
        }
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No receivers is fine
            let _ = self.events.send(event);
        }
    }

    /// Lock the state after collecting expired leases
    async fn locked(&self) -> Result<tokio::sync::MutexGuard<'_, State>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let expired = state.expire(Instant::now());
        self.publish(expired);
        Ok(state)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.locked().await?;
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<bool> {
        let mut state = self.locked().await?;
        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let events = self.locked().await?.drop_lease(lease);
        self.publish(events);
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<u64> {
        let kv = self.locked().await?.write(key, value, lease)?;
        let version = kv.version;
        self.publish(vec![WatchEvent::Put(kv)]);
        Ok(version)
    }

    async fn compare_and_put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        expected_version: u64,
    ) -> Result<PutOutcome> {
        let kv = {
            let mut state = self.locked().await?;
            let current = state.entries.get(key).map(|kv| kv.version).unwrap_or(0);
            if current != expected_version {
                return Ok(PutOutcome::VersionMismatch);
            }
            state.write(key, value, lease)?
        };
        let version = kv.version;
        self.publish(vec![WatchEvent::Put(kv)]);
        Ok(PutOutcome::Applied(version))
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.locked().await?.entries.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let state = self.locked().await?;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = {
            let mut state = self.locked().await?;
            let removed = state.entries.remove(key).is_some();
            if removed {
                state.next_revision();
            }
            removed
        };
        if removed {
            self.publish(vec![WatchEvent::Delete {
                key: key.to_string(),
            }]);
        }
        Ok(removed)
    }

    async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, WatchEvent>> {
        self.check_available()?;
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            // Lagged receivers lose events; consumers resync periodically
            let event = event.ok().filter(|e| e.key().starts_with(&prefix));
            futures::future::ready(event)
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
