//! etcd v3 coordination store

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, warn};

use super::store::{CoordinationStore, KeyValue, LeaseId, PutOutcome, WatchEvent};
use crate::{Error, Result};

/// Coordination store backed by an etcd cluster
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

fn registry_err(context: &str, e: etcd_client::Error) -> Error {
    Error::registry(format!("etcd {context}: {e}"))
}

fn to_key_value(kv: &etcd_client::KeyValue) -> Result<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| Error::registry(format!("non UTF-8 key: {e}")))?;
    let value = kv
        .value_str()
        .map_err(|e| Error::registry(format!("non UTF-8 value for {key}: {e}")))?;
    Ok(KeyValue {
        key: key.to_string(),
        value: value.to_string(),
        lease: (kv.lease() != 0).then_some(kv.lease()),
        version: u64::try_from(kv.mod_revision()).unwrap_or(0),
    })
}

fn put_options(lease: Option<LeaseId>) -> Option<PutOptions> {
    lease.map(|id| PutOptions::new().with_lease(id))
}

impl EtcdStore {
    /// Connect to the given endpoints
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| registry_err("connect", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let ttl = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let response = self
            .client
            .clone()
            .lease_grant(ttl, None)
            .await
            .map_err(|e| registry_err("lease grant", e))?;
        Ok(response.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<bool> {
        let (mut keeper, mut responses) = self
            .client
            .clone()
            .lease_keep_alive(lease)
            .await
            .map_err(|e| registry_err("lease keep-alive", e))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| registry_err("lease keep-alive", e))?;
        match responses.message().await {
            Ok(Some(response)) => Ok(response.ttl() > 0),
            Ok(None) => Err(Error::registry("etcd keep-alive stream closed")),
            Err(e) => Err(registry_err("lease keep-alive", e)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        match self.client.clone().lease_revoke(lease).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("lease not found") => {
                debug!(lease, "lease already gone");
                Ok(())
            }
            Err(e) => Err(registry_err("lease revoke", e)),
        }
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<u64> {
        let response = self
            .client
            .clone()
            .put(key, value, put_options(lease))
            .await
            .map_err(|e| registry_err("put", e))?;
        Ok(response
            .header()
            .map(|h| u64::try_from(h.revision()).unwrap_or(0))
            .unwrap_or(0))
    }

    async fn compare_and_put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        expected_version: u64,
    ) -> Result<PutOutcome> {
        let expected = i64::try_from(expected_version).unwrap_or(i64::MAX);
        let txn = Txn::new()
            .when([Compare::mod_revision(key, CompareOp::Equal, expected)])
            .and_then([TxnOp::put(key, value, put_options(lease))]);
        let response = self
            .client
            .clone()
            .txn(txn)
            .await
            .map_err(|e| registry_err("txn", e))?;
        if !response.succeeded() {
            return Ok(PutOutcome::VersionMismatch);
        }
        let revision = response
            .header()
            .map(|h| u64::try_from(h.revision()).unwrap_or(0))
            .unwrap_or(0);
        Ok(PutOutcome::Applied(revision))
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let response = self
            .client
            .clone()
            .get(key, None)
            .await
            .map_err(|e| registry_err("get", e))?;
        response.kvs().first().map(to_key_value).transpose()
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let response = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| registry_err("list", e))?;
        let mut kvs = response
            .kvs()
            .iter()
            .map(to_key_value)
            .collect::<Result<Vec<_>>>()?;
        kvs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(kvs)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let response = self
            .client
            .clone()
            .delete(key, None)
            .await
            .map_err(|e| registry_err("delete", e))?;
        Ok(response.deleted() > 0)
    }

    async fn watch(&self, prefix: &str) -> Result<BoxStream<'static, WatchEvent>> {
        let (watcher, stream) = self
            .client
            .clone()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| registry_err("watch", e))?;

        // The watcher handle must outlive the stream or etcd cancels the watch
        let events = futures::stream::unfold(
            (watcher, stream),
            |(watcher, mut stream)| async move {
                match stream.message().await {
                    Ok(Some(response)) => {
                        let batch: Vec<WatchEvent> = response
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kv = event.kv()?;
                                match event.event_type() {
                                    EventType::Put => to_key_value(kv).ok().map(WatchEvent::Put),
                                    EventType::Delete => kv.key_str().ok().map(|key| {
                                        WatchEvent::Delete {
                                            key: key.to_string(),
                                        }
                                    }),
                                }
                            })
                            .collect();
                        Some((futures::stream::iter(batch), (watcher, stream)))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(error = %e, "etcd watch stream failed");
                        None
                    }
                }
            },
        )
        .flatten();
        Ok(events.boxed())
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .clone()
            .status()
            .await
            .map(|_| ())
            .map_err(|e| registry_err("status", e))
    }
}
