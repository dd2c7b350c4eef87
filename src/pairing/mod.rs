//! Peer pairing protocol
//!
//! Each side sends the ready replicas it knows for a group and receives the
//! peer's list in return. The caller then maps its own replicas to remote
//! addresses by ordinal position: both lists are sorted by the numeric
//! suffix of their identifiers and zipped, so `worker-0` pairs with the
//! peer's `worker-0` when both sides are complete.
//!
//! Mappings already agreed on in a previous round are kept as long as the
//! local replica is still ready and the peer still reports the address. A
//! crashed replica therefore only drops its own entry; the others keep their
//! partner.

mod client;
mod server;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crd::{Pair, ReplicaType};
use crate::discovery::AliasTarget;
use crate::{Error, Result};

pub use client::{HttpPeerClient, PeerClient, PAIR_PATH};
#[cfg(test)]
pub use client::MockPeerClient;
pub use server::{peer_router, PeerApiError, PeerState, HEALTH_PATH};

/// A replica as advertised to the peer
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerEndpoint {
    /// Replica identifier, e.g. `worker-0`
    pub id: String,
    /// Network address, e.g. `10.0.0.1:10000`
    pub address: String,
}

impl PeerEndpoint {
    /// Create an endpoint
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Request sent to the peer operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    /// FLApp name, identical on both sides
    pub app: String,
    /// Replica group being paired
    pub replica_type: ReplicaType,
    /// Ready replicas of the caller
    pub local: Vec<PeerEndpoint>,
}

/// Response from the peer operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResponse {
    /// FLApp name echoed back
    pub app: String,
    /// Replica group echoed back
    pub replica_type: ReplicaType,
    /// Ready replicas of the responder
    pub local: Vec<PeerEndpoint>,
}

impl PairResponse {
    /// Reject responses that do not answer `request` or are internally inconsistent
    pub fn validate(&self, request: &PairRequest) -> Result<()> {
        if self.app != request.app || self.replica_type != request.replica_type {
            return Err(Error::protocol(format!(
                "response for {}/{} does not match request for {}/{}",
                self.app, self.replica_type, request.app, request.replica_type
            )));
        }
        let mut seen = BTreeSet::new();
        for endpoint in &self.local {
            if ordinal(&endpoint.id).is_none() {
                return Err(Error::protocol(format!(
                    "peer identifier '{}' has no ordinal",
                    endpoint.id
                )));
            }
            if endpoint.address.trim().is_empty() {
                return Err(Error::protocol(format!(
                    "peer identifier '{}' has an empty address",
                    endpoint.id
                )));
            }
            if let Err(e) = AliasTarget::parse(&endpoint.address) {
                return Err(Error::protocol(format!(
                    "peer identifier '{}' has an unusable address: {e}",
                    endpoint.id
                )));
            }
            if !seen.insert(endpoint.id.as_str()) {
                return Err(Error::protocol(format!(
                    "peer reported '{}' twice",
                    endpoint.id
                )));
            }
        }
        Ok(())
    }
}

/// Numeric suffix of an identifier: `worker-12` -> 12
pub fn ordinal(id: &str) -> Option<u32> {
    let (_, suffix) = id.rsplit_once('-')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Order identifiers by ordinal; identifiers without one sort last by name
fn ordinal_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (ordinal(a), ordinal(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Sort identifiers by ordinal in place
pub fn sort_by_ordinal(ids: &mut [String]) {
    ids.sort_by(|a, b| ordinal_order(a, b));
}

/// Compute the pairing of `local` identifiers against the peer's endpoints
///
/// The i-th smallest local ordinal pairs with the i-th smallest remote
/// ordinal. A previous entry survives only while its local and remote
/// ordinals are equal, so a replica keeps its partner across the other
/// side's crashes, while an entry formed when only part of a group was
/// ready is redone once the rest arrives. The mapping always has
/// `min(local, remote)` entries and depends only on its inputs.
pub fn compute_pair(previous: Option<&Pair>, local: &[String], remote: &[PeerEndpoint]) -> Pair {
    let mut local: Vec<String> = local.to_vec();
    sort_by_ordinal(&mut local);
    local.dedup();

    let mut remote: Vec<&PeerEndpoint> = remote.iter().collect();
    remote.sort_by(|a, b| ordinal_order(&a.id, &b.id));
    remote.dedup_by(|a, b| a.id == b.id);

    let local_set: BTreeSet<&str> = local.iter().map(String::as_str).collect();
    let mut free_remote: Vec<&PeerEndpoint> = remote.clone();
    let mut mapping = BTreeMap::new();

    if let Some(previous) = previous {
        for (id, address) in &previous.mapping {
            if !local_set.contains(id.as_str()) {
                continue;
            }
            let Some(local_ordinal) = ordinal(id) else {
                continue;
            };
            let partner = free_remote
                .iter()
                .position(|r| &r.address == address && ordinal(&r.id) == Some(local_ordinal));
            if let Some(pos) = partner {
                free_remote.remove(pos);
                mapping.insert(id.clone(), address.clone());
            }
        }
    }

    let unpaired: Vec<&String> = local.iter().filter(|id| !mapping.contains_key(*id)).collect();
    for (id, endpoint) in unpaired.into_iter().zip(free_remote) {
        mapping.insert(id.clone(), endpoint.address.clone());
    }

    Pair {
        local,
        remote: remote.into_iter().map(|r| r.id.clone()).collect(),
        mapping,
    }
}

/// Runs pairing rounds against the peer operator
#[derive(Clone)]
pub struct PairingProtocol {
    client: Arc<dyn PeerClient>,
}

impl PairingProtocol {
    /// Create a protocol driver over `client`
    pub fn new(client: Arc<dyn PeerClient>) -> Self {
        Self { client }
    }

    /// One pairing round for a replica group
    ///
    /// On error the caller must keep its previous pairing; every error is
    /// retryable.
    pub async fn pair(
        &self,
        app: &str,
        replica_type: &ReplicaType,
        previous: Option<&Pair>,
        local: Vec<PeerEndpoint>,
    ) -> Result<Pair> {
        let request = PairRequest {
            app: app.to_string(),
            replica_type: replica_type.clone(),
            local,
        };
        let response = self.client.exchange(&request).await?;
        if let Err(e) = response.validate(&request) {
            warn!(%app, %replica_type, error = %e, "peer sent malformed pairing response");
            return Err(e);
        }

        let local_ids: Vec<String> = request.local.iter().map(|e| e.id.clone()).collect();
        let pair = compute_pair(previous, &local_ids, &response.local);
        debug!(
            %app,
            %replica_type,
            local = pair.local.len(),
            remote = pair.remote.len(),
            mapped = pair.mapping.len(),
            "pairing round complete"
        );
        Ok(pair)
    }
}
