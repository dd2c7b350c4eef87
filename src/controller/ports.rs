//! Replica port allocation
//!
//! With `--assign-worker-port` every replica pod gets a port from the
//! configured range. Allocation is keyed by pod (`namespace/name`), takes the
//! lowest free port, and is recorded on the pod's port annotation. The
//! annotation is the durable record: allocations are rebuilt from the pods
//! that exist, so a restarted or newly elected operator never hands out a
//! port that a live pod already holds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::PortRange;
use crate::pods::pod_port;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug)]
struct Allocation {
    port: u16,
    allocated_at: Instant,
}

#[derive(Default)]
struct Allocations {
    by_owner: BTreeMap<String, Allocation>,
    used: BTreeSet<u16>,
}

/// Allocator of replica ports within a range
pub struct PortAllocator {
    range: PortRange,
    state: Mutex<Allocations>,
}

/// Allocation key of a pod
pub fn port_owner(namespace: &str, pod_name: &str) -> String {
    format!("{namespace}/{pod_name}")
}

impl PortAllocator {
    /// Create an allocator handing out ports from `range`
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            state: Mutex::new(Allocations::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Allocations> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Range ports are allocated from
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Number of ports currently held
    pub fn allocated(&self) -> usize {
        self.lock().by_owner.len()
    }

    /// Port held by `owner`, if any
    pub fn get(&self, owner: &str) -> Option<u16> {
        self.lock().by_owner.get(owner).map(|a| a.port)
    }

    /// Port for `owner`: the one it already holds, else the lowest free one
    pub fn allocate(&self, owner: &str) -> Result<u16> {
        let mut state = self.lock();
        if let Some(existing) = state.by_owner.get(owner) {
            return Ok(existing.port);
        }
        let port = (self.range.start..=self.range.end)
            .find(|p| !state.used.contains(p))
            .ok_or_else(|| {
                Error::validation(format!(
                    "no free port left in range {} for {owner}",
                    self.range
                ))
            })?;
        state.used.insert(port);
        state.by_owner.insert(
            owner.to_string(),
            Allocation {
                port,
                allocated_at: Instant::now(),
            },
        );
        debug!(%owner, port, "port allocated");
        Ok(port)
    }

    /// Record a port already in use by `owner`
    ///
    /// Ports outside the range are ignored. When the port is recorded for a
    /// different owner the first holder keeps it.
    pub fn observe(&self, owner: &str, port: u16) -> bool {
        if !self.range.contains(port) {
            return false;
        }
        let mut state = self.lock();
        if let Some(existing) = state.by_owner.get(owner) {
            return existing.port == port;
        }
        if !state.used.insert(port) {
            return false;
        }
        state.by_owner.insert(
            owner.to_string(),
            Allocation {
                port,
                allocated_at: Instant::now(),
            },
        );
        true
    }

    /// Release the port held by `owner`
    pub fn release(&self, owner: &str) -> Option<u16> {
        let mut state = self.lock();
        let allocation = state.by_owner.remove(owner)?;
        state.used.remove(&allocation.port);
        debug!(%owner, port = allocation.port, "port released");
        Some(allocation.port)
    }

    /// Rebuild allocations from the pods that exist
    ///
    /// Records every annotated pod port and releases allocations whose pod is
    /// gone. Allocations younger than `grace` are kept: their pod may have
    /// been created but not reached the watch cache yet.
    pub fn sync(&self, pods: &[Pod], grace: Duration) -> usize {
        let mut live = BTreeSet::new();
        for pod in pods {
            let owner = port_owner(&pod.namespace().unwrap_or_default(), &pod.name_any());
            if let Some(port) = pod_port(pod) {
                self.observe(&owner, port);
            }
            live.insert(owner);
        }

        let now = Instant::now();
        let stale: Vec<String> = self
            .lock()
            .by_owner
            .iter()
            .filter(|(owner, a)| !live.contains(*owner) && now.duration_since(a.allocated_at) >= grace)
            .map(|(owner, _)| owner.clone())
            .collect();
        for owner in &stale {
            self.release(owner);
        }
        if !stale.is_empty() {
            info!(released = stale.len(), "released ports of deleted pods");
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ReplicaType;
    use crate::pods::testing::ready_pod;
    use crate::registry::ReplicaKey;

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(PortRange::new(start, end).unwrap())
    }

    #[test]
    fn allocation_is_lowest_free_and_stable_per_owner() {
        let ports = allocator(10000, 10010);
        assert_eq!(ports.allocate("default/a-worker-0").unwrap(), 10000);
        assert_eq!(ports.allocate("default/a-worker-1").unwrap(), 10001);
        assert_eq!(ports.allocate("default/a-worker-0").unwrap(), 10000);

        ports.release("default/a-worker-0");
        assert_eq!(ports.allocate("default/b-worker-0").unwrap(), 10000);
    }

    #[test]
    fn exhausted_range_is_a_spec_error() {
        let ports = allocator(10000, 10001);
        ports.allocate("a").unwrap();
        ports.allocate("b").unwrap();
        let err = ports.allocate("c").unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Spec);
    }

    #[test]
    fn observed_ports_are_never_handed_out_again() {
        let ports = allocator(10000, 10010);
        assert!(ports.observe("default/old-worker-0", 10000));
        assert!(!ports.observe("default/dup", 10000));
        assert!(!ports.observe("default/outside", 80));
        assert_eq!(ports.allocate("default/new").unwrap(), 10001);
    }

    /// Story: the operator restarts while two pods hold ports. Seeding from
    /// the pods prevents collisions, and once one pod is deleted its port
    /// is reused after the grace period.
    #[tokio::test(start_paused = true)]
    async fn story_ports_survive_restart_and_are_reclaimed() {
        let key = |i| ReplicaKey::new("default", "mnist", ReplicaType::worker(), i);
        // fixtures annotate port 10000 + index
        let pods = vec![ready_pod(&key(0)), ready_pod(&key(1))];

        let ports = allocator(10000, 10010);
        assert_eq!(ports.sync(&pods, Duration::from_secs(30)), 0);
        assert_eq!(ports.allocated(), 2);
        assert_eq!(ports.allocate("default/other-ps-0").unwrap(), 10002);

        tokio::time::advance(Duration::from_secs(31)).await;
        let released = ports.sync(&pods[1..], Duration::from_secs(30));
        // worker-0 is gone; other-ps-0 has no pod either
        assert_eq!(released, 2);
        assert_eq!(ports.get("default/mnist-worker-1"), Some(10001));
        assert_eq!(ports.allocate("default/next").unwrap(), 10000);
    }

    #[test]
    fn fresh_allocations_survive_sync_within_grace() {
        let ports = allocator(10000, 10010);
        ports.allocate("default/just-created").unwrap();
        assert_eq!(ports.sync(&[], Duration::from_secs(30)), 0);
        assert_eq!(ports.get("default/just-created"), Some(10000));
    }
}
