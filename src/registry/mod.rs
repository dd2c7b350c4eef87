//! Endpoint registry and the coordination store behind it
//!
//! - [`CoordinationStore`] - lease-backed, watchable key-value store
//! - [`MemoryStore`] - in-process store (single operator replica, tests)
//! - `EtcdStore` - etcd v3 store (feature `etcd`)
//! - [`EndpointRegistry`] - replica identity to address directory

mod endpoints;
#[cfg(feature = "etcd")]
mod etcd;
mod key;
mod memory;
mod store;

pub use endpoints::{EndpointRegistry, PeerEvent, PublishOutcome, ResyncReport};
#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use key::{ReplicaKey, Scope, KEY_ROOT};
pub use memory::MemoryStore;
pub use store::{CoordinationStore, KeyValue, LeaseId, PutOutcome, WatchEvent};
