//! FLApp operator - Kubernetes operator for cross-cluster federated learning
//!
//! An FLApp is a training job split across two clusters run by different
//! organizations. Each side runs its own parameter-server, master and worker
//! replica groups; the operator on each side creates those pods, publishes
//! their addresses and agrees with the operator on the other side on which
//! local replica talks to which remote one.
//!
//! # Architecture
//!
//! - The reconciler drives every FLApp through
//!   `Created -> Bootstrapping -> Pairing -> Running -> Succeeded | Failed`
//! - Service discovery publishes ready pod addresses into a lease-backed
//!   endpoint registry and mirrors paired remote addresses back as local
//!   Service aliases
//! - The pairing protocol exchanges endpoint sets with the peer operator over
//!   HTTP and maps replicas by ordinal position
//! - Leader election keeps exactly one active reconciler per cluster
//!
//! # Modules
//!
//! - [`crd`] - FLApp Custom Resource Definition and status types
//! - [`controller`] - FLApp reconciliation logic and controller wiring
//! - [`pods`] - Pod construction and pod state classification
//! - [`registry`] - Coordination store abstraction and endpoint registry
//! - [`discovery`] - Service discovery controller and peer aliases
//! - [`pairing`] - Peer pairing protocol (client, server, mapping algorithm)
//! - [`leader_election`] - Lease based leader election
//! - [`config`] - Operator configuration
//! - [`retry`] - Backoff helpers
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod leader_election;
pub mod pairing;
pub mod pods;
pub mod registry;
pub mod retry;

pub use error::{Error, ErrorClass};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Field manager used for server-side apply and status writes
pub const FIELD_MANAGER: &str = "flapp-operator";

/// Default namespace watched by the operator
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default base URL of the peer operator's pairing endpoint
pub const DEFAULT_PEER_URL: &str = "http://localhost:8081";

/// Default port for the pairing HTTP server
pub const DEFAULT_LISTEN_PORT: u16 = 8080;

/// Default number of concurrent reconcile workers
pub const DEFAULT_WORKER_NUM: u16 = 10;

/// Default interval between periodic reconciles of every FLApp
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 30;

/// Default range for dynamically assigned replica ports
pub const DEFAULT_WORKER_PORT_RANGE: &str = "10000-30000";

/// Port used by replicas when port assignment is disabled and the template
/// declares no container port
pub const DEFAULT_REPLICA_PORT: u16 = 50051;

/// Default TTL of registry leases held for pod endpoints
pub const DEFAULT_REGISTRY_LEASE_TTL_SECS: u64 = 10;

/// Default ceiling for reconcile retry backoff
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

/// Default namespace of the leader election lock
pub const DEFAULT_LOCK_NAMESPACE: &str = "fedlearner-system";

/// Default name of the leader election lock
pub const DEFAULT_LOCK_NAME: &str = "flapp-operator-lock";

/// Default leader lease duration
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 15;

/// Default deadline for the leader to renew before giving up
pub const DEFAULT_RENEW_DEADLINE_SECS: u64 = 5;

/// Default interval between leader election attempts
pub const DEFAULT_RETRY_PERIOD_SECS: u64 = 4;
