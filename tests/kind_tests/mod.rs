//! Cluster-backed stories for the FLApp operator
//!
//! - `crd_operations`: creating, reading and deleting FLApps through the
//!   Kubernetes API
//! - `flapp_lifecycle`: the reconciler running in-process against the
//!   cluster, creating replica pods and reporting status
//!
//! # Running These Tests
//!
//! ```bash
//! kind create cluster --name flapp-test
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod crd_operations;
mod flapp_lifecycle;
mod helpers;
