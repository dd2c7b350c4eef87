//! FLApp controller
//!
//! Reconciliation logic for FLApps and the wiring that runs it: the
//! reconciler drives every FLApp's pods, pairing and status through an
//! observe-diff-act loop; the runner feeds it from watches on FLApps and
//! their pods.

mod client;
mod flapp;
mod ports;
mod runner;

pub use client::{ClusterApi, KubeClusterApi};
#[cfg(test)]
pub use client::MockClusterApi;
pub use flapp::{
    compute_phase, error_policy, reconcile, spec_error_condition, Context, ContextBuilder,
    GroupView, CONDITION_RETRYING, CONDITION_SPEC_VALID,
};
pub use ports::{port_owner, PortAllocator};
pub use runner::{run_controllers, ControllerDeps};
