//! Custom Resource Definitions for the FLApp operator

mod flapp;
mod types;

pub use flapp::{FLApp, FLAppSpec, FLAppStatus, ReplicaSpec, DEFAULT_RESTART_LIMIT};
pub use types::{
    set_condition, Condition, ConditionStatus, FLAppPhase, Pair, ReplicaStatus, ReplicaType,
};
