//! Error types for the FLApp operator
//!
//! Every error carries a [`ErrorClass`] that decides how the reconciler
//! reacts to it: transient errors are retried with backoff, conflicts are
//! dropped in favour of the next change notification, spec errors become a
//! terminal condition on the affected replica group, protocol errors keep the
//! previous pairing, and fatal errors abort startup.

use thiserror::Error;

/// Main error type for FLApp operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid FLApp spec or request
    #[error("validation error: {0}")]
    Validation(String),

    /// Pod creation rejected by the API server (admission, quota, schema)
    #[error("pod creation rejected for replica type {replica_type}: {message}")]
    PodCreation {
        /// Replica type whose pod was rejected
        replica_type: String,
        /// Rejection reason reported by the API server
        message: String,
    },

    /// Optimistic concurrency check failed
    #[error("conflict: {0}")]
    Conflict(String),

    /// Endpoint registry or coordination store unavailable
    #[error("registry error: {0}")]
    Registry(String),

    /// Peer operator unreachable or returned an error status
    #[error("pairing error: {0}")]
    Pairing(String),

    /// Peer operator returned a malformed response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// This instance does not hold leadership
    #[error("not the leader, refusing to mutate cluster state")]
    NotLeader,

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid operator configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected internal state
    #[error("internal error: {0}")]
    Internal(String),
}

/// How a failed operation should be handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with exponential backoff
    Transient,
    /// Drop and wait for the next change notification
    Conflict,
    /// Record a terminal condition; do not retry until the spec changes
    Spec,
    /// Keep the previous pairing and retry
    Protocol,
    /// Abort the process
    Fatal,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a pod creation error for a replica type
    pub fn pod_creation(replica_type: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PodCreation {
            replica_type: replica_type.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a registry error with the given message
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a pairing error with the given message
    pub fn pairing(msg: impl Into<String>) -> Self {
        Self::Pairing(msg.into())
    }

    /// Create a protocol error with the given message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error for the reconciler
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Kube(kube::Error::Api(response)) => match response.code {
                409 => ErrorClass::Conflict,
                400 | 403 | 422 => ErrorClass::Spec,
                _ => ErrorClass::Transient,
            },
            Self::Kube(_) => ErrorClass::Transient,
            Self::Validation(_) | Self::PodCreation { .. } => ErrorClass::Spec,
            Self::Conflict(_) => ErrorClass::Conflict,
            Self::Registry(_) | Self::Pairing(_) | Self::NotLeader | Self::Internal(_) => {
                ErrorClass::Transient
            }
            Self::Protocol(_) | Self::Serialization(_) => ErrorClass::Protocol,
            Self::Config(_) => ErrorClass::Fatal,
        }
    }

    /// Whether a later attempt may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::Protocol | ErrorClass::Conflict
        )
    }
}

/// Returns the HTTP status code of a kube API error, if any
pub(crate) fn api_status(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}
