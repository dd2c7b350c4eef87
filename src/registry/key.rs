//! Registry key layout
//!
//! `/flapp/<scope>/<namespace>/<app>/<replica type>/<index>`
//!
//! The `local` scope holds leased addresses of this cluster's ready pods.
//! The `peer` scope mirrors the remote address each local replica was paired
//! with; service discovery turns those into resolvable aliases.

use std::fmt;

use crate::crd::ReplicaType;

/// Root of every key written by the operator
pub const KEY_ROOT: &str = "/flapp";

/// Key namespace inside the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Addresses of local pods
    Local,
    /// Remote addresses paired with local pods
    Peer,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Peer => "peer",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "peer" => Some(Self::Peer),
            _ => None,
        }
    }

    /// Prefix of every key of this scope in a namespace
    pub fn namespace_prefix(self, namespace: &str) -> String {
        format!("{KEY_ROOT}/{}/{namespace}/", self.as_str())
    }

    /// Prefix of every key of this scope for one FLApp
    pub fn app_prefix(self, namespace: &str, app: &str) -> String {
        format!("{}{app}/", self.namespace_prefix(namespace))
    }

    /// Prefix of every key of this scope for one replica group
    pub fn group_prefix(self, namespace: &str, app: &str, replica_type: &ReplicaType) -> String {
        format!("{}{replica_type}/", self.app_prefix(namespace, app))
    }
}

/// Identity of one replica: `(namespace, FLApp, replica type, ordinal)`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaKey {
    /// Namespace of the FLApp
    pub namespace: String,
    /// FLApp name
    pub app: String,
    /// Replica group
    pub replica_type: ReplicaType,
    /// Ordinal within the group
    pub index: u32,
}

impl ReplicaKey {
    /// Create a key
    pub fn new(
        namespace: impl Into<String>,
        app: impl Into<String>,
        replica_type: ReplicaType,
        index: u32,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            app: app.into(),
            replica_type,
            index,
        }
    }

    /// Identifier exchanged with the peer, e.g. `worker-0`
    pub fn identifier(&self) -> String {
        format!("{}-{}", self.replica_type, self.index)
    }

    /// Name of the pod running this replica
    pub fn pod_name(&self) -> String {
        format!("{}-{}-{}", self.app, self.replica_type, self.index)
    }

    /// Name of the Service resolving to this replica's remote counterpart
    pub fn alias_name(&self) -> String {
        format!("{}-peer", self.pod_name())
    }

    /// Full registry path in `scope`
    pub fn path(&self, scope: Scope) -> String {
        format!(
            "{}{}",
            scope.group_prefix(&self.namespace, &self.app, &self.replica_type),
            self.index
        )
    }

    /// Parse a registry path back into its scope and key
    pub fn parse(path: &str) -> Option<(Scope, Self)> {
        let rest = path.strip_prefix(KEY_ROOT)?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let scope = Scope::parse(parts.next()?)?;
        let namespace = parts.next()?;
        let app = parts.next()?;
        let replica_type = parts.next()?;
        let index = parts.next()?.parse().ok()?;
        if parts.next().is_some() || namespace.is_empty() || app.is_empty() {
            return None;
        }
        Some((
            scope,
            Self::new(namespace, app, ReplicaType::new(replica_type), index),
        ))
    }
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.app, self.identifier())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ReplicaKey {
        ReplicaKey::new("default", "mnist", ReplicaType::worker(), 3)
    }

    #[test]
    fn names_derive_from_the_key() {
        let key = key();
        assert_eq!(key.identifier(), "worker-3");
        assert_eq!(key.pod_name(), "mnist-worker-3");
        assert_eq!(key.alias_name(), "mnist-worker-3-peer");
        assert_eq!(key.to_string(), "default/mnist/worker-3");
    }

    #[test]
    fn path_round_trips_through_parse() {
        let key = key();
        let path = key.path(Scope::Peer);
        assert_eq!(path, "/flapp/peer/default/mnist/worker/3");
        assert_eq!(ReplicaKey::parse(&path), Some((Scope::Peer, key)));
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        assert!(ReplicaKey::parse("/other/local/default/mnist/worker/3").is_none());
        assert!(ReplicaKey::parse("/flapp/unknown/default/mnist/worker/3").is_none());
        assert!(ReplicaKey::parse("/flapp/local/default/mnist/worker/x").is_none());
        assert!(ReplicaKey::parse("/flapp/local/default/mnist/worker/3/extra").is_none());
        assert!(ReplicaKey::parse("/flapp/local/default/mnist/worker").is_none());
    }

    #[test]
    fn app_prefix_does_not_match_longer_app_names() {
        let short = Scope::Local.app_prefix("default", "app");
        let long = ReplicaKey::new("default", "app2", ReplicaType::ps(), 0).path(Scope::Local);
        assert!(!long.starts_with(&short));
    }
}
