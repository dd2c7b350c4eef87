//! Operator configuration
//!
//! The binary parses command-line flags (each also readable from an
//! environment variable) and converts them into an [`OperatorConfig`], which
//! is validated once at startup. Invalid configuration aborts the process.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Inclusive range of ports handed out to replicas
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    /// First port in the range
    pub start: u16,
    /// Last port in the range (inclusive)
    pub end: u16,
}

impl PortRange {
    /// Create a range, rejecting empty or privileged ranges
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || start > end {
            return Err(Error::config(format!(
                "invalid port range {start}-{end}: start must be in 1..=end"
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Ranges are never empty once constructed
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `port` lies inside the range
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| Error::config(format!("port range '{s}' must look like 10000-30000")))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|e| Error::config(format!("invalid port '{v}' in range '{s}': {e}")))
        };
        Self::new(parse(start)?, parse(end)?)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Leader election settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// Whether to campaign for a lease before reconciling
    pub enabled: bool,
    /// Namespace holding the lock object
    pub lock_namespace: String,
    /// Name of the lock object
    pub lock_name: String,
    /// How long non-leaders wait before taking over an unrenewed lease
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before stepping down
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lock_namespace: crate::DEFAULT_LOCK_NAMESPACE.to_string(),
            lock_name: crate::DEFAULT_LOCK_NAME.to_string(),
            lease_duration: Duration::from_secs(crate::DEFAULT_LEASE_DURATION_SECS),
            renew_deadline: Duration::from_secs(crate::DEFAULT_RENEW_DEADLINE_SECS),
            retry_period: Duration::from_secs(crate::DEFAULT_RETRY_PERIOD_SECS),
        }
    }
}

impl LeaderElectionConfig {
    /// The leader must give up before anyone else may take over, and must be
    /// able to attempt at least one renewal inside the deadline.
    pub fn validate(&self) -> Result<()> {
        if self.renew_deadline >= self.lease_duration {
            return Err(Error::config(format!(
                "leader election renew deadline ({:?}) must be shorter than lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_period.is_zero() || self.retry_period >= self.renew_deadline {
            return Err(Error::config(format!(
                "leader election retry period ({:?}) must be non-zero and shorter than renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            )));
        }
        if self.lock_name.is_empty() || self.lock_namespace.is_empty() {
            return Err(Error::config("leader election lock name and namespace are required"));
        }
        Ok(())
    }
}

/// Complete operator configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace whose FLApps this operator manages
    pub namespace: String,
    /// Base URL of the peer operator's pairing endpoint
    pub peer_url: String,
    /// Port for the local pairing HTTP server
    pub listen_port: u16,
    /// etcd endpoints for the endpoint registry; empty selects the in-process store
    pub etcd_endpoints: Vec<String>,
    /// Number of FLApps reconciled concurrently
    pub worker_num: u16,
    /// Interval between periodic reconciles of every FLApp
    pub resync_interval: Duration,
    /// Whether replica ports are allocated from `worker_port_range`
    pub assign_worker_port: bool,
    /// Range for allocated replica ports
    pub worker_port_range: PortRange,
    /// TTL of leases backing published pod endpoints
    pub registry_lease_ttl: Duration,
    /// Ceiling for reconcile retry backoff
    pub max_backoff: Duration,
    /// Leader election settings
    pub leader_election: LeaderElectionConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: crate::DEFAULT_NAMESPACE.to_string(),
            peer_url: crate::DEFAULT_PEER_URL.to_string(),
            listen_port: crate::DEFAULT_LISTEN_PORT,
            etcd_endpoints: Vec::new(),
            worker_num: crate::DEFAULT_WORKER_NUM,
            resync_interval: Duration::from_secs(crate::DEFAULT_RESYNC_INTERVAL_SECS),
            assign_worker_port: true,
            worker_port_range: PortRange {
                start: 10000,
                end: 30000,
            },
            registry_lease_ttl: Duration::from_secs(crate::DEFAULT_REGISTRY_LEASE_TTL_SECS),
            max_backoff: Duration::from_secs(crate::DEFAULT_MAX_BACKOFF_SECS),
            leader_election: LeaderElectionConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        if self.worker_num == 0 {
            return Err(Error::config("worker-num must be at least 1"));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::config("resync interval must be non-zero"));
        }
        if self.registry_lease_ttl < Duration::from_secs(2) {
            return Err(Error::config("registry lease TTL must be at least 2s"));
        }
        if self.max_backoff.is_zero() {
            return Err(Error::config("max backoff must be non-zero"));
        }
        if self.assign_worker_port && self.worker_port_range.contains(self.listen_port) {
            return Err(Error::config(format!(
                "listen port {} overlaps worker port range {}",
                self.listen_port, self.worker_port_range
            )));
        }
        if self.leader_election.enabled {
            self.leader_election.validate()?;
            // every replica answers the peer from its own registry
            if self.etcd_endpoints.is_empty() {
                return Err(Error::config(
                    "leader election requires a shared registry (--etcd-url)",
                ));
            }
        }
        Ok(())
    }

    /// Interval at which registry leases are refreshed (a third of the TTL)
    pub fn registry_refresh_interval(&self) -> Duration {
        self.registry_lease_ttl / 3
    }
}

/// Accepts `host:port` as well as full URLs and strips trailing slashes
pub fn normalize_peer_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Splits a comma separated endpoint list, dropping blanks
pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
