//! FLApp operator - cross-cluster federated learning on Kubernetes

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{ArgAction, Parser};
use kube::{Client, CustomResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flapp_operator::config::{
    normalize_peer_url, parse_endpoints, LeaderElectionConfig, OperatorConfig, PortRange,
};
use flapp_operator::controller::{run_controllers, ControllerDeps};
use flapp_operator::crd::FLApp;
use flapp_operator::discovery::{AliasClient, KubeAliasClient};
use flapp_operator::leader_election::{
    run_with_leadership, KubeLeaseLock, LeaderElector, LeadershipHandle,
};
use flapp_operator::pairing::{peer_router, HttpPeerClient, PairingProtocol, PeerState};
use flapp_operator::registry::{CoordinationStore, EndpointRegistry, MemoryStore};

/// Interval at which the in-process store collects expired leases
const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// FLApp operator - runs one side of cross-cluster federated learning jobs
#[derive(Parser, Debug)]
#[command(name = "flapp-operator", version, about, long_about = None)]
struct Cli {
    /// Print the FLApp CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Namespace whose FLApps are managed
    #[arg(long, env = "FLAPP_NAMESPACE", default_value = flapp_operator::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Base URL (or host:port) of the peer operator's pairing endpoint
    #[arg(long, env = "FLAPP_PEER_URL", default_value = flapp_operator::DEFAULT_PEER_URL)]
    peer_url: String,

    /// Port of the local pairing endpoint
    #[arg(long, env = "FLAPP_PORT", default_value_t = flapp_operator::DEFAULT_LISTEN_PORT)]
    port: u16,

    /// Comma separated etcd endpoints for the endpoint registry
    ///
    /// Empty selects the in-process store, which only suits a single
    /// operator replica.
    #[arg(long, env = "FLAPP_ETCD_URL", default_value = "")]
    etcd_url: String,

    /// Number of FLApps reconciled concurrently
    #[arg(long, env = "FLAPP_WORKER_NUM", default_value_t = flapp_operator::DEFAULT_WORKER_NUM)]
    worker_num: u16,

    /// Interval between periodic reconciles of every FLApp
    #[arg(long, env = "FLAPP_RESYNC_INTERVAL_SECS", default_value_t = flapp_operator::DEFAULT_RESYNC_INTERVAL_SECS)]
    resync_interval_secs: u64,

    /// Allocate a port for every replica from --worker-port-range
    #[arg(long, env = "FLAPP_ASSIGN_WORKER_PORT", default_value_t = true, action = ArgAction::Set)]
    assign_worker_port: bool,

    /// Port range for allocated replica ports, as `start-end`
    #[arg(long, env = "FLAPP_WORKER_PORT_RANGE", default_value = flapp_operator::DEFAULT_WORKER_PORT_RANGE)]
    worker_port_range: PortRange,

    /// Campaign for a lease before reconciling (for HA deployments, needs --etcd-url)
    #[arg(long, env = "FLAPP_LEADER_ELECTION")]
    leader_election: bool,

    /// Namespace of the leader election Lease
    #[arg(long, env = "FLAPP_LEADER_ELECTION_LOCK_NAMESPACE", default_value = flapp_operator::DEFAULT_LOCK_NAMESPACE)]
    leader_election_lock_namespace: String,

    /// Name of the leader election Lease
    #[arg(long, env = "FLAPP_LEADER_ELECTION_LOCK_NAME", default_value = flapp_operator::DEFAULT_LOCK_NAME)]
    leader_election_lock_name: String,

    /// How long standbys wait before taking over an unrenewed lease
    #[arg(long, env = "FLAPP_LEADER_ELECTION_LEASE_DURATION_SECS", default_value_t = flapp_operator::DEFAULT_LEASE_DURATION_SECS)]
    leader_election_lease_duration_secs: u64,

    /// How long the leader keeps retrying renewal before stepping down
    #[arg(long, env = "FLAPP_LEADER_ELECTION_RENEW_DEADLINE_SECS", default_value_t = flapp_operator::DEFAULT_RENEW_DEADLINE_SECS)]
    leader_election_renew_deadline_secs: u64,

    /// Interval between leader election attempts
    #[arg(long, env = "FLAPP_LEADER_ELECTION_RETRY_PERIOD_SECS", default_value_t = flapp_operator::DEFAULT_RETRY_PERIOD_SECS)]
    leader_election_retry_period_secs: u64,

    /// TTL of the registry leases backing published pod endpoints
    #[arg(long, env = "FLAPP_REGISTRY_LEASE_TTL_SECS", default_value_t = flapp_operator::DEFAULT_REGISTRY_LEASE_TTL_SECS)]
    registry_lease_ttl_secs: u64,

    /// Ceiling for reconcile retry backoff
    #[arg(long, env = "FLAPP_MAX_BACKOFF_SECS", default_value_t = flapp_operator::DEFAULT_MAX_BACKOFF_SECS)]
    max_backoff_secs: u64,
}

impl Cli {
    fn into_config(self) -> flapp_operator::Result<OperatorConfig> {
        let config = OperatorConfig {
            namespace: self.namespace,
            peer_url: normalize_peer_url(&self.peer_url),
            listen_port: self.port,
            etcd_endpoints: parse_endpoints(&self.etcd_url),
            worker_num: self.worker_num,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            assign_worker_port: self.assign_worker_port,
            worker_port_range: self.worker_port_range,
            registry_lease_ttl: Duration::from_secs(self.registry_lease_ttl_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            leader_election: LeaderElectionConfig {
                enabled: self.leader_election,
                lock_namespace: self.leader_election_lock_namespace,
                lock_name: self.leader_election_lock_name,
                lease_duration: Duration::from_secs(self.leader_election_lease_duration_secs),
                renew_deadline: Duration::from_secs(self.leader_election_renew_deadline_secs),
                retry_period: Duration::from_secs(self.leader_election_retry_period_secs),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&FLApp::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = cli.into_config()?;
    run_operator(config).await
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        info!("shutdown signal received, stopping");
        token.cancel();
    });
}

/// Select the coordination store behind the endpoint registry
async fn connect_store(config: &OperatorConfig) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    if config.etcd_endpoints.is_empty() {
        info!("using in-process coordination store");
        let store = MemoryStore::new();
        store.spawn_reaper(REAPER_INTERVAL);
        return Ok(Arc::new(store));
    }

    #[cfg(feature = "etcd")]
    {
        use flapp_operator::registry::EtcdStore;
        use flapp_operator::retry::{retry_with_backoff, RetryConfig};

        let endpoints = config.etcd_endpoints.clone();
        let store = retry_with_backoff(&RetryConfig::with_max_attempts(5), "etcd_connect", || {
            let endpoints = endpoints.clone();
            async move { EtcdStore::connect(&endpoints).await }
        })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to etcd: {}", e))?;
        info!(endpoints = ?config.etcd_endpoints, "connected to etcd");
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "etcd"))]
    Err(anyhow::anyhow!(
        "--etcd-url was given but this build has no etcd support (feature `etcd`)"
    ))
}

/// Identity written into the leader lock: hostname plus a per-process suffix
fn leader_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "flapp-operator".to_string());
    format!("{host}_{}", uuid::Uuid::new_v4())
}

async fn run_operator(config: OperatorConfig) -> anyhow::Result<()> {
    info!(
        namespace = %config.namespace,
        peer_url = %config.peer_url,
        port = config.listen_port,
        workers = config.worker_num,
        "starting FLApp operator"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let store = connect_store(&config).await?;
    let registry = Arc::new(EndpointRegistry::new(store, config.registry_lease_ttl));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind port {}: {}", config.listen_port, e))?;
    let router = peer_router(PeerState {
        registry: registry.clone(),
        namespace: config.namespace.clone(),
    });
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });
    info!(port = config.listen_port, "peer pairing endpoint listening");

    let pairing = PairingProtocol::new(Arc::new(HttpPeerClient::new(config.peer_url.clone())?));
    let aliases: Arc<dyn AliasClient> =
        Arc::new(KubeAliasClient::new(client.clone(), &config.namespace));
    let deps = |leadership: LeadershipHandle| ControllerDeps {
        registry: registry.clone(),
        aliases: aliases.clone(),
        pairing: pairing.clone(),
        leadership,
    };

    if config.leader_election.enabled {
        let identity = leader_identity();
        info!(%identity, "leader election enabled");
        let lock = Arc::new(KubeLeaseLock::new(
            client.clone(),
            &config.leader_election.lock_namespace,
            &config.leader_election.lock_name,
        ));
        let elector = Arc::new(LeaderElector::new(lock, identity, &config.leader_election));
        let leadership = elector.leadership();

        let active: Mutex<Option<(CancellationToken, JoinHandle<()>)>> = Mutex::new(None);
        let stopping: Mutex<Vec<JoinHandle<()>>> = Mutex::new(Vec::new());

        run_with_leadership(
            elector,
            || {
                let token = shutdown.child_token();
                let client = client.clone();
                let config = config.clone();
                let deps = deps(leadership.clone());
                let task_token = token.clone();
                let task = tokio::spawn(async move {
                    if let Err(e) = run_controllers(client, &config, deps, task_token).await {
                        error!(error = %e, "controllers failed");
                    }
                });
                *active.lock().unwrap_or_else(|p| p.into_inner()) = Some((token, task));
                std::future::ready(())
            },
            || {
                if let Some((token, task)) = active.lock().unwrap_or_else(|p| p.into_inner()).take() {
                    token.cancel();
                    stopping.lock().unwrap_or_else(|p| p.into_inner()).push(task);
                }
            },
            shutdown.clone(),
        )
        .await;

        let tasks = std::mem::take(&mut *stopping.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
    } else {
        run_controllers(client, &config, deps(LeadershipHandle::always()), shutdown.clone())
            .await?;
    }

    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "peer endpoint stopped with error"),
        Err(e) => warn!(error = %e, "peer endpoint task failed"),
    }
    info!("FLApp operator stopped");
    Ok(())
}
