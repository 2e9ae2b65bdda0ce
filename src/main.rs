use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anck::controller::{
    self, BrokerUrls, GrpcCredentialService, KubeStore, NatsConnector, OperatorConfig, RetryPolicy,
};
use anck::crd::Network;
use anck::Error;
use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// List Networks and their participating nodes
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Operator namespace, also holding the leader lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "edgefarm-network")]
    namespace: String,

    /// gRPC endpoint of the credential service
    #[arg(
        long,
        env = "ANCK_CREDENTIALS_URL",
        default_value = "http://anck-credentials.anck.svc.cluster.local:6000"
    )]
    credentials_url: String,

    /// Timeout of credential service requests
    #[arg(long, env = "ANCK_CREDENTIALS_TIMEOUT_SECS", default_value_t = 10)]
    credentials_timeout_secs: u64,

    /// Main broker URL, used by cloud participants and for stream administration
    #[arg(long, env = "NATS_URL", default_value = "nats://nats.nats:4222")]
    nats_url: String,

    /// Leaf broker URL on edge nodes
    #[arg(long, env = "LEAF_NATS_URL", default_value = "nats://leaf-nats.nats:4222")]
    leaf_nats_url: String,

    /// Node label marking edge nodes
    #[arg(long, env = "EDGE_NODE_LABEL", default_value = "node-role.kubernetes.io/edge")]
    edge_node_label: String,

    /// Requeue interval after a successful Network pass
    #[arg(long, env = "REQUEUE_SECS", default_value_t = 5)]
    requeue_secs: u64,

    /// Elect a leader through a coordination Lease
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Address of the health and metrics endpoint
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,

    /// Log one JSON object per line
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Restrict the listing to one namespace
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("anck operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: Api<Network> = match &args.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let networks = api
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?;

    println!("Managed Networks: {}", networks.items.len());
    for network in &networks.items {
        let participation = network.participation();
        println!(
            "  {}/{}: {} participants, active nodes [{}]",
            network.namespace().unwrap_or_default(),
            network.name_any(),
            network.spec.participants.len(),
            participation.active_nodes().join(", ")
        );
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    anck::telemetry::init_tracing(args.log_json)?;

    info!("Starting anck operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let credentials = GrpcCredentialService::new(
        &args.credentials_url,
        Duration::from_secs(args.credentials_timeout_secs),
    )?;
    controller::wait_until_ready(&credentials, Duration::from_secs(60), Duration::from_secs(1))
        .await?;

    let config = OperatorConfig {
        operator_namespace: args.namespace.clone(),
        broker_urls: BrokerUrls {
            nats_url: args.nats_url.clone(),
            leaf_url: args.leaf_nats_url.clone(),
        },
        edge_node_label: args.edge_node_label.clone(),
        requeue: Duration::from_secs(args.requeue_secs),
    };

    let ctx = controller::Context {
        store: Arc::new(KubeStore::new(client.clone())),
        credentials: Arc::new(credentials),
        broker: Arc::new(NatsConnector::new(
            &args.nats_url,
            Duration::from_secs(args.credentials_timeout_secs),
        )),
        config,
        stream_retry: RetryPolicy::stream_existence(),
    };

    let is_leader = Arc::new(AtomicBool::new(!args.leader_elect));
    if args.leader_elect {
        let leader_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        info!("Leader election using holder ID: {}", holder_identity);

        let lease_client = client.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            run_leader_election(lease_client, &leader_namespace, &holder_identity, is_leader_bg)
                .await;
        });
    } else {
        info!("Leader election disabled, reconciling as the only replica");
    }

    let state = Arc::new(controller::ControllerState {
        client: client.clone(),
        ctx: Arc::new(ctx),
        is_leader: Arc::clone(&is_leader),
    });

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let addr = args.metrics_bind_address;
        tokio::spawn(async move {
            if let Err(e) = anck::rest_api::run_server(api_state, addr).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    let result = controller::run_controllers(state).await;

    anck::telemetry::shutdown_tracing();

    result
}

const LEASE_NAME: &str = "anck-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    let expiry = renew.0 + chrono::Duration::seconds(duration as i64);
                    now > expiry
                })
                .unwrap_or(true);

            if expired {
                info!(
                    "Lease held by {:?} has expired, taking over",
                    current_holder
                );
                // guarded by the fetched resourceVersion so only one replica wins
                let claimed = claim_lease(existing.clone(), identity, now);
                match leases.replace(LEASE_NAME, &PostParams::default(), &claimed).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(err)) if err.code == 409 => {
                        info!("Another replica took over lease {} first", LEASE_NAME);
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            } else {
                Ok(false)
            }
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            match leases.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!("Created lease {} with holder {}", LEASE_NAME, identity);
                    Ok(true)
                }
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// Take over `existing` for `identity`, keeping its resourceVersion as precondition
fn claim_lease(mut existing: Lease, identity: &str, now: chrono::DateTime<Utc>) -> Lease {
    let spec = existing.spec.get_or_insert_with(Default::default);
    spec.holder_identity = Some(identity.to_string());
    spec.acquire_time = Some(MicroTime(now));
    spec.renew_time = Some(MicroTime(now));
    spec.lease_duration_seconds = Some(LEASE_DURATION_SECS);
    spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
    existing
}
