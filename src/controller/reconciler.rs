//! Controller wiring
//!
//! Hosts the three watch loops (Network, Participants, Pod) and the shared
//! [`Context`] they reconcile with. The reconcile logic itself lives in the
//! per-kind modules and only talks to the collaborator traits held by the
//! context, so it runs unchanged against in-memory fakes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{future, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector, watcher, WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use super::broker::BrokerConnector;
use super::credentials::CredentialService;
use super::finalizers::{PARTICIPANTS_FINALIZER, POD_FINALIZER};
use super::retry::RetryPolicy;
use super::sidecar::BrokerUrls;
use super::store::ResourceStore;
use super::{network, participants, pod};
use crate::crd::{Network, Participants};
use crate::error::{Error, Result};

/// Settings collected from the command line at startup
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace the operator and its lease live in
    pub operator_namespace: String,
    pub broker_urls: BrokerUrls,
    /// Node label marking edge nodes with a local leaf broker
    pub edge_node_label: String,
    /// Default requeue interval after a successful pass
    pub requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_namespace: "edgefarm-network".to_string(),
            broker_urls: BrokerUrls {
                nats_url: "nats://nats.nats:4222".to_string(),
                leaf_url: "nats://leaf-nats.nats:4222".to_string(),
            },
            edge_node_label: "node-role.kubernetes.io/edge".to_string(),
            requeue: Duration::from_secs(5),
        }
    }
}

/// Collaborators and settings shared by every reconcile pass
pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub credentials: Arc<dyn CredentialService>,
    pub broker: Arc<dyn BrokerConnector>,
    pub config: OperatorConfig,
    /// Existence-check policy for node stream creation
    pub stream_retry: RetryPolicy,
}

/// Controller state shared across all three controllers
pub struct ControllerState {
    pub client: Client,
    pub ctx: Arc<Context>,
    /// Only the leader reconciles; always true without leader election
    pub is_leader: Arc<AtomicBool>,
}

const RETRIABLE_REQUEUE: Duration = Duration::from_secs(5);
const CONFIG_ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Requeue interval after a failed pass
pub fn requeue_after(error: &Error) -> Duration {
    if error.is_retriable() {
        RETRIABLE_REQUEUE
    } else {
        CONFIG_ERROR_REQUEUE
    }
}

/// Watch predicate: spec generation, finalizers and deletion
///
/// Status and plain metadata writes leave the hash unchanged so the
/// controllers do not react to their own status updates.
fn lifecycle_hash<K: Resource>(obj: &K) -> Option<u64> {
    let meta = obj.meta();
    let mut hasher = DefaultHasher::new();
    meta.generation.hash(&mut hasher);
    meta.finalizers.hash(&mut hasher);
    meta.deletion_timestamp
        .as_ref()
        .map(|t| t.0.timestamp())
        .hash(&mut hasher);
    Some(hasher.finish())
}

/// Pods change node assignment without a generation bump
fn pod_lifecycle_hash(pod: &Pod) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    lifecycle_hash(pod).hash(&mut hasher);
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_ref())
        .hash(&mut hasher);
    pod::pod_networks(pod).hash(&mut hasher);
    Some(hasher.finish())
}

fn not_leader(state: &ControllerState) -> Option<Action> {
    (!state.is_leader.load(Ordering::Relaxed)).then(|| Action::requeue(RETRIABLE_REQUEUE))
}

#[cfg(feature = "metrics")]
fn observe(controller: &str, started: Instant, result: &Result<Action>) {
    super::metrics::observe_reconcile_duration_seconds(controller, started.elapsed().as_secs_f64());
    if let Err(e) = result {
        super::metrics::inc_reconcile_error(controller, e.kind());
    }
}

#[cfg(not(feature = "metrics"))]
fn observe(_controller: &str, _started: Instant, _result: &Result<Action>) {}

#[instrument(skip(obj, state), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_network(obj: Arc<Network>, state: Arc<ControllerState>) -> Result<Action> {
    if let Some(action) = not_leader(&state) {
        return Ok(action);
    }
    let started = Instant::now();
    let result = network::reconcile(&obj, &state.ctx).await;
    observe("network", started, &result);
    result
}

#[instrument(skip(obj, state), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_participants(
    obj: Arc<Participants>,
    state: Arc<ControllerState>,
) -> Result<Action> {
    if let Some(action) = not_leader(&state) {
        return Ok(action);
    }
    let started = Instant::now();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Participants> = Api::namespaced(state.client.clone(), &namespace);
    let ctx = &state.ctx;
    let result = finalizer(&api, PARTICIPANTS_FINALIZER, obj, |event| async move {
        match event {
            FinalizerEvent::Apply(p) => participants::apply(&p, ctx).await,
            FinalizerEvent::Cleanup(p) => participants::cleanup(&p, ctx).await,
        }
    })
    .await
    .map_err(Error::from);
    observe("participants", started, &result);
    result
}

#[instrument(skip(obj, state), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_pod(obj: Arc<Pod>, state: Arc<ControllerState>) -> Result<Action> {
    if let Some(action) = not_leader(&state) {
        return Ok(action);
    }
    // a pod that never joined a network carries no finalizer of ours
    if pod::pod_networks(&obj).is_empty() && !obj.finalizers().iter().any(|f| f == POD_FINALIZER) {
        return Ok(Action::await_change());
    }
    let started = Instant::now();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Pod> = Api::namespaced(state.client.clone(), &namespace);
    let ctx = &state.ctx;
    let result = finalizer(&api, POD_FINALIZER, obj, |event| async move {
        match event {
            FinalizerEvent::Apply(p) => pod::apply(&p, ctx).await,
            FinalizerEvent::Cleanup(p) => pod::cleanup(&p, ctx).await,
        }
    })
    .await
    .map_err(Error::from);
    observe("pod", started, &result);
    result
}

fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, _state: Arc<ControllerState>) -> Action {
    error!(name = %obj.name_any(), namespace = obj.namespace(), error = %error, "Reconciliation error");
    Action::requeue(requeue_after(error))
}

async fn ensure_crd_installed<K>(api: &Api<K>, kind: &str) -> Result<()>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.list(&Default::default()).await {
        Ok(_) => {
            info!("{} CRD is available", kind);
            Ok(())
        }
        Err(e) => {
            error!("{} CRD not found. Please install the CRD first: {:?}", kind, e);
            Err(Error::ConfigError(format!("{kind} CRD not installed")))
        }
    }
}

/// Start the Network, Participants and Pod controllers and run them until shutdown
pub async fn run_controllers(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let networks: Api<Network> = Api::all(client.clone());
    let participants: Api<Participants> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());

    ensure_crd_installed(&networks, "Network").await?;
    ensure_crd_installed(&participants, "Participants").await?;

    info!("Starting Network, Participants and Pod controllers");

    let (network_reader, network_writer) = reflector::store();
    let network_stream = watcher(networks, watcher::Config::default())
        .default_backoff()
        .reflect(network_writer)
        .applied_objects()
        .predicate_filter(lifecycle_hash::<Network>);
    let network_controller = Controller::for_stream(network_stream, network_reader)
        .shutdown_on_signal()
        .run(reconcile_network, error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled network: {:?}", obj),
                Err(e) => warn!("Network reconcile error: {:?}", e),
            }
        });

    let (participants_reader, participants_writer) = reflector::store();
    let participants_stream = watcher(participants, watcher::Config::default())
        .default_backoff()
        .reflect(participants_writer)
        .applied_objects()
        .predicate_filter(lifecycle_hash::<Participants>);
    let participants_controller = Controller::for_stream(participants_stream, participants_reader)
        .shutdown_on_signal()
        .run(reconcile_participants, error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled participants: {:?}", obj),
                Err(e) => warn!("Participants reconcile error: {:?}", e),
            }
        });

    let (pod_reader, pod_writer) = reflector::store();
    let pod_stream = watcher(pods, watcher::Config::default())
        .default_backoff()
        .reflect(pod_writer)
        .applied_objects()
        .try_filter(|p| {
            future::ready(
                !pod::pod_networks(p).is_empty() || p.finalizers().iter().any(|f| f == POD_FINALIZER),
            )
        })
        .predicate_filter(pod_lifecycle_hash);
    let pod_controller = Controller::for_stream(pod_stream, pod_reader)
        .shutdown_on_signal()
        .run(reconcile_pod, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled pod: {:?}", obj),
                Err(e) => warn!("Pod reconcile error: {:?}", e),
            }
        });

    futures::join!(network_controller, participants_controller, pod_controller);
    Ok(())
}
