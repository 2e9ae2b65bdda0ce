//! Pod controller
//!
//! Records participating pods in the per-node sets of every Network named by
//! their labels. Arrivals land in the creating set, departures in the
//! terminating set; the Network controller's participation pass does the rest.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::broker::MAIN_DOMAIN;
use super::reconciler::Context;
use super::retry::retry_on_conflict;
use super::store::ResourceStore;
use crate::crd::{insert_sorted, NodeState, ParticipationStatus};
use crate::error::Result;

/// Label keys containing this mark name a network in their value
pub const PARTICIPANT_LABEL_MARK: &str = "participant.edgefarm.io/";

/// Networks a pod takes part in, sorted and deduplicated
pub fn pod_networks(pod: &Pod) -> Vec<String> {
    pod.labels()
        .iter()
        .filter(|(k, v)| k.contains(PARTICIPANT_LABEL_MARK) && !v.is_empty())
        .map(|(_, v)| v.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

/// Domain of a node: the node itself for edge nodes, otherwise the main domain
pub async fn pod_domain(store: &dyn ResourceStore, node: &str, edge_label: &str) -> Result<String> {
    let labels = store.node_labels(node).await?.unwrap_or_default();
    if labels.contains_key(edge_label) {
        Ok(node.to_string())
    } else {
        Ok(MAIN_DOMAIN.to_string())
    }
}

/// Record a pod scheduled onto `node`, returning whether the status changed
pub fn record_arrival(status: &mut ParticipationStatus, node: &str, pod: &str) -> bool {
    if status.confirmed(node).iter().any(|p| p == pod) {
        return false;
    }
    let changed = insert_sorted(status.pods_creating.entry(node.to_string()).or_default(), pod);
    let label = match status.state(node) {
        Some(NodeState::Active) | Some(NodeState::Pending) => return changed,
        // streams of a draining node still exist while it has confirmed pods
        Some(NodeState::Terminating) if !status.confirmed(node).is_empty() => NodeState::Active,
        _ => NodeState::Pending,
    };
    status.nodes.insert(node.to_string(), label);
    true
}

/// Record a pod leaving, returning whether the status changed
///
/// The node the pod was recorded on wins over `node`. A pod that was never
/// absorbed is simply dropped from the creating set.
pub fn record_departure(status: &mut ParticipationStatus, node: &str, pod: &str) -> bool {
    let node = status.node_of_pod(pod).unwrap_or_else(|| node.to_string());

    let confirmed = status.confirmed(&node).iter().any(|p| p == pod);
    if !confirmed {
        let Some(creating) = status.pods_creating.get_mut(&node) else {
            return false;
        };
        let before = creating.len();
        creating.retain(|p| p != pod);
        if before == creating.len() {
            return false;
        }
        if creating.is_empty() {
            status.pods_creating.remove(&node);
            if status.confirmed(&node).is_empty() && status.terminating(&node).is_empty() {
                status.nodes.remove(&node);
            }
        }
        return true;
    }

    let changed = insert_sorted(
        status.pods_terminating.entry(node.clone()).or_default(),
        pod,
    );
    let all_leaving = {
        let terminating: BTreeSet<_> = status.terminating(&node).iter().collect();
        let confirmed: BTreeSet<_> = status.confirmed(&node).iter().collect();
        terminating == confirmed
    };
    if all_leaving && status.creating(&node).is_empty() && status.state(&node) != Some(NodeState::Terminating) {
        status.nodes.insert(node, NodeState::Terminating);
        return true;
    }
    changed
}

/// Apply `record` to the status of every named network
async fn update_networks<F>(
    ctx: &Context,
    namespace: &str,
    networks: &[String],
    domain: &str,
    pod: &str,
    record: F,
) -> Result<Vec<String>>
where
    F: Fn(&mut ParticipationStatus, &str, &str) -> bool + Copy + Send + Sync,
{
    let store = ctx.store.as_ref();
    let mut missing = Vec::new();
    for network_name in networks {
        let name = network_name.as_str();
        let found = retry_on_conflict("record pod participation", move || async move {
            let Some(mut network) = store.get_network(namespace, name).await? else {
                return Ok(false);
            };
            let mut status = network.status.clone().unwrap_or_default();
            if !record(&mut status.participating, domain, pod) {
                debug!(network = %name, "Participation already recorded");
                return Ok(true);
            }
            network.status = Some(status);
            store.replace_network_status(&network).await?;
            info!(network = %name, node = %domain, "Recorded pod participation");
            Ok(true)
        })
        .await?;
        if !found {
            missing.push(network_name.clone());
        }
    }
    Ok(missing)
}

#[instrument(skip(pod, ctx), fields(pod = %pod.name_any(), namespace = pod.namespace()))]
pub async fn apply(pod: &Pod, ctx: &Context) -> Result<Action> {
    let networks = pod_networks(pod);
    if networks.is_empty() {
        return Ok(Action::await_change());
    }
    let Some(node) = node_name(pod) else {
        debug!("Pod not scheduled yet");
        return Ok(Action::requeue(ctx.config.requeue));
    };
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let domain = pod_domain(ctx.store.as_ref(), node, &ctx.config.edge_node_label).await?;
    let name = pod.name_any();

    let missing = update_networks(ctx, &namespace, &networks, &domain, &name, record_arrival).await?;
    if !missing.is_empty() {
        warn!(networks = ?missing, "Networks of pod do not exist yet, requeueing");
        return Ok(Action::requeue(ctx.config.requeue));
    }
    Ok(Action::requeue(ctx.config.requeue))
}

#[instrument(skip(pod, ctx), fields(pod = %pod.name_any(), namespace = pod.namespace()))]
pub async fn cleanup(pod: &Pod, ctx: &Context) -> Result<Action> {
    let networks = pod_networks(pod);
    let Some(node) = node_name(pod) else {
        return Ok(Action::await_change());
    };
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let domain = pod_domain(ctx.store.as_ref(), node, &ctx.config.edge_node_label).await?;
    let name = pod.name_any();

    let missing = update_networks(ctx, &namespace, &networks, &domain, &name, record_departure).await?;
    if !missing.is_empty() {
        debug!(networks = ?missing, "Networks already gone");
    }
    Ok(Action::await_change())
}
