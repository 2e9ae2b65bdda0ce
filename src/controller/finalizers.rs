//! Finalizer handling
//!
//! A Network carries its own finalizer plus one per active node, so its
//! deletion waits until credentials, secrets and every node's streams are
//! torn down. Participants and Pods are guarded through kube's
//! [`finalizer`](kube::runtime::finalizer) helper with the names below.

use std::collections::BTreeSet;

use kube::{Resource, ResourceExt};
use tracing::info;

use super::retry::retry_on_conflict;
use super::store::ResourceStore;
use crate::crd::Network;
use crate::error::Result;

/// Finalizer protecting a Network until its teardown completes
pub const NETWORK_FINALIZER: &str = "network.edgefarm.io/finalizer";

/// Finalizer protecting a Participants object until it left its network
pub const PARTICIPANTS_FINALIZER: &str = "participants.network.edgefarm.io/finalizer";

/// Finalizer protecting a participating Pod until its departure is recorded
pub const POD_FINALIZER: &str = "pods.network.edgefarm.io/finalizer";

const NODE_FINALIZER_PREFIX: &str = "participation.network.edgefarm.io/";

/// Finalizer kept on a Network while `node` has node-local streams
pub fn node_finalizer(node: &str) -> String {
    format!("{NODE_FINALIZER_PREFIX}{node}")
}

/// Nodes named by node finalizers
pub fn finalized_nodes(finalizers: &[String]) -> BTreeSet<String> {
    finalizers
        .iter()
        .filter_map(|f| f.strip_prefix(NODE_FINALIZER_PREFIX))
        .filter(|node| !node.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer<K: Resource>(obj: &K, name: &str) -> bool {
    obj.finalizers().iter().any(|f| f == name)
}

/// Apply additions and removals, keeping the existing order
///
/// Returns `None` when nothing changes.
pub fn merge_finalizers(
    current: &[String],
    add: &BTreeSet<String>,
    remove: &BTreeSet<String>,
) -> Option<Vec<String>> {
    let mut merged: Vec<String> = current
        .iter()
        .filter(|f| !remove.contains(*f))
        .cloned()
        .collect();
    for name in add {
        if !remove.contains(name) && !merged.contains(name) {
            merged.push(name.clone());
        }
    }
    (merged != current).then_some(merged)
}

/// Add and remove finalizers on a Network, re-reading it on conflict
///
/// Returns the updated Network, or `None` if it no longer exists (removing
/// the last finalizer of a deleting object lets the API server drop it).
pub async fn update_network_finalizers(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    add: &BTreeSet<String>,
    remove: &BTreeSet<String>,
) -> Result<Option<Network>> {
    if add.is_empty() && remove.is_empty() {
        return store.get_network(namespace, name).await;
    }
    retry_on_conflict("update network finalizers", move || async move {
        let Some(mut network) = store.get_network(namespace, name).await? else {
            return Ok(None);
        };
        let Some(finalizers) = merge_finalizers(network.finalizers(), add, remove) else {
            return Ok(Some(network));
        };
        network.metadata.finalizers = Some(finalizers);
        let updated = store.replace_network(&network).await;
        match updated {
            Ok(updated) => {
                info!(
                    network = %name,
                    added = add.len(),
                    removed = remove.len(),
                    "Updated network finalizers"
                );
                Ok(Some(updated))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    })
    .await
}
