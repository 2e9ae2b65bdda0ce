//! Participation state machine
//!
//! Every node of a network carries three pod sets: confirmed (P), creating (C)
//! and terminating (T), plus a lifecycle label. A pass classifies each node,
//! performs the broker work its class requires and returns a
//! [`ParticipationPlan`] of per-node deltas and finalizer changes. The plan is
//! applied to a freshly read status by the caller, so pod arrivals and
//! departures recorded between read and write are never lost. Deltas therefore
//! name the pods they move instead of replacing whole sets.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::finalizers::node_finalizer;
use super::streams::StreamManager;
use crate::crd::{insert_sorted, NetworkSpec, NodeState, ParticipationStatus};

/// Class of a node in one pass, evaluated in declaration order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeClass {
    /// Pods arriving, none confirmed yet
    New,
    /// Pods arriving next to confirmed ones
    StillParticipatingCreate,
    /// Every confirmed pod is leaving
    StillParticipatingDelete,
    /// Some pods finished leaving
    Deleted,
    Invalid,
}

impl std::fmt::Display for NodeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeClass::New => write!(f, "new"),
            NodeClass::StillParticipatingCreate => write!(f, "still-participating-create"),
            NodeClass::StillParticipatingDelete => write!(f, "still-participating-delete"),
            NodeClass::Deleted => write!(f, "deleted"),
            NodeClass::Invalid => write!(f, "invalid"),
        }
    }
}

fn set_equal(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Classify a node from its confirmed, creating and terminating pods
pub fn classify(confirmed: &[String], creating: &[String], terminating: &[String]) -> NodeClass {
    if !creating.is_empty() && confirmed.is_empty() {
        NodeClass::New
    } else if !creating.is_empty() {
        NodeClass::StillParticipatingCreate
    } else if !confirmed.is_empty() && set_equal(terminating, confirmed) {
        NodeClass::StillParticipatingDelete
    } else if !terminating.is_empty() {
        NodeClass::Deleted
    } else {
        NodeClass::Invalid
    }
}

/// Status change for one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeDelta {
    /// Node streams exist: label active, move `absorbed` from creating to confirmed
    Activate { absorbed: Vec<String> },
    /// Move `absorbed` from creating to confirmed
    Absorb { absorbed: Vec<String> },
    /// Node streams are gone: drop the departed pods. Pods that arrived since
    /// stay in creating and the node goes back to pending.
    Remove {
        confirmed: Vec<String>,
        terminating: Vec<String>,
    },
    /// Drop `drained` from confirmed and terminating
    Drain { drained: Vec<String> },
    /// Drop the node with every pod set, for a Network being deleted
    Purge,
}

/// Outcome of a participation pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParticipationPlan {
    pub deltas: BTreeMap<String, NodeDelta>,
    pub add_finalizers: BTreeSet<String>,
    pub remove_finalizers: BTreeSet<String>,
    /// Nodes whose broker work failed, with the reason; retried next pass
    pub failed_nodes: BTreeMap<String, String>,
}

impl ParticipationPlan {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.add_finalizers.is_empty() && self.remove_finalizers.is_empty()
    }
}

impl ParticipationStatus {
    /// Apply a delta computed from an earlier snapshot of this status
    pub fn apply(&mut self, node: &str, delta: &NodeDelta) {
        match delta {
            NodeDelta::Activate { absorbed } => {
                self.absorb(node, absorbed);
                self.nodes.insert(node.to_string(), NodeState::Active);
            }
            NodeDelta::Absorb { absorbed } => self.absorb(node, absorbed),
            NodeDelta::Remove {
                confirmed,
                terminating,
            } => {
                self.drop_pods(node, confirmed, terminating);
                if self.creating(node).is_empty() {
                    self.nodes.remove(node);
                } else {
                    self.nodes.insert(node.to_string(), NodeState::Pending);
                }
            }
            NodeDelta::Drain { drained } => self.drop_pods(node, drained, drained),
            NodeDelta::Purge => {
                self.nodes.remove(node);
                self.pods.remove(node);
                self.pods_creating.remove(node);
                self.pods_terminating.remove(node);
            }
        }
        self.prune(node);
    }

    /// Move the absorbed pods still creating into confirmed
    ///
    /// A pod that departed since the snapshot is no longer in creating and
    /// stays gone.
    fn absorb(&mut self, node: &str, absorbed: &[String]) {
        let Some(creating) = self.pods_creating.get_mut(node) else {
            return;
        };
        let (moved, kept): (Vec<String>, Vec<String>) =
            creating.drain(..).partition(|p| absorbed.contains(p));
        *creating = kept;
        if moved.is_empty() {
            return;
        }
        let confirmed = self.pods.entry(node.to_string()).or_default();
        for pod in &moved {
            insert_sorted(confirmed, pod);
        }
    }

    fn drop_pods(&mut self, node: &str, confirmed: &[String], terminating: &[String]) {
        if let Some(pods) = self.pods.get_mut(node) {
            pods.retain(|p| !confirmed.contains(p));
        }
        if let Some(pods) = self.pods_terminating.get_mut(node) {
            pods.retain(|p| !terminating.contains(p));
        }
    }

    /// Drop empty pod lists, and the node itself once no pods are left
    fn prune(&mut self, node: &str) {
        for map in [
            &mut self.pods,
            &mut self.pods_creating,
            &mut self.pods_terminating,
        ] {
            if map.get(node).is_some_and(|pods| pods.is_empty()) {
                map.remove(node);
            }
        }
        let has_pods = self.pods.contains_key(node)
            || self.pods_creating.contains_key(node)
            || self.pods_terminating.contains_key(node);
        if !has_pods {
            self.nodes.remove(node);
        }
    }
}

/// Names of the node-local streams of a network
fn node_stream_names(spec: &NetworkSpec) -> Vec<String> {
    spec.node_streams().map(|s| s.name.clone()).collect()
}

/// Classify every node and perform its broker work
///
/// `finalized` names the nodes holding a node finalizer on the Network. A
/// finalized node missing from `status` left before its activation was
/// persisted; its streams are deleted and its finalizer released. Without
/// `streams` no broker work happens and such nodes are left alone.
pub async fn run_participation_pass(
    network: &str,
    spec: &NetworkSpec,
    status: &ParticipationStatus,
    finalized: &BTreeSet<String>,
    streams: Option<&StreamManager>,
) -> ParticipationPlan {
    let mut plan = ParticipationPlan::default();
    let nodes = status.node_names();

    for node in &nodes {
        let node = node.clone();
        let confirmed = status.confirmed(&node);
        let creating = status.creating(&node);
        let terminating = status.terminating(&node);
        let label = status.state(&node);
        let class = classify(confirmed, creating, terminating);
        debug!(network, node = %node, class = %class, label = ?label, "Classified node");

        match class {
            NodeClass::New => {
                let Some(streams) = streams else {
                    debug!(network, node = %node, "Broker unavailable, not activating node");
                    continue;
                };
                match ensure_node_streams(network, spec, &node, streams).await {
                    Ok(()) => {
                        info!(network, node = %node, "Node streams ready, activating node");
                        plan.deltas.insert(
                            node.clone(),
                            NodeDelta::Activate {
                                absorbed: creating.to_vec(),
                            },
                        );
                        plan.add_finalizers.insert(node_finalizer(&node));
                    }
                    Err(reason) => {
                        warn!(network, node = %node, %reason, "Node stays pending");
                        plan.failed_nodes.insert(node.clone(), reason);
                    }
                }
            }
            NodeClass::StillParticipatingCreate => {
                plan.deltas.insert(
                    node.clone(),
                    NodeDelta::Absorb {
                        absorbed: creating.to_vec(),
                    },
                );
            }
            NodeClass::StillParticipatingDelete => {
                if label != Some(NodeState::Terminating) {
                    debug!(network, node = %node, label = ?label, "All pods leaving before node was marked terminating");
                }
                teardown_node(network, spec, &node, label, (confirmed, terminating), streams, &mut plan)
                    .await;
            }
            NodeClass::Deleted => {
                let remaining = confirmed.iter().filter(|p| !terminating.contains(p)).count();
                if remaining == 0 {
                    teardown_node(network, spec, &node, label, (confirmed, terminating), streams, &mut plan)
                        .await;
                } else {
                    info!(network, node = %node, left = terminating.len(), remaining, "Pods left node");
                    plan.deltas.insert(
                        node.clone(),
                        NodeDelta::Drain {
                            drained: terminating.to_vec(),
                        },
                    );
                }
            }
            NodeClass::Invalid => {
                // confirmed pods on an active node are the steady state
                if label == Some(NodeState::Active) && !confirmed.is_empty() {
                    debug!(network, node = %node, "Node steady");
                } else {
                    warn!(network, node = %node, label = ?label, "Node label does not match its pods, ignoring");
                }
            }
        }
    }

    if streams.is_some() {
        let no_pods: &[String] = &[];
        for node in finalized.iter().filter(|n| !nodes.contains(*n)) {
            info!(network, node = %node, "Releasing node without participation");
            teardown_node(network, spec, node, None, (no_pods, no_pods), streams, &mut plan).await;
        }
    }

    plan
}

/// Delete every node's streams and release every node, for a Network being deleted
///
/// Covers nodes in `status` and nodes only known from their finalizer, in
/// whatever class they are. Without `streams` nodes are released without
/// broker work.
pub async fn run_deletion_pass(
    network: &str,
    spec: &NetworkSpec,
    status: &ParticipationStatus,
    finalized: &BTreeSet<String>,
    streams: Option<&StreamManager>,
) -> ParticipationPlan {
    let mut plan = ParticipationPlan::default();
    let nodes: BTreeSet<String> = status.node_names().into_iter().chain(finalized.iter().cloned()).collect();

    for node in nodes {
        // a pending node may hold streams from a partly failed activation
        if let Some(streams) = streams {
            if let Err(e) = streams.delete(&node, network, &node_stream_names(spec)).await {
                warn!(network, node = %node, error = %e, "Node stream teardown failed");
                plan.failed_nodes.insert(node, e.to_string());
                continue;
            }
        }
        debug!(network, node = %node, "Node released");
        plan.remove_finalizers.insert(node_finalizer(&node));
        plan.deltas.insert(node, NodeDelta::Purge);
    }

    plan
}

async fn ensure_node_streams(
    network: &str,
    spec: &NetworkSpec,
    node: &str,
    streams: &StreamManager,
) -> Result<(), String> {
    for stream in spec.node_streams() {
        let subjects = spec.subjects_for(&stream.name);
        streams
            .ensure(node, network, stream, &subjects)
            .await
            .map_err(|e| format!("stream {}: {}", stream.name, e))?;
    }
    Ok(())
}

/// Delete a node's streams and drop its departed pods from status
async fn teardown_node(
    network: &str,
    spec: &NetworkSpec,
    node: &str,
    label: Option<NodeState>,
    (confirmed, terminating): (&[String], &[String]),
    streams: Option<&StreamManager>,
    plan: &mut ParticipationPlan,
) {
    // pending nodes never had streams created
    if label != Some(NodeState::Pending) {
        if let Some(streams) = streams {
            if let Err(e) = streams.delete(node, network, &node_stream_names(spec)).await {
                warn!(network, node = %node, error = %e, "Node stream teardown failed");
                plan.failed_nodes.insert(node.to_string(), e.to_string());
                return;
            }
        }
    }
    info!(network, node = %node, "Node left network");
    plan.deltas.insert(
        node.to_string(),
        NodeDelta::Remove {
            confirmed: confirmed.to_vec(),
            terminating: terminating.to_vec(),
        },
    );
    plan.remove_finalizers.insert(node_finalizer(node));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::pod::{record_arrival, record_departure};
    use crate::controller::retry::RetryPolicy;
    use crate::controller::testing::FakeBroker;
    use crate::crd::{StreamConfigSpec, StreamLocation, StreamSpec};
    use std::time::Duration;

    fn pods(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn spec() -> NetworkSpec {
        NetworkSpec {
            streams: vec![StreamSpec {
                name: "events".to_string(),
                location: StreamLocation::Node,
                link: None,
                config: StreamConfigSpec::default(),
            }],
            ..Default::default()
        }
    }

    fn status_with(
        node: &str,
        state: Option<NodeState>,
        confirmed: &[&str],
        creating: &[&str],
        terminating: &[&str],
    ) -> ParticipationStatus {
        let mut status = ParticipationStatus::default();
        if let Some(state) = state {
            status.nodes.insert(node.to_string(), state);
        }
        if !confirmed.is_empty() {
            status.pods.insert(node.to_string(), pods(confirmed));
        }
        if !creating.is_empty() {
            status.pods_creating.insert(node.to_string(), pods(creating));
        }
        if !terminating.is_empty() {
            status
                .pods_terminating
                .insert(node.to_string(), pods(terminating));
        }
        status
    }

    fn manager(broker: &FakeBroker) -> StreamManager {
        StreamManager::new(broker.session(), RetryPolicy::fixed(5, Duration::ZERO))
    }

    #[test]
    fn test_classification_is_total_and_ordered() {
        let sets: [&[&str]; 4] = [&[], &["a"], &["b"], &["a", "b"]];
        for p in sets {
            for c in sets {
                for t in sets {
                    let (p, c, t) = (pods(p), pods(c), pods(t));
                    let class = classify(&p, &c, &t);
                    let expected = if !c.is_empty() && p.is_empty() {
                        NodeClass::New
                    } else if !c.is_empty() {
                        NodeClass::StillParticipatingCreate
                    } else if !p.is_empty() && set_equal(&t, &p) {
                        NodeClass::StillParticipatingDelete
                    } else if !t.is_empty() {
                        NodeClass::Deleted
                    } else {
                        NodeClass::Invalid
                    };
                    assert_eq!(class, expected, "P={p:?} C={c:?} T={t:?}");
                }
            }
        }
    }

    #[test]
    fn test_classification_examples() {
        assert_eq!(classify(&[], &pods(&["a"]), &[]), NodeClass::New);
        assert_eq!(
            classify(&pods(&["a"]), &pods(&["b"]), &pods(&["a"])),
            NodeClass::StillParticipatingCreate
        );
        assert_eq!(
            classify(&pods(&["a", "b"]), &[], &pods(&["b", "a"])),
            NodeClass::StillParticipatingDelete
        );
        assert_eq!(
            classify(&pods(&["a", "b"]), &[], &pods(&["a"])),
            NodeClass::Deleted
        );
        assert_eq!(classify(&pods(&["a"]), &[], &[]), NodeClass::Invalid);
        assert_eq!(classify(&[], &[], &[]), NodeClass::Invalid);
    }

    #[tokio::test]
    async fn test_new_node_activates_after_streams_exist() {
        let broker = FakeBroker::default();
        let status = status_with("edge-1", Some(NodeState::Pending), &[], &["pod-a"], &[]);

        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), Some(&manager(&broker))).await;

        assert_eq!(
            plan.deltas.get("edge-1"),
            Some(&NodeDelta::Activate {
                absorbed: pods(&["pod-a"])
            })
        );
        assert!(plan.add_finalizers.contains(&node_finalizer("edge-1")));
        assert!(broker.has_stream("edge-1", "net_events"));

        let mut next = status.clone();
        next.apply("edge-1", &plan.deltas["edge-1"]);
        assert_eq!(next.state("edge-1"), Some(NodeState::Active));
        assert_eq!(next.confirmed("edge-1"), pods(&["pod-a"]).as_slice());
        assert!(next.creating("edge-1").is_empty());
    }

    #[tokio::test]
    async fn test_new_node_stays_pending_on_stream_error() {
        let broker = FakeBroker::default();
        broker.fail_next_creates("edge-1", 100);
        let status = status_with("edge-1", Some(NodeState::Pending), &[], &["pod-a"], &[]);

        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), Some(&manager(&broker))).await;

        assert!(plan.deltas.is_empty());
        assert!(plan.add_finalizers.is_empty());
        assert!(plan.failed_nodes.contains_key("edge-1"));
    }

    #[tokio::test]
    async fn test_one_failing_node_does_not_block_others() {
        let broker = FakeBroker::default();
        broker.fail_next_creates("edge-1", 100);
        let mut status = status_with("edge-1", Some(NodeState::Pending), &[], &["pod-a"], &[]);
        status.nodes.insert("edge-2".to_string(), NodeState::Pending);
        status
            .pods_creating
            .insert("edge-2".to_string(), pods(&["pod-b"]));

        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), Some(&manager(&broker))).await;

        assert!(plan.failed_nodes.contains_key("edge-1"));
        assert!(matches!(
            plan.deltas.get("edge-2"),
            Some(NodeDelta::Activate { .. })
        ));
    }

    #[tokio::test]
    async fn test_still_participating_create_absorbs() {
        let status = status_with(
            "edge-1",
            Some(NodeState::Active),
            &["pod-a"],
            &["pod-b", "pod-a"],
            &[],
        );
        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), None).await;

        let mut next = status.clone();
        next.apply("edge-1", &plan.deltas["edge-1"]);
        assert_eq!(next.confirmed("edge-1"), pods(&["pod-a", "pod-b"]).as_slice());
        assert!(next.creating("edge-1").is_empty());
        assert_eq!(next.state("edge-1"), Some(NodeState::Active));
        assert!(plan.add_finalizers.is_empty() && plan.remove_finalizers.is_empty());
    }

    #[tokio::test]
    async fn test_all_pods_leaving_removes_node_and_streams() {
        let broker = FakeBroker::default();
        broker.insert_stream("edge-1", "net_events");
        let status = status_with(
            "edge-1",
            Some(NodeState::Terminating),
            &["pod-a"],
            &[],
            &["pod-a"],
        );

        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), Some(&manager(&broker))).await;

        assert_eq!(
            plan.deltas.get("edge-1"),
            Some(&NodeDelta::Remove {
                confirmed: pods(&["pod-a"]),
                terminating: pods(&["pod-a"]),
            })
        );
        assert!(plan.remove_finalizers.contains(&node_finalizer("edge-1")));
        assert!(!broker.has_stream("edge-1", "net_events"));

        let mut next = status.clone();
        next.apply("edge-1", &plan.deltas["edge-1"]);
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_failure_keeps_node() {
        let broker = FakeBroker::default();
        broker.insert_stream("edge-1", "net_events");
        broker.fail_delete("edge-1", "net_events");
        let status = status_with(
            "edge-1",
            Some(NodeState::Terminating),
            &["pod-a"],
            &[],
            &["pod-a"],
        );

        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), Some(&manager(&broker))).await;

        assert!(plan.deltas.is_empty());
        assert!(plan.remove_finalizers.is_empty());
        assert!(plan.failed_nodes.contains_key("edge-1"));
    }

    #[tokio::test]
    async fn test_partial_departure_drains() {
        let status = status_with(
            "edge-1",
            Some(NodeState::Active),
            &["pod-a", "pod-b"],
            &[],
            &["pod-a"],
        );
        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), None).await;

        assert_eq!(
            plan.deltas.get("edge-1"),
            Some(&NodeDelta::Drain {
                drained: pods(&["pod-a"])
            })
        );
        let mut next = status.clone();
        next.apply("edge-1", &plan.deltas["edge-1"]);
        assert_eq!(next.confirmed("edge-1"), pods(&["pod-b"]).as_slice());
        assert!(next.terminating("edge-1").is_empty());
        assert_eq!(next.state("edge-1"), Some(NodeState::Active));
    }

    #[tokio::test]
    async fn test_pod_arriving_during_teardown_survives() {
        let broker = FakeBroker::default();
        broker.insert_stream("edge-1", "net_events");
        let snapshot = status_with(
            "edge-1",
            Some(NodeState::Terminating),
            &["pod-a"],
            &[],
            &["pod-a"],
        );
        let finalized = BTreeSet::from(["edge-1".to_string()]);
        let plan =
            run_participation_pass("net", &spec(), &snapshot, &finalized, Some(&manager(&broker))).await;

        // the pod controller records pod-b before the pass is persisted
        let mut fresh = snapshot.clone();
        assert!(record_arrival(&mut fresh, "edge-1", "pod-b"));
        fresh.apply("edge-1", &plan.deltas["edge-1"]);

        assert!(fresh.confirmed("edge-1").is_empty());
        assert!(fresh.terminating("edge-1").is_empty());
        assert_eq!(fresh.creating("edge-1"), pods(&["pod-b"]).as_slice());
        assert_eq!(fresh.state("edge-1"), Some(NodeState::Pending));

        // the next pass starts the node again
        let plan =
            run_participation_pass("net", &spec(), &fresh, &BTreeSet::new(), Some(&manager(&broker))).await;
        assert!(matches!(plan.deltas.get("edge-1"), Some(NodeDelta::Activate { .. })));
        assert!(broker.has_stream("edge-1", "net_events"));
    }

    #[tokio::test]
    async fn test_pod_departing_during_absorb_stays_gone() {
        let status = status_with(
            "edge-1",
            Some(NodeState::Active),
            &["pod-a"],
            &["pod-b", "pod-c"],
            &[],
        );
        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), None).await;

        let mut fresh = status.clone();
        assert!(record_departure(&mut fresh, "edge-1", "pod-b"));
        assert!(record_arrival(&mut fresh, "edge-1", "pod-d"));
        fresh.apply("edge-1", &plan.deltas["edge-1"]);

        assert_eq!(fresh.confirmed("edge-1"), pods(&["pod-a", "pod-c"]).as_slice());
        assert_eq!(fresh.creating("edge-1"), pods(&["pod-d"]).as_slice());
    }

    #[tokio::test]
    async fn test_activation_after_only_pod_departed_leaves_no_node() {
        let broker = FakeBroker::default();
        let snapshot = status_with("edge-1", Some(NodeState::Pending), &[], &["pod-a"], &[]);
        let plan =
            run_participation_pass("net", &spec(), &snapshot, &BTreeSet::new(), Some(&manager(&broker))).await;
        assert!(plan.add_finalizers.contains(&node_finalizer("edge-1")));

        let mut fresh = snapshot.clone();
        assert!(record_departure(&mut fresh, "edge-1", "pod-a"));
        fresh.apply("edge-1", &plan.deltas["edge-1"]);
        assert!(fresh.is_empty());

        // the finalizer landed without a node; the next pass releases it
        let finalized = BTreeSet::from(["edge-1".to_string()]);
        let plan =
            run_participation_pass("net", &spec(), &fresh, &finalized, Some(&manager(&broker))).await;
        assert!(plan.remove_finalizers.contains(&node_finalizer("edge-1")));
        assert!(!broker.has_stream("edge-1", "net_events"));
    }

    #[tokio::test]
    async fn test_orphaned_finalizer_kept_without_broker() {
        let finalized = BTreeSet::from(["edge-1".to_string()]);
        let plan = run_participation_pass(
            "net",
            &spec(),
            &ParticipationStatus::default(),
            &finalized,
            None,
        )
        .await;
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_deletion_releases_nodes_in_every_class() {
        let broker = FakeBroker::default();
        broker.insert_stream("edge-1", "net_events");
        broker.insert_stream("edge-3", "net_events");
        // edge-1 steady with running pods, edge-2 pending, edge-3 only finalized
        let mut status = status_with("edge-1", Some(NodeState::Active), &["pod-a"], &[], &[]);
        status.nodes.insert("edge-2".to_string(), NodeState::Pending);
        status
            .pods_creating
            .insert("edge-2".to_string(), pods(&["pod-b"]));
        let finalized = BTreeSet::from(["edge-1".to_string(), "edge-3".to_string()]);

        let plan = run_deletion_pass("net", &spec(), &status, &finalized, Some(&manager(&broker))).await;

        assert!(plan.failed_nodes.is_empty());
        for node in ["edge-1", "edge-2", "edge-3"] {
            assert_eq!(plan.deltas.get(node), Some(&NodeDelta::Purge));
            assert!(plan.remove_finalizers.contains(&node_finalizer(node)));
        }
        assert!(!broker.has_stream("edge-1", "net_events"));
        assert!(!broker.has_stream("edge-3", "net_events"));
        assert!(broker.streams_in("edge-2").is_empty());

        let mut next = status.clone();
        for (node, delta) in &plan.deltas {
            next.apply(node, delta);
        }
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn test_deletion_keeps_node_when_teardown_fails() {
        let broker = FakeBroker::default();
        broker.insert_stream("edge-1", "net_events");
        broker.fail_delete("edge-1", "net_events");
        let status = status_with("edge-1", Some(NodeState::Active), &["pod-a"], &[], &[]);
        let finalized = BTreeSet::from(["edge-1".to_string()]);

        let plan = run_deletion_pass("net", &spec(), &status, &finalized, Some(&manager(&broker))).await;

        assert!(plan.deltas.is_empty());
        assert!(plan.remove_finalizers.is_empty());
        assert!(plan.failed_nodes.contains_key("edge-1"));
    }

    #[tokio::test]
    async fn test_invalid_node_is_ignored() {
        let status = status_with("edge-1", Some(NodeState::Active), &["pod-a"], &[], &[]);
        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), None).await;
        assert!(plan.is_empty());
        assert!(plan.failed_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_mislabelled_invalid_node_is_left_alone() {
        let status = status_with("edge-1", Some(NodeState::Terminating), &["pod-a"], &[], &[]);
        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), None).await;
        assert!(plan.is_empty());
        assert!(plan.failed_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_new_node_activates_whatever_its_label() {
        let broker = FakeBroker::default();
        broker.insert_stream("edge-1", "net_events");
        let status = status_with("edge-1", Some(NodeState::Active), &[], &["pod-a"], &[]);

        let plan = run_participation_pass("net", &spec(), &status, &BTreeSet::new(), Some(&manager(&broker))).await;

        assert_eq!(
            plan.deltas.get("edge-1"),
            Some(&NodeDelta::Activate {
                absorbed: pods(&["pod-a"])
            })
        );
        assert_eq!(broker.create_calls(), 0);
    }

    #[test]
    fn test_apply_keeps_concurrent_arrivals() {
        let mut status = status_with(
            "edge-1",
            Some(NodeState::Pending),
            &[],
            &["pod-a", "pod-b"],
            &[],
        );
        // pod-b arrived after the plan was computed from a snapshot holding only pod-a
        status.apply(
            "edge-1",
            &NodeDelta::Activate {
                absorbed: pods(&["pod-a"]),
            },
        );
        assert_eq!(status.confirmed("edge-1"), pods(&["pod-a"]).as_slice());
        assert_eq!(status.creating("edge-1"), pods(&["pod-b"]).as_slice());
    }
}
