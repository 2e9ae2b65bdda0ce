//! Response bodies of the REST API

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::crd::{Network, NodeState};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether this replica currently reconciles
    pub leader: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// Participation summary of one network
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSummary {
    pub name: String,
    pub namespace: String,
    pub account_name: Option<String>,
    pub participants: usize,
    pub active_nodes: Vec<String>,
    pub pending_nodes: Vec<String>,
    pub terminating_nodes: Vec<String>,
    pub deleting: bool,
}

impl From<&Network> for NetworkSummary {
    fn from(network: &Network) -> Self {
        let participation = network.participation();
        let nodes_in = |state: NodeState| {
            participation
                .nodes
                .iter()
                .filter(|(_, s)| **s == state)
                .map(|(n, _)| n.clone())
                .collect()
        };
        Self {
            name: network.name_any(),
            namespace: network.namespace().unwrap_or_default(),
            account_name: network.account_name(),
            participants: network.spec.participants.len(),
            active_nodes: nodes_in(NodeState::Active),
            pending_nodes: nodes_in(NodeState::Pending),
            terminating_nodes: nodes_in(NodeState::Terminating),
            deleting: network.metadata.deletion_timestamp.is_some(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkListResponse {
    pub items: Vec<NetworkSummary>,
    pub total: usize,
}
