//! Shared types for the Network and Participants resources
//!
//! - [`ParticipantType`] - where a participating component runs (edge node or cloud)
//! - [`StreamSpec`] - one declared message stream with its placement and policies
//! - [`ParticipationStatus`] - per-node pod bookkeeping recorded in the Network status
//! - [`MainDomainStatus`] - streams created in the shared main domain

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Where a participating component is deployed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    /// Runs on an edge node and connects through the local leaf broker
    Edge,
    /// Runs in the cloud and connects to the main broker
    Cloud,
    /// Internal participants without a sidecar, e.g. the operator's own housekeeping user
    #[default]
    Unknown,
}

impl std::fmt::Display for ParticipantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantType::Edge => write!(f, "edge"),
            ParticipantType::Cloud => write!(f, "cloud"),
            ParticipantType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Broker placement of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StreamLocation {
    /// Shared main cluster
    Main,
    /// Every edge node that runs a participating pod
    Node,
}

/// Stream storage backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    File,
    #[default]
    Memory,
}

impl FromStr for StorageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(StorageType::File),
            "memory" => Ok(StorageType::Memory),
            other => Err(Error::ConfigError(format!(
                "invalid storage type '{other}', expected one of: file, memory"
            ))),
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::File => write!(f, "file"),
            StorageType::Memory => write!(f, "memory"),
        }
    }
}

/// Message retention policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    #[serde(rename = "workqueue")]
    WorkQueue,
}

impl FromStr for RetentionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limits" => Ok(RetentionPolicy::Limits),
            "interest" => Ok(RetentionPolicy::Interest),
            "workqueue" => Ok(RetentionPolicy::WorkQueue),
            other => Err(Error::ConfigError(format!(
                "invalid retention policy '{other}', expected one of: limits, interest, workqueue"
            ))),
        }
    }
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionPolicy::Limits => write!(f, "limits"),
            RetentionPolicy::Interest => write!(f, "interest"),
            RetentionPolicy::WorkQueue => write!(f, "workqueue"),
        }
    }
}

/// What the broker discards once a stream limit is reached
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    #[default]
    Old,
    New,
}

impl FromStr for DiscardPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "old" => Ok(DiscardPolicy::Old),
            "new" => Ok(DiscardPolicy::New),
            other => Err(Error::ConfigError(format!(
                "invalid discard policy '{other}', expected one of: old, new"
            ))),
        }
    }
}

impl std::fmt::Display for DiscardPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardPolicy::Old => write!(f, "old"),
            DiscardPolicy::New => write!(f, "new"),
        }
    }
}

/// A message stream declared by a network
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpec {
    pub name: String,

    pub location: StreamLocation,

    /// Aggregate a node-located stream of the same network into this main stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<StreamLink>,

    #[serde(default)]
    pub config: StreamConfigSpec,
}

impl StreamSpec {
    /// Main-domain stream fed from node streams
    pub fn is_aggregate(&self) -> bool {
        self.location == StreamLocation::Main && self.link.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamLink {
    /// Name of the node-located stream to aggregate
    pub stream: String,
}

/// Broker limits and policies of a stream. `-1` means unlimited.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfigSpec {
    #[serde(default)]
    pub storage: StorageType,

    #[serde(default)]
    pub retention: RetentionPolicy,

    #[serde(default)]
    pub discard: DiscardPolicy,

    #[serde(default = "unlimited")]
    pub max_msgs_per_subject: i64,

    #[serde(default = "unlimited")]
    pub max_msgs: i64,

    #[serde(default = "unlimited")]
    pub max_bytes: i64,

    #[serde(default = "unlimited_i32")]
    pub max_msg_size: i32,

    /// Duration such as `30s`, `12h`, `2w`, `6M` or `1y`. Empty means unlimited.
    #[serde(default = "default_max_age")]
    pub max_age: String,
}

fn unlimited() -> i64 {
    -1
}

fn unlimited_i32() -> i32 {
    -1
}

fn default_max_age() -> String {
    "1y".to_string()
}

impl Default for StreamConfigSpec {
    fn default() -> Self {
        Self {
            storage: StorageType::default(),
            retention: RetentionPolicy::default(),
            discard: DiscardPolicy::default(),
            max_msgs_per_subject: unlimited(),
            max_msgs: unlimited(),
            max_bytes: unlimited(),
            max_msg_size: unlimited_i32(),
            max_age: default_max_age(),
        }
    }
}

/// Subjects that are captured by a stream
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSpec {
    pub name: String,
    pub stream: String,
    #[serde(default)]
    pub subjects: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportSpec {
    pub from: String,
    pub to: String,
}

/// Lifecycle label of a node within a network
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Active,
    Terminating,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Pending => write!(f, "pending"),
            NodeState::Active => write!(f, "active"),
            NodeState::Terminating => write!(f, "terminating"),
        }
    }
}

/// Per-node pod bookkeeping. Pod lists are kept sorted and deduplicated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParticipationStatus {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeState>,

    /// Pods confirmed participating, by node
    #[serde(default)]
    pub pods: BTreeMap<String, Vec<String>>,

    /// Pods scheduled but not yet absorbed, by node
    #[serde(default)]
    pub pods_creating: BTreeMap<String, Vec<String>>,

    /// Pods leaving, by node
    #[serde(default)]
    pub pods_terminating: BTreeMap<String, Vec<String>>,
}

impl ParticipationStatus {
    /// Every node mentioned anywhere in the status
    pub fn node_names(&self) -> BTreeSet<String> {
        self.nodes
            .keys()
            .chain(self.pods.keys())
            .chain(self.pods_creating.keys())
            .chain(self.pods_terminating.keys())
            .cloned()
            .collect()
    }

    pub fn state(&self, node: &str) -> Option<NodeState> {
        self.nodes.get(node).copied()
    }

    pub fn confirmed(&self, node: &str) -> &[String] {
        self.pods.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn creating(&self, node: &str) -> &[String] {
        self.pods_creating
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn terminating(&self, node: &str) -> &[String] {
        self.pods_terminating
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Nodes whose node-local streams exist
    pub fn active_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, state)| **state == NodeState::Active)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Node a pod is recorded on, searching confirmed then creating pods
    pub fn node_of_pod(&self, pod: &str) -> Option<String> {
        self.pods
            .iter()
            .chain(self.pods_creating.iter())
            .find(|(_, pods)| pods.iter().any(|p| p == pod))
            .map(|(node, _)| node.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.node_names().is_empty()
    }
}

/// Insert into a sorted pod list, returning false if already present
pub fn insert_sorted(list: &mut Vec<String>, item: &str) -> bool {
    match list.binary_search_by(|p| p.as_str().cmp(item)) {
        Ok(_) => false,
        Err(pos) => {
            list.insert(pos, item.to_string());
            true
        }
    }
}

/// Creation state of a stream in the main domain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Created,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStreamStatus {
    /// Node domains the aggregate currently sources from
    #[serde(default)]
    pub source_domains: Vec<String>,

    /// Node-local stream name mirrored from every source domain
    pub source_name: String,

    pub state: StreamState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MainDomainStatus {
    #[serde(default)]
    pub standard: BTreeMap<String, StreamState>,

    #[serde(default)]
    pub aggregate: BTreeMap<String, AggregateStreamStatus>,
}
