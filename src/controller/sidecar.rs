//! Messaging sidecar manifest
//!
//! Components talk to the broker through a Dapr JetStream pub/sub component,
//! one per network they participate in.

use serde::{Deserialize, Serialize};

use crate::crd::ParticipantType;
use crate::error::Result;

/// Broker addresses handed to sidecars and bootstrap workloads
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerUrls {
    /// Main broker, used by cloud participants
    pub nats_url: String,
    /// Local leaf broker on edge nodes
    pub leaf_url: String,
}

impl BrokerUrls {
    /// URL a participant's sidecar connects to; `None` for participants without a sidecar
    pub fn for_participant(&self, participant_type: ParticipantType) -> Option<&str> {
        match participant_type {
            ParticipantType::Edge => Some(&self.leaf_url),
            ParticipantType::Cloud => Some(&self.nats_url),
            ParticipantType::Unknown => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaprComponent {
    pub api_version: String,
    pub kind: String,
    pub metadata: ComponentMetadata,
    pub spec: ComponentSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetadata {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(rename = "type")]
    pub component_type: String,
    pub version: String,
    pub metadata: Vec<MetadataItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub name: String,
    pub value: String,
}

impl DaprComponent {
    /// JetStream pub/sub component named after the network
    pub fn jetstream(network: &str, nats_url: &str, jwt: &str, seed: &str) -> Self {
        let item = |name: &str, value: &str| MetadataItem {
            name: name.to_string(),
            value: value.to_string(),
        };
        Self {
            api_version: "dapr.io/v1alpha1".to_string(),
            kind: "Component".to_string(),
            metadata: ComponentMetadata {
                name: network.to_string(),
            },
            spec: ComponentSpec {
                component_type: "pubsub.jetstream".to_string(),
                version: "v1".to_string(),
                metadata: vec![
                    item("natsURL", nats_url),
                    item("jwt", jwt),
                    item("seedKey", seed),
                ],
            },
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Key of a network's manifest inside the sidecar secret
pub fn manifest_key(network: &str) -> String {
    format!("{network}.yaml")
}
