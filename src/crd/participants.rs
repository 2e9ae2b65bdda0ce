//! Participants Custom Resource Definition
//!
//! Declares that a component of an application takes part in a Network.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ParticipantType;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "network.edgefarm.io",
    version = "v1alpha1",
    kind = "Participants",
    namespaced,
    shortname = "part",
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".spec.network"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsSpec {
    pub app: String,
    pub component: String,
    #[serde(rename = "type", default)]
    pub participant_type: ParticipantType,
    /// Name of the Network, in the same namespace
    pub network: String,
}

impl ParticipantsSpec {
    /// Identifier used as participant key and component secret name
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.app, self.component)
    }
}
