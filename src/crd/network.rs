//! Network Custom Resource Definition
//!
//! A Network groups participating components that share broker credentials
//! and message streams. Streams are placed either in the shared main domain
//! or on every edge node running a participating pod.

use std::collections::{BTreeMap, BTreeSet};

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ImportSpec, MainDomainStatus, ParticipantType, ParticipationStatus, StreamLocation, StreamSpec,
    SubjectSpec,
};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "network.edgefarm.io",
    version = "v1alpha1",
    kind = "Network",
    namespaced,
    status = "NetworkStatus",
    shortname = "net",
    printcolumn = r#"{"name":"Account","type":"string","jsonPath":".status.accountName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Namespace the component secrets are written to; defaults to the Network's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Broker account; when unset the account assigned by the credential service is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,

    /// Component identifier (`<app>.<component>`) to participant type
    #[serde(default)]
    pub participants: BTreeMap<String, ParticipantType>,

    #[serde(default)]
    pub streams: Vec<StreamSpec>,

    #[serde(default)]
    pub subjects: Vec<SubjectSpec>,

    #[serde(default)]
    pub imports: Vec<ImportSpec>,
}

impl NetworkSpec {
    /// Validate stream declarations before any broker call is made
    pub fn validate(&self) -> Result<(), String> {
        let mut names = BTreeSet::new();
        for stream in &self.streams {
            if stream.name.is_empty() {
                return Err("stream name must not be empty".to_string());
            }
            if stream
                .name
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>' | '/' | '\\'))
            {
                return Err(format!(
                    "stream name '{}' must not contain whitespace, '.', '*', '>' or path separators",
                    stream.name
                ));
            }
            if !names.insert(stream.name.as_str()) {
                return Err(format!("duplicate stream name '{}'", stream.name));
            }
        }

        for stream in &self.streams {
            let Some(link) = &stream.link else {
                continue;
            };
            if stream.location != StreamLocation::Main {
                return Err(format!(
                    "stream '{}': only main streams may link to node streams",
                    stream.name
                ));
            }
            let linked = self.streams.iter().find(|s| s.name == link.stream);
            match linked {
                Some(s) if s.location == StreamLocation::Node => {}
                Some(_) => {
                    return Err(format!(
                        "stream '{}' links to '{}' which is not a node stream",
                        stream.name, link.stream
                    ))
                }
                None => {
                    return Err(format!(
                        "stream '{}' links to unknown stream '{}'",
                        stream.name, link.stream
                    ))
                }
            }
        }

        for subject in &self.subjects {
            if !names.contains(subject.stream.as_str()) {
                return Err(format!(
                    "subject '{}' references unknown stream '{}'",
                    subject.name, subject.stream
                ));
            }
        }

        Ok(())
    }

    /// Subject filter of a stream: union of every subject spec naming it, in declaration order
    pub fn subjects_for(&self, stream: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.subjects
            .iter()
            .filter(|s| s.stream == stream)
            .flat_map(|s| s.subjects.iter())
            .filter(|s| seen.insert(s.as_str()))
            .cloned()
            .collect()
    }

    pub fn node_streams(&self) -> impl Iterator<Item = &StreamSpec> {
        self.streams
            .iter()
            .filter(|s| s.location == StreamLocation::Node)
    }

    /// Main streams that are not fed from node streams
    pub fn standard_main_streams(&self) -> impl Iterator<Item = &StreamSpec> {
        self.streams
            .iter()
            .filter(|s| s.location == StreamLocation::Main && s.link.is_none())
    }

    pub fn aggregate_streams(&self) -> impl Iterator<Item = &StreamSpec> {
        self.streams.iter().filter(|s| s.is_aggregate())
    }
}

impl Network {
    /// Namespace the component secrets live in
    pub fn target_namespace(&self) -> String {
        self.spec
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| self.namespace())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Account name from the spec, falling back to the one recorded in status
    pub fn account_name(&self) -> Option<String> {
        self.spec
            .account_name
            .clone()
            .filter(|a| !a.is_empty())
            .or_else(|| self.status.as_ref().and_then(|s| s.account_name.clone()))
    }

    pub fn participation(&self) -> ParticipationStatus {
        self.status
            .as_ref()
            .map(|s| s.participating.clone())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Account assigned by the credential service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,

    #[serde(default)]
    pub participating: ParticipationStatus,

    #[serde(default)]
    pub main_domain: MainDomainStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
