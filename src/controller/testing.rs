//! In-memory collaborators for controller tests

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::ResourceExt;

use super::broker::{BrokerConnector, BrokerSession, StreamConfig, StreamSource};
use super::credentials::{CredentialService, DesiredState, ParticipantCredentials};
use super::secrets::secret_entries;
use super::store::ResourceStore;
use crate::crd::Network;
use crate::error::{Error, Result};

/// Content of a NATS creds file
pub fn creds_file(jwt: &str, seed: &str) -> String {
    format!(
        "-----BEGIN NATS USER JWT-----\n{jwt}\n------END NATS USER JWT------\n\n\
         ************************* IMPORTANT *************************\n\
         NKEY Seed printed below can be used to sign and prove identity.\n\n\
         -----BEGIN USER NKEY SEED-----\n{seed}\n------END USER NKEY SEED------\n"
    )
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct StoreState {
    secrets: BTreeMap<Key, Secret>,
    networks: BTreeMap<Key, Network>,
    namespaces: BTreeSet<String>,
    nodes: BTreeMap<String, BTreeMap<String, String>>,
    version: u64,
    secret_conflicts: u32,
    concurrent_upsert: Option<(Key, Vec<(String, String)>)>,
    network_conflicts: u32,
    status_writes: u32,
}

impl StoreState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// [`ResourceStore`] with resourceVersion based optimistic concurrency
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn secret_entries(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        let state = self.state.lock().unwrap();
        state.secrets.get(&key(namespace, name)).map(secret_entries)
    }

    pub fn insert_secret(&self, namespace: &str, name: &str, entries: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.to_string());
        secret.metadata.namespace = Some(namespace.to_string());
        secret.metadata.resource_version = Some(version);
        secret.data = Some(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        );
        state.secrets.insert(key(namespace, name), secret);
    }

    /// Fail the next `n` secret replacements with a conflict
    pub fn inject_secret_conflicts(&self, n: u32) {
        self.state.lock().unwrap().secret_conflicts = n;
    }

    /// Let another writer add `entries` to a secret just before our next write to it lands
    pub fn upsert_before_next_write(&self, namespace: &str, name: &str, entries: &[(&str, &str)]) {
        let entries = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state.lock().unwrap().concurrent_upsert = Some((key(namespace, name), entries));
    }

    fn apply_concurrent_upsert(state: &mut StoreState, k: &Key) {
        if state.concurrent_upsert.as_ref().map(|(target, _)| target) != Some(k) {
            return;
        }
        let Some((_, entries)) = state.concurrent_upsert.take() else {
            return;
        };
        let version = state.next_version();
        if let Some(stored) = state.secrets.get_mut(k) {
            let data = stored.data.get_or_insert_with(Default::default);
            for (entry, value) in entries {
                data.insert(entry, ByteString(value.into_bytes()));
            }
            stored.metadata.resource_version = Some(version);
        }
    }

    /// Fail the next `n` network writes with a conflict
    pub fn inject_network_conflicts(&self, n: u32) {
        self.state.lock().unwrap().network_conflicts = n;
    }

    pub fn insert_network(&self, mut network: Network) -> Network {
        let mut state = self.state.lock().unwrap();
        let namespace = network.namespace().unwrap_or_else(|| "default".to_string());
        network.metadata.namespace = Some(namespace.clone());
        network.metadata.resource_version = Some(state.next_version());
        network.metadata.generation.get_or_insert(1);
        state
            .networks
            .insert(key(&namespace, &network.name_any()), network.clone());
        network
    }

    pub fn network(&self, namespace: &str, name: &str) -> Option<Network> {
        let state = self.state.lock().unwrap();
        state.networks.get(&key(namespace, name)).cloned()
    }

    /// Request deletion the way the API server does
    pub fn delete_network(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        let version = state.next_version();
        let Some(network) = state.networks.get_mut(&k) else {
            return;
        };
        if network.finalizers().is_empty() {
            state.networks.remove(&k);
        } else {
            network.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            network.metadata.resource_version = Some(version);
        }
    }

    pub fn add_node(&self, name: &str, labels: &[(&str, &str)]) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert(name.to_string(), labels);
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains(name)
    }

    pub fn status_writes(&self) -> u32 {
        self.state.lock().unwrap().status_writes
    }

    fn take_network_conflict(state: &mut StoreState, name: &str) -> Result<()> {
        if state.network_conflicts > 0 {
            state.network_conflicts -= 1;
            return Err(Error::Conflict(format!("network {name}")));
        }
        Ok(())
    }
}

fn check_version(stored: Option<&String>, given: Option<&String>, what: &str) -> Result<()> {
    match (stored, given) {
        (Some(stored), Some(given)) if stored != given => Err(Error::Conflict(what.to_string())),
        _ => Ok(()),
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, &secret.name_any());
        if state.secrets.contains_key(&k) {
            return Err(Error::Conflict(format!("secret {namespace}/{} exists", k.1)));
        }
        let mut stored = secret.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.secrets.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let mut state = self.state.lock().unwrap();
        let name = secret.name_any();
        if state.secret_conflicts > 0 {
            state.secret_conflicts -= 1;
            // a concurrent writer bumped the version
            let version = state.next_version();
            if let Some(stored) = state.secrets.get_mut(&key(namespace, &name)) {
                stored.metadata.resource_version = Some(version);
            }
            return Err(Error::Conflict(format!("secret {namespace}/{name}")));
        }
        let k = key(namespace, &name);
        Self::apply_concurrent_upsert(&mut state, &k);
        let Some(stored) = state.secrets.get(&k) else {
            return Err(Error::NotFound(format!("secret {namespace}/{name}")));
        };
        check_version(
            stored.metadata.resource_version.as_ref(),
            secret.metadata.resource_version.as_ref(),
            &name,
        )?;
        let mut updated = secret.clone();
        updated.metadata.resource_version = Some(state.next_version());
        state.secrets.insert(k, updated.clone());
        Ok(updated)
    }

    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        Self::apply_concurrent_upsert(&mut state, &k);
        let Some(stored) = state.secrets.get(&k) else {
            return Ok(false);
        };
        check_version(
            stored.metadata.resource_version.as_ref(),
            resource_version.map(str::to_string).as_ref(),
            name,
        )?;
        state.secrets.remove(&k);
        Ok(true)
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .insert(name.to_string());
        Ok(())
    }

    async fn get_network(&self, namespace: &str, name: &str) -> Result<Option<Network>> {
        Ok(self.network(namespace, name))
    }

    async fn replace_network(&self, network: &Network) -> Result<Network> {
        let mut state = self.state.lock().unwrap();
        let name = network.name_any();
        let namespace = network.namespace().unwrap_or_else(|| "default".to_string());
        Self::take_network_conflict(&mut state, &name)?;
        let k = key(&namespace, &name);
        let Some(stored) = state.networks.get(&k).cloned() else {
            return Err(Error::NotFound(format!("network {namespace}/{name}")));
        };
        check_version(
            stored.metadata.resource_version.as_ref(),
            network.metadata.resource_version.as_ref(),
            &name,
        )?;
        let mut updated = network.clone();
        updated.status = stored.status.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        if spec_changed(&updated, &stored) {
            updated.metadata.generation = Some(stored.metadata.generation.unwrap_or(1) + 1);
        }
        updated.metadata.resource_version = Some(state.next_version());
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.networks.remove(&k);
        } else {
            state.networks.insert(k, updated.clone());
        }
        Ok(updated)
    }

    async fn replace_network_status(&self, network: &Network) -> Result<Network> {
        let mut state = self.state.lock().unwrap();
        let name = network.name_any();
        let namespace = network.namespace().unwrap_or_else(|| "default".to_string());
        Self::take_network_conflict(&mut state, &name)?;
        let k = key(&namespace, &name);
        let Some(mut stored) = state.networks.get(&k).cloned() else {
            return Err(Error::NotFound(format!("network {namespace}/{name}")));
        };
        check_version(
            stored.metadata.resource_version.as_ref(),
            network.metadata.resource_version.as_ref(),
            &name,
        )?;
        stored.status = network.status.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.status_writes += 1;
        state.networks.insert(k, stored.clone());
        Ok(stored)
    }

    async fn list_networks(&self, namespace: Option<&str>) -> Result<Vec<Network>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .networks
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |n| n == ns))
            .map(|(_, n)| n.clone())
            .collect())
    }

    async fn node_labels(&self, node: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.state.lock().unwrap().nodes.get(node).cloned())
    }
}

fn spec_changed(a: &Network, b: &Network) -> bool {
    serde_json::to_value(&a.spec).ok() != serde_json::to_value(&b.spec).ok()
}

#[derive(Default)]
struct CredentialState {
    revoked: Vec<String>,
    unavailable: bool,
    requests: Vec<(String, Vec<String>)>,
    deleted_networks: Vec<String>,
    deleted_accounts: Vec<String>,
}

/// [`CredentialService`] issuing deterministic credentials
#[derive(Default)]
pub struct FakeCredentials {
    state: Mutex<CredentialState>,
}

impl FakeCredentials {
    pub fn account_for(network: &str) -> String {
        format!("acc-{network}")
    }

    pub fn creds_for(network: &str, participant: &str) -> String {
        creds_file(&format!("jwt-{network}-{participant}"), &format!("seed-{participant}"))
    }

    pub fn revoke(&self, participant: &str) {
        self.state
            .lock()
            .unwrap()
            .revoked
            .push(participant.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Participant lists of every desired-state request, by network
    pub fn requests(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn deleted_networks(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_networks.clone()
    }

    pub fn deleted_accounts(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_accounts.clone()
    }
}

#[async_trait]
impl CredentialService for FakeCredentials {
    async fn desired_state(&self, network: &str, participants: &[String]) -> Result<DesiredState> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(Error::CredentialService("503 unavailable".to_string()));
        }
        state
            .requests
            .push((network.to_string(), participants.to_vec()));
        let creds = participants
            .iter()
            .filter(|p| !state.revoked.contains(p))
            .map(|p| {
                (
                    p.clone(),
                    ParticipantCredentials {
                        creds: Self::creds_for(network, p),
                        account_public_key: format!("APUB-{network}"),
                    },
                )
            })
            .collect();
        Ok(DesiredState {
            account_name: Self::account_for(network),
            creds,
            deleted_participants: state.revoked.clone(),
        })
    }

    async fn delete_network(&self, network: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(Error::CredentialService("503 unavailable".to_string()));
        }
        state.deleted_networks.push(network.to_string());
        Ok(())
    }

    async fn delete_account(&self, account: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(Error::CredentialService("503 unavailable".to_string()));
        }
        state.deleted_accounts.push(account.to_string());
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        if self.state.lock().unwrap().unavailable {
            return Err(Error::CredentialService("503 unavailable".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct BrokerState {
    streams: BTreeMap<Key, StreamConfig>,
    calls: Vec<String>,
    create_calls: usize,
    fail_creates: BTreeMap<String, u32>,
    fail_deletes: BTreeSet<Key>,
    connects: Vec<String>,
    closes: usize,
    fail_connect: bool,
}

/// Broker holding streams per domain; clones share state
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn session(&self) -> Box<dyn BrokerSession> {
        Box::new(FakeSession {
            state: self.state.clone(),
        })
    }

    /// Every administrative call, as `<operation> <domain> <stream>`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Create attempts, including failed ones
    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn has_stream(&self, domain: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .streams
            .contains_key(&key(domain, name))
    }

    pub fn stream(&self, domain: &str, name: &str) -> Option<StreamConfig> {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(&key(domain, name))
            .cloned()
    }

    /// Streams of a domain, by name
    pub fn streams_in(&self, domain: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .streams
            .keys()
            .filter(|(d, _)| d == domain)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn insert_stream(&self, domain: &str, name: &str) {
        let config = StreamConfig {
            name: name.to_string(),
            ..Default::default()
        };
        self.state
            .lock()
            .unwrap()
            .streams
            .insert(key(domain, name), config);
    }

    /// Fail the next `n` stream creations in `domain`
    pub fn fail_next_creates(&self, domain: &str, n: u32) {
        self.state
            .lock()
            .unwrap()
            .fail_creates
            .insert(domain.to_string(), n);
    }

    pub fn fail_delete(&self, domain: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_deletes
            .insert(key(domain, name));
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().fail_connect = fail;
    }

    /// Credentials of every connection attempt
    pub fn connects(&self) -> Vec<String> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

#[async_trait]
impl BrokerConnector for FakeBroker {
    async fn connect(&self, creds: &str) -> Result<Box<dyn BrokerSession>> {
        let mut state = self.state.lock().unwrap();
        state.connects.push(creds.to_string());
        if state.fail_connect {
            return Err(Error::Broker {
                domain: "main".to_string(),
                message: "connection refused".to_string(),
            });
        }
        drop(state);
        Ok(self.session())
    }
}

struct FakeSession {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn stream_exists(&self, domain: &str, name: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("exists {domain} {name}"));
        Ok(state.streams.contains_key(&key(domain, name)))
    }

    async fn create_stream(&self, domain: &str, config: &StreamConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create {domain} {}", config.name));
        state.create_calls += 1;
        if let Some(remaining) = state.fail_creates.get_mut(domain) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Broker {
                    domain: domain.to_string(),
                    message: "timeout".to_string(),
                });
            }
        }
        state
            .streams
            .entry(key(domain, &config.name))
            .or_insert_with(|| config.clone());
        Ok(())
    }

    async fn create_mirror_stream(
        &self,
        domain: &str,
        config: &StreamConfig,
        sources: &[StreamSource],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("mirror {domain} {}", config.name));
        let config = StreamConfig {
            sources: Some(sources.to_vec()),
            ..config.clone()
        };
        state.streams.insert(key(domain, &config.name), config);
        Ok(())
    }

    async fn delete_streams(&self, domain: &str, names: &[String]) -> Vec<(String, Result<()>)> {
        let mut state = self.state.lock().unwrap();
        let mut results = Vec::new();
        for name in names {
            state.calls.push(format!("delete {domain} {name}"));
            let result = if state.fail_deletes.contains(&key(domain, name)) {
                Err(Error::Broker {
                    domain: domain.to_string(),
                    message: "insufficient resources".to_string(),
                })
            } else {
                state.streams.remove(&key(domain, name));
                Ok(())
            };
            results.push((name.clone(), result));
        }
        results
    }

    async fn close(&self) {
        self.state.lock().unwrap().closes += 1;
    }
}
