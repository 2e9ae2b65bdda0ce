//! Secret synchronizer
//!
//! Every component has one credential secret, named after its identifier,
//! holding `<network>.creds` and `<network>.pub` for each network it takes
//! part in, plus the sidecar system entry. A companion `<component>.dapr`
//! secret holds one sidecar manifest per network.
//!
//! Changes are planned as pure functions over the current secret data and
//! applied under [`retry_on_conflict`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use tracing::{debug, info, instrument, warn};

use super::credentials::DesiredState;
use super::retry::retry_on_conflict;
use super::sidecar::{manifest_key, BrokerUrls, DaprComponent};
use super::store::ResourceStore;
use crate::crd::ParticipantType;
use crate::error::{Error, Result};

/// System entry written into every component secret
pub const SIDECAR_SYSTEM_ENTRY: &str = "nats-sidecar.json";

/// Entries containing any of these never count as network participation
pub const IGNORED_ENTRY_MARKERS: [&str; 3] = [".pub", "nats-sidecar", "edgefarm-sys"];

/// Secret handed to leaf-node bootstrap workloads
pub const SERVER_INFO_SECRET: &str = "nats-server-info";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_LABEL: &str = "network.edgefarm.io/component";

pub fn creds_key(network: &str) -> String {
    format!("{network}.creds")
}

pub fn pub_key(network: &str) -> String {
    format!("{network}.pub")
}

/// Name of a component's sidecar manifest secret
pub fn sidecar_secret_name(component: &str) -> String {
    format!("{component}.dapr")
}

pub fn is_ignored_entry(key: &str) -> bool {
    IGNORED_ENTRY_MARKERS.iter().any(|m| key.contains(m))
}

/// Entries that represent network participation
pub fn counted_entries(data: &BTreeMap<String, String>) -> usize {
    data.keys().filter(|k| !is_ignored_entry(k)).count()
}

/// Change to apply to a secret's entries
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryChange {
    Upsert(BTreeMap<String, String>),
    Remove(Vec<String>),
}

/// Store operation that realizes an [`EntryChange`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretAction {
    Create(BTreeMap<String, String>),
    Update(BTreeMap<String, String>),
    Delete,
    Noop,
}

/// Plan the minimal operation for `change` given the current data
///
/// `system` entries are added whenever the secret is created or updated. A
/// removal that leaves only ignored entries deletes the whole secret.
pub fn plan_secret(
    current: Option<&BTreeMap<String, String>>,
    change: &EntryChange,
    system: &BTreeMap<String, String>,
) -> SecretAction {
    match (current, change) {
        (None, EntryChange::Upsert(entries)) => {
            let mut data = system.clone();
            data.extend(entries.clone());
            SecretAction::Create(data)
        }
        (None, EntryChange::Remove(_)) => SecretAction::Noop,
        (Some(data), EntryChange::Upsert(entries)) => {
            let mut merged = data.clone();
            for (k, v) in system {
                merged.entry(k.clone()).or_insert_with(|| v.clone());
            }
            merged.extend(entries.clone());
            if &merged == data {
                SecretAction::Noop
            } else {
                SecretAction::Update(merged)
            }
        }
        (Some(data), EntryChange::Remove(keys)) => {
            if !keys.iter().any(|k| data.contains_key(k)) {
                return SecretAction::Noop;
            }
            let mut pruned = data.clone();
            for key in keys {
                pruned.remove(key);
            }
            if counted_entries(&pruned) == 0 {
                SecretAction::Delete
            } else {
                SecretAction::Update(pruned)
            }
        }
    }
}

/// Decode secret data into strings
pub fn secret_entries(secret: &Secret) -> BTreeMap<String, String> {
    let mut entries: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    if let Some(string_data) = &secret.string_data {
        entries.extend(string_data.clone());
    }
    entries
}

fn encode_entries(entries: &BTreeMap<String, String>) -> BTreeMap<String, ByteString> {
    entries
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
        .collect()
}

fn new_secret(name: &str, namespace: &str, component: &str, data: &BTreeMap<String, String>) -> Secret {
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), "anck".to_string()),
        (COMPONENT_LABEL.to_string(), component.to_string()),
    ]);
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(encode_entries(data)),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Read, plan and write one secret until no concurrent writer interferes
#[instrument(skip(store, change, system))]
pub async fn apply_entry_change(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    component: &str,
    change: &EntryChange,
    system: &BTreeMap<String, String>,
) -> Result<SecretAction> {
    retry_on_conflict("apply secret change", move || async move {
        let current = store.get_secret(namespace, name).await?;
        let action = plan_secret(current.as_ref().map(secret_entries).as_ref(), change, system);
        match (&action, current) {
            (SecretAction::Create(data), _) => {
                store
                    .create_secret(namespace, &new_secret(name, namespace, component, data))
                    .await?;
                record_operation("create");
                info!("Created secret");
            }
            (SecretAction::Update(data), Some(mut secret)) => {
                secret.data = Some(encode_entries(data));
                secret.string_data = None;
                store.replace_secret(namespace, &secret).await?;
                record_operation("update");
                debug!("Updated secret");
            }
            (SecretAction::Delete, current) => {
                let version = current.and_then(|s| s.metadata.resource_version);
                store
                    .delete_secret(namespace, name, version.as_deref())
                    .await?;
                record_operation("delete");
                info!("Deleted secret without remaining network entries");
            }
            (SecretAction::Noop, _) => {}
            (SecretAction::Update(_), None) => {
                return Err(Error::Conflict(format!("secret {namespace}/{name} vanished")));
            }
        }
        Ok(action)
    })
    .await
}

#[cfg(feature = "metrics")]
fn record_operation(action: &str) {
    super::metrics::inc_secret_operation(action);
}

#[cfg(not(feature = "metrics"))]
fn record_operation(_action: &str) {}

/// Split a NATS creds file into its user JWT and NKEY seed
pub fn parse_creds(creds: &str) -> Result<(String, String)> {
    let mut jwt = None;
    let mut seed = None;
    let mut lines = creds.lines().map(str::trim);
    while let Some(line) = lines.next() {
        if line.contains("BEGIN NATS USER JWT") {
            jwt = lines.next().map(str::to_string);
        } else if line.contains("BEGIN USER NKEY SEED") {
            seed = lines.next().map(str::to_string);
        }
    }
    match (jwt, seed) {
        (Some(jwt), Some(seed)) if !jwt.is_empty() && !seed.is_empty() => Ok((jwt, seed)),
        _ => Err(Error::ConfigError(
            "creds file does not contain both a JWT and a NKEY seed".to_string(),
        )),
    }
}

fn system_entries(component: &str) -> BTreeMap<String, String> {
    let content = serde_json::json!({ "component": component }).to_string();
    BTreeMap::from([(SIDECAR_SYSTEM_ENTRY.to_string(), content)])
}

/// Bring one component's secrets in line with the credential response
///
/// Issued credentials are upserted together with the sidecar manifest;
/// revoked participants have this network's entries stripped.
#[instrument(skip(store, desired, urls), fields(participant_type = %participant_type))]
pub async fn sync_component(
    store: &dyn ResourceStore,
    namespace: &str,
    network: &str,
    component: &str,
    participant_type: ParticipantType,
    desired: &DesiredState,
    urls: &BrokerUrls,
) -> Result<()> {
    if desired.deleted_participants.iter().any(|p| p == component) {
        info!("Participant revoked, removing network entries");
        return strip_component(store, namespace, network, component).await;
    }

    let Some(issued) = desired.creds.get(component) else {
        warn!("No credentials issued for component");
        return Ok(());
    };

    let entries = BTreeMap::from([
        (creds_key(network), issued.creds.clone()),
        (pub_key(network), issued.account_public_key.clone()),
    ]);
    apply_entry_change(
        store,
        namespace,
        component,
        component,
        &EntryChange::Upsert(entries),
        &system_entries(component),
    )
    .await?;

    if let Some(url) = urls.for_participant(participant_type) {
        let (jwt, seed) = parse_creds(&issued.creds)?;
        let manifest = DaprComponent::jetstream(network, url, &jwt, &seed).to_yaml()?;
        apply_entry_change(
            store,
            namespace,
            &sidecar_secret_name(component),
            component,
            &EntryChange::Upsert(BTreeMap::from([(manifest_key(network), manifest)])),
            &BTreeMap::new(),
        )
        .await?;
    }
    Ok(())
}

/// Remove a network's entries from a component's secrets; missing secrets are fine
#[instrument(skip(store))]
pub async fn strip_component(
    store: &dyn ResourceStore,
    namespace: &str,
    network: &str,
    component: &str,
) -> Result<()> {
    apply_entry_change(
        store,
        namespace,
        component,
        component,
        &EntryChange::Remove(vec![creds_key(network), pub_key(network)]),
        &BTreeMap::new(),
    )
    .await?;
    apply_entry_change(
        store,
        namespace,
        &sidecar_secret_name(component),
        component,
        &EntryChange::Remove(vec![manifest_key(network)]),
        &BTreeMap::new(),
    )
    .await?;
    Ok(())
}

/// Credential blob a component holds for a network
pub async fn read_credentials(
    store: &dyn ResourceStore,
    namespace: &str,
    component: &str,
    network: &str,
) -> Result<Option<String>> {
    Ok(store
        .get_secret(namespace, component)
        .await?
        .map(|s| secret_entries(&s))
        .and_then(|mut entries| entries.remove(&creds_key(network))))
}

/// Create the broker address secret unless it already exists
pub async fn ensure_server_info(
    store: &dyn ResourceStore,
    namespace: &str,
    urls: &BrokerUrls,
) -> Result<()> {
    let data = BTreeMap::from([
        ("NATS_ADDRESS".to_string(), urls.nats_url.clone()),
        ("LEAF_ADDRESS".to_string(), urls.leaf_url.clone()),
    ]);
    let secret = new_secret(SERVER_INFO_SECRET, namespace, "anck", &data);
    match store.create_secret(namespace, &secret).await {
        Ok(_) => {
            info!(namespace, "Created server info secret");
            Ok(())
        }
        Err(e) if e.is_conflict() => Ok(()),
        Err(e) => Err(e),
    }
}
