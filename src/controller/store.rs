//! Resource store adapter
//!
//! Uniform access to the cluster objects the controllers read and write.
//! Not-found is reported as `Ok(None)` (reads) or `Ok(false)` (deletes), and
//! optimistic-concurrency failures as [`Error::Conflict`] so callers can wrap
//! writes in [`retry_on_conflict`](super::retry::retry_on_conflict).

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node, Secret};
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, Preconditions},
    Client, ResourceExt,
};
use tracing::{debug, info};

use crate::crd::Network;
use crate::error::{Error, Result};

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a secret; an existing secret yields [`Error::Conflict`]
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret>;

    /// Replace a secret guarded by its `resourceVersion`
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret>;

    /// Delete a secret, returning whether it existed
    ///
    /// With `resource_version` set the delete only succeeds against that
    /// version; otherwise it yields [`Error::Conflict`].
    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<bool>;

    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    async fn get_network(&self, namespace: &str, name: &str) -> Result<Option<Network>>;

    /// Replace spec and metadata (including finalizers) guarded by `resourceVersion`
    async fn replace_network(&self, network: &Network) -> Result<Network>;

    /// Replace the status subresource guarded by `resourceVersion`
    async fn replace_network_status(&self, network: &Network) -> Result<Network>;

    async fn list_networks(&self, namespace: Option<&str>) -> Result<Vec<Network>>;

    /// Labels of a cluster node, `None` if the node is gone
    async fn node_labels(&self, node: &str) -> Result<Option<BTreeMap<String, String>>>;
}

/// [`ResourceStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn networks(&self, namespace: &str) -> Api<Network> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_api_error(kind: &str, namespace: &str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::Conflict(format!("{kind} {namespace}/{name}"))
        }
        kube::Error::Api(ae) if ae.code == 404 => {
            Error::NotFound(format!("{kind} {namespace}/{name}"))
        }
        other => Error::KubeError(other),
    }
}

fn object_namespace(network: &Network) -> String {
    network.namespace().unwrap_or_else(|| "default".to_string())
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.secrets(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_api_error("secret", namespace, name, e))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let name = secret.name_any();
        debug!(namespace, secret = %name, "Creating secret");
        self.secrets(namespace)
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| map_api_error("secret", namespace, &name, e))
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let name = secret.name_any();
        debug!(namespace, secret = %name, "Replacing secret");
        self.secrets(namespace)
            .replace(&name, &PostParams::default(), secret)
            .await
            .map_err(|e| map_api_error("secret", namespace, &name, e))
    }

    async fn delete_secret(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<bool> {
        let params = DeleteParams {
            preconditions: resource_version.map(|version| Preconditions {
                resource_version: Some(version.to_string()),
                uid: None,
            }),
            ..Default::default()
        };
        match self.secrets(namespace).delete(name, &params).await
        {
            Ok(_) => {
                debug!(namespace, secret = %name, "Deleted secret");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(map_api_error("secret", namespace, name, e)),
        }
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await?.is_some() {
            return Ok(());
        }
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!(namespace = %name, "Created namespace");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn get_network(&self, namespace: &str, name: &str) -> Result<Option<Network>> {
        self.networks(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_api_error("network", namespace, name, e))
    }

    async fn replace_network(&self, network: &Network) -> Result<Network> {
        let namespace = object_namespace(network);
        let name = network.name_any();
        self.networks(&namespace)
            .replace(&name, &PostParams::default(), network)
            .await
            .map_err(|e| map_api_error("network", &namespace, &name, e))
    }

    async fn replace_network_status(&self, network: &Network) -> Result<Network> {
        let namespace = object_namespace(network);
        let name = network.name_any();
        let data = serde_json::to_vec(network)?;
        self.networks(&namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| map_api_error("network", &namespace, &name, e))
    }

    async fn list_networks(&self, namespace: Option<&str>) -> Result<Vec<Network>> {
        let api: Api<Network> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn node_labels(&self, node: &str) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(node).await?.map(|n| n.labels().clone()))
    }
}
