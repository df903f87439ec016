use async_trait::async_trait;
use futures_util::{StreamExt, future};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use pkg_types::identity::{IdentityEvent, IdentityKey, Scope};
use pkg_types::secret::SecretObject;
use std::path::Path;
use tracing::{debug, info};

use crate::client::{ClusterClient, IdentityList, IdentityStream};
use crate::error::ClusterError;

/// [`ClusterClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the given kubeconfig, or the in-cluster service account
    /// when none is given.
    pub async fn connect(kube_config: Option<&Path>) -> Result<Self, ClusterError> {
        let config = match kube_config {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Configuration(format!(
                        "failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        ClusterError::Configuration(format!("failed to load kubeconfig: {}", e))
                    })?
            }
            None => Config::incluster().map_err(|e| {
                ClusterError::Configuration(format!("failed to load in-cluster config: {}", e))
            })?,
        };
        let cluster_url = config.cluster_url.clone();
        info!("Connecting to Kubernetes API at {}", cluster_url);
        let client = Client::try_from(config)
            .map_err(|e| ClusterError::Configuration(format!("failed to create client: {}", e)))?;
        let version = client.apiserver_version().await.map_err(|e| {
            ClusterError::Configuration(format!(
                "Kubernetes API at {} is unreachable: {}",
                cluster_url, e
            ))
        })?;
        info!("Connected to Kubernetes {}", version.git_version);
        Ok(Self::new(client))
    }

    fn service_accounts(&self, scope: &Scope) -> Api<ServiceAccount> {
        match scope {
            Scope::All => Api::all(self.client.clone()),
            Scope::Namespace(ns) => Api::namespaced(self.client.clone(), ns),
        }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(resp) => ClusterError::from_status(resp.code, &resp.reason, &resp.message),
        other => ClusterError::Transient(other.to_string()),
    }
}

fn identity_of(sa: &ServiceAccount) -> Option<IdentityKey> {
    Some(IdentityKey::new(
        sa.metadata.namespace.clone()?,
        sa.metadata.name.clone()?,
    ))
}

fn to_secret(secret: &SecretObject) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(secret.name.clone()),
            namespace: Some(secret.namespace.clone()),
            annotations: Some(secret.annotations.clone()),
            resource_version: secret.resource_version.clone(),
            ..Default::default()
        },
        type_: Some(secret.secret_type.clone()),
        data: Some(
            secret
                .data
                .iter()
                .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn from_secret(secret: Secret) -> SecretObject {
    SecretObject {
        namespace: secret.metadata.namespace.unwrap_or_default(),
        name: secret.metadata.name.unwrap_or_default(),
        secret_type: secret.type_.unwrap_or_default(),
        annotations: secret.metadata.annotations.unwrap_or_default(),
        data: secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect(),
        resource_version: secret.metadata.resource_version,
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_identities(&self, scope: &Scope) -> Result<IdentityList, ClusterError> {
        let list = self
            .service_accounts(scope)
            .list(&ListParams::default())
            .await
            .map_err(map_err)?;
        Ok(IdentityList {
            identities: list.items.iter().filter_map(identity_of).collect(),
            resource_version: list.metadata.resource_version.unwrap_or_default(),
        })
    }

    async fn watch_identities(
        &self,
        scope: &Scope,
        resource_version: &str,
    ) -> Result<IdentityStream, ClusterError> {
        let stream = self
            .service_accounts(scope)
            .watch(&WatchParams::default(), resource_version)
            .await
            .map_err(map_err)?;
        Ok(stream
            .filter_map(|event| {
                future::ready(match event {
                    Ok(WatchEvent::Added(sa)) | Ok(WatchEvent::Modified(sa)) => {
                        identity_of(&sa).map(|key| Ok(IdentityEvent::Added(key)))
                    }
                    Ok(WatchEvent::Deleted(sa)) => {
                        identity_of(&sa).map(|key| Ok(IdentityEvent::Deleted(key)))
                    }
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(resp)) => {
                        debug!("Service account watch error: {}", resp.message);
                        Some(Err(ClusterError::from_status(
                            resp.code,
                            &resp.reason,
                            &resp.message,
                        )))
                    }
                    Err(e) => Some(Err(map_err(e))),
                })
            })
            .boxed())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SecretObject>, ClusterError> {
        let secret = self
            .secrets(namespace)
            .get_opt(name)
            .await
            .map_err(map_err)?;
        Ok(secret.map(from_secret))
    }

    async fn create_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError> {
        let mut body = to_secret(secret);
        body.metadata.resource_version = None;
        let created = self
            .secrets(&secret.namespace)
            .create(&PostParams::default(), &body)
            .await
            .map_err(map_err)?;
        Ok(from_secret(created))
    }

    async fn update_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError> {
        let replaced = self
            .secrets(&secret.namespace)
            .replace(&secret.name, &PostParams::default(), &to_secret(secret))
            .await
            .map_err(map_err)?;
        Ok(from_secret(replaced))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
