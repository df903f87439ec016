use async_trait::async_trait;
use futures_util::stream::BoxStream;
use pkg_types::identity::{IdentityEvent, IdentityKey, Scope};
use pkg_types::secret::SecretObject;

use crate::error::ClusterError;

/// Stream of identity events; it ends (or yields an error) when the watch
/// connection drops, after which the caller relists.
pub type IdentityStream = BoxStream<'static, Result<IdentityEvent, ClusterError>>;

/// Snapshot of the identities in scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityList {
    pub identities: Vec<IdentityKey>,
    /// Version to resume watching from, so no event between list and watch is lost.
    pub resource_version: String,
}

/// Operations the controller needs from the cluster API.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    async fn list_identities(&self, scope: &Scope) -> Result<IdentityList, ClusterError>;

    async fn watch_identities(
        &self,
        scope: &Scope,
        resource_version: &str,
    ) -> Result<IdentityStream, ClusterError>;

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SecretObject>, ClusterError>;

    async fn create_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError>;

    /// Replace an existing secret. `secret.resource_version` must match the
    /// stored version or the call fails with [`ClusterError::Conflict`].
    async fn update_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
