use chrono::{DateTime, Utc};
use pkg_constants::secret::{
    CERT_CHAIN_KEY, PRIVATE_KEY_KEY, ROOT_CERT_KEY, SECRET_TYPE, SERVICE_ACCOUNT_ANNOTATION,
};
use std::collections::BTreeMap;

use crate::identity::IdentityKey;

/// A secret object as seen through the cluster API.
///
/// `resource_version` is opaque and only used for optimistic concurrency:
/// an update carrying a stale version is rejected by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretObject {
    pub namespace: String,
    pub name: String,
    pub secret_type: String,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
    pub resource_version: Option<String>,
}

impl SecretObject {
    /// Build the secret for `key` holding the three PEM blobs.
    pub fn for_identity(
        key: &IdentityKey,
        cert_chain: &[u8],
        private_key: &[u8],
        root_cert: &[u8],
    ) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(SERVICE_ACCOUNT_ANNOTATION.to_string(), key.name.clone());

        let mut data = BTreeMap::new();
        data.insert(CERT_CHAIN_KEY.to_string(), cert_chain.to_vec());
        data.insert(PRIVATE_KEY_KEY.to_string(), private_key.to_vec());
        data.insert(ROOT_CERT_KEY.to_string(), root_cert.to_vec());

        Self {
            namespace: key.namespace.clone(),
            name: key.secret_name(),
            secret_type: SECRET_TYPE.to_string(),
            annotations,
            data,
            resource_version: None,
        }
    }

    pub fn cert_chain(&self) -> Option<&[u8]> {
        self.data.get(CERT_CHAIN_KEY).map(Vec::as_slice)
    }

    pub fn private_key(&self) -> Option<&[u8]> {
        self.data.get(PRIVATE_KEY_KEY).map(Vec::as_slice)
    }

    pub fn root_cert(&self) -> Option<&[u8]> {
        self.data.get(ROOT_CERT_KEY).map(Vec::as_slice)
    }

    /// True if this secret was written by mesh-ca for the given identity.
    pub fn is_managed_for(&self, key: &IdentityKey) -> bool {
        self.secret_type == SECRET_TYPE
            && self
                .annotations
                .get(SERVICE_ACCOUNT_ANNOTATION)
                .is_some_and(|sa| sa == &key.name)
    }
}

/// Certificate state of one identity, recomputed from its stored secret on
/// every reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub namespace: String,
    pub identity_name: String,
    /// Name of the secret the certificate lives in.
    pub certificate_reference: String,
    pub last_issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SecretRecord {
    /// Full validity window of the stored certificate.
    pub fn lifetime(&self) -> chrono::Duration {
        self.expires_at - self.last_issued_at
    }

    /// Time left until expiry; negative once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }
}
