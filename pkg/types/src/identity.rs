use pkg_constants::secret::SECRET_NAME_PREFIX;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a workload identity (a service account).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub namespace: String,
    pub name: String,
}

impl IdentityKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of the secret holding this identity's key and certificates.
    pub fn secret_name(&self) -> String {
        format!("{}{}", SECRET_NAME_PREFIX, self.name)
    }

    /// SPIFFE URI carried as the URI SAN of the identity's certificate.
    pub fn spiffe_uri(&self, trust_domain: &str) -> String {
        format!(
            "spiffe://{}/ns/{}/sa/{}",
            trust_domain, self.namespace, self.name
        )
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity lifecycle events, decoupled from the cluster API's raw watch events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    Added(IdentityKey),
    Deleted(IdentityKey),
}

impl IdentityEvent {
    pub fn key(&self) -> &IdentityKey {
        match self {
            IdentityEvent::Added(key) | IdentityEvent::Deleted(key) => key,
        }
    }
}

/// Set of namespaces the controller is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    Namespace(String),
}

impl Scope {
    /// An empty namespace means cluster-wide.
    pub fn from_namespace(namespace: &str) -> Self {
        if namespace.is_empty() {
            Scope::All
        } else {
            Scope::Namespace(namespace.to_string())
        }
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        match self {
            Scope::All => true,
            Scope::Namespace(ns) => ns == &key.namespace,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "all namespaces"),
            Scope::Namespace(ns) => write!(f, "namespace {}", ns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_name_and_uri() {
        let key = IdentityKey::new("payments", "checkout");
        assert_eq!(key.secret_name(), "mesh-ca.checkout");
        assert_eq!(
            key.spiffe_uri("cluster.local"),
            "spiffe://cluster.local/ns/payments/sa/checkout"
        );
        assert_eq!(key.to_string(), "payments/checkout");
    }

    #[test]
    fn scope_filtering() {
        let key = IdentityKey::new("payments", "checkout");
        assert!(Scope::from_namespace("").contains(&key));
        assert!(Scope::from_namespace("payments").contains(&key));
        assert!(!Scope::from_namespace("default").contains(&key));
    }
}
