use serde::{Deserialize, Serialize};

/// mesh-ca configuration file (YAML). Every field is optional; command-line
/// flags take precedence over values set here.
///
/// Example `config.yaml`:
/// ```yaml
/// self-signed-ca: true
/// self-signed-ca-org: k8s.cluster.local
/// ca-cert-ttl: 240h
/// cert-ttl: 1h
/// namespace: istio-system
/// workers: 4
/// rotation-grace-ratio: 0.5
/// retry:
///   max-attempts: 5
///   initial-delay: 100ms
///   max-delay: 10s
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaConfigFile {
    #[serde(default, alias = "cert-chain")]
    pub cert_chain: Option<String>,
    #[serde(default, alias = "signing-cert")]
    pub signing_cert: Option<String>,
    #[serde(default, alias = "signing-key")]
    pub signing_key: Option<String>,
    #[serde(default, alias = "root-cert")]
    pub root_cert: Option<String>,

    #[serde(default, alias = "self-signed-ca")]
    pub self_signed_ca: Option<bool>,
    #[serde(default, alias = "self-signed-ca-org")]
    pub self_signed_ca_org: Option<String>,
    #[serde(default, alias = "ca-cert-ttl")]
    pub ca_cert_ttl: Option<String>,
    #[serde(default, alias = "cert-ttl")]
    pub cert_ttl: Option<String>,
    #[serde(default, alias = "trust-domain")]
    pub trust_domain: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, alias = "kube-config")]
    pub kube_config: Option<String>,

    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default, alias = "rotation-grace-ratio")]
    pub rotation_grace_ratio: Option<f64>,
    #[serde(default, alias = "scan-interval")]
    pub scan_interval: Option<String>,
    #[serde(default, alias = "max-signing-failures")]
    pub max_signing_failures: Option<u32>,
    #[serde(default, alias = "shutdown-grace")]
    pub shutdown_grace: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryConfigFile>,

    #[serde(default, alias = "monitoring-port")]
    pub monitoring_port: Option<u16>,
}

/// Backoff policy for transient cluster API failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfigFile {
    #[serde(default, alias = "max-attempts")]
    pub max_attempts: Option<u32>,
    #[serde(default, alias = "initial-delay")]
    pub initial_delay: Option<String>,
    #[serde(default, alias = "max-delay")]
    pub max_delay: Option<String>,
    #[serde(default)]
    pub multiplier: Option<f64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kebab_case_file() {
        let yaml = r#"
self-signed-ca: true
self-signed-ca-org: example.org
ca-cert-ttl: 240h
cert-ttl: 30m
namespace: istio-system
workers: 8
rotation-grace-ratio: 0.25
retry:
  max-attempts: 3
  initial-delay: 50ms
"#;
        let cfg: CaConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.self_signed_ca, Some(true));
        assert_eq!(cfg.self_signed_ca_org.as_deref(), Some("example.org"));
        assert_eq!(cfg.ca_cert_ttl.as_deref(), Some("240h"));
        assert_eq!(cfg.cert_ttl.as_deref(), Some("30m"));
        assert_eq!(cfg.namespace.as_deref(), Some("istio-system"));
        assert_eq!(cfg.workers, Some(8));
        assert_eq!(cfg.rotation_grace_ratio, Some(0.25));
        let retry = cfg.retry.unwrap();
        assert_eq!(retry.max_attempts, Some(3));
        assert_eq!(retry.initial_delay.as_deref(), Some("50ms"));
        assert!(retry.max_delay.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg: CaConfigFile = load_config_file("/nonexistent/mesh-ca/config.yaml").unwrap();
        assert!(cfg.self_signed_ca.is_none());
        assert!(cfg.cert_chain.is_none());
    }
}
