use anyhow::{Context, Result, bail};
use clap::Parser;
use pkg_constants::network::DEFAULT_MONITORING_PORT;
use pkg_constants::paths::DEFAULT_CONFIG_PATH;
use pkg_constants::pki::{DEFAULT_CA_CERT_TTL_SECS, DEFAULT_CERT_TTL_SECS, DEFAULT_SELF_SIGNED_ORG};
use pkg_controllers::{ControllerConfig, RetryConfig};
use pkg_pki::KeyMaterialConfig;
use pkg_types::config::{CaConfigFile, RetryConfigFile};
use pkg_types::duration::parse_duration;
use pkg_types::identity::Scope;
use pkg_types::validate::validate_namespace;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(
    name = "mesh-ca",
    version,
    about = "Workload identity certificate authority and secret controller"
)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Path to the certificate chain file
    #[arg(long)]
    pub cert_chain: Option<String>,

    /// Path to the CA signing certificate file
    #[arg(long)]
    pub signing_cert: Option<String>,

    /// Path to the CA signing key file
    #[arg(long)]
    pub signing_key: Option<String>,

    /// Path to the root certificate file
    #[arg(long)]
    pub root_cert: Option<String>,

    /// Namespace to manage. Falls back to $NAMESPACE; unset means all namespaces
    #[arg(long)]
    pub namespace: Option<String>,

    /// Path to a kubeconfig file; required when not running inside a pod
    #[arg(long)]
    pub kube_config: Option<String>,

    /// Generate a self-signed CA certificate; the key-material file options are ignored
    #[arg(long)]
    pub self_signed_ca: bool,

    /// Issuer organization of the self-signed CA certificate [default: k8s.cluster.local]
    #[arg(long)]
    pub self_signed_ca_org: Option<String>,

    /// Validity of the self-signed CA certificate [default: 240h]
    #[arg(long)]
    pub ca_cert_ttl: Option<String>,

    /// Validity of issued certificates [default: 1h]
    #[arg(long)]
    pub cert_ttl: Option<String>,

    /// Trust domain of workload identities [default: cluster.local]
    #[arg(long)]
    pub trust_domain: Option<String>,

    /// Number of concurrent reconcile workers [default: 4]
    #[arg(long)]
    pub workers: Option<usize>,

    /// Rotate once less than this fraction of a certificate's lifetime remains [default: 0.5]
    #[arg(long)]
    pub rotation_grace_ratio: Option<f64>,

    /// Interval of the rotation scan [default: cert-ttl / 2]
    #[arg(long)]
    pub scan_interval: Option<String>,

    /// Consecutive signing failures before an identity is parked [default: 5]
    #[arg(long)]
    pub max_signing_failures: Option<u32>,

    /// Port of the monitoring endpoint, 0 disables it [default: 15014]
    #[arg(long)]
    pub monitoring_port: Option<u16>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

/// Fully merged and validated process options.
#[derive(Debug)]
pub struct Options {
    pub key_material: KeyMaterialConfig,
    pub controller: ControllerConfig,
    pub kube_config: Option<PathBuf>,
    pub monitoring_port: u16,
}

fn duration_or(value: Option<String>, name: &str, default: Duration) -> Result<Duration> {
    match value {
        Some(v) => parse_duration(&v).with_context(|| format!("invalid {}", name)),
        None => Ok(default),
    }
}

fn retry_config(file: Option<RetryConfigFile>) -> Result<RetryConfig> {
    let defaults = RetryConfig::default();
    let file = file.unwrap_or_default();
    Ok(RetryConfig {
        max_attempts: file.max_attempts.unwrap_or(defaults.max_attempts),
        initial_delay: duration_or(
            file.initial_delay,
            "retry initial-delay",
            defaults.initial_delay,
        )?,
        max_delay: duration_or(file.max_delay, "retry max-delay", defaults.max_delay)?,
        multiplier: file.multiplier.unwrap_or(defaults.multiplier),
    })
}

/// Merge CLI > config file > `env_namespace` (namespace only) > defaults,
/// then validate.
pub fn resolve(cli: Cli, file: CaConfigFile, env_namespace: Option<String>) -> Result<Options> {
    let namespace = cli
        .namespace
        .or(file.namespace)
        .or(env_namespace)
        .unwrap_or_default();
    if !namespace.is_empty() {
        validate_namespace(&namespace)?;
    }

    let cert_ttl = duration_or(
        cli.cert_ttl.or(file.cert_ttl),
        "cert-ttl",
        Duration::from_secs(DEFAULT_CERT_TTL_SECS),
    )?;
    if cert_ttl.is_zero() {
        bail!("cert-ttl must be positive");
    }

    let cert_chain = cli.cert_chain.or(file.cert_chain);
    let signing_cert = cli.signing_cert.or(file.signing_cert);
    let signing_key = cli.signing_key.or(file.signing_key);
    let root_cert = cli.root_cert.or(file.root_cert);

    let key_material = if cli.self_signed_ca || file.self_signed_ca.unwrap_or(false) {
        if cert_chain.is_some() || signing_cert.is_some() || signing_key.is_some() {
            warn!("Using a self-signed CA; the cert-chain, signing-cert and signing-key options are ignored");
        }
        let ca_ttl = duration_or(
            cli.ca_cert_ttl.or(file.ca_cert_ttl),
            "ca-cert-ttl",
            Duration::from_secs(DEFAULT_CA_CERT_TTL_SECS),
        )?;
        if ca_ttl.is_zero() {
            bail!("ca-cert-ttl must be positive");
        }
        KeyMaterialConfig::SelfSigned {
            org: cli
                .self_signed_ca_org
                .or(file.self_signed_ca_org)
                .unwrap_or_else(|| DEFAULT_SELF_SIGNED_ORG.to_string()),
            ca_ttl,
        }
    } else {
        let Some(cert_chain) = cert_chain else {
            bail!(
                "No certificate chain has been specified. Either specify a cert chain file via '--cert-chain' option or use '--self-signed-ca'"
            );
        };
        let Some(signing_cert) = signing_cert else {
            bail!(
                "No signing cert has been specified. Either specify a cert file via '--signing-cert' option or use '--self-signed-ca'"
            );
        };
        let Some(signing_key) = signing_key else {
            bail!(
                "No signing key has been specified. Either specify a key file via '--signing-key' option or use '--self-signed-ca'"
            );
        };
        let Some(root_cert) = root_cert else {
            bail!(
                "No root cert has been specified. Either specify a root cert file via '--root-cert' option or use '--self-signed-ca'"
            );
        };
        KeyMaterialConfig::Imported {
            cert_chain: cert_chain.into(),
            signing_cert: signing_cert.into(),
            signing_key: signing_key.into(),
            root_cert: root_cert.into(),
        }
    };

    let mut controller = ControllerConfig::new(cert_ttl);
    controller.scope = Scope::from_namespace(&namespace);
    if let Some(trust_domain) = cli.trust_domain.or(file.trust_domain) {
        controller.trust_domain = trust_domain;
    }
    if let Some(workers) = cli.workers.or(file.workers) {
        controller.workers = workers;
    }
    if let Some(ratio) = cli.rotation_grace_ratio.or(file.rotation_grace_ratio) {
        controller.grace_ratio = ratio;
    }
    controller.scan_interval = duration_or(
        cli.scan_interval.or(file.scan_interval),
        "scan-interval",
        controller.scan_interval,
    )?;
    if let Some(max) = cli.max_signing_failures.or(file.max_signing_failures) {
        controller.max_signing_failures = max;
    }
    controller.shutdown_grace =
        duration_or(file.shutdown_grace, "shutdown-grace", controller.shutdown_grace)?;
    controller.retry = retry_config(file.retry)?;
    controller.validate().map_err(anyhow::Error::msg)?;

    Ok(Options {
        key_material,
        controller,
        kube_config: cli.kube_config.or(file.kube_config).map(PathBuf::from),
        monitoring_port: cli
            .monitoring_port
            .or(file.monitoring_port)
            .unwrap_or(DEFAULT_MONITORING_PORT),
    })
}
