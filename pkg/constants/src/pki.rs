//! Certificate authority constants.

/// Issuer organization of the self-signed root when none is configured.
pub const DEFAULT_SELF_SIGNED_ORG: &str = "k8s.cluster.local";

/// Validity of the self-signed root certificate (10 days).
pub const DEFAULT_CA_CERT_TTL_SECS: u64 = 240 * 60 * 60;

/// Validity of issued workload certificates (1 hour).
pub const DEFAULT_CERT_TTL_SECS: u64 = 60 * 60;

/// Trust domain used in workload SPIFFE identities.
pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

/// Length of randomly generated certificate serial numbers.
pub const SERIAL_NUMBER_BYTES: usize = 16;
