//! Layout of the per-identity secrets written by the controller.

/// Secret name = `SECRET_NAME_PREFIX + service_account_name`.
pub const SECRET_NAME_PREFIX: &str = "mesh-ca.";

/// Secret `type` field for secrets managed by mesh-ca.
pub const SECRET_TYPE: &str = "mesh-ca.io/key-and-cert";

/// Annotation recording the service account that owns a secret.
pub const SERVICE_ACCOUNT_ANNOTATION: &str = "mesh-ca.io/service-account.name";

/// Data key holding the leaf certificate followed by the signing chain.
pub const CERT_CHAIN_KEY: &str = "cert-chain.pem";

/// Data key holding the leaf private key.
pub const PRIVATE_KEY_KEY: &str = "key.pem";

/// Data key holding the root certificate.
pub const ROOT_CERT_KEY: &str = "root-cert.pem";
