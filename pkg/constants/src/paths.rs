//! Filesystem path and environment constants.

/// Default config file path. A missing file means "all defaults".
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mesh-ca/config.yaml";

/// Environment variable consulted for the namespace scope when `--namespace` is unset.
pub const NAMESPACE_ENV: &str = "NAMESPACE";
