use anyhow::{Result, bail};
use pkg_constants::secret::SECRET_NAME_PREFIX;

use crate::identity::IdentityKey;

/// Validate a namespace name (DNS-1123 label).
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_namespace(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("namespace must not be empty");
    }
    if name.len() > 63 {
        bail!("namespace '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("namespace '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "namespace '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Validate that an identity can be mapped onto a secret: the derived secret
/// name must be a DNS-1123 subdomain (max 253 chars, `[a-z0-9.-]`, alphanumeric ends).
pub fn validate_identity(key: &IdentityKey) -> Result<()> {
    validate_namespace(&key.namespace)?;
    if key.name.is_empty() {
        bail!("service account name must not be empty");
    }
    let secret_name = key.secret_name();
    if secret_name.len() > 253 {
        bail!(
            "secret name for service account '{}' exceeds 253 characters (got {})",
            key.name,
            secret_name.len()
        );
    }
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    if !key.name.starts_with(alnum) || !key.name.ends_with(alnum) {
        bail!(
            "service account name '{}' must start and end with a lowercase letter or digit",
            key.name
        );
    }
    if !key.name.chars().all(|c| alnum(c) || c == '-' || c == '.') {
        bail!(
            "service account name '{}' must contain only [a-z0-9.-] to fit a '{}' secret",
            key.name,
            SECRET_NAME_PREFIX
        );
    }
    Ok(())
}
