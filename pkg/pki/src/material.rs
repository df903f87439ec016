//! CA key material: either generated (self-signed root) or imported from PEM files.

use chrono::{DateTime, SubsecRound, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls_pemfile::Item;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{PkiError, Result};
use crate::inspect::{inspect_der, pem_to_ders, verify_issued_by};
use pkg_constants::pki::SERIAL_NUMBER_BYTES;

/// Where the CA key material comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterialConfig {
    /// Generate a fresh root at startup.
    SelfSigned { org: String, ca_ttl: Duration },
    /// Load a signing certificate/key pair and its root from PEM files.
    Imported {
        cert_chain: PathBuf,
        signing_cert: PathBuf,
        signing_key: PathBuf,
        root_cert: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaMode {
    SelfSigned,
    Imported,
}

impl fmt::Display for CaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaMode::SelfSigned => write!(f, "self-signed"),
            CaMode::Imported => write!(f, "imported"),
        }
    }
}

/// Validated CA key material. Immutable once constructed.
///
/// In self-signed mode the root is also the signing certificate, and its key
/// is the signing key.
pub struct CaKeyMaterial {
    mode: CaMode,
    root_cert_pem: String,
    root_not_before: DateTime<Utc>,
    root_not_after: DateTime<Utc>,
    /// Certificates appended after the leaf in issued chains (empty when self-signed).
    cert_chain_pem: String,
    /// rcgen handle for the signing certificate, used as the issuer of leaves.
    issuer: Certificate,
    signing_key: KeyPair,
}

impl CaKeyMaterial {
    pub fn load(config: &KeyMaterialConfig) -> Result<Self> {
        match config {
            KeyMaterialConfig::SelfSigned { org, ca_ttl } => Self::self_signed(org, *ca_ttl),
            KeyMaterialConfig::Imported {
                cert_chain,
                signing_cert,
                signing_key,
                root_cert,
            } => Self::from_pem(
                &read_pem_file(cert_chain)?,
                &read_pem_file(signing_cert)?,
                &read_pem_file(signing_key)?,
                &read_pem_file(root_cert)?,
            ),
        }
    }

    /// Generate a self-signed root valid for `ca_ttl`, issued to organization `org`.
    pub fn self_signed(org: &str, ca_ttl: Duration) -> Result<Self> {
        info!("Generating self-signed CA root (org={})", org);

        let ttl = chrono::Duration::from_std(ca_ttl)
            .map_err(|e| PkiError::Configuration(format!("invalid CA TTL: {}", e)))?;
        if ttl < chrono::Duration::seconds(1) {
            return Err(PkiError::Configuration(
                "CA TTL must be at least one second".to_string(),
            ));
        }
        let not_before = Utc::now().trunc_subsecs(0);
        let not_after = not_before.checked_add_signed(ttl).ok_or_else(|| {
            PkiError::Configuration(format!("CA TTL of {}s is out of range", ca_ttl.as_secs()))
        })?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, org);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after).map_err(|_| {
            PkiError::Configuration(format!("CA TTL of {}s is out of range", ca_ttl.as_secs()))
        })?;
        params.serial_number = Some(SerialNumber::from_slice(&random_serial(&mut rand::rng())));

        let key_pair = KeyPair::generate()
            .map_err(|e| PkiError::Configuration(format!("failed to generate CA key: {}", e)))?;
        let root = params
            .self_signed(&key_pair)
            .map_err(|e| PkiError::Configuration(format!("failed to create CA cert: {}", e)))?;

        Ok(Self {
            mode: CaMode::SelfSigned,
            root_cert_pem: root.pem(),
            root_not_before: not_before,
            root_not_after: not_after,
            cert_chain_pem: String::new(),
            issuer: root,
            signing_key: key_pair,
        })
    }

    /// Build material from the four PEM inputs, checking that the signing
    /// certificate chains to the root and matches the signing key.
    pub fn from_pem(
        cert_chain_pem: &str,
        signing_cert_pem: &str,
        signing_key_pem: &str,
        root_cert_pem: &str,
    ) -> Result<Self> {
        let root_der = first_der("root certificate", root_cert_pem)?;
        let root = inspect_der(&root_der).map_err(|e| config_err("root certificate", e))?;
        if !root.is_ca {
            return Err(PkiError::Configuration(
                "root certificate does not carry CA basic constraints".to_string(),
            ));
        }
        if root.not_after <= Utc::now() {
            return Err(PkiError::Configuration(format!(
                "root certificate expired at {}",
                root.not_after
            )));
        }

        let signing_der = first_der("signing certificate", signing_cert_pem)?;
        let signing = inspect_der(&signing_der).map_err(|e| config_err("signing certificate", e))?;
        if !signing.is_ca {
            return Err(PkiError::Configuration(
                "signing certificate is not a CA certificate".to_string(),
            ));
        }
        if signing.not_after <= Utc::now() {
            return Err(PkiError::Configuration(format!(
                "signing certificate expired at {}",
                signing.not_after
            )));
        }
        verify_issued_by(&signing_der, &root_der).map_err(|_| {
            PkiError::Configuration(format!(
                "signing certificate ({}) does not chain to the root certificate ({})",
                signing.subject, root.subject
            ))
        })?;

        let chain = pem_to_ders(cert_chain_pem.as_bytes())
            .map_err(|e| config_err("certificate chain", e))?;
        for der in &chain {
            inspect_der(der).map_err(|e| config_err("certificate chain", e))?;
        }

        let signing_key = parse_signing_key(signing_key_pem)?;
        let spki = signing_public_key(&signing_der)?;
        if signing_key.public_key_der() != spki {
            return Err(PkiError::Configuration(
                "signing key does not match the signing certificate's public key".to_string(),
            ));
        }

        let issuer_params = CertificateParams::from_ca_cert_pem(signing_cert_pem)
            .map_err(|e| config_err("signing certificate", e))?;
        let issuer = issuer_params
            .self_signed(&signing_key)
            .map_err(|e| config_err("signing certificate", e))?;

        info!(
            "Loaded CA key material (signing={}, root={}, root expires {})",
            signing.subject, root.subject, root.not_after
        );

        Ok(Self {
            mode: CaMode::Imported,
            root_cert_pem: root_cert_pem.to_string(),
            root_not_before: root.not_before,
            root_not_after: root.not_after,
            cert_chain_pem: normalize_chain(cert_chain_pem),
            issuer,
            signing_key,
        })
    }

    pub fn mode(&self) -> CaMode {
        self.mode
    }

    pub fn root_cert_pem(&self) -> &str {
        &self.root_cert_pem
    }

    pub fn root_not_before(&self) -> DateTime<Utc> {
        self.root_not_before
    }

    pub fn root_not_after(&self) -> DateTime<Utc> {
        self.root_not_after
    }

    pub fn cert_chain_pem(&self) -> &str {
        &self.cert_chain_pem
    }

    pub(crate) fn issuer(&self) -> &Certificate {
        &self.issuer
    }

    pub(crate) fn signing_key(&self) -> &KeyPair {
        &self.signing_key
    }
}

/// Random positive serial number bytes.
pub(crate) fn random_serial(rng: &mut impl RngCore) -> [u8; SERIAL_NUMBER_BYTES] {
    let mut bytes = [0u8; SERIAL_NUMBER_BYTES];
    rng.fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    bytes
}

pub(crate) fn to_offset(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| PkiError::Signing(format!("timestamp out of range: {}", e)))
}

fn read_pem_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        PkiError::Configuration(format!("failed to read {}: {}", path.display(), e))
    })
}

fn config_err(what: &str, e: impl fmt::Display) -> PkiError {
    PkiError::Configuration(format!("invalid {}: {}", what, e))
}

fn first_der(what: &str, pem: &str) -> Result<Vec<u8>> {
    let mut ders = pem_to_ders(pem.as_bytes()).map_err(|e| config_err(what, e))?;
    Ok(ders.swap_remove(0))
}

fn parse_signing_key(pem: &str) -> Result<KeyPair> {
    let mut reader = pem.as_bytes();
    let items = rustls_pemfile::read_all(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| config_err("signing key", e))?;
    let mut keys = items.iter().filter(|item| {
        matches!(
            item,
            Item::Pkcs8Key(_) | Item::Pkcs1Key(_) | Item::Sec1Key(_)
        )
    });
    match keys.next() {
        Some(Item::Pkcs8Key(_)) => {}
        Some(_) => {
            return Err(PkiError::Configuration(
                "signing key must be PKCS#8 encoded (BEGIN PRIVATE KEY)".to_string(),
            ));
        }
        None => {
            return Err(PkiError::Configuration(
                "no private key found in signing key input".to_string(),
            ));
        }
    }
    KeyPair::from_pem(pem).map_err(|e| config_err("signing key", e))
}

fn signing_public_key(signing_der: &[u8]) -> Result<Vec<u8>> {
    use x509_parser::prelude::*;
    let (_, cert) = X509Certificate::from_der(signing_der)
        .map_err(|e| config_err("signing certificate", e))?;
    Ok(cert.public_key().raw.to_vec())
}

fn normalize_chain(pem: &str) -> String {
    let trimmed = pem.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::inspect::inspect_pem;
    use pkg_constants::pki::DEFAULT_SELF_SIGNED_ORG;

    #[test]
    fn self_signed_root_is_valid_ca() {
        let ttl = Duration::from_secs(240 * 3600);
        let material = CaKeyMaterial::self_signed(DEFAULT_SELF_SIGNED_ORG, ttl).unwrap();
        assert_eq!(material.mode(), CaMode::SelfSigned);
        assert!(material.cert_chain_pem().is_empty());

        let info = inspect_pem(material.root_cert_pem().as_bytes()).unwrap();
        assert!(info.is_ca);
        assert_eq!(info.organization.as_deref(), Some(DEFAULT_SELF_SIGNED_ORG));
        assert_eq!(info.lifetime(), chrono::Duration::hours(240));
        assert_eq!(info.not_after, material.root_not_after());

        let der = pem_to_ders(material.root_cert_pem().as_bytes()).unwrap();
        assert!(verify_issued_by(&der[0], &der[0]).is_ok());
    }

    #[test]
    fn self_signed_uses_configured_org() {
        let material =
            CaKeyMaterial::self_signed("example.org", Duration::from_secs(3600)).unwrap();
        let info = inspect_pem(material.root_cert_pem().as_bytes()).unwrap();
        assert_eq!(info.organization.as_deref(), Some("example.org"));
    }

    #[test]
    fn self_signed_rejects_zero_ttl() {
        let err = CaKeyMaterial::self_signed("example.org", Duration::ZERO).err().unwrap();
        assert!(matches!(err, PkiError::Configuration(_)));
    }

    #[test]
    fn self_signed_rejects_out_of_range_ttl() {
        // Past chrono's last representable date.
        let err = CaKeyMaterial::self_signed(
            "example.org",
            Duration::from_secs(5_000_000_000 * 3600),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PkiError::Configuration(_)));

        // Fine for chrono, but beyond year 9999.
        let err = CaKeyMaterial::self_signed(
            "example.org",
            Duration::from_secs(100_000 * 365 * 86_400),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PkiError::Configuration(_)));
    }

    #[test]
    fn imports_valid_hierarchy() {
        let h = hierarchy();
        let chain = format!("{}{}", h.signing_pem, h.root_pem);
        let material =
            CaKeyMaterial::from_pem(&chain, &h.signing_pem, &h.signing_key_pem, &h.root_pem)
                .unwrap();
        assert_eq!(material.mode(), CaMode::Imported);
        assert_eq!(material.root_cert_pem(), h.root_pem);
        assert_eq!(pem_to_ders(material.cert_chain_pem().as_bytes()).unwrap().len(), 2);
    }

    #[test]
    fn rejects_signing_cert_from_another_root() {
        let h = hierarchy();
        let other = hierarchy();
        let err = CaKeyMaterial::from_pem(
            &h.signing_pem,
            &h.signing_pem,
            &h.signing_key_pem,
            &other.root_pem,
        )
        .err()
        .unwrap();
        match err {
            PkiError::Configuration(msg) => assert!(msg.contains("does not chain")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_mismatched_signing_key() {
        let h = hierarchy();
        let other = hierarchy();
        let err = CaKeyMaterial::from_pem(
            &h.signing_pem,
            &h.signing_pem,
            &other.signing_key_pem,
            &h.root_pem,
        )
        .err()
        .unwrap();
        match err {
            PkiError::Configuration(msg) => assert!(msg.contains("does not match")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_expired_signing_cert() {
        let h = hierarchy_with_signing_days(-1);
        let err = CaKeyMaterial::from_pem(
            &h.signing_pem,
            &h.signing_pem,
            &h.signing_key_pem,
            &h.root_pem,
        )
        .err()
        .unwrap();
        match err {
            PkiError::Configuration(msg) => assert!(msg.contains("signing certificate expired")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_non_ca_root() {
        let (cert, key) = leaf_only();
        let err = CaKeyMaterial::from_pem(&cert, &cert, &key, &cert).err().unwrap();
        match err {
            PkiError::Configuration(msg) => assert!(msg.contains("basic constraints")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_unparsable_inputs() {
        let h = hierarchy();
        assert!(matches!(
            CaKeyMaterial::from_pem("garbage", &h.signing_pem, &h.signing_key_pem, &h.root_pem),
            Err(PkiError::Configuration(_))
        ));
        assert!(matches!(
            CaKeyMaterial::from_pem(&h.signing_pem, &h.signing_pem, "garbage", &h.root_pem),
            Err(PkiError::Configuration(_))
        ));
        assert!(matches!(
            CaKeyMaterial::from_pem(&h.signing_pem, &h.signing_pem, &h.signing_key_pem, ""),
            Err(PkiError::Configuration(_))
        ));
    }

    #[test]
    fn loads_from_files() {
        let h = hierarchy();
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, content: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        };
        let config = KeyMaterialConfig::Imported {
            cert_chain: write("cert-chain.pem", &h.signing_pem),
            signing_cert: write("ca-cert.pem", &h.signing_pem),
            signing_key: write("ca-key.pem", &h.signing_key_pem),
            root_cert: write("root-cert.pem", &h.root_pem),
        };
        let material = CaKeyMaterial::load(&config).unwrap();
        assert_eq!(material.mode(), CaMode::Imported);
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let config = KeyMaterialConfig::Imported {
            cert_chain: PathBuf::from("/nonexistent/cert-chain.pem"),
            signing_cert: PathBuf::from("/nonexistent/ca-cert.pem"),
            signing_key: PathBuf::from("/nonexistent/ca-key.pem"),
            root_cert: PathBuf::from("/nonexistent/root-cert.pem"),
        };
        match CaKeyMaterial::load(&config) {
            Err(PkiError::Configuration(msg)) => assert!(msg.contains("cert-chain.pem")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected failure"),
        }
    }
}
