use chrono::{DateTime, SubsecRound, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rcgen::Ia5String;
use rcgen::{
    CertificateParams, DistinguishedName, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::{PkiError, Result};
use crate::material::{CaKeyMaterial, CaMode, KeyMaterialConfig, random_serial, to_offset};

/// A request for a workload certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    /// Workload identity URI, placed in the URI SAN.
    pub subject: String,
    /// Requested validity; capped by the remaining lifetime of the root.
    pub ttl: Duration,
}

/// A freshly signed leaf certificate with its key.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub leaf_cert_pem: String,
    /// Leaf certificate followed by the signing chain.
    pub cert_chain_pem: String,
    pub private_key_pem: String,
    pub root_cert_pem: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Cluster Certificate Authority.
/// Owns the CA key material and issues short-lived workload certificates.
pub struct CertificateAuthority {
    material: CaKeyMaterial,
    /// Serial source; held for the whole signing operation.
    signer: Mutex<StdRng>,
    root_expired: AtomicBool,
}

impl CertificateAuthority {
    pub fn new(material: CaKeyMaterial) -> Self {
        info!(
            "Certificate authority ready (mode={}, root expires {})",
            material.mode(),
            material.root_not_after()
        );
        Self {
            material,
            signer: Mutex::new(StdRng::from_os_rng()),
            root_expired: AtomicBool::new(false),
        }
    }

    /// Load key material and build the CA. Any error here is fatal.
    pub fn from_config(config: &KeyMaterialConfig) -> Result<Self> {
        Ok(Self::new(CaKeyMaterial::load(config)?))
    }

    /// Sign a leaf certificate for `request` valid from now.
    pub fn sign(&self, request: &CertificateRequest) -> Result<IssuedCertificate> {
        self.sign_at(request, Utc::now())
    }

    /// Sign a leaf certificate valid from `now` for
    /// `min(request.ttl, root.not_after - now)`.
    pub fn sign_at(
        &self,
        request: &CertificateRequest,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate> {
        let root_not_after = self.material.root_not_after();
        if self.root_expired.load(Ordering::Acquire) {
            return Err(PkiError::ExpiredRoot(root_not_after));
        }

        let requested = chrono::Duration::from_std(request.ttl)
            .map_err(|e| PkiError::InvalidRequest(format!("invalid TTL: {}", e)))?;
        if requested < chrono::Duration::seconds(1) {
            return Err(PkiError::InvalidRequest(
                "requested TTL must be at least one second".to_string(),
            ));
        }
        let uri = Ia5String::try_from(request.subject.clone()).map_err(|e| {
            PkiError::InvalidRequest(format!("invalid subject '{}': {}", request.subject, e))
        })?;

        let not_before = now.trunc_subsecs(0);
        let remaining = root_not_after - not_before;
        if remaining <= chrono::Duration::zero() {
            if !self.root_expired.swap(true, Ordering::AcqRel) {
                error!(
                    "Root certificate expired at {}; certificate issuance is disabled until restart",
                    root_not_after
                );
            }
            return Err(PkiError::ExpiredRoot(root_not_after));
        }
        let not_after = not_before + requested.min(remaining);

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.subject_alt_names = vec![SanType::URI(uri)];
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;

        let mut rng = self
            .signer
            .lock()
            .map_err(|_| PkiError::Signing("signer lock poisoned".to_string()))?;
        let serial = random_serial(&mut *rng);
        let serial_hex = serial.iter().map(|b| format!("{:02x}", b)).collect::<String>();
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let leaf_key = KeyPair::generate()
            .map_err(|e| PkiError::Signing(format!("failed to generate leaf key: {}", e)))?;
        let leaf = params
            .signed_by(&leaf_key, self.material.issuer(), self.material.signing_key())
            .map_err(|e| PkiError::Signing(format!("failed to sign certificate: {}", e)))?;
        drop(rng);

        let leaf_cert_pem = leaf.pem();
        let cert_chain_pem = format!("{}{}", leaf_cert_pem, self.material.cert_chain_pem());

        debug!(
            "Issued certificate for {} (serial={}, not_after={})",
            request.subject, serial_hex, not_after
        );

        Ok(IssuedCertificate {
            leaf_cert_pem,
            cert_chain_pem,
            private_key_pem: leaf_key.serialize_pem(),
            root_cert_pem: self.material.root_cert_pem().to_string(),
            serial: serial_hex,
            not_before,
            not_after,
        })
    }

    /// Root certificate in PEM.
    pub fn root_certificate(&self) -> &[u8] {
        self.material.root_cert_pem().as_bytes()
    }

    pub fn root_not_after(&self) -> DateTime<Utc> {
        self.material.root_not_after()
    }

    pub fn mode(&self) -> CaMode {
        self.material.mode()
    }

    /// True once a signing attempt observed the root past its validity.
    pub fn is_root_expired(&self) -> bool {
        self.root_expired.load(Ordering::Acquire)
    }
}

/// Signing operations the secret controller depends on.
pub trait Signer: Send + Sync + 'static {
    fn sign_at(
        &self,
        request: &CertificateRequest,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate>;

    /// Root certificate in PEM.
    fn root_certificate(&self) -> &[u8];

    fn is_root_expired(&self) -> bool;
}

impl Signer for CertificateAuthority {
    fn sign_at(
        &self,
        request: &CertificateRequest,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate> {
        CertificateAuthority::sign_at(self, request, now)
    }

    fn root_certificate(&self) -> &[u8] {
        CertificateAuthority::root_certificate(self)
    }

    fn is_root_expired(&self) -> bool {
        CertificateAuthority::is_root_expired(self)
    }
}
