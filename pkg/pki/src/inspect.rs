//! Read-only inspection of PEM certificates.

use chrono::{DateTime, Utc};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use crate::error::{PkiError, Result};

/// Fields of a certificate the controller and the loader care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub organization: Option<String>,
    pub uris: Vec<String>,
    pub serial: String,
    pub is_ca: bool,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    pub fn lifetime(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }
}

/// Split a PEM buffer into DER certificates, in order.
pub fn pem_to_ders(pem: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut reader = pem;
    let ders = rustls_pemfile::certs(&mut reader)
        .map(|r| r.map(|der| der.to_vec()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PkiError::Parse(format!("failed to read PEM: {}", e)))?;
    if ders.is_empty() {
        return Err(PkiError::Parse("no certificate found in PEM".to_string()));
    }
    Ok(ders)
}

/// Parse the first certificate of a PEM buffer.
pub fn inspect_pem(pem: &[u8]) -> Result<CertificateInfo> {
    let ders = pem_to_ders(pem)?;
    inspect_der(&ders[0])
}

pub fn inspect_der(der: &[u8]) -> Result<CertificateInfo> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))?;

    let uris = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::URI(uri) => Some(uri.to_string()),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => return Err(PkiError::Parse(format!("invalid SAN extension: {}", e))),
    };

    let organization = cert
        .subject()
        .iter_organization()
        .next()
        .and_then(|o| o.as_str().ok())
        .map(str::to_string);

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        organization,
        uris,
        serial: cert.raw_serial_as_string(),
        is_ca: cert.is_ca(),
        not_before: asn1_to_utc(cert.validity().not_before)?,
        not_after: asn1_to_utc(cert.validity().not_after)?,
    })
}

/// Check that `cert_der` carries a valid signature from the key in `issuer_der`.
/// A certificate verifies against itself when it is self-signed.
pub fn verify_issued_by(cert_der: &[u8], issuer_der: &[u8]) -> Result<()> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))?;
    let (_, issuer) = X509Certificate::from_der(issuer_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse issuer certificate: {}", e)))?;
    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|e| PkiError::Parse(format!("signature verification failed: {}", e)))
}

fn asn1_to_utc(t: ASN1Time) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(t.timestamp(), 0)
        .ok_or_else(|| PkiError::Parse(format!("timestamp out of range: {}", t)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_pem_input() {
        assert!(inspect_pem(b"not a certificate").is_err());
        assert!(pem_to_ders(b"").is_err());
    }

    #[test]
    fn rejects_truncated_certificate() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIBAAAA\n-----END CERTIFICATE-----\n";
        assert!(inspect_pem(pem.as_bytes()).is_err());
    }
}
