//! Certificate authority for workload identities.
//!
//! [`material`] turns configuration into validated CA key material,
//! [`ca`] signs leaf certificates with it, and [`inspect`] reads back
//! certificates that were stored elsewhere.

pub mod ca;
pub mod error;
pub mod inspect;
pub mod material;

pub use ca::{CertificateAuthority, CertificateRequest, IssuedCertificate, Signer};
pub use error::{PkiError, Result};
pub use material::{CaKeyMaterial, CaMode, KeyMaterialConfig};
