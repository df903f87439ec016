pub mod handlers;
pub mod server;

use std::sync::Arc;

use pkg_metrics::MetricsRegistry;
use pkg_pki::CertificateAuthority;

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ca: Arc<CertificateAuthority>,
    pub metrics: Arc<MetricsRegistry>,
}
