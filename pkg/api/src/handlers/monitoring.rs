use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use chrono::{SecondsFormat, Utc};
use pkg_metrics::ROOT_EXPIRED;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub mode: String,
    pub root_not_after: String,
    pub root_expired: bool,
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// GET /healthz: 503 once the root certificate has expired.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let root_not_after = state.ca.root_not_after();
    let expired = state.ca.is_root_expired() || Utc::now() >= root_not_after;
    if expired {
        state.metrics.gauge_set(ROOT_EXPIRED, 1);
    }
    let health = Health {
        status: if expired { "root_expired" } else { "ok" },
        mode: state.ca.mode().to_string(),
        root_not_after: root_not_after.to_rfc3339_opts(SecondsFormat::Secs, true),
        root_expired: expired,
    };
    let code = if expired {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(health))
}

/// GET /root-cert: the CA's root certificate in PEM.
pub async fn root_cert(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        state.ca.root_certificate().to_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::Response;
    use pkg_metrics::MetricsRegistry;
    use pkg_pki::{CaKeyMaterial, CertificateAuthority, CertificateRequest};
    use std::sync::Arc;
    use std::time::Duration;

    fn state() -> AppState {
        let material =
            CaKeyMaterial::self_signed("k8s.cluster.local", Duration::from_secs(240 * 3600))
                .unwrap();
        AppState {
            ca: Arc::new(CertificateAuthority::new(material)),
            metrics: Arc::new(MetricsRegistry::mesh_ca()),
        }
    }

    async fn body(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ca_state() {
        let state = state();
        let response = healthz(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["mode"], "self-signed");
        assert_eq!(json["root_expired"], false);
    }

    #[tokio::test]
    async fn healthz_fails_once_root_expired() {
        let state = state();
        let after = state.ca.root_not_after() + chrono::Duration::seconds(1);
        let request = CertificateRequest {
            subject: "spiffe://cluster.local/ns/default/sa/web".to_string(),
            ttl: Duration::from_secs(3600),
        };
        assert!(state.ca.sign_at(&request, after).is_err());

        let response = healthz(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body(response).await.contains("root_expired"));
        assert_eq!(state.metrics.gauge_get(ROOT_EXPIRED), Some(1));
    }

    #[tokio::test]
    async fn serves_metrics_and_root() {
        let state = state();
        let response = metrics(State(state.clone())).await.into_response();
        assert!(body(response).await.contains("mesh_ca_certificates_issued_total 0"));

        let response = root_cert(State(state.clone())).await.into_response();
        assert_eq!(
            body(response).await.as_bytes(),
            state.ca.root_certificate()
        );
    }
}
