//! Per-identity reconciliation: make the identity's secret match the desired
//! state (present and fresh while tracked, gone once untracked).

use chrono::{DateTime, Utc};
use pkg_cluster::{ClusterClient, ClusterError};
use pkg_constants::controller::MAX_CONFLICT_RETRIES;
use pkg_metrics::{
    CERTIFICATES_ISSUED, CERTIFICATES_ROTATED, MetricsRegistry, ROOT_EXPIRED, SECRETS_DELETED,
    SIGNING_FAILURES, STORE_ERRORS,
};
use pkg_pki::inspect::inspect_pem;
use pkg_pki::{CertificateRequest, IssuedCertificate, PkiError, Signer};
use pkg_types::identity::IdentityKey;
use pkg_types::secret::{SecretObject, SecretRecord};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::tracker::{FailureVerdict, IdentityTracker};

/// What the stored secret of an identity looks like right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretState {
    Missing,
    /// A secret with the identity's name exists but was not written by mesh-ca.
    Foreign,
    Malformed(String),
    Valid(SecretRecord),
    /// Below the rotation threshold, expired, or not yet valid.
    ExpiringSoon(SecretRecord),
    /// Issued under a root other than the CA's current one.
    RootMismatch,
}

impl SecretState {
    fn needs_rotation(&self) -> bool {
        matches!(self, SecretState::ExpiringSoon(_) | SecretState::RootMismatch)
    }
}

/// Classify `secret` for `key`. A certificate is expiring once its remaining
/// lifetime is below `grace_ratio` of its full lifetime.
pub fn classify(
    key: &IdentityKey,
    secret: Option<&SecretObject>,
    root_cert: &[u8],
    now: DateTime<Utc>,
    grace_ratio: f64,
) -> SecretState {
    let Some(secret) = secret else {
        return SecretState::Missing;
    };
    if !secret.is_managed_for(key) {
        return SecretState::Foreign;
    }
    let (Some(chain), Some(private_key), Some(stored_root)) =
        (secret.cert_chain(), secret.private_key(), secret.root_cert())
    else {
        return SecretState::Malformed("missing data keys".to_string());
    };
    if private_key.is_empty() {
        return SecretState::Malformed("empty private key".to_string());
    }
    let leaf = match inspect_pem(chain) {
        Ok(leaf) => leaf,
        Err(e) => return SecretState::Malformed(e.to_string()),
    };
    if stored_root != root_cert {
        return SecretState::RootMismatch;
    }

    let record = SecretRecord {
        namespace: secret.namespace.clone(),
        identity_name: key.name.clone(),
        certificate_reference: secret.name.clone(),
        last_issued_at: leaf.not_before,
        expires_at: leaf.not_after,
    };
    let lifetime_ms = record.lifetime().num_milliseconds() as f64;
    let remaining_ms = record.remaining(now).num_milliseconds() as f64;
    if record.last_issued_at > now || remaining_ms < lifetime_ms * grace_ratio {
        SecretState::ExpiringSoon(record)
    } else {
        SecretState::Valid(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No write was needed.
    Unchanged,
    Issued,
    Rotated,
    Deleted,
    /// Signing kept failing; the identity is left alone until it is re-added.
    Parked,
    /// The root has expired; existing secrets are left untouched.
    RootExpired,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("cluster API error: {0}")]
    Store(#[from] ClusterError),

    #[error("signing certificate for {identity} failed ({failures} consecutive): {source}")]
    Signing {
        identity: String,
        failures: u32,
        #[source]
        source: PkiError,
    },

    #[error("secret for {0} kept changing concurrently")]
    ConflictRetriesExhausted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileSettings {
    pub trust_domain: String,
    pub cert_ttl: Duration,
    pub grace_ratio: f64,
    pub retry: RetryConfig,
}

pub struct Reconciler {
    cluster: Arc<dyn ClusterClient>,
    signer: Arc<dyn Signer>,
    tracker: Arc<IdentityTracker>,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        signer: Arc<dyn Signer>,
        tracker: Arc<IdentityTracker>,
        metrics: Arc<MetricsRegistry>,
        clock: Arc<dyn Clock>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            cluster,
            signer,
            tracker,
            metrics,
            clock,
            settings,
        }
    }

    pub async fn reconcile(&self, key: &IdentityKey) -> Result<ReconcileOutcome, ReconcileError> {
        if !self.tracker.is_tracked(key) {
            return self.remove(key).await;
        }
        if self.tracker.is_parked(key) {
            return Ok(ReconcileOutcome::Parked);
        }
        if self.signer.is_root_expired() {
            self.metrics.gauge_set(ROOT_EXPIRED, 1);
            return Ok(ReconcileOutcome::RootExpired);
        }

        let name = key.secret_name();
        let existing = self
            .store("get_secret", || self.cluster.get_secret(&key.namespace, &name))
            .await?;
        let now = self.clock.now();
        let state = self.classify(key, existing.as_ref(), now);
        match &state {
            SecretState::Valid(record) => {
                debug!(identity = %key, expires_at = %record.expires_at, "Secret is up to date");
                return Ok(ReconcileOutcome::Unchanged);
            }
            SecretState::Foreign => {
                warn!(identity = %key, secret = %name, "Secret exists but is not managed by mesh-ca, leaving it");
                return Ok(ReconcileOutcome::Unchanged);
            }
            SecretState::Malformed(reason) => {
                warn!(identity = %key, reason = %reason, "Replacing malformed secret");
            }
            SecretState::ExpiringSoon(record) => {
                info!(identity = %key, expires_at = %record.expires_at, "Certificate is due for rotation");
            }
            SecretState::RootMismatch => {
                info!(identity = %key, "Certificate was issued under a different root, reissuing");
            }
            SecretState::Missing => {}
        }

        let issued = match self.sign(key, now)? {
            Ok(issued) => issued,
            Err(outcome) => return Ok(outcome),
        };
        if !self.write(key, existing, &issued).await? {
            return Ok(ReconcileOutcome::Unchanged);
        }

        self.metrics.counter_inc(CERTIFICATES_ISSUED);
        if state.needs_rotation() {
            self.metrics.counter_inc(CERTIFICATES_ROTATED);
            info!(identity = %key, serial = %issued.serial, not_after = %issued.not_after, "Rotated certificate");
            Ok(ReconcileOutcome::Rotated)
        } else {
            info!(identity = %key, serial = %issued.serial, not_after = %issued.not_after, "Issued certificate");
            Ok(ReconcileOutcome::Issued)
        }
    }

    fn classify(
        &self,
        key: &IdentityKey,
        secret: Option<&SecretObject>,
        now: DateTime<Utc>,
    ) -> SecretState {
        classify(
            key,
            secret,
            self.signer.root_certificate(),
            now,
            self.settings.grace_ratio,
        )
    }

    /// Sign a certificate for `key`. The inner `Err` is the outcome to report
    /// when no certificate can be issued and that is not an error.
    fn sign(
        &self,
        key: &IdentityKey,
        now: DateTime<Utc>,
    ) -> Result<Result<IssuedCertificate, ReconcileOutcome>, ReconcileError> {
        let request = CertificateRequest {
            subject: key.spiffe_uri(&self.settings.trust_domain),
            ttl: self.settings.cert_ttl,
        };
        match self.signer.sign_at(&request, now) {
            Ok(issued) => {
                self.tracker.record_signing_success(key);
                Ok(Ok(issued))
            }
            Err(PkiError::ExpiredRoot(_)) => {
                self.metrics.gauge_set(ROOT_EXPIRED, 1);
                Ok(Err(ReconcileOutcome::RootExpired))
            }
            Err(e) => {
                self.metrics.counter_inc(SIGNING_FAILURES);
                match self.tracker.record_signing_failure(key) {
                    FailureVerdict::Parked => {
                        error!(identity = %key, error = %e, "Signing keeps failing, parking identity until it is re-added");
                        Ok(Err(ReconcileOutcome::Parked))
                    }
                    FailureVerdict::Retry(failures) => Err(ReconcileError::Signing {
                        identity: key.to_string(),
                        failures,
                        source: e,
                    }),
                }
            }
        }
    }

    /// Store `issued` in the identity's secret. On a concurrent change the
    /// secret is re-read and the same certificate is written again, unless
    /// the secret is now valid. Returns false if nothing was written.
    async fn write(
        &self,
        key: &IdentityKey,
        mut current: Option<SecretObject>,
        issued: &IssuedCertificate,
    ) -> Result<bool, ReconcileError> {
        let mut desired = SecretObject::for_identity(
            key,
            issued.cert_chain_pem.as_bytes(),
            issued.private_key_pem.as_bytes(),
            issued.root_cert_pem.as_bytes(),
        );
        let name = key.secret_name();

        for attempt in 0..=MAX_CONFLICT_RETRIES {
            let result = match &current {
                None => {
                    desired.resource_version = None;
                    self.store("create_secret", || self.cluster.create_secret(&desired))
                        .await
                }
                Some(existing) => {
                    desired.resource_version = existing.resource_version.clone();
                    self.store("update_secret", || self.cluster.update_secret(&desired))
                        .await
                }
            };
            match result {
                Ok(_) => return Ok(true),
                Err(ClusterError::Conflict(_)) | Err(ClusterError::AlreadyExists) => {
                    debug!(identity = %key, attempt = attempt, "Secret changed concurrently, re-reading");
                    current = self
                        .store("get_secret", || self.cluster.get_secret(&key.namespace, &name))
                        .await?;
                    match self.classify(key, current.as_ref(), self.clock.now()) {
                        SecretState::Valid(_) | SecretState::Foreign => return Ok(false),
                        _ => {}
                    }
                }
                // Deleted between read and update.
                Err(ClusterError::NotFound) => current = None,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ReconcileError::ConflictRetriesExhausted(key.to_string()))
    }

    async fn remove(&self, key: &IdentityKey) -> Result<ReconcileOutcome, ReconcileError> {
        let name = key.secret_name();
        let existing = self
            .store("get_secret", || self.cluster.get_secret(&key.namespace, &name))
            .await?;
        match existing {
            Some(secret) if secret.is_managed_for(key) => {
                match self
                    .store("delete_secret", || {
                        self.cluster.delete_secret(&key.namespace, &name)
                    })
                    .await
                {
                    Ok(()) | Err(ClusterError::NotFound) => {}
                    Err(e) => return Err(e.into()),
                }
                self.metrics.counter_inc(SECRETS_DELETED);
                info!(identity = %key, secret = %name, "Deleted secret of removed identity");
                Ok(ReconcileOutcome::Deleted)
            }
            Some(_) => {
                debug!(identity = %key, "Secret is not managed by mesh-ca, not deleting");
                Ok(ReconcileOutcome::Unchanged)
            }
            None => Ok(ReconcileOutcome::Unchanged),
        }
    }

    /// Run a cluster call with transient-error backoff.
    async fn store<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, ClusterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let result =
            retry_with_backoff(&self.settings.retry, operation, ClusterError::is_transient, call)
                .await;
        if let Err(e) = &result {
            if !matches!(
                e,
                ClusterError::NotFound | ClusterError::AlreadyExists | ClusterError::Conflict(_)
            ) {
                self.metrics.counter_inc(STORE_ERRORS);
            }
        }
        result
    }
}
