use pkg_cluster::ClusterClient;
use pkg_constants::controller::{
    DEFAULT_MAX_SIGNING_FAILURES, DEFAULT_ROTATION_GRACE_RATIO, DEFAULT_WORKERS,
    EVENT_CHANNEL_CAPACITY, SCAN_INTERVAL_DIVISOR, SHUTDOWN_GRACE_SECS,
};
use pkg_constants::pki::DEFAULT_TRUST_DOMAIN;
use pkg_metrics::MetricsRegistry;
use pkg_pki::Signer;
use pkg_types::duration::format_duration;
use pkg_types::identity::{IdentityEvent, IdentityKey, Scope};
use pkg_types::validate::validate_identity;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::queue::WorkQueue;
use crate::reconciler::{ReconcileSettings, Reconciler};
use crate::retry::RetryConfig;
use crate::scheduler::RotationScheduler;
use crate::tracker::IdentityTracker;
use crate::watcher::IdentityWatcher;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub scope: Scope,
    pub trust_domain: String,
    /// Validity requested for workload certificates.
    pub cert_ttl: Duration,
    pub workers: usize,
    /// Fraction of a certificate's lifetime below which it is rotated.
    pub grace_ratio: f64,
    pub scan_interval: Duration,
    pub max_signing_failures: u32,
    pub shutdown_grace: Duration,
    pub retry: RetryConfig,
}

impl ControllerConfig {
    /// Defaults for the given certificate TTL; the scan runs at half the TTL.
    pub fn new(cert_ttl: Duration) -> Self {
        Self {
            scope: Scope::All,
            trust_domain: DEFAULT_TRUST_DOMAIN.to_string(),
            cert_ttl,
            workers: DEFAULT_WORKERS,
            grace_ratio: DEFAULT_ROTATION_GRACE_RATIO,
            scan_interval: cert_ttl / SCAN_INTERVAL_DIVISOR,
            max_signing_failures: DEFAULT_MAX_SIGNING_FAILURES,
            shutdown_grace: Duration::from_secs(SHUTDOWN_GRACE_SECS),
            retry: RetryConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cert_ttl < Duration::from_secs(1) {
            return Err("certificate TTL must be at least one second".to_string());
        }
        if self.workers == 0 {
            return Err("at least one worker is required".to_string());
        }
        if !(self.grace_ratio > 0.0 && self.grace_ratio < 1.0) {
            return Err(format!(
                "rotation grace ratio must be between 0 and 1 (exclusive), got {}",
                self.grace_ratio
            ));
        }
        if self.scan_interval.is_zero() || self.scan_interval >= self.cert_ttl {
            return Err(format!(
                "scan interval ({}) must be positive and shorter than the certificate TTL ({})",
                format_duration(self.scan_interval),
                format_duration(self.cert_ttl)
            ));
        }
        if self.max_signing_failures == 0 {
            return Err("max signing failures must be at least 1".to_string());
        }
        if self.trust_domain.is_empty() {
            return Err("trust domain must not be empty".to_string());
        }
        self.retry.validate()
    }
}

/// Keeps one secret per service account in scope: issues it when the
/// identity appears, rotates it before expiry, deletes it with the identity.
pub struct SecretController {
    cluster: Arc<dyn ClusterClient>,
    signer: Arc<dyn Signer>,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
    tracker: Arc<IdentityTracker>,
    queue: Arc<WorkQueue<IdentityKey>>,
}

impl SecretController {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        signer: Arc<dyn Signer>,
        metrics: Arc<MetricsRegistry>,
        config: ControllerConfig,
    ) -> Self {
        let tracker = Arc::new(IdentityTracker::new(
            config.max_signing_failures,
            metrics.clone(),
        ));
        Self {
            cluster,
            signer,
            metrics,
            clock: Arc::new(SystemClock),
            config,
            tracker,
            queue: Arc::new(WorkQueue::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tracker(&self) -> Arc<IdentityTracker> {
        self.tracker.clone()
    }

    /// Run until `cancel` fires or the watcher stops, then give in-flight
    /// reconciles up to `shutdown_grace` to finish.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "SecretController started ({}, workers={}, cert_ttl={}, scan_interval={})",
            self.config.scope,
            self.config.workers,
            format_duration(self.config.cert_ttl),
            format_duration(self.config.scan_interval)
        );

        // Cancelled on every exit path so the watcher and scheduler stop too.
        let tasks = cancel.child_token();
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let watcher = IdentityWatcher::new(
            self.cluster.clone(),
            self.config.scope.clone(),
            self.config.retry.clone(),
            self.metrics.clone(),
        );
        let watcher_task = tokio::spawn(watcher.run(events_tx, tasks.clone()));
        let scheduler_task = tokio::spawn(RotationScheduler::new(self.config.scan_interval).run(
            self.tracker.clone(),
            self.queue.clone(),
            tasks.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(
            self.cluster.clone(),
            self.signer.clone(),
            self.tracker.clone(),
            self.metrics.clone(),
            self.clock.clone(),
            ReconcileSettings {
                trust_domain: self.config.trust_domain.clone(),
                cert_ttl: self.config.cert_ttl,
                grace_ratio: self.config.grace_ratio,
                retry: self.config.retry.clone(),
            },
        ));
        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            workers.spawn(worker(id, reconciler.clone(), self.queue.clone()));
        }

        loop {
            tokio::select! {
                _ = tasks.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        warn!("Identity watcher stopped unexpectedly");
                        break;
                    }
                },
            }
        }

        info!("SecretController shutting down");
        tasks.cancel();
        self.queue.shutdown();
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Reconciles still running after {}, aborting them",
                format_duration(self.config.shutdown_grace)
            );
            workers.abort_all();
        }
        let _ = watcher_task.await;
        let _ = scheduler_task.await;
        info!("SecretController stopped");
    }

    fn dispatch(&self, event: IdentityEvent) {
        match event {
            IdentityEvent::Added(key) => {
                if let Err(e) = validate_identity(&key) {
                    warn!(identity = %key, error = %e, "Ignoring identity that cannot own a secret");
                    return;
                }
                debug!(identity = %key, "Identity added");
                self.tracker.track(key.clone());
                self.queue.add(key);
            }
            IdentityEvent::Deleted(key) => {
                debug!(identity = %key, "Identity deleted");
                self.tracker.untrack(&key);
                self.queue.add(key);
            }
        }
    }
}

async fn worker(id: usize, reconciler: Arc<Reconciler>, queue: Arc<WorkQueue<IdentityKey>>) {
    while let Some(key) = queue.next().await {
        match reconciler.reconcile(&key).await {
            Ok(outcome) => debug!(worker = id, identity = %key, outcome = ?outcome, "Reconciled"),
            Err(e) => warn!(worker = id, identity = %key, error = %e, "Reconcile failed, will retry on next scan"),
        }
        queue.done(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::reconciler::testing::{CountingSigner, fast_retry};
    use pkg_cluster::{ClusterError, IdentityList, IdentityStream, MemoryCluster};
    use pkg_metrics::CERTIFICATES_ROTATED;
    use pkg_types::secret::SecretObject;
    use std::future::Future;

    const HOUR: Duration = Duration::from_secs(3600);

    async fn eventually<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..400 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn config() -> ControllerConfig {
        let mut config = ControllerConfig::new(HOUR);
        config.retry = fast_retry();
        config
    }

    #[test]
    fn default_config_is_valid() {
        let config = ControllerConfig::new(HOUR);
        assert_eq!(config.scan_interval, Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = ControllerConfig::new(HOUR);
        config.scan_interval = HOUR;
        assert!(config.validate().unwrap_err().contains("scan interval"));

        let mut config = ControllerConfig::new(HOUR);
        config.grace_ratio = 1.0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::new(HOUR);
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::new(HOUR);
        config.max_signing_failures = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn issues_and_removes_secrets_for_service_accounts() {
        let cluster = MemoryCluster::new();
        cluster.add_service_account(IdentityKey::new("default", "web"));
        cluster.add_service_account(IdentityKey::new("payments", "checkout"));

        let metrics = Arc::new(MetricsRegistry::mesh_ca());
        let controller = SecretController::new(
            Arc::new(cluster.clone()),
            Arc::new(CountingSigner::new()),
            metrics.clone(),
            config(),
        );
        let tracker = controller.tracker();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        eventually(|| {
            let cluster = cluster.clone();
            async move { cluster.secret_count() == 2 }
        })
        .await;
        assert!(cluster.secret("payments", "mesh-ca.checkout").is_some());
        assert_eq!(tracker.len(), 2);

        cluster.remove_service_account(&IdentityKey::new("default", "web"));
        eventually(|| {
            let cluster = cluster.clone();
            async move { cluster.secret("default", "mesh-ca.web").is_none() }
        })
        .await;
        assert_eq!(tracker.len(), 1);
        assert_eq!(cluster.stats().secret_deletes, 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_scans_rotate_exactly_once() {
        let cluster = MemoryCluster::new();
        let key = IdentityKey::new("default", "web");
        cluster.add_service_account(key.clone());

        let signer = Arc::new(CountingSigner::new());
        let clock = Arc::new(ManualClock::starting_now());
        let metrics = Arc::new(MetricsRegistry::mesh_ca());
        let mut config = config();
        config.scan_interval = Duration::from_millis(10);
        let controller = SecretController::new(
            Arc::new(cluster.clone()),
            signer.clone(),
            metrics.clone(),
            config,
        )
        .with_clock(clock.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        eventually(|| {
            let cluster = cluster.clone();
            async move { cluster.secret_count() == 1 }
        })
        .await;
        // Several scans with nothing to do.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.stats().writes(), 1);

        clock.advance(chrono::Duration::minutes(31));
        eventually(|| {
            let cluster = cluster.clone();
            async move { cluster.stats().secret_updates >= 1 }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cluster.stats().secret_updates, 1);
        assert_eq!(signer.signed(), 2);
        assert_eq!(metrics.counter_get(CERTIFICATES_ROTATED), Some(1));

        cancel.cancel();
        handle.await.unwrap();
    }

    /// Delegates to a [`MemoryCluster`], but holds every secret create for
    /// `create_delay` and can make listing panic.
    struct SlowCluster {
        inner: MemoryCluster,
        create_delay: Duration,
        creates_started: Arc<tokio::sync::Notify>,
        panic_on_list: bool,
    }

    impl SlowCluster {
        fn new(inner: MemoryCluster, create_delay: Duration) -> Self {
            Self {
                inner,
                create_delay,
                creates_started: Arc::new(tokio::sync::Notify::new()),
                panic_on_list: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl ClusterClient for SlowCluster {
        async fn list_identities(&self, scope: &Scope) -> Result<IdentityList, ClusterError> {
            if self.panic_on_list {
                panic!("service account listing blew up");
            }
            self.inner.list_identities(scope).await
        }

        async fn watch_identities(
            &self,
            scope: &Scope,
            resource_version: &str,
        ) -> Result<IdentityStream, ClusterError> {
            self.inner.watch_identities(scope, resource_version).await
        }

        async fn get_secret(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<SecretObject>, ClusterError> {
            self.inner.get_secret(namespace, name).await
        }

        async fn create_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError> {
            self.creates_started.notify_one();
            tokio::time::sleep(self.create_delay).await;
            self.inner.create_secret(secret).await
        }

        async fn update_secret(&self, secret: &SecretObject) -> Result<SecretObject, ClusterError> {
            self.inner.update_secret(secret).await
        }

        async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
            self.inner.delete_secret(namespace, name).await
        }
    }

    fn slow_controller(slow: SlowCluster, shutdown_grace: Duration) -> SecretController {
        let mut config = config();
        config.shutdown_grace = shutdown_grace;
        SecretController::new(
            Arc::new(slow),
            Arc::new(CountingSigner::new()),
            Arc::new(MetricsRegistry::mesh_ca()),
            config,
        )
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_reconcile_finish_within_grace() {
        let cluster = MemoryCluster::new();
        cluster.add_service_account(IdentityKey::new("default", "web"));
        let slow = SlowCluster::new(cluster.clone(), Duration::from_millis(200));
        let started = slow.creates_started.clone();
        let controller = slow_controller(slow, Duration::from_secs(5));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(2), started.notified())
            .await
            .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(cluster.secret("default", "mesh-ca.web").is_some());
    }

    #[tokio::test]
    async fn shutdown_aborts_reconcile_that_outlives_grace() {
        let cluster = MemoryCluster::new();
        cluster.add_service_account(IdentityKey::new("default", "web"));
        let slow = SlowCluster::new(cluster.clone(), Duration::from_secs(60));
        let started = slow.creates_started.clone();
        let controller = slow_controller(slow, Duration::from_millis(50));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(2), started.notified())
            .await
            .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.secret_count(), 0);
    }

    #[tokio::test]
    async fn stops_when_the_watcher_dies() {
        let mut slow = SlowCluster::new(MemoryCluster::new(), Duration::ZERO);
        slow.panic_on_list = true;
        let controller = slow_controller(slow, Duration::from_millis(50));

        // Never cancelled from outside.
        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(2), controller.run(cancel.clone()))
            .await
            .unwrap();
        assert!(!cancel.is_cancelled());
    }
}
