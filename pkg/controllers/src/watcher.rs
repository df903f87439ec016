use futures_util::StreamExt;
use pkg_cluster::ClusterClient;
use pkg_metrics::{MetricsRegistry, WATCH_RESYNCS};
use pkg_types::identity::{IdentityEvent, IdentityKey, Scope};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::RetryConfig;

/// Follows service accounts in scope and forwards them as [`IdentityEvent`]s.
///
/// After a disconnect the watcher relists and emits only the difference
/// against the identities it has already reported, then resumes watching.
pub struct IdentityWatcher {
    cluster: Arc<dyn ClusterClient>,
    scope: Scope,
    backoff: RetryConfig,
    metrics: Arc<MetricsRegistry>,
    known: BTreeSet<IdentityKey>,
}

impl IdentityWatcher {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        scope: Scope,
        backoff: RetryConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            cluster,
            scope,
            backoff,
            metrics,
            known: BTreeSet::new(),
        }
    }

    /// Run until cancelled or until the receiving side goes away.
    pub async fn run(mut self, events: mpsc::Sender<IdentityEvent>, cancel: CancellationToken) {
        info!("IdentityWatcher started ({})", self.scope);
        let mut synced_once = false;
        let mut failures = 0u32;

        loop {
            let list = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.cluster.list_identities(&self.scope) => result,
            };
            let list = match list {
                Ok(list) => list,
                Err(e) => {
                    failures += 1;
                    let delay = self.backoff.delay_for(failures);
                    warn!(error = %e, attempt = failures, delay_ms = delay.as_millis() as u64, "Listing service accounts failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            if synced_once {
                self.metrics.counter_inc(WATCH_RESYNCS);
            }
            let diff = self.resync(list.identities);
            debug!("Listed service accounts, {} changes since last sync", diff.len());
            for event in diff {
                if events.send(event).await.is_err() {
                    return;
                }
            }
            synced_once = true;

            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.cluster.watch_identities(&self.scope, &list.resource_version) => result,
            };
            let mut stream = match stream {
                Ok(stream) => {
                    failures = 0;
                    stream
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.backoff.delay_for(failures);
                    warn!(error = %e, attempt = failures, delay_ms = delay.as_millis() as u64, "Opening service account watch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("IdentityWatcher stopped");
                        return;
                    }
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        match &event {
                            IdentityEvent::Added(key) => {
                                self.known.insert(key.clone());
                            }
                            IdentityEvent::Deleted(key) => {
                                self.known.remove(key);
                            }
                        }
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Service account watch failed, resyncing");
                        break;
                    }
                    None => {
                        info!("Service account watch closed, resyncing");
                        break;
                    }
                }
            }
        }
        info!("IdentityWatcher stopped");
    }

    /// Replace the known set with `listed`, returning the events that turn
    /// the old set into the new one.
    fn resync(&mut self, listed: Vec<IdentityKey>) -> Vec<IdentityEvent> {
        let listed: BTreeSet<IdentityKey> = listed
            .into_iter()
            .filter(|key| self.scope.contains(key))
            .collect();
        let mut diff: Vec<IdentityEvent> = self
            .known
            .difference(&listed)
            .cloned()
            .map(IdentityEvent::Deleted)
            .collect();
        diff.extend(
            listed
                .difference(&self.known)
                .cloned()
                .map(IdentityEvent::Added),
        );
        self.known = listed;
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_cluster::MemoryCluster;
    use std::time::Duration;

    fn key(name: &str) -> IdentityKey {
        IdentityKey::new("default", name)
    }

    fn start(
        cluster: &MemoryCluster,
    ) -> (
        mpsc::Receiver<IdentityEvent>,
        CancellationToken,
        Arc<MetricsRegistry>,
        tokio::task::JoinHandle<()>,
    ) {
        let metrics = Arc::new(MetricsRegistry::mesh_ca());
        let watcher = IdentityWatcher::new(
            Arc::new(cluster.clone()),
            Scope::All,
            RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            },
            metrics.clone(),
        );
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(tx, cancel.clone()));
        (rx, cancel, metrics, handle)
    }

    async fn recv(rx: &mut mpsc::Receiver<IdentityEvent>) -> IdentityEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("watcher stopped")
    }

    async fn wait_for_watch(cluster: &MemoryCluster) {
        for _ in 0..200 {
            if cluster.watcher_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watch was never opened");
    }

    #[tokio::test]
    async fn initial_list_then_live_events() {
        let cluster = MemoryCluster::new();
        cluster.add_service_account(key("a"));
        let (mut rx, cancel, _, handle) = start(&cluster);

        assert_eq!(recv(&mut rx).await, IdentityEvent::Added(key("a")));
        wait_for_watch(&cluster).await;

        cluster.add_service_account(key("b"));
        cluster.remove_service_account(&key("a"));
        assert_eq!(recv(&mut rx).await, IdentityEvent::Added(key("b")));
        assert_eq!(recv(&mut rx).await, IdentityEvent::Deleted(key("a")));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn resync_after_disconnect_emits_only_differences() {
        let cluster = MemoryCluster::new();
        cluster.add_service_account(key("a"));
        cluster.add_service_account(key("b"));
        let (mut rx, cancel, metrics, handle) = start(&cluster);
        recv(&mut rx).await;
        recv(&mut rx).await;
        wait_for_watch(&cluster).await;

        // Changes that happen while the watch is down are never streamed.
        cluster.disconnect_watches();
        cluster.remove_service_account_silently(&key("a"));
        cluster.add_service_account_silently(key("c"));

        assert_eq!(recv(&mut rx).await, IdentityEvent::Deleted(key("a")));
        assert_eq!(recv(&mut rx).await, IdentityEvent::Added(key("c")));
        wait_for_watch(&cluster).await;
        assert!(rx.try_recv().is_err(), "b must not be re-announced");
        assert_eq!(metrics.counter_get(WATCH_RESYNCS), Some(1));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn list_failures_are_retried() {
        let cluster = MemoryCluster::new();
        cluster.add_service_account(key("a"));
        cluster.fail_next_requests(3);
        let (mut rx, cancel, _, handle) = start(&cluster);

        assert_eq!(recv(&mut rx).await, IdentityEvent::Added(key("a")));
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let cluster = MemoryCluster::new();
        let (_rx, cancel, _, handle) = start(&cluster);
        wait_for_watch(&cluster).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
