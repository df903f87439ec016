use pkg_types::identity::IdentityKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::queue::WorkQueue;
use crate::tracker::IdentityTracker;

/// Periodically requeues every tracked, non-parked identity so certificates
/// crossing the rotation threshold are picked up without a watch event.
pub struct RotationScheduler {
    interval: Duration,
}

impl RotationScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn run(
        self,
        tracker: Arc<IdentityTracker>,
        queue: Arc<WorkQueue<IdentityKey>>,
        cancel: CancellationToken,
    ) {
        info!(
            "RotationScheduler started (interval={}s)",
            self.interval.as_secs()
        );
        // The initial sync already queues everything; skip the immediate tick.
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let keys = tracker.schedulable();
                    debug!("Rotation scan requeueing {} identities", keys.len());
                    for key in keys {
                        queue.add(key);
                    }
                }
            }
        }
        info!("RotationScheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_metrics::MetricsRegistry;

    #[tokio::test(start_paused = true)]
    async fn requeues_schedulable_identities_each_tick() {
        let tracker = Arc::new(IdentityTracker::new(1, Arc::new(MetricsRegistry::mesh_ca())));
        let queue = Arc::new(WorkQueue::new());
        let a = IdentityKey::new("default", "a");
        let parked = IdentityKey::new("default", "parked");
        tracker.track(a.clone());
        tracker.track(parked.clone());
        tracker.record_signing_failure(&parked);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(RotationScheduler::new(Duration::from_secs(60)).run(
            tracker.clone(),
            queue.clone(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(queue.is_empty(), "no scan before the first interval");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some(a.clone()));
        queue.done(&a);

        cancel.cancel();
        handle.await.unwrap();
    }
}
