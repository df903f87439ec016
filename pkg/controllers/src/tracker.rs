use dashmap::DashMap;
use pkg_metrics::{MetricsRegistry, PARKED_IDENTITIES, TRACKED_IDENTITIES};
use pkg_types::identity::IdentityKey;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TrackedIdentity {
    signing_failures: u32,
    parked: bool,
}

/// Result of recording a signing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Retry on the next scan. Carries the consecutive failure count.
    Retry(u32),
    /// The failure budget is spent; the identity is no longer scheduled.
    Parked,
}

/// Identities known to exist in the cluster, with their signing failure state.
pub struct IdentityTracker {
    identities: DashMap<IdentityKey, TrackedIdentity>,
    max_signing_failures: u32,
    metrics: Arc<MetricsRegistry>,
}

impl IdentityTracker {
    pub fn new(max_signing_failures: u32, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            identities: DashMap::new(),
            max_signing_failures,
            metrics,
        }
    }

    /// Start tracking `key`, or un-park it if it was parked.
    pub fn track(&self, key: IdentityKey) {
        self.identities.insert(key, TrackedIdentity::default());
        self.publish();
    }

    /// Returns false if the key was not tracked.
    pub fn untrack(&self, key: &IdentityKey) -> bool {
        let removed = self.identities.remove(key).is_some();
        self.publish();
        removed
    }

    pub fn is_tracked(&self, key: &IdentityKey) -> bool {
        self.identities.contains_key(key)
    }

    pub fn is_parked(&self, key: &IdentityKey) -> bool {
        self.identities.get(key).is_some_and(|t| t.parked)
    }

    /// Tracked identities the rotation scan should visit.
    pub fn schedulable(&self) -> Vec<IdentityKey> {
        let mut keys: Vec<_> = self
            .identities
            .iter()
            .filter(|entry| !entry.value().parked)
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn record_signing_failure(&self, key: &IdentityKey) -> FailureVerdict {
        let verdict = match self.identities.get_mut(key) {
            Some(mut entry) => {
                entry.signing_failures += 1;
                if entry.signing_failures >= self.max_signing_failures {
                    entry.parked = true;
                    FailureVerdict::Parked
                } else {
                    FailureVerdict::Retry(entry.signing_failures)
                }
            }
            None => FailureVerdict::Retry(0),
        };
        self.publish();
        verdict
    }

    pub fn record_signing_success(&self, key: &IdentityKey) {
        if let Some(mut entry) = self.identities.get_mut(key) {
            entry.signing_failures = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn parked_count(&self) -> usize {
        self.identities.iter().filter(|e| e.value().parked).count()
    }

    fn publish(&self) {
        self.metrics
            .gauge_set(TRACKED_IDENTITIES, self.identities.len() as i64);
        self.metrics
            .gauge_set(PARKED_IDENTITIES, self.parked_count() as i64);
    }
}
