use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const CERTIFICATES_ISSUED: &str = "mesh_ca_certificates_issued_total";
pub const CERTIFICATES_ROTATED: &str = "mesh_ca_certificates_rotated_total";
pub const SECRETS_DELETED: &str = "mesh_ca_secrets_deleted_total";
pub const SIGNING_FAILURES: &str = "mesh_ca_signing_failures_total";
pub const STORE_ERRORS: &str = "mesh_ca_store_errors_total";
pub const WATCH_RESYNCS: &str = "mesh_ca_watch_resyncs_total";
pub const TRACKED_IDENTITIES: &str = "mesh_ca_tracked_identities";
pub const PARKED_IDENTITIES: &str = "mesh_ca_parked_identities";
pub const ROOT_EXPIRED: &str = "mesh_ca_root_expired";

/// A lightweight, thread-safe metrics registry that renders in Prometheus text exposition format.
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Counter>>,
    gauges: RwLock<BTreeMap<String, Gauge>>,
}

/// Monotonically increasing counter.
pub struct Counter {
    value: AtomicU64,
    help: String,
}

/// Value that can go up or down.
pub struct Gauge {
    value: AtomicI64,
    help: String,
}

// Values are atomics, so a panic while holding a lock cannot leave them torn.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry with every mesh-ca metric registered at zero.
    pub fn mesh_ca() -> Self {
        let registry = Self::new();
        registry.register_counter(CERTIFICATES_ISSUED, "Workload certificates issued");
        registry.register_counter(
            CERTIFICATES_ROTATED,
            "Certificates reissued because they were expiring or stale",
        );
        registry.register_counter(SECRETS_DELETED, "Identity secrets deleted");
        registry.register_counter(SIGNING_FAILURES, "Failed signing attempts");
        registry.register_counter(STORE_ERRORS, "Failed cluster API calls");
        registry.register_counter(WATCH_RESYNCS, "Identity watch resynchronizations");
        registry.register_gauge(TRACKED_IDENTITIES, "Identities currently tracked");
        registry.register_gauge(
            PARKED_IDENTITIES,
            "Identities parked after repeated signing failures",
        );
        registry.register_gauge(ROOT_EXPIRED, "1 once the root certificate has expired");
        registry
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        write(&self.counters)
            .entry(name.to_string())
            .or_insert_with(|| Counter {
                value: AtomicU64::new(0),
                help: help.to_string(),
            });
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| Gauge {
                value: AtomicI64::new(0),
                help: help.to_string(),
            });
    }

    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    pub fn counter_add(&self, name: &str, val: u64) {
        if let Some(c) = read(&self.counters).get(name) {
            c.value.fetch_add(val, Ordering::Relaxed);
        }
    }

    pub fn counter_get(&self, name: &str) -> Option<u64> {
        read(&self.counters)
            .get(name)
            .map(|c| c.value.load(Ordering::Relaxed))
    }

    pub fn gauge_set(&self, name: &str, val: i64) {
        if let Some(g) = read(&self.gauges).get(name) {
            g.value.store(val, Ordering::Relaxed);
        }
    }

    pub fn gauge_get(&self, name: &str) -> Option<i64> {
        read(&self.gauges)
            .get(name)
            .map(|g| g.value.load(Ordering::Relaxed))
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        for (name, counter) in read(&self.counters).iter() {
            output.push_str(&format!("# HELP {} {}\n", name, counter.help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!(
                "{} {}\n",
                name,
                counter.value.load(Ordering::Relaxed)
            ));
        }

        for (name, gauge) in read(&self.gauges).iter() {
            output.push_str(&format!("# HELP {} {}\n", name, gauge.help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!(
                "{} {}\n",
                name,
                gauge.value.load(Ordering::Relaxed)
            ));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prometheus_text() {
        let registry = MetricsRegistry::mesh_ca();
        registry.counter_inc(CERTIFICATES_ISSUED);
        registry.counter_add(CERTIFICATES_ISSUED, 2);
        registry.gauge_set(TRACKED_IDENTITIES, 7);

        let text = registry.render();
        assert!(text.contains("# TYPE mesh_ca_certificates_issued_total counter\n"));
        assert!(text.contains("mesh_ca_certificates_issued_total 3\n"));
        assert!(text.contains("# TYPE mesh_ca_tracked_identities gauge\n"));
        assert!(text.contains("mesh_ca_tracked_identities 7\n"));
        assert!(text.contains("mesh_ca_root_expired 0\n"));
    }

    #[test]
    fn unknown_metrics_are_ignored() {
        let registry = MetricsRegistry::new();
        registry.counter_inc("missing");
        registry.gauge_set("missing", 1);
        assert_eq!(registry.counter_get("missing"), None);
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = MetricsRegistry::mesh_ca();
        registry.counter_inc(STORE_ERRORS);
        registry.register_counter(STORE_ERRORS, "again");
        assert_eq!(registry.counter_get(STORE_ERRORS), Some(1));
    }
}
