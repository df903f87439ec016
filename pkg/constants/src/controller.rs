//! Secret controller constants.

/// Number of concurrent reconcile workers.
pub const DEFAULT_WORKERS: usize = 4;

/// A certificate is rotated once its remaining lifetime drops below
/// `ratio * (not_after - not_before)`.
pub const DEFAULT_ROTATION_GRACE_RATIO: f64 = 0.5;

/// The rotation scan runs every `cert_ttl / SCAN_INTERVAL_DIVISOR` unless configured.
pub const SCAN_INTERVAL_DIVISOR: u32 = 2;

/// Consecutive signing failures after which an identity is parked.
pub const DEFAULT_MAX_SIGNING_FAILURES: u32 = 5;

/// How many times a write is retried after an optimistic-concurrency conflict.
pub const MAX_CONFLICT_RETRIES: u32 = 3;

/// Time in-flight reconciles are given to finish after shutdown is requested.
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Capacity of the channel between the identity watcher and the dispatcher.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ─── Store retry policy ───────────────────────────────────────────────────

/// Attempts per store call before the error is surfaced (including the first).
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// First backoff delay, in milliseconds.
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 100;

/// Backoff ceiling, in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Exponential backoff multiplier.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
