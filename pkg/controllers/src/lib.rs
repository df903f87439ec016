//! The secret controller: watches service accounts and keeps one
//! CA-signed key-and-certificate secret per identity.

pub mod clock;
pub mod controller;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod tracker;
pub mod watcher;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{ControllerConfig, SecretController};
pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
pub use retry::RetryConfig;
