//! Network-related constants.

/// Default port for the monitoring endpoint (`/metrics`, `/healthz`, `/root-cert`).
/// Port `0` disables the endpoint.
pub const DEFAULT_MONITORING_PORT: u16 = 15014;
