//! Diagnostics sink.
//!
//! Relay usage and terminal failures are reported out of band; the engine
//! never blocks on the sink, so both methods are fire-and-forget.

use tracing::debug;

/// Sink for diagnostic events.
pub trait Telemetry: Send + Sync {
    /// A relay round won the connection race for this transaction.
    fn relay_used(&self, txn_id: &str, method: &str);

    /// A transaction entered its fail state; `reason` is the underlying
    /// diagnostic, including HTTP status / provider code where known.
    fn crash_report(&self, txn_id: &str, reason: &str);
}

/// Telemetry sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn relay_used(&self, txn_id: &str, method: &str) {
        debug!(transaction = %txn_id, method, "relay used");
    }

    fn crash_report(&self, txn_id: &str, reason: &str) {
        debug!(transaction = %txn_id, reason, "crash report");
    }
}
