//! Types and client seam for the metadata/coordination service.
//!
//! The coordination service issues transaction records, device endpoints,
//! relay rendezvous points, and cloud credentials. peerferry consumes it
//! through the [`Coordinator`] trait so the orchestration engine stays
//! decoupled from the actual REST transport and testable with mocks.

mod client;
mod telemetry;
mod types;

pub use client::{BoxFuture, Coordinator};
pub use telemetry::{NullTelemetry, Telemetry};
pub use types::{CloudCredentials, PeerEndpoints, RelayEndpoint, StatusAck, TransactionStatus};

/// Errors produced by coordination-service calls.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// The service rejected the operation as not permitted for the
    /// current transaction state. Recovered as a state transition,
    /// never a crash.
    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    /// The service (or relay) is temporarily unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// HTTP-level failure with the provider error code, kept for
    /// diagnostics.
    #[error("http {status}: {code}")]
    Http { status: u16, code: String },

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl CoordinationError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CoordinationError::Unavailable(_) => true,
            CoordinationError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
