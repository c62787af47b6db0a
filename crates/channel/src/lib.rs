//! Framed peer wire channel.
//!
//! Once the connection race produces a socket (dialed or accepted, direct
//! or relayed), both sides speak the same structured protocol: a short
//! transaction-id handshake, then length-prefixed JSON envelopes with raw
//! chunk bytes following data-bearing messages.

mod channel;
mod messages;
mod wire;

pub use channel::PeerChannel;
pub use messages::{ManifestEntry, PeerMessage};
pub use wire::{accept_handshake, confirm_handshake, dial_handshake, HANDSHAKE_ID_LEN};

/// Upper bound on a JSON envelope frame. Chunk payloads are framed
/// separately and are not subject to this limit.
pub const MAX_ENVELOPE_LEN: usize = 64 * 1024;

/// Upper bound on a single chunk payload. The declared length comes off
/// the wire from an untrusted peer, so nothing is allocated past this.
pub const MAX_CHUNK_LEN: usize = 256 * 1024;

/// Errors produced by the peer channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes we could not decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// The acceptor did not recognize the transaction id.
    #[error("handshake rejected by peer")]
    Rejected,

    #[error("envelope too large: {0} bytes (max {MAX_ENVELOPE_LEN})")]
    EnvelopeTooLarge(usize),

    /// A data-bearing message declared a payload beyond the chunk cap.
    #[error("chunk payload too large: {0} bytes (max {MAX_CHUNK_LEN})")]
    PayloadTooLarge(u64),

    /// A data-bearing message declared a length that does not match the
    /// payload supplied by the caller.
    #[error("payload length mismatch: declared {declared}, supplied {supplied}")]
    PayloadMismatch { declared: u64, supplied: u64 },
}

impl ChannelError {
    /// Whether the transfer machine should go back to `Connect` instead
    /// of failing. Both network-level and protocol-decode errors are
    /// recovered by reconnecting.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, ChannelError::Io(_) | ChannelError::Decode(_))
    }
}
