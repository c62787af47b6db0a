//! Transfer engine: connection rounds and the transfer state machine.
//!
//! Given a negotiated transaction, this crate obtains a socket to the
//! peer (cheapest strategy first, racing an inbound listener), keeps the
//! link alive for the payload exchange, and falls back to cloud buffering
//! when the peer is confirmed offline.

mod connect;
mod gate;
mod role;
mod rounds;
mod transferer;

pub use connect::{run_connection_race, RaceOutcome};
pub use gate::{Gate, GatePair, PeerGates, PeerGatesConfig};
pub use role::{DuplexStream, DynStream, ReceiverRole, RoleFuture, SenderRole, TransferRole};
pub use rounds::{AddressRound, ConnectionRound, RelayRound, RoundFuture, RoundProvider};
pub use transferer::{
    CloudBufferTarget, RoundSource, RoundsFuture, TransferEvent, TransferOutcome, TransferState,
    Transferer, TransfererConfig,
};

use peerferry_channel::ChannelError;
use peerferry_cloudstore::UploadError;
use peerferry_coordination::CoordinationError;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    /// Publishing our addresses failed; without them the peer can never
    /// reach us, so this is fatal to the transfer.
    #[error("failed to publish local addresses: {0}")]
    PublishFailed(CoordinationError),

    #[error("invalid relative path: {0}")]
    InvalidPath(String),

    #[error("transfer cancelled")]
    Cancelled,
}
