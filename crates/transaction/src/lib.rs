//! Transaction lifecycle: the outer state machine wrapping one transfer.
//!
//! A transaction turns user intent (accept, reject, cancel) and remote
//! status notifications into a single linear lifecycle. Every machine
//! variant converges through the shared terminal funnel (`Finish`,
//! `Reject`, `Cancel`, `Fail`) before `End` clears the on-disk snapshot.

mod machine;
mod snapshot;
mod transaction;
mod types;

pub use machine::{
    CleanupHook, MachineState, NoopCleanup, TransactionMachine, TransferOp, TransfererOp,
};
pub use snapshot::{
    recover, MachineSnapshot, RecoveredTransaction, SnapshotStore, TransactionSnapshot,
    SNAPSHOT_VERSION,
};
pub use transaction::Transaction;
pub use types::{FileSpec, Role, TransactionData};

use peerferry_coordination::CoordinationError;
use peerferry_transfer::TransferError;

/// Errors produced by the transaction layer.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// The requested operation is illegal for this role or state, e.g.
    /// accepting a send-side transaction or cancelling a terminal one.
    /// Rejected synchronously; no state changes.
    #[error("bad operation: {0}")]
    BadOperation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}
