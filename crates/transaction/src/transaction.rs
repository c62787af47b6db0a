//! User-facing transaction handle.
//!
//! Owns one machine task and exposes accept/reject/cancel, progress,
//! and the status stream. The machine processes one transition at a
//! time; commands are queued on an unbounded channel and answered
//! individually.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use peerferry_coordination::{Coordinator, Telemetry, TransactionStatus};

use crate::machine::{CleanupHook, Command, TransactionMachine, TransferOp};
use crate::snapshot::{SnapshotStore, TransactionSnapshot};
use crate::types::{Role, TransactionData};
use crate::TransactionError;

pub struct Transaction {
    seq: u64,
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<TransactionStatus>,
    progress_rx: watch::Receiver<f64>,
    snapshots: Arc<SnapshotStore>,
}

impl Transaction {
    /// Starts a send-side transaction.
    pub fn send(
        data: TransactionData,
        coordinator: Arc<dyn Coordinator>,
        telemetry: Arc<dyn Telemetry>,
        snapshot_root: &Path,
        op: Box<dyn TransferOp>,
        cleanup: Box<dyn CleanupHook>,
    ) -> Result<Self, TransactionError> {
        if data.role != Role::Send {
            return Err(TransactionError::BadOperation(
                "send() requires send-role data".into(),
            ));
        }
        Self::start(data, coordinator, telemetry, snapshot_root, op, cleanup)
    }

    /// Starts a receive-side transaction, normally in response to a
    /// service notification carrying the transaction id.
    pub fn receive(
        data: TransactionData,
        coordinator: Arc<dyn Coordinator>,
        telemetry: Arc<dyn Telemetry>,
        snapshot_root: &Path,
        op: Box<dyn TransferOp>,
        cleanup: Box<dyn CleanupHook>,
    ) -> Result<Self, TransactionError> {
        if data.role != Role::Receive {
            return Err(TransactionError::BadOperation(
                "receive() requires receive-role data".into(),
            ));
        }
        Self::start(data, coordinator, telemetry, snapshot_root, op, cleanup)
    }

    fn start(
        data: TransactionData,
        coordinator: Arc<dyn Coordinator>,
        telemetry: Arc<dyn Telemetry>,
        snapshot_root: &Path,
        op: Box<dyn TransferOp>,
        cleanup: Box<dyn CleanupHook>,
    ) -> Result<Self, TransactionError> {
        let snapshots = Arc::new(SnapshotStore::new(snapshot_root, &data.dir_key()));
        snapshots.save_transaction(&TransactionSnapshot::new(data.clone()))?;

        let seq = data.seq;
        let role = data.role;
        let progress_rx = op.progress();
        let (status_tx, status_rx) = watch::channel(TransactionStatus::Created);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let machine = TransactionMachine::new(
            data,
            coordinator,
            telemetry,
            Arc::clone(&snapshots),
            op,
            cleanup,
            status_tx,
        );
        tokio::spawn(machine.run(command_rx));

        Ok(Self {
            seq,
            role,
            commands,
            status_rx,
            progress_rx,
            snapshots,
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Snapshot store for this transaction; doubles as the upload
    /// token store for its cloud buffering.
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub async fn accept(&self) -> Result<(), TransactionError> {
        if self.role != Role::Receive {
            return Err(TransactionError::BadOperation(
                "only a receive-side transaction can accept".into(),
            ));
        }
        self.request(Command::Accept).await
    }

    pub async fn reject(&self) -> Result<(), TransactionError> {
        if self.role != Role::Receive {
            return Err(TransactionError::BadOperation(
                "only a receive-side transaction can reject".into(),
            ));
        }
        self.request(Command::Reject).await
    }

    /// Requests cancellation. Idempotent while the transaction is
    /// active; a bad operation once it is terminal.
    pub async fn cancel(&self) -> Result<(), TransactionError> {
        self.request(Command::Cancel).await
    }

    /// Feeds a remote status notification into the machine. Unknown or
    /// irrelevant statuses are ignored; so is anything arriving after
    /// the terminal transition.
    pub fn transaction_status_update(&self, status: TransactionStatus) {
        if self.commands.send(Command::StatusUpdate(status)).is_err() {
            debug!(seq = self.seq, ?status, "status update after terminal ignored");
        }
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status_rx.borrow()
    }

    /// Status stream; emits on every change, the terminal status
    /// exactly once.
    pub fn subscribe(&self) -> watch::Receiver<TransactionStatus> {
        self.status_rx.clone()
    }

    /// Progress of the current payload operation in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        *self.progress_rx.borrow()
    }

    /// Waits until the transaction reaches a terminal status.
    pub async fn join(&self) -> TransactionStatus {
        let mut rx = self.status_rx.clone();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            // The machine task is gone; the last observed status stands.
            Err(_) => *self.status_rx.borrow(),
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), TransactionError>>) -> Command,
    ) -> Result<(), TransactionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(make(reply_tx)).is_err() {
            return Err(TransactionError::BadOperation(
                "transaction already terminal".into(),
            ));
        }
        reply_rx.await.unwrap_or_else(|_| {
            Err(TransactionError::BadOperation(
                "transaction already terminal".into(),
            ))
        })
    }
}
