//! The outer transaction state machine.
//!
//! Active states are role-specific (`Created → Negotiating →
//! AwaitingDecision → Active`, the decision state existing only for the
//! receive role); every run converges through exactly one terminal
//! funnel state (`Finish`, `Reject`, `Cancel`, `Fail`) and then `End`,
//! which clears the on-disk snapshot. Funnel states never propagate
//! errors past their boundary: whatever goes wrong inside them is
//! logged and the machine still ends.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use peerferry_coordination::{Coordinator, Telemetry, TransactionStatus};
use peerferry_transfer::{TransferError, TransferOutcome, Transferer};

use crate::snapshot::{SnapshotStore, TransactionSnapshot};
use crate::types::{Role, TransactionData};
use crate::TransactionError;

/// States of the outer machine; names are what lands in `state.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Created,
    Negotiating,
    AwaitingDecision,
    Active,
    Finish,
    Reject,
    Cancel,
    Fail,
    End,
}

impl MachineState {
    pub fn name(&self) -> &'static str {
        match self {
            MachineState::Created => "created",
            MachineState::Negotiating => "negotiating",
            MachineState::AwaitingDecision => "awaiting_decision",
            MachineState::Active => "active",
            MachineState::Finish => "finish",
            MachineState::Reject => "reject",
            MachineState::Cancel => "cancel",
            MachineState::Fail => "fail",
            MachineState::End => "end",
        }
    }
}

/// The payload operation the `Active` state delegates to. One
/// implementation per role is selected at construction and never
/// re-dispatched; [`TransfererOp`] is the production one, tests script
/// their own.
pub trait TransferOp: Send + Sync {
    fn progress(&self) -> watch::Receiver<f64>;
    fn run<'a>(
        &'a self,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferOutcome, TransferError>> + Send + 'a>>;
}

/// Runs the inner transfer state machine.
pub struct TransfererOp(pub Transferer);

impl TransferOp for TransfererOp {
    fn progress(&self) -> watch::Receiver<f64> {
        self.0.progress()
    }

    fn run<'a>(
        &'a self,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferOutcome, TransferError>> + Send + 'a>> {
        Box::pin(self.0.run(cancel))
    }
}

/// Runs when a transaction enters the funnel, before `End`: closing
/// archives, mirrors, open handles. Errors are logged, never fatal.
pub trait CleanupHook: Send + Sync {
    fn cleanup(&self, data: &TransactionData) -> Result<(), std::io::Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCleanup;

impl CleanupHook for NoopCleanup {
    fn cleanup(&self, _data: &TransactionData) -> Result<(), std::io::Error> {
        Ok(())
    }
}

/// Requests delivered to the machine task by the owning handle.
pub(crate) enum Command {
    Accept(oneshot::Sender<Result<(), TransactionError>>),
    Reject(oneshot::Sender<Result<(), TransactionError>>),
    Cancel(oneshot::Sender<Result<(), TransactionError>>),
    StatusUpdate(TransactionStatus),
}

/// Which funnel state the active phase resolved into.
enum Funnel {
    Finish,
    Reject,
    Cancel,
    Fail(String),
}

pub struct TransactionMachine {
    data: TransactionData,
    status: TransactionStatus,
    coordinator: Arc<dyn Coordinator>,
    telemetry: Arc<dyn Telemetry>,
    snapshots: Arc<SnapshotStore>,
    op: Box<dyn TransferOp>,
    cleanup: Box<dyn CleanupHook>,
    status_tx: watch::Sender<TransactionStatus>,
}

impl TransactionMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: TransactionData,
        coordinator: Arc<dyn Coordinator>,
        telemetry: Arc<dyn Telemetry>,
        snapshots: Arc<SnapshotStore>,
        op: Box<dyn TransferOp>,
        cleanup: Box<dyn CleanupHook>,
        status_tx: watch::Sender<TransactionStatus>,
    ) -> Self {
        Self {
            data,
            status: TransactionStatus::Created,
            coordinator,
            telemetry,
            snapshots,
            op,
            cleanup,
            status_tx,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let funnel = self.run_active(&mut commands).await;
        self.run_funnel(funnel).await;
        // Anything still queued arrived after the terminal transition.
        while let Ok(command) = commands.try_recv() {
            refuse(command, "transaction already terminal");
        }
    }

    /// Drives the active states; the return value is the single funnel
    /// state this run converges into.
    async fn run_active(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Funnel {
        self.enter(MachineState::Created);

        self.enter(MachineState::Negotiating);
        if let Err(e) = self.negotiate().await {
            return Funnel::Fail(format!("negotiation failed: {e}"));
        }
        self.set_status(TransactionStatus::Initialized);

        if self.data.role == Role::Receive {
            self.enter(MachineState::AwaitingDecision);
            match self.await_decision(commands).await {
                Decision::Accepted => {}
                Decision::Funnel(funnel) => return funnel,
            }
            self.set_status(TransactionStatus::Accepted);
        }

        self.enter(MachineState::Active);
        if let Err(e) = self
            .coordinator
            .update_status(
                &self.data.txn_id,
                TransactionStatus::Started,
                Some(self.data.local_device()),
            )
            .await
        {
            warn!(transaction = %self.data.txn_id, error = %e, "started notification failed");
        }
        self.set_status(TransactionStatus::Started);

        let cancel = CancellationToken::new();
        let mut run = self.op.run(cancel.clone());
        // Set when a remote terminal status interrupts the transfer, so
        // the eventual Cancelled outcome maps to the right funnel.
        let mut remote_funnel: Option<Funnel> = None;
        loop {
            tokio::select! {
                result = &mut run => {
                    return match result {
                        Ok(TransferOutcome::Delivered) | Ok(TransferOutcome::Buffered) => {
                            Funnel::Finish
                        }
                        Ok(TransferOutcome::Cancelled) => {
                            remote_funnel.unwrap_or(Funnel::Cancel)
                        }
                        Err(e) => Funnel::Fail(e.to_string()),
                    };
                }
                command = commands.recv() => match command {
                    Some(Command::Cancel(reply)) => {
                        // Idempotent: a second cancel is answered the
                        // same way and changes nothing.
                        let _ = reply.send(Ok(()));
                        cancel.cancel();
                    }
                    Some(Command::Accept(reply)) | Some(Command::Reject(reply)) => {
                        let _ = reply.send(Err(TransactionError::BadOperation(
                            "transfer already in progress".into(),
                        )));
                    }
                    Some(Command::StatusUpdate(status)) => {
                        if let Some(funnel) = remote_gate(status) {
                            info!(transaction = %self.data.txn_id, ?status, "remote terminal status");
                            remote_funnel = Some(funnel);
                            cancel.cancel();
                        }
                    }
                    None => cancel.cancel(),
                }
            }
        }
    }

    /// Waits for the local user (or a remote terminal status) to decide
    /// an incoming transfer.
    async fn await_decision(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Decision {
        let mut decided: Option<Decision> = None;
        while decided.is_none() {
            match commands.recv().await {
                Some(Command::Accept(reply)) => {
                    let _ = reply.send(Ok(()));
                    decided = Some(Decision::Accepted);
                }
                Some(Command::Reject(reply)) => {
                    let _ = reply.send(Ok(()));
                    decided = Some(Decision::Funnel(Funnel::Reject));
                }
                Some(Command::Cancel(reply)) => {
                    let _ = reply.send(Ok(()));
                    decided = Some(Decision::Funnel(Funnel::Cancel));
                }
                Some(Command::StatusUpdate(status)) => {
                    if let Some(funnel) = remote_gate(status) {
                        decided = Some(Decision::Funnel(funnel));
                    }
                }
                None => decided = Some(Decision::Funnel(Funnel::Cancel)),
            }
        }
        decided.unwrap_or(Decision::Funnel(Funnel::Cancel))
    }

    /// Registers the transaction with the coordination service,
    /// assigning an id if this side originated it.
    async fn negotiate(&mut self) -> Result<(), TransactionError> {
        if self.data.txn_id.is_empty() {
            self.data.txn_id = Uuid::new_v4().to_string();
            info!(transaction = %self.data.txn_id, seq = self.data.seq, "transaction id assigned");
            self.coordinator
                .update_status(
                    &self.data.txn_id,
                    TransactionStatus::Created,
                    Some(self.data.local_device()),
                )
                .await?;
        }
        self.coordinator
            .update_status(
                &self.data.txn_id,
                TransactionStatus::Initialized,
                Some(self.data.local_device()),
            )
            .await?;
        Ok(())
    }

    /// Runs the chosen funnel state to completion. Never fails: every
    /// error inside the funnel is caught and the machine ends anyway.
    async fn run_funnel(&mut self, funnel: Funnel) {
        let (state, status, reason) = match funnel {
            Funnel::Finish => (MachineState::Finish, TransactionStatus::Finished, None),
            Funnel::Reject => (MachineState::Reject, TransactionStatus::Rejected, None),
            Funnel::Cancel => (MachineState::Cancel, TransactionStatus::Canceled, None),
            Funnel::Fail(reason) => (MachineState::Fail, TransactionStatus::Failed, Some(reason)),
        };
        self.enter(state);

        if let Some(reason) = &reason {
            error!(transaction = %self.data.txn_id, reason, "transaction failed");
            self.telemetry.crash_report(&self.data.txn_id, reason);
        }

        // Benign acks (already in status / already finalized) come back
        // as Ok from the coordinator.
        if !self.data.txn_id.is_empty() {
            if let Err(e) = self
                .coordinator
                .update_status(&self.data.txn_id, status, Some(self.data.local_device()))
                .await
            {
                warn!(transaction = %self.data.txn_id, error = %e, "terminal notification failed");
            }
        }

        if let Err(e) = self.cleanup.cleanup(&self.data) {
            warn!(transaction = %self.data.txn_id, error = %e, "cleanup hook failed");
        }

        self.set_status(status);

        self.enter(MachineState::End);
        if let Err(e) = self.snapshots.clear() {
            warn!(transaction = %self.data.txn_id, error = %e, "snapshot cleanup failed");
        }
    }

    fn enter(&self, state: MachineState) {
        info!(transaction = %self.data.txn_id, seq = self.data.seq, state = state.name(), "machine state");
        if state != MachineState::End {
            if let Err(e) = self.snapshots.save_state(state.name()) {
                warn!(transaction = %self.data.txn_id, error = %e, "state snapshot failed");
            }
        }
    }

    /// Records and publishes a status change. Once terminal, the
    /// externally observed status never changes again.
    fn set_status(&mut self, status: TransactionStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        let snapshot = TransactionSnapshot {
            version: crate::snapshot::SNAPSHOT_VERSION,
            data: self.data.clone(),
            status,
            archived: false,
            upload_token: peerferry_cloudstore::TokenStore::load(self.snapshots.as_ref()),
        };
        if !status.is_terminal() {
            if let Err(e) = self.snapshots.save_transaction(&snapshot) {
                warn!(transaction = %self.data.txn_id, error = %e, "transaction snapshot failed");
            }
        }
        let _ = self.status_tx.send(status);
    }
}

enum Decision {
    Accepted,
    Funnel(Funnel),
}

/// Maps a remote terminal status onto the local funnel gate it opens.
/// Non-terminal and unknown statuses are ignored, not errors.
fn remote_gate(status: TransactionStatus) -> Option<Funnel> {
    match status {
        TransactionStatus::Canceled | TransactionStatus::Deleted => Some(Funnel::Cancel),
        TransactionStatus::Rejected => Some(Funnel::Reject),
        TransactionStatus::Finished => Some(Funnel::Finish),
        TransactionStatus::Failed => Some(Funnel::Fail("peer reported failure".into())),
        _ => None,
    }
}

fn refuse(command: Command, why: &str) {
    match command {
        Command::Accept(reply) | Command::Reject(reply) | Command::Cancel(reply) => {
            let _ = reply.send(Err(TransactionError::BadOperation(why.into())));
        }
        Command::StatusUpdate(_) => {}
    }
}
