//! Transaction data model.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Which side of the transfer this process plays. Fixed at
/// construction; a transaction never changes role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Send,
    Receive,
}

/// One payload file in the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: PathBuf,
    pub size: u64,
}

/// Everything a transaction knows about itself, persisted in the
/// snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionData {
    /// Process-local sequence number, not stable across restarts.
    pub seq: u64,
    /// Transaction id, empty until negotiation assigns one.
    #[serde(default)]
    pub txn_id: String,
    pub sender: String,
    pub sender_device: String,
    pub recipient: String,
    pub recipient_device: Option<String>,
    #[serde(default)]
    pub message: String,
    pub files: Vec<FileSpec>,
    pub role: Role,
}

impl TransactionData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        txn_id: impl Into<String>,
        sender: impl Into<String>,
        sender_device: impl Into<String>,
        recipient: impl Into<String>,
        recipient_device: Option<String>,
        message: impl Into<String>,
        files: Vec<FileSpec>,
    ) -> Self {
        Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            txn_id: txn_id.into(),
            sender: sender.into(),
            sender_device: sender_device.into(),
            recipient: recipient.into(),
            recipient_device,
            message: message.into(),
            files,
            role,
        }
    }

    /// The id of this device within the transaction.
    pub fn local_device(&self) -> &str {
        match self.role {
            Role::Send => &self.sender_device,
            Role::Receive => self.recipient_device.as_deref().unwrap_or(""),
        }
    }

    /// Snapshot directory name: the transaction id once known, the
    /// local sequence number before that.
    pub fn dir_key(&self) -> String {
        if self.txn_id.is_empty() {
            format!("seq-{}", self.seq)
        } else {
            self.txn_id.clone()
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}
