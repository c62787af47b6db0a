//! Crash-recoverable snapshots.
//!
//! Each transaction owns a directory under the snapshot root holding
//! `transaction.json` (data, status, archived flag, upload token) and
//! `state.json` (current machine state name). Writes go through a temp
//! file in the same directory plus a rename, so a crash never leaves a
//! half-written snapshot. Both files disappear when the machine reaches
//! `End`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use peerferry_cloudstore::{TokenStore, UploadToken};
use peerferry_coordination::TransactionStatus;

use crate::types::TransactionData;
use crate::TransactionError;

/// Bumped when the snapshot schema changes shape.
pub const SNAPSHOT_VERSION: u32 = 1;

const TRANSACTION_FILE: &str = "transaction.json";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub version: u32,
    pub data: TransactionData,
    pub status: TransactionStatus,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub upload_token: Option<UploadToken>,
}

impl TransactionSnapshot {
    pub fn new(data: TransactionData) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            data,
            status: TransactionStatus::Created,
            archived: false,
            upload_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub version: u32,
    pub state: String,
}

/// On-disk store for one transaction's snapshots.
///
/// Also serves as the [`TokenStore`] for that transaction's cloud
/// uploads: the multipart token rides inside `transaction.json`, so it
/// is persisted and cleared with the same atomicity as everything else.
pub struct SnapshotStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on transaction.json.
    lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(root: &Path, key: &str) -> Self {
        Self {
            dir: root.join(key),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_transaction(&self, snapshot: &TransactionSnapshot) -> Result<(), TransactionError> {
        let _guard = self.lock.lock().unwrap();
        self.write_atomic(TRANSACTION_FILE, snapshot)
    }

    pub fn load_transaction(&self) -> Result<Option<TransactionSnapshot>, TransactionError> {
        self.read(TRANSACTION_FILE)
    }

    pub fn save_state(&self, state: &str) -> Result<(), TransactionError> {
        self.write_atomic(
            STATE_FILE,
            &MachineSnapshot {
                version: SNAPSHOT_VERSION,
                state: state.to_owned(),
            },
        )
    }

    pub fn load_state(&self) -> Result<Option<MachineSnapshot>, TransactionError> {
        self.read(STATE_FILE)
    }

    /// Removes all transient state for this transaction. Called on
    /// `End`; missing files are fine.
    pub fn clear(&self) -> Result<(), TransactionError> {
        let _guard = self.lock.lock().unwrap();
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic<T: Serialize>(&self, name: &str, value: &T) -> Result<(), TransactionError> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, self.dir.join(name))?;
        Ok(())
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Result<Option<T>, TransactionError> {
        let path = self.dir.join(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn update_token(&self, token: Option<UploadToken>) {
        let _guard = self.lock.lock().unwrap();
        let snapshot = match self.read::<TransactionSnapshot>(TRANSACTION_FILE) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                warn!(dir = %self.dir.display(), "no snapshot to carry upload token");
                return;
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "snapshot read failed");
                return;
            }
        };
        let snapshot = TransactionSnapshot {
            upload_token: token,
            ..snapshot
        };
        if let Err(e) = self.write_atomic(TRANSACTION_FILE, &snapshot) {
            warn!(dir = %self.dir.display(), error = %e, "snapshot write failed");
        }
    }
}

impl TokenStore for SnapshotStore {
    fn load(&self) -> Option<UploadToken> {
        let _guard = self.lock.lock().unwrap();
        self.read::<TransactionSnapshot>(TRANSACTION_FILE)
            .ok()
            .flatten()
            .and_then(|s| s.upload_token)
    }

    fn save(&self, token: &UploadToken) {
        self.update_token(Some(token.clone()));
    }

    fn clear(&self) {
        self.update_token(None);
    }
}

/// A transaction found on disk at startup.
#[derive(Debug)]
pub struct RecoveredTransaction {
    pub snapshot: TransactionSnapshot,
    /// Machine state name at the time of the crash, if recorded.
    pub state: Option<String>,
}

/// Scans the snapshot root for transactions interrupted by a crash.
///
/// Terminal transactions are historical and skipped; directories that
/// fail to parse are logged and skipped rather than aborting recovery.
pub fn recover(root: &Path) -> Result<Vec<RecoveredTransaction>, TransactionError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut recovered = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let key = entry.file_name().to_string_lossy().into_owned();
        let store = SnapshotStore::new(root, &key);
        let snapshot = match store.load_transaction() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => continue,
            Err(e) => {
                warn!(dir = %key, error = %e, "unreadable snapshot skipped");
                continue;
            }
        };
        if snapshot.status.is_terminal() {
            debug!(dir = %key, status = ?snapshot.status, "terminal transaction skipped");
            continue;
        }
        let state = store.load_state().ok().flatten().map(|m| m.state);
        recovered.push(RecoveredTransaction { snapshot, state });
    }
    Ok(recovered)
}
