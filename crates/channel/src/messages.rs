//! Peer messages exchanged over an established channel.

use serde::{Deserialize, Serialize};

/// One file in the transfer manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Relative path, forward slashes.
    pub relative_path: String,
    pub size: u64,
}

/// Messages of the payload-exchange protocol.
///
/// `ChunkData` is followed on the wire by exactly `len` raw payload
/// bytes; every other message is a bare envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Sender → receiver: what this transfer contains.
    Manifest { files: Vec<ManifestEntry> },
    /// Receiver → sender: resume point for one file.
    PullRequest { file: String, offset: u64 },
    /// Sender → receiver: one chunk, bytes follow.
    ChunkData {
        file: String,
        offset: u64,
        len: u64,
        checksum: String,
    },
    /// Receiver → sender: chunk written durably.
    ChunkAck { file: String, offset: u64 },
    /// Sender → receiver: all files delivered.
    Complete,
    /// Either side: give up on this channel.
    Abort { reason: String },
}

impl PeerMessage {
    /// Length of the raw payload following this envelope, if any.
    pub fn data_len(&self) -> Option<u64> {
        match self {
            PeerMessage::ChunkData { len, .. } => Some(*len),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_representation() {
        let msg = PeerMessage::ChunkAck {
            file: "a/b.bin".into(),
            offset: 4096,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"chunk_ack\""));
        let back: PeerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn data_len_only_for_chunks() {
        let chunk = PeerMessage::ChunkData {
            file: "f".into(),
            offset: 0,
            len: 128,
            checksum: String::new(),
        };
        assert_eq!(chunk.data_len(), Some(128));
        assert_eq!(PeerMessage::Complete.data_len(), None);
    }
}
