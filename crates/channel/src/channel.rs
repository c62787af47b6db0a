//! Structured RPC channel over an established socket.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::PeerMessage;
use crate::{ChannelError, MAX_CHUNK_LEN, MAX_ENVELOPE_LEN};

/// Structured message channel over any byte stream.
///
/// Generic over the stream so direct TCP sockets, relayed sockets, and
/// in-memory duplexes in tests all work the same way.
pub struct PeerChannel<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeerChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Consumes the channel, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Sends a bare envelope.
    pub async fn send(&mut self, msg: &PeerMessage) -> Result<(), ChannelError> {
        debug_assert!(msg.data_len().is_none(), "data-bearing message without payload");
        self.write_envelope(msg).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a data-bearing envelope followed by its payload bytes.
    pub async fn send_with_data(
        &mut self,
        msg: &PeerMessage,
        data: &[u8],
    ) -> Result<(), ChannelError> {
        let declared = msg.data_len().unwrap_or(0);
        if declared != data.len() as u64 {
            return Err(ChannelError::PayloadMismatch {
                declared,
                supplied: data.len() as u64,
            });
        }
        if declared > MAX_CHUNK_LEN as u64 {
            return Err(ChannelError::PayloadTooLarge(declared));
        }
        self.write_envelope(msg).await?;
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receives the next message and, for data-bearing messages, its
    /// payload.
    pub async fn recv(&mut self) -> Result<(PeerMessage, Option<Vec<u8>>), ChannelError> {
        let len = self.stream.read_u32().await? as usize;
        if len > MAX_ENVELOPE_LEN {
            return Err(ChannelError::EnvelopeTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        let msg: PeerMessage = serde_json::from_slice(&buf)
            .map_err(|e| ChannelError::Decode(format!("bad envelope: {e}")))?;

        let data = match msg.data_len() {
            Some(data_len) => {
                // The declared length is peer-controlled; bound it
                // before allocating anything.
                if data_len > MAX_CHUNK_LEN as u64 {
                    return Err(ChannelError::PayloadTooLarge(data_len));
                }
                let mut data = vec![0u8; data_len as usize];
                self.stream.read_exact(&mut data).await?;
                Some(data)
            }
            None => None,
        };
        Ok((msg, data))
    }

    async fn write_envelope(&mut self, msg: &PeerMessage) -> Result<(), ChannelError> {
        let json = serde_json::to_vec(msg)
            .map_err(|e| ChannelError::Decode(format!("encode failed: {e}")))?;
        if json.len() > MAX_ENVELOPE_LEN {
            return Err(ChannelError::EnvelopeTooLarge(json.len()));
        }
        self.stream.write_u32(json.len() as u32).await?;
        self.stream.write_all(&json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ManifestEntry;

    #[tokio::test]
    async fn envelope_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = PeerChannel::new(a);
        let mut rx = PeerChannel::new(b);

        let msg = PeerMessage::Manifest {
            files: vec![ManifestEntry {
                relative_path: "dir/file.bin".into(),
                size: 1024,
            }],
        };
        tx.send(&msg).await.unwrap();

        let (got, data) = rx.recv().await.unwrap();
        assert_eq!(got, msg);
        assert!(data.is_none());
    }

    #[tokio::test]
    async fn chunk_data_carries_payload() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = PeerChannel::new(a);
        let mut rx = PeerChannel::new(b);

        let payload = vec![0xAB; 512];
        let msg = PeerMessage::ChunkData {
            file: "big.bin".into(),
            offset: 2048,
            len: payload.len() as u64,
            checksum: "deadbeef".into(),
        };
        tx.send_with_data(&msg, &payload).await.unwrap();

        let (got, data) = rx.recv().await.unwrap();
        assert_eq!(got, msg);
        assert_eq!(data.unwrap(), payload);
    }

    #[tokio::test]
    async fn payload_length_mismatch_rejected() {
        let (a, _b) = tokio::io::duplex(4096);
        let mut tx = PeerChannel::new(a);

        let msg = PeerMessage::ChunkData {
            file: "f".into(),
            offset: 0,
            len: 100,
            checksum: String::new(),
        };
        let result = tx.send_with_data(&msg, &[0u8; 50]).await;
        assert!(matches!(result, Err(ChannelError::PayloadMismatch { .. })));
    }

    #[tokio::test]
    async fn garbage_frame_is_decode_error() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut rx = PeerChannel::new(b);

        // Valid length prefix, invalid JSON body.
        a.write_u32(7).await.unwrap();
        a.write_all(b"not {}!").await.unwrap();
        a.flush().await.unwrap();

        let result = rx.recv().await;
        match result {
            Err(e) => assert!(e.is_reconnectable()),
            Ok(_) => panic!("expected decode error"),
        }
    }

    #[tokio::test]
    async fn hostile_payload_declaration_rejected_before_allocation() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut rx = PeerChannel::new(b);

        // A well-formed envelope declaring an absurd payload length,
        // with no payload bytes behind it.
        let hostile = serde_json::to_vec(&PeerMessage::ChunkData {
            file: "f".into(),
            offset: 0,
            len: u64::MAX,
            checksum: String::new(),
        })
        .unwrap();
        a.write_u32(hostile.len() as u32).await.unwrap();
        a.write_all(&hostile).await.unwrap();
        a.flush().await.unwrap();

        match rx.recv().await {
            Err(ChannelError::PayloadTooLarge(len)) => assert_eq!(len, u64::MAX),
            other => panic!("expected payload rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_payload_cannot_be_sent() {
        let (a, _b) = tokio::io::duplex(4096);
        let mut tx = PeerChannel::new(a);

        let data = vec![0u8; MAX_CHUNK_LEN + 1];
        let msg = PeerMessage::ChunkData {
            file: "f".into(),
            offset: 0,
            len: data.len() as u64,
            checksum: String::new(),
        };
        assert!(matches!(
            tx.send_with_data(&msg, &data).await,
            Err(ChannelError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn oversized_envelope_rejected() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut rx = PeerChannel::new(b);

        a.write_u32((MAX_ENVELOPE_LEN + 1) as u32).await.unwrap();
        a.flush().await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Err(ChannelError::EnvelopeTooLarge(_))
        ));
    }
}
