//! Handshake and framing primitives.
//!
//! # Wire format
//!
//! ```text
//! HANDSHAKE (dialer -> acceptor):   [36 bytes: transaction id ASCII]
//! CONFIRM   (acceptor -> dialer):   [1 byte: 0x01=OK, 0x00=unknown]
//!
//! ENVELOPE: [4 bytes BE: json_len] [json_len bytes: PeerMessage JSON]
//! DATA:     raw bytes, length declared inside the ChunkData envelope
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ChannelError;

/// Transaction ids are hyphenated UUIDs: 36 ASCII bytes.
pub const HANDSHAKE_ID_LEN: usize = 36;

const CONFIRM_OK: u8 = 0x01;
const CONFIRM_UNKNOWN: u8 = 0x00;

/// Dialer side: sends the transaction id and waits for confirmation.
pub async fn dial_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    txn_id: &str,
) -> Result<(), ChannelError> {
    if txn_id.len() != HANDSHAKE_ID_LEN {
        return Err(ChannelError::Decode(format!(
            "transaction id must be {HANDSHAKE_ID_LEN} bytes, got {}",
            txn_id.len()
        )));
    }
    stream.write_all(txn_id.as_bytes()).await?;
    stream.flush().await?;

    let byte = stream.read_u8().await?;
    if byte == CONFIRM_OK {
        Ok(())
    } else {
        Err(ChannelError::Rejected)
    }
}

/// Acceptor side: reads the transaction id the dialer claims.
///
/// The caller validates the id and answers with
/// [`confirm_handshake`].
pub async fn accept_handshake<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, ChannelError> {
    let mut buf = [0u8; HANDSHAKE_ID_LEN];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf.to_vec())
        .map_err(|e| ChannelError::Decode(format!("invalid transaction id encoding: {e}")))
}

/// Acceptor side: confirms or rejects the handshake.
pub async fn confirm_handshake<S: AsyncWrite + Unpin>(
    stream: &mut S,
    known: bool,
) -> Result<(), ChannelError> {
    stream
        .write_u8(if known { CONFIRM_OK } else { CONFIRM_UNKNOWN })
        .await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXN: &str = "0c6bee6a-9b51-4f8a-bb1e-6b0f2f4a7d31";

    #[tokio::test]
    async fn handshake_accepted() {
        let (mut dialer, mut acceptor) = tokio::io::duplex(256);

        let dial = tokio::spawn(async move {
            dial_handshake(&mut dialer, TXN).await.unwrap();
        });

        let id = accept_handshake(&mut acceptor).await.unwrap();
        assert_eq!(id, TXN);
        confirm_handshake(&mut acceptor, true).await.unwrap();

        dial.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejected_for_unknown_transaction() {
        let (mut dialer, mut acceptor) = tokio::io::duplex(256);

        let dial = tokio::spawn(async move { dial_handshake(&mut dialer, TXN).await });

        let _ = accept_handshake(&mut acceptor).await.unwrap();
        confirm_handshake(&mut acceptor, false).await.unwrap();

        assert!(matches!(dial.await.unwrap(), Err(ChannelError::Rejected)));
    }

    #[tokio::test]
    async fn bad_id_length_rejected_locally() {
        let (mut dialer, _acceptor) = tokio::io::duplex(256);
        let result = dial_handshake(&mut dialer, "short").await;
        assert!(matches!(result, Err(ChannelError::Decode(_))));
    }
}
