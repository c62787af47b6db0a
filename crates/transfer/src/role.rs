//! Sender and receiver halves of the peer transfer protocol.
//!
//! The receiver drives the exchange: after the manifest it pulls each
//! file from whatever offset it already holds, so a reconnect resumes
//! where the previous connection dropped.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use peerferry_channel::{ChannelError, ManifestEntry, PeerChannel, PeerMessage, MAX_CHUNK_LEN};

use crate::TransferError;

/// Stream type the transferer hands to a role once the winning socket
/// is known.
pub type DynStream = Box<dyn DuplexStream>;

pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<S: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for S {}

pub type RoleFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + 'a>>;

/// What a device does on an established channel. Tagged by role rather
/// than subclassed: a transaction is either sending or receiving.
pub trait TransferRole: Send + Sync {
    fn run<'a>(
        &'a self,
        channel: &'a mut PeerChannel<DynStream>,
        cancel: &'a CancellationToken,
        progress: &'a watch::Sender<f64>,
    ) -> RoleFuture<'a>;
}

// Outgoing chunks fill the channel's payload cap exactly.
const IO_CHUNK_SIZE: usize = MAX_CHUNK_LEN;

/// Streams local files to the peer on demand.
pub struct SenderRole {
    /// (local path, name announced in the manifest)
    files: Vec<(PathBuf, String)>,
}

impl SenderRole {
    pub fn new(files: Vec<(PathBuf, String)>) -> Self {
        Self { files }
    }

    async fn serve(
        &self,
        channel: &mut PeerChannel<DynStream>,
        cancel: &CancellationToken,
        progress: &watch::Sender<f64>,
    ) -> Result<(), TransferError> {
        let mut manifest = Vec::with_capacity(self.files.len());
        let mut total = 0u64;
        for (path, name) in &self.files {
            let size = tokio::fs::metadata(path).await?.len();
            total += size;
            manifest.push(ManifestEntry {
                relative_path: name.clone(),
                size,
            });
        }
        channel
            .send(&PeerMessage::Manifest { files: manifest })
            .await?;

        let mut sent = 0u64;
        loop {
            if cancel.is_cancelled() {
                channel
                    .send(&PeerMessage::Abort {
                        reason: "cancelled".into(),
                    })
                    .await?;
                return Err(TransferError::Cancelled);
            }
            let (message, _) = channel.recv().await?;
            match message {
                PeerMessage::PullRequest { file, offset } => {
                    let Some((path, _)) = self.files.iter().find(|(_, n)| *n == file) else {
                        warn!(%file, "pull for unknown file");
                        channel
                            .send(&PeerMessage::Abort {
                                reason: format!("unknown file {file}"),
                            })
                            .await?;
                        return Err(ChannelError::Rejected.into());
                    };
                    sent += offset;
                    self.stream_file(channel, path, &file, offset, progress, &mut sent, total)
                        .await?;
                }
                PeerMessage::Complete => {
                    info!("peer confirmed delivery");
                    let _ = progress.send(1.0);
                    return Ok(());
                }
                PeerMessage::Abort { reason } => {
                    warn!(%reason, "peer aborted");
                    return Err(ChannelError::Rejected.into());
                }
                other => {
                    warn!(kind = ?other, "unexpected message while sending");
                    return Err(ChannelError::Rejected.into());
                }
            }
        }
    }

    async fn stream_file(
        &self,
        channel: &mut PeerChannel<DynStream>,
        path: &Path,
        name: &str,
        offset: u64,
        progress: &watch::Sender<f64>,
        sent: &mut u64,
        total: u64,
    ) -> Result<(), TransferError> {
        let mut file = File::open(path).await?;
        let size = file.metadata().await?.len();
        file.seek(SeekFrom::Start(offset)).await?;
        debug!(%name, offset, size, "streaming file");

        let mut pos = offset;
        let mut buf = vec![0u8; IO_CHUNK_SIZE];
        while pos < size {
            let want = ((size - pos) as usize).min(IO_CHUNK_SIZE);
            file.read_exact(&mut buf[..want]).await?;
            let checksum = hex::encode(Sha256::digest(&buf[..want]));
            channel
                .send_with_data(
                    &PeerMessage::ChunkData {
                        file: name.to_owned(),
                        offset: pos,
                        len: want as u64,
                        checksum,
                    },
                    &buf[..want],
                )
                .await?;
            let (ack, _) = channel.recv().await?;
            match ack {
                PeerMessage::ChunkAck { offset: acked, .. } if acked == pos => {}
                PeerMessage::Abort { reason } => {
                    warn!(%reason, "peer aborted mid-file");
                    return Err(ChannelError::Rejected.into());
                }
                other => {
                    warn!(kind = ?other, "expected chunk ack");
                    return Err(ChannelError::Rejected.into());
                }
            }
            pos += want as u64;
            *sent += want as u64;
            if total > 0 {
                let _ = progress.send(*sent as f64 / total as f64);
            }
        }
        Ok(())
    }
}

impl TransferRole for SenderRole {
    fn run<'a>(
        &'a self,
        channel: &'a mut PeerChannel<DynStream>,
        cancel: &'a CancellationToken,
        progress: &'a watch::Sender<f64>,
    ) -> RoleFuture<'a> {
        Box::pin(self.serve(channel, cancel, progress))
    }
}

/// Pulls the announced files into a destination directory, resuming
/// any partial file already on disk.
pub struct ReceiverRole {
    dest: PathBuf,
}

impl ReceiverRole {
    pub fn new(dest: PathBuf) -> Self {
        Self { dest }
    }

    async fn pull(
        &self,
        channel: &mut PeerChannel<DynStream>,
        cancel: &CancellationToken,
        progress: &watch::Sender<f64>,
    ) -> Result<(), TransferError> {
        let (message, _) = channel.recv().await?;
        let files = match message {
            PeerMessage::Manifest { files } => files,
            PeerMessage::Abort { reason } => {
                warn!(%reason, "peer aborted before manifest");
                return Err(ChannelError::Rejected.into());
            }
            other => {
                warn!(kind = ?other, "expected manifest");
                return Err(ChannelError::Rejected.into());
            }
        };

        let total: u64 = files.iter().map(|f| f.size).sum();
        let mut received = 0u64;
        for entry in &files {
            let target = self.resolve(&entry.relative_path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await?;
            let offset = file.metadata().await?.len().min(entry.size);
            received += offset;
            if offset > 0 {
                info!(file = %entry.relative_path, offset, "resuming partial file");
            }

            channel
                .send(&PeerMessage::PullRequest {
                    file: entry.relative_path.clone(),
                    offset,
                })
                .await?;

            let mut pos = offset;
            while pos < entry.size {
                if cancel.is_cancelled() {
                    channel
                        .send(&PeerMessage::Abort {
                            reason: "cancelled".into(),
                        })
                        .await?;
                    return Err(TransferError::Cancelled);
                }
                let (message, data) = channel.recv().await?;
                match message {
                    PeerMessage::ChunkData {
                        offset: chunk_offset,
                        checksum,
                        ..
                    } => {
                        let data = data.ok_or_else(|| {
                            ChannelError::Decode("chunk without payload".into())
                        })?;
                        if chunk_offset != pos {
                            return Err(ChannelError::Decode(format!(
                                "chunk at offset {chunk_offset}, expected {pos}"
                            ))
                            .into());
                        }
                        if hex::encode(Sha256::digest(&data)) != checksum {
                            return Err(
                                ChannelError::Decode("chunk checksum mismatch".into()).into()
                            );
                        }
                        file.write_all(&data).await?;
                        channel
                            .send(&PeerMessage::ChunkAck {
                                file: entry.relative_path.clone(),
                                offset: pos,
                            })
                            .await?;
                        pos += data.len() as u64;
                        received += data.len() as u64;
                        if total > 0 {
                            let _ = progress.send(received as f64 / total as f64);
                        }
                    }
                    PeerMessage::Abort { reason } => {
                        warn!(%reason, "peer aborted mid-file");
                        return Err(ChannelError::Rejected.into());
                    }
                    other => {
                        warn!(kind = ?other, "expected chunk data");
                        return Err(ChannelError::Rejected.into());
                    }
                }
            }
            file.flush().await?;
        }

        channel.send(&PeerMessage::Complete).await?;
        let _ = progress.send(1.0);
        info!(files = files.len(), "all files received");
        Ok(())
    }

    /// Manifested names stay inside the destination directory.
    fn resolve(&self, relative: &str) -> Result<PathBuf, TransferError> {
        let path = Path::new(relative);
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(TransferError::InvalidPath(relative.to_owned()));
        }
        Ok(self.dest.join(path))
    }
}

impl TransferRole for ReceiverRole {
    fn run<'a>(
        &'a self,
        channel: &'a mut PeerChannel<DynStream>,
        cancel: &'a CancellationToken,
        progress: &'a watch::Sender<f64>,
    ) -> RoleFuture<'a> {
        Box::pin(self.pull(channel, cancel, progress))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn duplex_channels() -> (PeerChannel<DynStream>, PeerChannel<DynStream>) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (
            PeerChannel::new(Box::new(a) as DynStream),
            PeerChannel::new(Box::new(b) as DynStream),
        )
    }

    #[tokio::test]
    async fn files_arrive_intact() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let payload = vec![7u8; 300 * 1024];
        tokio::fs::write(src.path().join("save.dat"), &payload)
            .await
            .unwrap();

        let sender = SenderRole::new(vec![(src.path().join("save.dat"), "save.dat".into())]);
        let receiver = ReceiverRole::new(dst.path().to_path_buf());

        let (mut send_ch, mut recv_ch) = duplex_channels();
        let cancel = CancellationToken::new();
        let (send_progress, _) = watch::channel(0.0);
        let (recv_progress, recv_watch) = watch::channel(0.0);

        let send_cancel = cancel.clone();
        let send_task = tokio::spawn(async move {
            sender.run(&mut send_ch, &send_cancel, &send_progress).await
        });
        receiver
            .run(&mut recv_ch, &cancel, &recv_progress)
            .await
            .unwrap();
        send_task.await.unwrap().unwrap();

        let got = tokio::fs::read(dst.path().join("save.dat")).await.unwrap();
        assert_eq!(got, payload);
        assert_eq!(*recv_watch.borrow(), 1.0);
    }

    #[tokio::test]
    async fn partial_file_is_resumed_from_offset() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let payload: Vec<u8> = (0..400_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(src.path().join("big.bin"), &payload)
            .await
            .unwrap();
        // First 100k already on disk from a dropped connection.
        tokio::fs::write(dst.path().join("big.bin"), &payload[..100_000])
            .await
            .unwrap();

        let sender = SenderRole::new(vec![(src.path().join("big.bin"), "big.bin".into())]);
        let receiver = ReceiverRole::new(dst.path().to_path_buf());

        let (mut send_ch, mut recv_ch) = duplex_channels();
        let cancel = CancellationToken::new();
        let (send_progress, _) = watch::channel(0.0);
        let (recv_progress, _) = watch::channel(0.0);

        let send_cancel = cancel.clone();
        let send_task = tokio::spawn(async move {
            sender.run(&mut send_ch, &send_cancel, &send_progress).await
        });
        receiver
            .run(&mut recv_ch, &cancel, &recv_progress)
            .await
            .unwrap();
        send_task.await.unwrap().unwrap();

        let got = tokio::fs::read(dst.path().join("big.bin")).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn traversal_names_are_rejected() {
        let dst = tempdir().unwrap();
        let receiver = ReceiverRole::new(dst.path().to_path_buf());
        assert!(matches!(
            receiver.resolve("../escape.txt"),
            Err(TransferError::InvalidPath(_))
        ));
        assert!(matches!(
            receiver.resolve("/etc/passwd"),
            Err(TransferError::InvalidPath(_))
        ));
        assert!(receiver.resolve("saves/slot1.dat").is_ok());
    }

    #[tokio::test]
    async fn empty_manifest_completes_immediately() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let _ = src;

        let sender = SenderRole::new(Vec::new());
        let receiver = ReceiverRole::new(dst.path().to_path_buf());

        let (mut send_ch, mut recv_ch) = duplex_channels();
        let cancel = CancellationToken::new();
        let (send_progress, _) = watch::channel(0.0);
        let (recv_progress, _) = watch::channel(0.0);

        let send_cancel = cancel.clone();
        let send_task = tokio::spawn(async move {
            sender.run(&mut send_ch, &send_cancel, &send_progress).await
        });
        receiver
            .run(&mut recv_ch, &cancel, &recv_progress)
            .await
            .unwrap();
        send_task.await.unwrap().unwrap();
    }
}
