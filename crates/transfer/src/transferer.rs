//! The per-transaction transfer state machine.
//!
//! Drives one payload delivery from credential prefetch through address
//! publication, connection racing, the peer exchange, and the
//! cloud-buffer fallback when the peer is confirmed offline. Connection
//! drops loop back to `Connect`; everything else funnels into `Stopped`.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use peerferry_channel::{accept_handshake, confirm_handshake, dial_handshake, PeerChannel};
use peerferry_cloudstore::{ObjectStore, TokenStore, UploadConfig, UploadError, Uploader};
use peerferry_coordination::{Coordinator, NullTelemetry, Telemetry};

use crate::connect::{run_connection_race, RaceOutcome};
use crate::gate::PeerGates;
use crate::role::{DynStream, TransferRole};
use crate::rounds::{ConnectionRound, RelayRound, RoundProvider};
use crate::TransferError;

/// Where the transfer machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    CloudSynchronize,
    PublishInterfaces,
    Connect,
    WaitForPeer,
    Transfer,
    CloudBuffer,
    Stopped,
}

impl TransferState {
    pub fn name(&self) -> &'static str {
        match self {
            TransferState::CloudSynchronize => "cloud_synchronize",
            TransferState::PublishInterfaces => "publish_interfaces",
            TransferState::Connect => "connect",
            TransferState::WaitForPeer => "wait_for_peer",
            TransferState::Transfer => "transfer",
            TransferState::CloudBuffer => "cloud_buffer",
            TransferState::Stopped => "stopped",
        }
    }
}

/// How a transfer run ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The payload reached the peer over a live connection.
    Delivered,
    /// The payload was parked in the object store for later pickup.
    Buffered,
    Cancelled,
}

/// Notifications for the owning transaction.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    StateChanged(TransferState),
    /// A connection was established; `via` names the winning round
    /// ("incoming" when the peer dialed us).
    Connected { via: String },
}

#[derive(Debug, Clone)]
pub struct TransfererConfig {
    /// Extra time the listener stays up after the last round fails.
    pub accept_grace: Duration,
    /// Bound on the post-connect id exchange.
    pub handshake_timeout: Duration,
}

impl Default for TransfererConfig {
    fn default() -> Self {
        Self {
            accept_grace: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Object-store destination for the cloud-buffer fallback.
pub struct CloudBufferTarget {
    pub store: Arc<dyn ObjectStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub payload: PathBuf,
    pub object_name: String,
    pub upload: UploadConfig,
}

pub type RoundsFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<Box<dyn ConnectionRound>>, TransferError>> + Send + 'a>>;

/// Source of the ordered round list and the addresses to publish for
/// the inbound listener. [`RoundProvider`] is the production
/// implementation; tests script their own.
pub trait RoundSource: Send + Sync {
    fn publishable_addresses(&self, port: u16) -> Vec<SocketAddr>;
    fn rounds(&self) -> RoundsFuture<'_>;
}

impl RoundSource for RoundProvider {
    fn publishable_addresses(&self, port: u16) -> Vec<SocketAddr> {
        self.local_addresses(port)
    }

    fn rounds(&self) -> RoundsFuture<'_> {
        Box::pin(self.build_rounds())
    }
}

/// Runs the transfer state machine for one transaction.
pub struct Transferer {
    txn_id: String,
    device_id: String,
    coordinator: Arc<dyn Coordinator>,
    telemetry: Arc<dyn Telemetry>,
    gates: Arc<PeerGates>,
    rounds: Arc<dyn RoundSource>,
    role: Box<dyn TransferRole>,
    cloud_buffer: Option<CloudBufferTarget>,
    config: TransfererConfig,
    progress: watch::Sender<f64>,
    state_tx: watch::Sender<TransferState>,
    events: mpsc::UnboundedSender<TransferEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransferEvent>>>,
}

impl Transferer {
    pub fn new(
        txn_id: impl Into<String>,
        device_id: impl Into<String>,
        coordinator: Arc<dyn Coordinator>,
        rounds: Arc<dyn RoundSource>,
        role: Box<dyn TransferRole>,
        gates: Arc<PeerGates>,
        config: TransfererConfig,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (progress, _) = watch::channel(0.0);
        let (state_tx, _) = watch::channel(TransferState::CloudSynchronize);
        Self {
            txn_id: txn_id.into(),
            device_id: device_id.into(),
            coordinator,
            telemetry: Arc::new(NullTelemetry),
            gates,
            rounds,
            role,
            cloud_buffer: None,
            config,
            progress,
            state_tx,
            events,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    pub fn with_cloud_buffer(mut self, target: CloudBufferTarget) -> Self {
        self.cloud_buffer = Some(target);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn gates(&self) -> &PeerGates {
        &self.gates
    }

    /// Progress of the current delivery attempt in `[0, 1]`.
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.subscribe()
    }

    /// Hands out the event stream; subsequent calls yield `None`.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransferEvent>> {
        self.event_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Current machine state, for snapshotting.
    pub fn state(&self) -> watch::Receiver<TransferState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: TransferState) {
        info!(transaction = %self.txn_id, state = state.name(), "transfer state");
        self.state_tx.send_replace(state);
        let _ = self.events.send(TransferEvent::StateChanged(state));
    }

    fn stop(&self, outcome: TransferOutcome) -> Result<TransferOutcome, TransferError> {
        self.set_state(TransferState::Stopped);
        Ok(outcome)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<TransferOutcome, TransferError> {
        // Credentials are prefetched so a later cloud-buffer entry does
        // not start with a round trip. Failure here is not fatal.
        self.set_state(TransferState::CloudSynchronize);
        if let Err(e) = self.coordinator.cloud_credentials(&self.txn_id, false).await {
            warn!(transaction = %self.txn_id, error = %e, "credential prefetch failed");
        }

        // Without published addresses the peer can never dial us.
        self.set_state(TransferState::PublishInterfaces);
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        let locals = self.rounds.publishable_addresses(port);
        self.coordinator
            .publish_addresses(&self.txn_id, &self.device_id, &locals, &[])
            .await
            .map_err(TransferError::PublishFailed)?;

        let mut state = TransferState::Connect;
        let mut channel: Option<PeerChannel<DynStream>> = None;
        loop {
            if cancel.is_cancelled() {
                return self.stop(TransferOutcome::Cancelled);
            }
            match state {
                TransferState::Connect => {
                    self.set_state(TransferState::Connect);
                    let rounds = self.rounds.rounds().await?;
                    let raced = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return self.stop(TransferOutcome::Cancelled),
                        _ = self.gates.offline().wait() => {
                            info!(transaction = %self.txn_id, "peer went offline mid-connect");
                            state = TransferState::WaitForPeer;
                            continue;
                        }
                        r = run_connection_race(&rounds, &listener, &cancel, self.config.accept_grace) => r,
                    };
                    match raced {
                        Err(TransferError::Cancelled) => {
                            return self.stop(TransferOutcome::Cancelled)
                        }
                        Err(e) => return Err(e),
                        Ok(RaceOutcome::Connected { stream, via }) => {
                            if let Some(stream) = self.finish_dial(stream, &via).await? {
                                channel = Some(PeerChannel::new(Box::new(stream) as DynStream));
                                state = TransferState::Transfer;
                            }
                            // On handshake failure the loop re-enters
                            // Connect and tries again.
                        }
                        Ok(RaceOutcome::Incoming { stream, peer }) => {
                            if let Some(stream) = self.finish_accept(stream, peer).await? {
                                channel = Some(PeerChannel::new(Box::new(stream) as DynStream));
                                state = TransferState::Transfer;
                            }
                        }
                        Ok(RaceOutcome::NotReachable) => {
                            self.gates.set_unreachable();
                            state = TransferState::WaitForPeer;
                        }
                    }
                }

                TransferState::Transfer => {
                    let Some(mut ch) = channel.take() else {
                        state = TransferState::Connect;
                        continue;
                    };
                    self.set_state(TransferState::Transfer);
                    self.gates.connected().open();
                    let result = self.role.run(&mut ch, &cancel, &self.progress).await;
                    self.gates.connected().close();
                    match result {
                        Ok(()) => return self.stop(TransferOutcome::Delivered),
                        Err(TransferError::Cancelled) => {
                            return self.stop(TransferOutcome::Cancelled)
                        }
                        Err(TransferError::Channel(e)) if e.is_reconnectable() => {
                            info!(transaction = %self.txn_id, error = %e, "connection dropped, reconnecting");
                            state = TransferState::Connect;
                        }
                        Err(e) => return Err(e),
                    }
                }

                TransferState::WaitForPeer => {
                    self.set_state(TransferState::WaitForPeer);
                    if self.gates.offline().is_open() {
                        state = TransferState::CloudBuffer;
                        continue;
                    }
                    // No timer here: only a fresh reachability or
                    // presence notification restarts the connect loop.
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return self.stop(TransferOutcome::Cancelled),
                        _ = self.gates.offline().wait() => state = TransferState::CloudBuffer,
                        _ = self.gates.reachable().wait() => state = TransferState::Connect,
                    }
                }

                TransferState::CloudBuffer => {
                    self.set_state(TransferState::CloudBuffer);
                    let Some(target) = &self.cloud_buffer else {
                        // Nothing to park on this side; hold until the
                        // peer reappears.
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return self.stop(TransferOutcome::Cancelled),
                            _ = self.gates.online().wait() => state = TransferState::WaitForPeer,
                        }
                        continue;
                    };

                    let upload_cancel = cancel.child_token();
                    let uploader = Uploader::new(
                        Arc::clone(&target.store),
                        Arc::clone(&target.tokens),
                        target.upload.clone(),
                    );
                    let run = uploader.run(
                        &target.payload,
                        &target.object_name,
                        upload_cancel.clone(),
                        self.progress.clone(),
                    );
                    tokio::pin!(run);
                    tokio::select! {
                        biased;
                        _ = self.gates.online().wait() => {
                            info!(transaction = %self.txn_id, "peer back online, suspending cloud buffering");
                            // Let in-flight parts land; the persisted
                            // token resumes the session later.
                            upload_cancel.cancel();
                            let _ = run.await;
                            state = TransferState::WaitForPeer;
                        }
                        result = &mut run => match result {
                            Ok(()) => return self.stop(TransferOutcome::Buffered),
                            Err(UploadError::Cancelled) => {
                                return self.stop(TransferOutcome::Cancelled)
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }

                // Entry states never recur, and Stopped is only reached
                // through `stop`.
                TransferState::CloudSynchronize
                | TransferState::PublishInterfaces
                | TransferState::Stopped => {
                    state = TransferState::Connect;
                }
            }
        }
    }

    /// Completes the dialer-side handshake on a won outbound round.
    async fn finish_dial(
        &self,
        mut stream: TcpStream,
        via: &str,
    ) -> Result<Option<TcpStream>, TransferError> {
        match timeout(
            self.config.handshake_timeout,
            dial_handshake(&mut stream, &self.txn_id),
        )
        .await
        {
            Ok(Ok(())) => {
                if via == RelayRound::NAME {
                    self.telemetry.relay_used(&self.txn_id, via);
                }
                let _ = self.events.send(TransferEvent::Connected {
                    via: via.to_owned(),
                });
                self.gates.set_reachable();
                Ok(Some(stream))
            }
            Ok(Err(e)) => {
                // Rejection usually means the acceptor has not loaded
                // the transaction yet; retrying is harmless either way.
                warn!(transaction = %self.txn_id, round = via, error = %e, "handshake failed");
                Ok(None)
            }
            Err(_) => {
                warn!(transaction = %self.txn_id, round = via, "handshake timed out");
                Ok(None)
            }
        }
    }

    /// Completes the acceptor-side handshake on an inbound connection.
    async fn finish_accept(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Option<TcpStream>, TransferError> {
        let exchange = async {
            let id = accept_handshake(&mut stream).await?;
            let known = id == self.txn_id;
            confirm_handshake(&mut stream, known).await?;
            Ok::<_, peerferry_channel::ChannelError>(known)
        };
        match timeout(self.config.handshake_timeout, exchange).await {
            Ok(Ok(true)) => {
                let _ = self.events.send(TransferEvent::Connected {
                    via: "incoming".to_owned(),
                });
                self.gates.set_reachable();
                Ok(Some(stream))
            }
            Ok(Ok(false)) => {
                warn!(%peer, "inbound handshake for unknown transaction");
                Ok(None)
            }
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "inbound handshake failed");
                Ok(None)
            }
            Err(_) => {
                warn!(%peer, "inbound handshake timed out");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::PeerGatesConfig;
    use crate::role::{ReceiverRole, SenderRole};
    use crate::rounds::AddressRound;
    use peerferry_cloudstore::{MemoryStore, MemoryTokenStore};
    use peerferry_coordination::{
        BoxFuture, CloudCredentials, CoordinationError, PeerEndpoints, RelayEndpoint, StatusAck,
        TransactionStatus,
    };
    use tempfile::tempdir;

    const TXN: &str = "5f0c2a9e-77d4-4b0a-9c63-2b7a1f08d4e1";

    struct MockCoordinator {
        fail_publish: bool,
    }

    impl Coordinator for MockCoordinator {
        fn update_status<'a>(
            &'a self,
            _txn_id: &'a str,
            _status: TransactionStatus,
            _device_id: Option<&'a str>,
        ) -> BoxFuture<'a, StatusAck> {
            Box::pin(async { Ok(StatusAck::Applied) })
        }

        fn peer_endpoints<'a>(
            &'a self,
            _txn_id: &'a str,
            _local_device: &'a str,
            _peer_device: &'a str,
        ) -> BoxFuture<'a, PeerEndpoints> {
            Box::pin(async {
                Ok(PeerEndpoints {
                    locals: Vec::new(),
                    externals: Vec::new(),
                })
            })
        }

        fn relay_rendezvous<'a>(&'a self, _txn_id: &'a str) -> BoxFuture<'a, RelayEndpoint> {
            Box::pin(async {
                Err(CoordinationError::Unavailable("no relay in tests".into()))
            })
        }

        fn cloud_credentials<'a>(
            &'a self,
            _txn_id: &'a str,
            _force_regenerate: bool,
        ) -> BoxFuture<'a, CloudCredentials> {
            Box::pin(async {
                Err(CoordinationError::Unavailable("no credentials in tests".into()))
            })
        }

        fn publish_addresses<'a>(
            &'a self,
            _txn_id: &'a str,
            _device_id: &'a str,
            _locals: &'a [SocketAddr],
            _publics: &'a [SocketAddr],
        ) -> BoxFuture<'a, ()> {
            let fail = self.fail_publish;
            Box::pin(async move {
                if fail {
                    Err(CoordinationError::NotPermitted("publish refused".into()))
                } else {
                    Ok(())
                }
            })
        }
    }

    /// Scripted source: a fixed candidate list, no relay.
    struct FixedRounds {
        candidates: Vec<SocketAddr>,
    }

    impl RoundSource for FixedRounds {
        fn publishable_addresses(&self, port: u16) -> Vec<SocketAddr> {
            vec![SocketAddr::from(([127, 0, 0, 1], port))]
        }

        fn rounds(&self) -> RoundsFuture<'_> {
            Box::pin(async {
                let mut rounds: Vec<Box<dyn ConnectionRound>> = Vec::new();
                if !self.candidates.is_empty() {
                    rounds.push(Box::new(AddressRound::new(
                        "direct:test",
                        self.candidates.clone(),
                    )));
                }
                Ok(rounds)
            })
        }
    }

    fn fast_config() -> TransfererConfig {
        TransfererConfig {
            accept_grace: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(2),
        }
    }

    fn fresh_gates() -> Arc<PeerGates> {
        Arc::new(PeerGates::new(PeerGatesConfig {
            offline_debounce: Duration::from_millis(0),
        }))
    }

    #[tokio::test]
    async fn payload_is_delivered_over_direct_connection() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let payload = vec![42u8; 200_000];
        tokio::fs::write(src.path().join("save.dat"), &payload)
            .await
            .unwrap();

        // Test-side peer: accepts, handshakes, then receives.
        let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_listener.local_addr().unwrap();
        let dest = dst.path().to_path_buf();
        let peer = tokio::spawn(async move {
            let (mut stream, _) = peer_listener.accept().await.unwrap();
            let id = accept_handshake(&mut stream).await.unwrap();
            confirm_handshake(&mut stream, id == TXN).await.unwrap();
            let mut channel = PeerChannel::new(Box::new(stream) as DynStream);
            let cancel = CancellationToken::new();
            let (progress, _) = watch::channel(0.0);
            ReceiverRole::new(dest)
                .run(&mut channel, &cancel, &progress)
                .await
                .unwrap();
        });

        let gates = fresh_gates();
        gates.set_online();
        let transferer = Transferer::new(
            TXN,
            "device-a",
            Arc::new(MockCoordinator { fail_publish: false }),
            Arc::new(FixedRounds {
                candidates: vec![peer_addr],
            }),
            Box::new(SenderRole::new(vec![(
                src.path().join("save.dat"),
                "save.dat".into(),
            )])),
            gates,
            fast_config(),
        );

        let outcome = transferer.run(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Delivered);
        peer.await.unwrap();

        let got = tokio::fs::read(dst.path().join("save.dat")).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn dropped_connection_is_resumed_over_a_new_one() {
        use peerferry_channel::PeerMessage;

        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        // Three wire chunks, so the drop lands mid-file.
        let payload: Vec<u8> = (0..600_000u32).map(|i| (i % 247) as u8).collect();
        tokio::fs::write(src.path().join("save.dat"), &payload)
            .await
            .unwrap();

        let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_listener.local_addr().unwrap();
        let dest = dst.path().to_path_buf();
        let peer = tokio::spawn(async move {
            // First connection: pull one chunk, ack it, then drop the
            // socket as a network failure would.
            let (mut stream, _) = peer_listener.accept().await.unwrap();
            let id = accept_handshake(&mut stream).await.unwrap();
            confirm_handshake(&mut stream, id == TXN).await.unwrap();
            let mut channel = PeerChannel::new(Box::new(stream) as DynStream);
            let (message, _) = channel.recv().await.unwrap();
            let entry = match message {
                PeerMessage::Manifest { files } => files.into_iter().next().unwrap(),
                other => panic!("expected manifest, got {other:?}"),
            };
            channel
                .send(&PeerMessage::PullRequest {
                    file: entry.relative_path.clone(),
                    offset: 0,
                })
                .await
                .unwrap();
            let (message, data) = channel.recv().await.unwrap();
            let first = match message {
                PeerMessage::ChunkData { offset, .. } => {
                    assert_eq!(offset, 0);
                    data.unwrap()
                }
                other => panic!("expected chunk, got {other:?}"),
            };
            tokio::fs::write(dest.join("save.dat"), &first).await.unwrap();
            channel
                .send(&PeerMessage::ChunkAck {
                    file: entry.relative_path,
                    offset: 0,
                })
                .await
                .unwrap();
            drop(channel);

            // Second connection: the real receiver resumes from what is
            // already on disk.
            let (mut stream, _) = peer_listener.accept().await.unwrap();
            let id = accept_handshake(&mut stream).await.unwrap();
            confirm_handshake(&mut stream, id == TXN).await.unwrap();
            let mut channel = PeerChannel::new(Box::new(stream) as DynStream);
            let cancel = CancellationToken::new();
            let (progress, _) = watch::channel(0.0);
            ReceiverRole::new(dest)
                .run(&mut channel, &cancel, &progress)
                .await
                .unwrap();
        });

        let gates = fresh_gates();
        gates.set_online();
        let transferer = Transferer::new(
            TXN,
            "device-a",
            Arc::new(MockCoordinator { fail_publish: false }),
            Arc::new(FixedRounds {
                candidates: vec![peer_addr],
            }),
            Box::new(SenderRole::new(vec![(
                src.path().join("save.dat"),
                "save.dat".into(),
            )])),
            gates,
            fast_config(),
        );
        let mut events = transferer.take_events().unwrap();

        let outcome = transferer.run(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Delivered);
        peer.await.unwrap();

        let got = tokio::fs::read(dst.path().join("save.dat")).await.unwrap();
        assert_eq!(got, payload);

        // The drop sent the machine back through Connect into a second
        // Transfer pass.
        let mut transfers = 0;
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::StateChanged(TransferState::Transfer) = event {
                transfers += 1;
            }
        }
        assert_eq!(transfers, 2);
    }

    #[tokio::test]
    async fn peer_back_online_leaves_cloud_buffer_via_wait_for_peer() {
        let gates = fresh_gates();
        gates.set_offline();
        let transferer = Transferer::new(
            TXN,
            "device-a",
            Arc::new(MockCoordinator { fail_publish: false }),
            Arc::new(FixedRounds {
                candidates: Vec::new(),
            }),
            Box::new(ReceiverRole::new(PathBuf::from("/nonexistent"))),
            Arc::clone(&gates),
            fast_config(),
        );
        let mut events = transferer.take_events().unwrap();

        let cancel = CancellationToken::new();
        let trigger_gates = Arc::clone(&gates);
        let trigger_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger_gates.set_online();
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger_cancel.cancel();
        });

        let outcome = transferer.run(cancel).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Cancelled);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::StateChanged(s) = event {
                seen.push(s);
            }
        }
        let buffered = seen
            .iter()
            .position(|s| *s == TransferState::CloudBuffer)
            .expect("cloud buffer never entered");
        // Online routes through WaitForPeer, not straight to Connect.
        assert_eq!(seen.get(buffered + 1), Some(&TransferState::WaitForPeer));
        // The fresh presence event triggers exactly one reconnect
        // attempt; exhausted rounds then hold without a retry timer.
        let connects = seen[buffered..]
            .iter()
            .filter(|s| **s == TransferState::Connect)
            .count();
        assert_eq!(connects, 1);
    }

    #[tokio::test]
    async fn offline_peer_routes_payload_to_cloud_buffer() {
        let src = tempdir().unwrap();
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
        tokio::fs::write(src.path().join("save.dat"), &payload)
            .await
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let tokens = Arc::new(MemoryTokenStore::new());

        let gates = fresh_gates();
        gates.set_offline();
        let transferer = Transferer::new(
            TXN,
            "device-a",
            Arc::new(MockCoordinator { fail_publish: false }),
            Arc::new(FixedRounds {
                candidates: Vec::new(),
            }),
            Box::new(SenderRole::new(vec![(
                src.path().join("save.dat"),
                "save.dat".into(),
            )])),
            gates,
            fast_config(),
        )
        .with_cloud_buffer(CloudBufferTarget {
            store: Arc::clone(&store) as Arc<dyn ObjectStore>,
            tokens: Arc::clone(&tokens) as Arc<dyn TokenStore>,
            payload: src.path().join("save.dat"),
            object_name: "txn/save.dat".into(),
            upload: UploadConfig {
                min_chunk_size: 16 * 1024,
                ..UploadConfig::default()
            },
        });

        let outcome = transferer.run(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Buffered);
        assert_eq!(store.object("txn/save.dat").unwrap(), payload);
        // The multipart token is gone once the object is finalized.
        assert!(tokens.load().is_none());
    }

    #[tokio::test]
    async fn cancel_during_wait_for_peer_stops_cleanly() {
        let gates = fresh_gates();
        gates.set_online();
        let transferer = Transferer::new(
            TXN,
            "device-a",
            Arc::new(MockCoordinator { fail_publish: false }),
            Arc::new(FixedRounds {
                candidates: Vec::new(),
            }),
            Box::new(ReceiverRole::new(PathBuf::from("/nonexistent"))),
            gates,
            TransfererConfig {
                accept_grace: Duration::from_millis(50),
                ..fast_config()
            },
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let outcome = transferer.run(cancel).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Cancelled);
    }

    #[tokio::test]
    async fn publish_failure_is_fatal() {
        let transferer = Transferer::new(
            TXN,
            "device-a",
            Arc::new(MockCoordinator { fail_publish: true }),
            Arc::new(FixedRounds {
                candidates: Vec::new(),
            }),
            Box::new(ReceiverRole::new(PathBuf::from("/nonexistent"))),
            fresh_gates(),
            fast_config(),
        );

        let result = transferer.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(TransferError::PublishFailed(_))));
    }

    #[tokio::test]
    async fn events_report_state_progression() {
        let transferer = Transferer::new(
            TXN,
            "device-a",
            Arc::new(MockCoordinator { fail_publish: false }),
            Arc::new(FixedRounds {
                candidates: Vec::new(),
            }),
            Box::new(ReceiverRole::new(PathBuf::from("/nonexistent"))),
            fresh_gates(),
            fast_config(),
        );
        let mut events = transferer.take_events().unwrap();
        assert!(transferer.take_events().is_none());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = transferer.run(cancel).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Cancelled);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::StateChanged(s) = event {
                seen.push(s);
            }
        }
        assert_eq!(seen.first(), Some(&TransferState::CloudSynchronize));
        assert_eq!(seen.last(), Some(&TransferState::Stopped));
    }
}
