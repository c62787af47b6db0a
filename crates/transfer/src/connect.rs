//! Races the ordered round list against the inbound listener.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::rounds::ConnectionRound;
use crate::TransferError;

/// How one connection attempt resolved.
pub enum RaceOutcome {
    /// An outbound round produced a socket.
    Connected { stream: TcpStream, via: String },
    /// The peer reached us first.
    Incoming { stream: TcpStream, peer: SocketAddr },
    /// Every round came up empty and nothing dialed in within the
    /// grace window.
    NotReachable,
}

/// Works through `rounds` strictly in order while simultaneously
/// accepting on `listener`; whichever side produces a socket first
/// wins. After the last round fails, the listener gets `grace` more
/// time before the attempt is declared unreachable.
pub async fn run_connection_race(
    rounds: &[Box<dyn ConnectionRound>],
    listener: &TcpListener,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<RaceOutcome, TransferError> {
    let outbound = async {
        for round in rounds {
            if cancel.is_cancelled() {
                break;
            }
            debug!(round = round.name(), "opening connection round");
            if let Some(stream) = round.open(cancel).await? {
                return Ok::<_, TransferError>(Some((stream, round.name().to_owned())));
            }
        }
        Ok(None)
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        accepted = listener.accept() => {
            let (stream, peer) = accepted?;
            info!(%peer, "accepted inbound connection");
            Ok(RaceOutcome::Incoming { stream, peer })
        }
        result = outbound => match result? {
            Some((stream, via)) => {
                info!(round = %via, "outbound round won");
                Ok(RaceOutcome::Connected { stream, via })
            }
            None => {
                // Rounds exhausted; the peer may still be mid-dial.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TransferError::Cancelled),
                    accepted = tokio::time::timeout(grace, listener.accept()) => match accepted {
                        Ok(Ok((stream, peer))) => {
                            info!(%peer, "accepted inbound connection in grace window");
                            Ok(RaceOutcome::Incoming { stream, peer })
                        }
                        Ok(Err(e)) => Err(e.into()),
                        Err(_) => Ok(RaceOutcome::NotReachable),
                    }
                }
            }
        }
    }
}
