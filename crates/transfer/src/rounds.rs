//! Connection rounds: ordered strategies for obtaining a peer socket.
//!
//! An address round probes a fixed list of host:port candidates; a relay
//! round asks the coordination service for a rendezvous endpoint. Rounds
//! are tried cheapest-first: one address round per viable local
//! interface, then externals, then the relay.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use peerferry_coordination::{CoordinationError, Coordinator, RelayEndpoint};

use crate::TransferError;

/// Boxed future returned by [`ConnectionRound::open`].
pub type RoundFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<TcpStream>, TransferError>> + Send + 'a>>;

/// One strategy for obtaining a socket to the peer.
///
/// `open` yields `Ok(None)` when the strategy simply did not work out;
/// errors are reserved for conditions the caller may want to surface.
pub trait ConnectionRound: Send + Sync {
    fn name(&self) -> &str;
    fn open<'a>(&'a self, cancel: &'a CancellationToken) -> RoundFuture<'a>;
}

/// Probes a fixed candidate list in order; the first connect wins.
pub struct AddressRound {
    name: String,
    candidates: Vec<SocketAddr>,
    connect_timeout: Duration,
}

impl AddressRound {
    pub fn new(name: impl Into<String>, candidates: Vec<SocketAddr>) -> Self {
        Self {
            name: name.into(),
            candidates,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl ConnectionRound for AddressRound {
    fn name(&self) -> &str {
        &self.name
    }

    fn open<'a>(&'a self, cancel: &'a CancellationToken) -> RoundFuture<'a> {
        Box::pin(async move {
            for addr in &self.candidates {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                let attempt = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(None),
                    result = attempt => match result {
                        Ok(Ok(stream)) => {
                            debug!(round = %self.name, %addr, "address round connected");
                            return Ok(Some(stream));
                        }
                        Ok(Err(e)) => {
                            debug!(round = %self.name, %addr, error = %e, "candidate refused");
                        }
                        Err(_) => {
                            debug!(round = %self.name, %addr, "candidate timed out");
                        }
                    }
                }
            }
            Ok(None)
        })
    }
}

/// Rendezvous through a relay service. More expensive than direct
/// probing, so always ordered last. The endpoint is fetched once and
/// memoized across attempts.
pub struct RelayRound {
    coordinator: Arc<dyn Coordinator>,
    txn_id: String,
    endpoint: Mutex<Option<RelayEndpoint>>,
    connect_timeout: Duration,
    /// Attempts against an unavailable rendezvous service before the
    /// round gives up for this pass.
    max_fetch_attempts: u32,
}

impl RelayRound {
    pub const NAME: &'static str = "relay";

    pub fn new(coordinator: Arc<dyn Coordinator>, txn_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            txn_id: txn_id.into(),
            endpoint: Mutex::new(None),
            connect_timeout: Duration::from_secs(5),
            max_fetch_attempts: 3,
        }
    }

    async fn rendezvous(&self, cancel: &CancellationToken) -> Result<Option<RelayEndpoint>, TransferError> {
        let mut cached = self.endpoint.lock().await;
        if let Some(ep) = cached.as_ref() {
            return Ok(Some(ep.clone()));
        }

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self.coordinator.relay_rendezvous(&self.txn_id).await {
                Ok(ep) => {
                    *cached = Some(ep.clone());
                    return Ok(Some(ep));
                }
                Err(e @ CoordinationError::Unavailable(_)) => {
                    attempt += 1;
                    if attempt >= self.max_fetch_attempts {
                        warn!(transaction = %self.txn_id, error = %e, "rendezvous unavailable, giving up this pass");
                        return Ok(None);
                    }
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl ConnectionRound for RelayRound {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn open<'a>(&'a self, cancel: &'a CancellationToken) -> RoundFuture<'a> {
        Box::pin(async move {
            let Some(endpoint) = self.rendezvous(cancel).await? else {
                return Ok(None);
            };

            let attempt = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint.addr));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(None),
                result = attempt => match result {
                    Ok(Ok(stream)) => {
                        debug!(addr = %endpoint.addr, "relay round connected");
                        Ok(Some(stream))
                    }
                    Ok(Err(e)) => {
                        debug!(addr = %endpoint.addr, error = %e, "relay refused");
                        Ok(None)
                    }
                    Err(_) => {
                        debug!(addr = %endpoint.addr, "relay timed out");
                        Ok(None)
                    }
                }
            }
        })
    }
}

/// Builds the ordered round list for one transaction.
pub struct RoundProvider {
    coordinator: Arc<dyn Coordinator>,
    txn_id: String,
    local_device: String,
    peer_device: String,
    connect_timeout: Duration,
}

impl RoundProvider {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        txn_id: impl Into<String>,
        local_device: impl Into<String>,
        peer_device: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            txn_id: txn_id.into(),
            local_device: local_device.into(),
            peer_device: peer_device.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Addresses of viable local interfaces (no loopback, no
    /// link-local), each bound to `port`. Published so peer rounds can
    /// find us.
    pub fn local_addresses(&self, port: u16) -> Vec<SocketAddr> {
        viable_interfaces()
            .into_iter()
            .map(|(_, ip)| SocketAddr::new(ip, port))
            .collect()
    }

    /// Ordered round list: one address round per viable local interface
    /// probing the peer's local endpoints, then the peer's external
    /// endpoints, then the relay.
    pub async fn build_rounds(&self) -> Result<Vec<Box<dyn ConnectionRound>>, TransferError> {
        let endpoints = self
            .coordinator
            .peer_endpoints(&self.txn_id, &self.local_device, &self.peer_device)
            .await?;

        let mut rounds: Vec<Box<dyn ConnectionRound>> = Vec::new();
        if !endpoints.locals.is_empty() {
            for (ifname, _) in viable_interfaces() {
                rounds.push(Box::new(
                    AddressRound::new(format!("direct:{ifname}"), endpoints.locals.clone())
                        .with_timeout(self.connect_timeout),
                ));
            }
        }
        if !endpoints.externals.is_empty() {
            rounds.push(Box::new(
                AddressRound::new("external", endpoints.externals.clone())
                    .with_timeout(self.connect_timeout),
            ));
        }
        rounds.push(Box::new(RelayRound::new(
            Arc::clone(&self.coordinator),
            self.txn_id.clone(),
        )));
        Ok(rounds)
    }
}

fn viable_interfaces() -> Vec<(String, IpAddr)> {
    let Ok(addrs) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };
    addrs
        .into_iter()
        .filter(|a| !a.is_loopback())
        .filter(|a| {
            let ip = a.ip();
            match ip {
                IpAddr::V4(v4) => !v4.is_link_local(),
                IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
            }
        })
        .map(|a| (a.name.clone(), a.ip()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn address_round_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let round = AddressRound::new("direct:test", vec![addr]);
        let cancel = CancellationToken::new();
        let stream = round.open(&cancel).await.unwrap();
        assert!(stream.is_some());
    }

    #[tokio::test]
    async fn address_round_skips_dead_candidates() {
        // Bind then drop: the port refuses connections.
        let dead_addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = listener.local_addr().unwrap();

        let round = AddressRound::new("direct:test", vec![dead_addr, live_addr]);
        let cancel = CancellationToken::new();
        let stream = round.open(&cancel).await.unwrap();
        assert!(stream.is_some());
    }

    #[tokio::test]
    async fn address_round_yields_none_when_all_fail() {
        let dead_addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let round = AddressRound::new("direct:test", vec![dead_addr]);
        let cancel = CancellationToken::new();
        assert!(round.open(&cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_round_stops_probing() {
        let dead_addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let round = AddressRound::new("direct:test", vec![dead_addr; 4]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(round.open(&cancel).await.unwrap().is_none());
    }

    #[test]
    fn viable_interfaces_exclude_loopback() {
        for (_, ip) in viable_interfaces() {
            assert!(!ip.is_loopback());
        }
    }
}
