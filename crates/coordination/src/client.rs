//! Abstract coordination-service client.
//!
//! The host application implements [`Coordinator`] on top of its actual
//! REST transport. Using a trait keeps the orchestration engine decoupled
//! from HTTP and testable with mocks.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use crate::types::{CloudCredentials, PeerEndpoints, RelayEndpoint, StatusAck, TransactionStatus};
use crate::CoordinationError;

/// Boxed future returned by [`Coordinator`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CoordinationError>> + Send + 'a>>;

/// Narrow interface to the metadata/coordination service.
pub trait Coordinator: Send + Sync {
    /// Records a transaction status. Idempotent: duplicate terminal
    /// notifications come back as [`StatusAck::AlreadyInStatus`] or
    /// [`StatusAck::AlreadyFinalized`], both of which are success.
    fn update_status<'a>(
        &'a self,
        txn_id: &'a str,
        status: TransactionStatus,
        device_id: Option<&'a str>,
    ) -> BoxFuture<'a, StatusAck>;

    /// Fetches the addresses the peer device has published.
    fn peer_endpoints<'a>(
        &'a self,
        txn_id: &'a str,
        local_device: &'a str,
        peer_device: &'a str,
    ) -> BoxFuture<'a, PeerEndpoints>;

    /// Asks for a relay rendezvous endpoint. Callers retry on
    /// [`CoordinationError::Unavailable`].
    fn relay_rendezvous<'a>(&'a self, txn_id: &'a str) -> BoxFuture<'a, RelayEndpoint>;

    /// Fetches (or force-regenerates) cloud store credentials.
    fn cloud_credentials<'a>(
        &'a self,
        txn_id: &'a str,
        force_regenerate: bool,
    ) -> BoxFuture<'a, CloudCredentials>;

    /// Publishes this device's reachable addresses so peer round
    /// attempts can find them.
    fn publish_addresses<'a>(
        &'a self,
        txn_id: &'a str,
        device_id: &'a str,
        locals: &'a [SocketAddr],
        publics: &'a [SocketAddr],
    ) -> BoxFuture<'a, ()>;
}
