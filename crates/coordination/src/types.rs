//! Service-facing data types.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a transaction as recorded by the coordination
/// service. Mirrored locally by the transaction state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created locally, nothing negotiated yet.
    Created,
    /// Transaction record exists on the service.
    Initialized,
    /// Recipient accepted the transfer.
    Accepted,
    /// Payload exchange in progress.
    Started,
    /// Cancelled by either side.
    Canceled,
    /// Aborted on an unrecoverable error.
    Failed,
    /// Payload fully delivered.
    Finished,
    /// Recipient declined the transfer.
    Rejected,
    /// Removed from the service.
    Deleted,
    /// Unknown / not applicable.
    None,
}

impl TransactionStatus {
    /// Terminal statuses mark a transaction as historical: no machine is
    /// ever rebuilt for it across restarts.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Canceled
                | TransactionStatus::Failed
                | TransactionStatus::Finished
                | TransactionStatus::Rejected
                | TransactionStatus::Deleted
        )
    }
}

/// Outcome of a status update. The service treats repeated terminal
/// notifications as no-ops; callers must treat the non-`Applied`
/// variants as success, not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAck {
    /// The status was recorded.
    Applied,
    /// The transaction already had this status.
    AlreadyInStatus,
    /// The transaction already reached a terminal status.
    AlreadyFinalized,
}

/// Addresses a peer device published for direct connection attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerEndpoints {
    /// Local-network addresses, cheapest to try.
    pub locals: Vec<SocketAddr>,
    /// Externally visible addresses (NAT-mapped).
    pub externals: Vec<SocketAddr>,
}

/// A relay rendezvous point issued by the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub addr: SocketAddr,
    /// Session key both peers present to the relay.
    pub session: String,
}

/// Short-lived credentials for the cloud object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudCredentials {
    pub provider: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CloudCredentials {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn terminal_statuses() {
        for s in [
            TransactionStatus::Canceled,
            TransactionStatus::Failed,
            TransactionStatus::Finished,
            TransactionStatus::Rejected,
            TransactionStatus::Deleted,
        ] {
            assert!(s.is_terminal(), "{s:?} should be terminal");
        }
        for s in [
            TransactionStatus::Created,
            TransactionStatus::Initialized,
            TransactionStatus::Accepted,
            TransactionStatus::Started,
            TransactionStatus::None,
        ] {
            assert!(!s.is_terminal(), "{s:?} should not be terminal");
        }
    }

    #[test]
    fn status_serde_snake_case() {
        let json = serde_json::to_string(&TransactionStatus::Finished).unwrap();
        assert_eq!(json, "\"finished\"");
        let back: TransactionStatus = serde_json::from_str("\"canceled\"").unwrap();
        assert_eq!(back, TransactionStatus::Canceled);
    }

    #[test]
    fn credentials_expiry() {
        let mut creds = CloudCredentials {
            provider: "s3".into(),
            bucket: "staging".into(),
            access_key: "AK".into(),
            secret_key: "SK".into(),
            session_token: "ST".into(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        assert!(!creds.is_expired());
        creds.expires_at = Utc::now() - Duration::seconds(1);
        assert!(creds.is_expired());
    }

    #[test]
    fn peer_endpoints_roundtrip() {
        let eps = PeerEndpoints {
            locals: vec!["192.168.1.10:4410".parse().unwrap()],
            externals: vec!["203.0.113.7:4410".parse().unwrap()],
        };
        let json = serde_json::to_string(&eps).unwrap();
        let back: PeerEndpoints = serde_json::from_str(&json).unwrap();
        assert_eq!(back.locals, eps.locals);
        assert_eq!(back.externals, eps.externals);
    }
}
