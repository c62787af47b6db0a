//! Gates: resettable one-shot signals and the peer-reachability model.
//!
//! A gate is a boolean a task can wait on; opening it unblocks all
//! waiters, and it can be closed again later. Peer reachability is two
//! mutually exclusive gate pairs (online|offline from presence
//! notifications, reachable|unreachable from connectivity probes) plus a
//! connected gate opened once a socket is actually established.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::trace;

/// A resettable one-shot signal.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        let (tx, _rx) = watch::channel(open);
        Self { tx }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn close(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves as soon as the gate is open (immediately if it already
    /// is).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot fail here.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Two mutually exclusive gates: opening one closes its sibling.
#[derive(Debug, Clone)]
pub struct GatePair {
    first: Gate,
    second: Gate,
}

impl GatePair {
    /// Both gates start closed.
    pub fn new() -> Self {
        Self {
            first: Gate::new(false),
            second: Gate::new(false),
        }
    }

    pub fn open_first(&self) {
        self.second.close();
        self.first.open();
    }

    pub fn open_second(&self) {
        self.first.close();
        self.second.open();
    }

    pub fn first(&self) -> &Gate {
        &self.first
    }

    pub fn second(&self) -> &Gate {
        &self.second
    }
}

impl Default for GatePair {
    fn default() -> Self {
        Self::new()
    }
}

/// Tuning for [`PeerGates`].
#[derive(Debug, Clone)]
pub struct PeerGatesConfig {
    /// How long an absence notification must hold before the offline
    /// gate opens. Upstream presence channels flap; this is a knob, not
    /// an inferred constant.
    pub offline_debounce: Duration,
}

impl Default for PeerGatesConfig {
    fn default() -> Self {
        Self {
            offline_debounce: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
struct PeerGatesInner {
    /// online | offline, from presence notifications.
    presence: GatePair,
    /// reachable | unreachable, from connectivity probes.
    reach: GatePair,
    /// Opened when a socket to the peer is actually established.
    connected: Gate,
    debounce: Duration,
    /// Bumped on every presence change; a pending debounced offline
    /// transition aborts if the generation moved on.
    presence_gen: AtomicU64,
}

/// Peer-reachability state shared between the transfer machine and the
/// notification handler.
#[derive(Debug, Clone)]
pub struct PeerGates {
    inner: Arc<PeerGatesInner>,
}

impl PeerGates {
    pub fn new(config: PeerGatesConfig) -> Self {
        Self {
            inner: Arc::new(PeerGatesInner {
                presence: GatePair::new(),
                reach: GatePair::new(),
                connected: Gate::new(false),
                debounce: config.offline_debounce,
                presence_gen: AtomicU64::new(0),
            }),
        }
    }

    pub fn online(&self) -> &Gate {
        self.inner.presence.first()
    }

    pub fn offline(&self) -> &Gate {
        self.inner.presence.second()
    }

    pub fn reachable(&self) -> &Gate {
        self.inner.reach.first()
    }

    pub fn unreachable(&self) -> &Gate {
        self.inner.reach.second()
    }

    pub fn connected(&self) -> &Gate {
        &self.inner.connected
    }

    /// Presence notification: the peer is online. A fresh presence
    /// event also supersedes any stale unreachable verdict, so a
    /// waiting connect loop re-probes.
    pub fn set_online(&self) {
        self.inner.presence_gen.fetch_add(1, Ordering::SeqCst);
        trace!("peer online");
        self.inner.presence.open_first();
        self.inner.reach.open_first();
    }

    /// Presence notification: the peer went away. The offline gate only
    /// opens after the debounce interval with no newer presence event.
    pub fn set_offline(&self) {
        let generation = self.inner.presence_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if !inner.debounce.is_zero() {
                tokio::time::sleep(inner.debounce).await;
            }
            if inner.presence_gen.load(Ordering::SeqCst) == generation {
                trace!("peer offline (debounced)");
                inner.presence.open_second();
            }
        });
    }

    /// Probe result: the peer answers on a direct path.
    pub fn set_reachable(&self) {
        self.inner.reach.open_first();
    }

    /// Probe result: no direct path right now.
    pub fn set_unreachable(&self) {
        self.inner.reach.open_second();
    }
}
