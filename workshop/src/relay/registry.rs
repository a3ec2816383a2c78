//! Socket registry.
//!
//! Tracks every open relay connection half and coordinates their teardown.
//! A connection pair is owned by one bridge task; the registry only holds the
//! signals needed to ask that task to end cleanly or to destroy it.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Which side of the relay a connection half sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Host-side connection accepted by the relay listener.
    Inbound,
    /// Connection opened by the relay into the guest.
    Outbound,
}

/// Signals shared by both halves of a pair.
#[derive(Clone)]
pub(crate) struct Teardown {
    /// Ask the bridge to finish with a clean end sequence.
    pub(crate) end: CancellationToken,
    /// Drop the bridge immediately, closing both sockets.
    pub(crate) destroy: CancellationToken,
    /// Changes (errors) once the pair is gone.
    closed: watch::Receiver<()>,
}

impl Teardown {
    async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        // Never sent on: resolves with Err once the pair handle drops.
        let _ = closed.changed().await;
    }
}

struct Entry {
    pair: u64,
    role: Role,
    peer: SocketAddr,
    teardown: Teardown,
}

/// Outcome of [`SocketRegistry::drain`].
#[derive(Debug, Default, Clone)]
pub struct DrainReport {
    /// Pairs that ended within the grace period.
    pub ended: usize,
    /// Pairs destroyed after the grace period elapsed.
    pub destroyed: usize,
    /// Errors raised while ending individual connections.
    pub errors: Vec<String>,
}

/// Set of live relay connection halves.
pub struct SocketRegistry {
    entries: Mutex<HashMap<u64, Entry>>,
    errors: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl SocketRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Number of registered connection halves.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of registered halves on one side.
    pub fn count(&self, role: Role) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.role == role)
            .count()
    }

    /// Peers of the registered halves on one side.
    pub fn peers(&self, role: Role) -> Vec<SocketAddr> {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.role == role)
            .map(|entry| entry.peer)
            .collect()
    }

    /// Allocate the handle that owns a new connection pair.
    pub(crate) fn open_pair(self: &Arc<Self>) -> PairHandle {
        let (closed_tx, closed_rx) = watch::channel(());
        PairHandle {
            registrations: Vec::new(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            registry: Arc::clone(self),
            teardown: Teardown {
                end: CancellationToken::new(),
                destroy: CancellationToken::new(),
                closed: closed_rx,
            },
            _closed_tx: closed_tx,
        }
    }

    pub(crate) fn record_error(&self, error: String) {
        self.errors.lock().push(error);
    }

    fn remove(&self, id: u64) {
        if let Some(entry) = self.entries.lock().remove(&id) {
            tracing::trace!(
                connection = id,
                pair = entry.pair,
                role = ?entry.role,
                peer = %entry.peer,
                "relay connection unregistered"
            );
        }
    }

    /// Tear down every registered pair.
    ///
    /// Each pair is asked to end cleanly and given `grace` to do so before it
    /// is destroyed. Teardowns run concurrently and one failing never stops
    /// its siblings. Returns once the registry is empty.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        let mut report = DrainReport::default();
        self.errors.lock().clear();

        loop {
            let pairs: BTreeMap<u64, Teardown> = self
                .entries
                .lock()
                .values()
                .map(|entry| (entry.pair, entry.teardown.clone()))
                .collect();
            if pairs.is_empty() {
                break;
            }

            let outcomes = futures::future::join_all(
                pairs
                    .into_values()
                    .map(|teardown| Self::teardown_pair(teardown, grace)),
            )
            .await;

            for ended_cleanly in outcomes {
                if ended_cleanly {
                    report.ended += 1;
                } else {
                    report.destroyed += 1;
                }
            }
        }

        report.errors = std::mem::take(&mut *self.errors.lock());
        report
    }

    /// Returns true when the pair ended within the grace period.
    async fn teardown_pair(teardown: Teardown, grace: Duration) -> bool {
        teardown.end.cancel();
        if tokio::time::timeout(grace, teardown.wait_closed())
            .await
            .is_ok()
        {
            return true;
        }
        teardown.destroy.cancel();
        teardown.wait_closed().await;
        false
    }
}

/// Owner of one relay connection pair.
///
/// Dropping it unregisters both halves and then signals the pair as closed,
/// so a drain waiting on the pair never observes stale entries.
pub(crate) struct PairHandle {
    // Dropped first: field drop order follows declaration order.
    registrations: Vec<Registration>,
    id: u64,
    registry: Arc<SocketRegistry>,
    teardown: Teardown,
    _closed_tx: watch::Sender<()>,
}

impl PairHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn teardown(&self) -> Teardown {
        self.teardown.clone()
    }

    /// Register one half of this pair.
    ///
    /// Refused once the pair has been asked to end, so a drain in progress
    /// cannot miss a late registration.
    pub(crate) fn register(&mut self, role: Role, peer: SocketAddr) -> bool {
        if self.teardown.end.is_cancelled() {
            return false;
        }
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.entries.lock().insert(
            id,
            Entry {
                pair: self.id,
                role,
                peer,
                teardown: self.teardown.clone(),
            },
        );
        tracing::trace!(connection = id, pair = self.id, ?role, %peer, "relay connection registered");
        self.registrations.push(Registration {
            registry: Arc::clone(&self.registry),
            id,
        });
        true
    }
}

/// Removes its entry from the registry exactly once, on drop.
struct Registration {
    registry: Arc<SocketRegistry>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
