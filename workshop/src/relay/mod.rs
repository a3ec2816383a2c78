//! Local traffic relay.
//!
//! Accepts TCP connections on the host-facing port and bridges each one,
//! byte for byte, to a fresh connection into the guest service. Every
//! connection half is tracked in a [`SocketRegistry`] so shutdown can drain
//! them within a bounded window.

mod registry;

pub use registry::{DrainReport, Role, SocketRegistry};

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use workshop_shared::constants::{network, timeouts};
use workshop_shared::errors::{WorkshopError, WorkshopResult};

use registry::{PairHandle, Teardown};

/// Where the relay listens and where it forwards to.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub upstream: SocketAddr,
    /// Per-connection window for a clean end before it is destroyed.
    pub drain_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], network::RELAY_PORT)),
            upstream: SocketAddr::from(([127, 0, 0, 1], network::GUEST_SERVICE_HOST_PORT)),
            drain_grace: Duration::from_millis(timeouts::RELAY_DRAIN_MS),
        }
    }
}

/// A bound relay. Dropping it without [`TrafficRelay::shutdown`] stops
/// accepting but leaves open pairs to finish on their own.
pub struct TrafficRelay {
    config: RelayConfig,
    local_addr: SocketAddr,
    registry: Arc<SocketRegistry>,
    accepted: Arc<AtomicU64>,
    stop_accepting: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl TrafficRelay {
    /// Bind the listener and start accepting.
    pub async fn bind(config: RelayConfig) -> WorkshopResult<Self> {
        let listener = TcpListener::bind(config.listen).await.map_err(|e| {
            WorkshopError::Relay(format!("failed to listen on {}: {}", config.listen, e))
        })?;
        let local_addr = listener.local_addr()?;
        tracing::info!(listen = %local_addr, upstream = %config.upstream, "Traffic relay listening");

        let registry = SocketRegistry::new();
        let accepted = Arc::new(AtomicU64::new(0));
        let stop_accepting = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            config.upstream,
            Arc::clone(&registry),
            Arc::clone(&accepted),
            stop_accepting.clone(),
        ));

        Ok(Self {
            config,
            local_addr,
            registry,
            accepted,
            stop_accepting,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn upstream(&self) -> SocketAddr {
        self.config.upstream
    }

    /// Registered connection halves (two per fully bridged pair).
    pub fn connections(&self) -> usize {
        self.registry.len()
    }

    /// Inbound connections accepted since bind.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    /// Stop accepting and drain every open connection.
    ///
    /// The listener is closed and the registry is empty once this returns,
    /// whether or not individual connections ended cleanly. Teardown errors
    /// are reported together as a single [`WorkshopError::Relay`].
    pub async fn shutdown(mut self) -> WorkshopResult<DrainReport> {
        self.stop_accepting.cancel();
        if let Some(task) = self.accept_task.take()
            && let Err(e) = task.await
        {
            tracing::warn!("Relay accept loop ended abnormally: {}", e);
        }

        let report = self.registry.drain(self.config.drain_grace).await;
        tracing::info!(
            listen = %self.local_addr,
            ended = report.ended,
            destroyed = report.destroyed,
            errors = report.errors.len(),
            "Traffic relay stopped"
        );

        if report.errors.is_empty() {
            Ok(report)
        } else {
            Err(WorkshopError::Relay(format!(
                "{} connection(s) failed to close cleanly: {}",
                report.errors.len(),
                report.errors.join("; ")
            )))
        }
    }
}

impl Drop for TrafficRelay {
    fn drop(&mut self) {
        self.stop_accepting.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    upstream: SocketAddr,
    registry: Arc<SocketRegistry>,
    accepted: Arc<AtomicU64>,
    stop_accepting: CancellationToken,
) {
    loop {
        let (inbound, peer) = tokio::select! {
            biased;
            _ = stop_accepting.cancelled() => break,
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    tracing::warn!("Relay accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let total = accepted.fetch_add(1, Ordering::Relaxed) + 1;
        let mut pair = registry.open_pair();
        pair.register(Role::Inbound, peer);

        let span = tracing::debug_span!("relay_pair", pair = pair.id(), %peer, total);
        tokio::spawn(serve_pair(pair, inbound, upstream, Arc::clone(&registry)).instrument(span));
    }
    tracing::debug!("Relay listener closed");
}

/// Own one pair until it finishes or is destroyed.
async fn serve_pair(
    mut pair: PairHandle,
    inbound: TcpStream,
    upstream: SocketAddr,
    registry: Arc<SocketRegistry>,
) {
    let teardown = pair.teardown();
    tokio::select! {
        biased;
        _ = teardown.destroy.cancelled() => {
            tracing::debug!("Relay pair destroyed after drain grace");
        }
        _ = bridge(&mut pair, inbound, upstream, &teardown, &registry) => {}
    }
    // Dropping the pair unregisters both halves.
}

async fn bridge(
    pair: &mut PairHandle,
    mut inbound: TcpStream,
    upstream: SocketAddr,
    teardown: &Teardown,
    registry: &SocketRegistry,
) {
    let mut outbound = tokio::select! {
        biased;
        _ = teardown.end.cancelled() => return,
        result = TcpStream::connect(upstream) => match result {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(%upstream, "Relay failed to reach guest: {}", e);
                return;
            }
        },
    };
    if !pair.register(Role::Outbound, upstream) {
        return;
    }

    let copied = tokio::select! {
        result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => Some(result),
        _ = teardown.end.cancelled() => None,
    };

    match copied {
        Some(Ok((to_guest, to_host))) => {
            tracing::debug!(to_guest, to_host, "Relay pair finished");
        }
        Some(Err(e)) => {
            // Returning drops both streams, closing the healthy half too.
            tracing::debug!("Relay pair failed: {}", e);
        }
        None => {
            let (inbound_end, outbound_end) = tokio::join!(inbound.shutdown(), outbound.shutdown());
            for (side, result) in [("inbound", inbound_end), ("outbound", outbound_end)] {
                if let Err(e) = result
                    && e.kind() != std::io::ErrorKind::NotConnected
                {
                    registry.record_error(format!("pair {} {}: {}", pair.id(), side, e));
                }
            }
        }
    }
}
