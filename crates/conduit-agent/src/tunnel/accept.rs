//! Accept loop: one relay per inbound connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::TunnelHandle;
use crate::backend::BackendConnector;
use crate::error::TunnelError;
use crate::relay::{ConnectionRelay, RelayConfig, RelayReport, RelayState, RelayTracker};

/// Counters shared between the loop and the relays it spawned.
#[derive(Debug, Default)]
pub struct AcceptStats {
    accepted: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
}

impl AcceptStats {
    pub fn summary(&self) -> AcceptSummary {
        AcceptSummary {
            accepted: self.accepted.load(Ordering::Acquire),
            done: self.done.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }

    fn finished(&self, state: RelayState) {
        let counter = if state == RelayState::Failed {
            &self.failed
        } else {
            &self.done
        };
        counter.fetch_add(1, Ordering::AcqRel);
    }
}

/// Relay counts at a point in time. `accepted - done - failed` relays are
/// still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AcceptSummary {
    pub accepted: u64,
    pub done: u64,
    pub failed: u64,
}

/// Accepts connections from a tunnel and hands each one to its own relay.
pub struct AcceptLoop {
    tunnel: TunnelHandle,
    backend_addr: String,
    connector: Arc<dyn BackendConnector>,
    relay_config: RelayConfig,
    tracker: RelayTracker,
    reports: Option<mpsc::UnboundedSender<RelayReport>>,
    stats: Arc<AcceptStats>,
    #[cfg(feature = "metrics")]
    metrics: conduit_core::metrics::RelayMetrics,
}

impl AcceptLoop {
    pub fn new(
        tunnel: TunnelHandle,
        backend_addr: impl Into<String>,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        Self {
            tunnel,
            backend_addr: backend_addr.into(),
            connector,
            relay_config: RelayConfig::default(),
            tracker: RelayTracker::new(),
            reports: None,
            stats: Arc::new(AcceptStats::default()),
            #[cfg(feature = "metrics")]
            metrics: conduit_core::metrics::RelayMetrics::new(),
        }
    }

    #[must_use]
    pub fn with_relay_config(mut self, config: RelayConfig) -> Self {
        self.relay_config = config;
        self
    }

    /// Share an existing tracker, e.g. one owned by the agent for teardown.
    #[must_use]
    pub fn with_tracker(mut self, tracker: RelayTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Receive a [`RelayReport`] for every finished relay.
    #[must_use]
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<RelayReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn stats(&self) -> Arc<AcceptStats> {
        Arc::clone(&self.stats)
    }

    pub fn tracker(&self) -> RelayTracker {
        self.tracker.clone()
    }

    pub fn tunnel(&self) -> &TunnelHandle {
        &self.tunnel
    }

    /// Accept until the tunnel closes.
    ///
    /// Returns `Ok` once the tunnel or session closes. Relay failures never
    /// stop the loop; any other tunnel failure is returned to the owner.
    pub async fn run(mut self) -> Result<AcceptSummary, TunnelError> {
        info!(
            tunnel_id = %self.tunnel.id(),
            public_addr = %self.tunnel.public_addr(),
            backend_addr = %self.backend_addr,
            "Accept loop started"
        );
        loop {
            match self.tunnel.accept().await {
                Ok(conn) => self.spawn_relay(conn).await,
                Err(TunnelError::Closed) => {
                    let summary = self.stats.summary();
                    info!(
                        tunnel_id = %self.tunnel.id(),
                        accepted = summary.accepted,
                        "Tunnel closed, accept loop finished"
                    );
                    return Ok(summary);
                }
                Err(TunnelError::AcceptTimeout(after)) => {
                    debug!(tunnel_id = %self.tunnel.id(), idle_ms = after.as_millis(), "No connection within accept deadline");
                }
                Err(e) => {
                    error!(tunnel_id = %self.tunnel.id(), error = %e, "Accept loop failed");
                    return Err(e);
                }
            }
        }
    }

    async fn spawn_relay(&self, conn: crate::stream::Connection) {
        self.stats.accepted.fetch_add(1, Ordering::AcqRel);
        debug!(
            tunnel_id = %self.tunnel.id(),
            connection_id = %conn.id(),
            peer_addr = %conn.peer_addr(),
            "Connection accepted"
        );

        let relay_id = conn.id();
        let tunnel_id = conn.tunnel_id().to_string();
        let peer_addr = conn.peer_addr().to_string();
        let relay = ConnectionRelay::new(
            conn,
            self.backend_addr.clone(),
            Arc::clone(&self.connector),
            self.relay_config.clone(),
            self.tunnel.session_state(),
        );
        self.tracker
            .insert(relay_id, tunnel_id, peer_addr, relay.stats())
            .await;

        let tracker = self.tracker.clone();
        let stats = Arc::clone(&self.stats);
        let reports = self.reports.clone();
        #[cfg(feature = "metrics")]
        let metrics = self.metrics.clone();
        let task = tokio::spawn(async move {
            let report = relay.run().await;
            tracker.remove(report.relay_id).await;
            stats.finished(report.state);
            #[cfg(feature = "metrics")]
            {
                metrics.record_bytes("inbound", report.inbound_bytes);
                metrics.record_bytes("outbound", report.outbound_bytes);
                metrics.record_relay(report.state.as_str());
            }
            if let Some(reports) = reports {
                let _ = reports.send(report);
            }
        });
        self.tracker.attach_abort(relay_id, task.abort_handle()).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::TcpConnector;
    use crate::rendezvous::LocalRendezvous;
    use crate::session::{SessionClient, SessionConfig};
    use crate::tunnel::TunnelOptions;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = socket.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn relays_each_connection_and_reports() {
        let backend = echo_backend().await;
        let rendezvous = Arc::new(LocalRendezvous::new());
        let session = SessionClient::new(rendezvous, SessionConfig::default())
            .connect("m")
            .await
            .unwrap();
        let tunnel = session.open_tunnel(TunnelOptions::default()).await.unwrap();
        let public = tunnel.public_addr().to_string();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let accept = AcceptLoop::new(tunnel, backend, Arc::new(TcpConnector::default()))
            .with_reports(tx);
        let stats = accept.stats();
        let running = tokio::spawn(accept.run());

        for i in 0..3u8 {
            let mut client = TcpStream::connect(&public).await.unwrap();
            let msg = vec![i; 100];
            client.write_all(&msg).await.unwrap();
            client.shutdown().await.unwrap();
            let mut echoed = Vec::new();
            client.read_to_end(&mut echoed).await.unwrap();
            assert_eq!(echoed, msg);
        }

        for _ in 0..3 {
            let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(report.state, RelayState::Done);
            assert_eq!(report.inbound_bytes, 100);
            assert_eq!(report.outbound_bytes, 100);
        }
        assert_eq!(
            stats.summary(),
            AcceptSummary {
                accepted: 3,
                done: 3,
                failed: 0
            }
        );
        assert!(!running.is_finished());

        session.close().await;
        let summary = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.accepted, 3);
    }

    #[tokio::test]
    async fn accept_deadline_does_not_stop_loop() {
        let rendezvous = Arc::new(LocalRendezvous::new());
        let session = SessionClient::new(rendezvous, SessionConfig::default())
            .connect("m")
            .await
            .unwrap();
        let tunnel = session
            .open_tunnel(TunnelOptions {
                accept_timeout: Some(Duration::from_millis(20)),
                ..Default::default()
            })
            .await
            .unwrap();
        let controller = tunnel.controller();
        let running = tokio::spawn(
            AcceptLoop::new(tunnel, "127.0.0.1:9", Arc::new(TcpConnector::default())).run(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!running.is_finished());

        controller.close().await.unwrap();
        let summary = running.await.unwrap().unwrap();
        assert_eq!(summary.accepted, 0);
    }
}
