#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end relay scenarios over real loopback sockets.
//!
//! Every test runs the full path: client socket → local rendezvous listener
//! → session router → tunnel → accept loop → relay → backend socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use conduit_agent::backend::{BackendConnector, TcpConnector};
use conduit_agent::relay::{RelayReport, RelayState, RelayTracker};
use conduit_agent::rendezvous::LocalRendezvous;
use conduit_agent::session::{Session, SessionClient, SessionConfig, SessionState};
use conduit_agent::stream::BackendStream;
use conduit_agent::tunnel::{AcceptLoop, AcceptStats, AcceptSummary, TunnelOptions};
use conduit_agent::{BackendError, TunnelError};

const WAIT: Duration = Duration::from_secs(10);

// =========================================================================
// Helpers
// =========================================================================

/// Backend that reads everything it is sent and then hangs up.
async fn sink_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut sink = Vec::new();
                let _ = socket.read_to_end(&mut sink).await;
            });
        }
    });
    addr
}

/// Backend that echoes every byte back.
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

/// Backend that keeps every connection open and never answers.
async fn silent_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Connector whose `fail_on`-th open (0-indexed) is refused.
struct FlakyConnector {
    inner: TcpConnector,
    opened: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl BackendConnector for FlakyConnector {
    async fn open(&self, addr: &str) -> Result<BackendStream, BackendError> {
        if self.opened.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            return Err(BackendError::ConnectionRefused {
                addr: addr.to_string(),
            });
        }
        self.inner.open(addr).await
    }
}

struct Running {
    rendezvous: Arc<LocalRendezvous>,
    session: Session,
    public_addr: String,
    stats: Arc<AcceptStats>,
    tracker: RelayTracker,
    reports: mpsc::UnboundedReceiver<RelayReport>,
    accept: JoinHandle<Result<AcceptSummary, TunnelError>>,
}

async fn start(backend_addr: &str, connector: Arc<dyn BackendConnector>) -> Running {
    let rendezvous = Arc::new(LocalRendezvous::new());
    let session = SessionClient::new(rendezvous.clone(), SessionConfig::default())
        .connect("python ses meta")
        .await
        .unwrap();
    let tunnel = session
        .open_tunnel(TunnelOptions {
            metadata: "python tun meta".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let public_addr = tunnel.public_addr().to_string();

    let (tx, reports) = mpsc::unbounded_channel();
    let accept = AcceptLoop::new(tunnel, backend_addr, connector).with_reports(tx);
    let stats = accept.stats();
    let tracker = accept.tracker();
    Running {
        rendezvous,
        session,
        public_addr,
        stats,
        tracker,
        reports,
        accept: tokio::spawn(accept.run()),
    }
}

async fn next_report(reports: &mut mpsc::UnboundedReceiver<RelayReport>) -> RelayReport {
    timeout(WAIT, reports.recv()).await.unwrap().unwrap()
}

/// Send `payload`, finish the write side, and collect whatever comes back.
async fn round_trip(public_addr: &str, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(public_addr).await.unwrap();
    client.write_all(payload).await.unwrap();
    client.shutdown().await.unwrap();
    let mut back = Vec::new();
    timeout(WAIT, client.read_to_end(&mut back))
        .await
        .unwrap()
        .unwrap();
    back
}

// =========================================================================
// Scenarios
// =========================================================================

#[tokio::test]
async fn three_payloads_complete_and_loop_keeps_running() {
    let backend = sink_backend().await;
    let mut run = start(&backend, Arc::new(TcpConnector::default())).await;

    for size in [0usize, 10, 10_000] {
        let payload = vec![0xAB; size];
        assert!(round_trip(&run.public_addr, &payload).await.is_empty());
    }

    let mut inbound = Vec::new();
    for _ in 0..3 {
        let report = next_report(&mut run.reports).await;
        assert_eq!(report.state, RelayState::Done, "{report:?}");
        assert_eq!(report.backend_addr, backend);
        assert_eq!(report.outbound_bytes, 0);
        inbound.push(report.inbound_bytes);
    }
    inbound.sort_unstable();
    assert_eq!(inbound, vec![0, 10, 10_000]);

    assert_eq!(
        run.stats.summary(),
        AcceptSummary {
            accepted: 3,
            done: 3,
            failed: 0
        }
    );
    assert!(!run.accept.is_finished());
    assert_eq!(run.session.state(), SessionState::Active);
}

#[tokio::test]
async fn unreachable_backend_fails_one_relay_only() {
    let backend = echo_backend().await;
    let connector = Arc::new(FlakyConnector {
        inner: TcpConnector::default(),
        opened: AtomicUsize::new(0),
        fail_on: 1,
    });
    let mut run = start(&backend, connector).await;

    let first = round_trip(&run.public_addr, b"first").await;
    assert_eq!(first, b"first");
    assert_eq!(next_report(&mut run.reports).await.state, RelayState::Done);

    // The refused relay closes the client side without data.
    assert!(round_trip(&run.public_addr, b"second").await.is_empty());
    let failed = next_report(&mut run.reports).await;
    assert_eq!(failed.state, RelayState::Failed);
    assert!(failed.error.unwrap().contains("refused"));

    let third = round_trip(&run.public_addr, b"third").await;
    assert_eq!(third, b"third");
    assert_eq!(next_report(&mut run.reports).await.state, RelayState::Done);

    assert_eq!(
        run.stats.summary(),
        AcceptSummary {
            accepted: 3,
            done: 2,
            failed: 1
        }
    );
    assert!(!run.accept.is_finished());
}

#[tokio::test]
async fn every_connection_gets_its_own_relay() {
    const N: usize = 8;
    let backend = echo_backend().await;
    let mut run = start(&backend, Arc::new(TcpConnector::default())).await;

    let clients: Vec<_> = (0..N)
        .map(|i| {
            let public = run.public_addr.clone();
            tokio::spawn(async move {
                let payload: Vec<u8> = (0..20_000 + i * 1_000)
                    .map(|_| rand::random::<u8>())
                    .collect();
                let back = round_trip(&public, &payload).await;
                assert_eq!(back, payload);
                payload.len() as u64
            })
        })
        .collect();

    let mut sent = Vec::new();
    for client in clients {
        sent.push(client.await.unwrap());
    }

    let mut relayed = Vec::new();
    for _ in 0..N {
        let report = next_report(&mut run.reports).await;
        assert_eq!(report.state, RelayState::Done);
        assert_eq!(report.inbound_bytes, report.outbound_bytes);
        relayed.push(report.inbound_bytes);
    }
    sent.sort_unstable();
    relayed.sort_unstable();
    assert_eq!(sent, relayed);
    assert_eq!(run.stats.summary().accepted, N as u64);
    assert_eq!(run.tracker.active_count().await, 0);
    assert_eq!(run.session.open_connections(), 0);
}

#[tokio::test]
async fn accept_after_tunnel_close_is_closed() {
    let rendezvous = Arc::new(LocalRendezvous::new());
    let session = SessionClient::new(rendezvous, SessionConfig::default())
        .connect("m")
        .await
        .unwrap();
    let mut tunnel = session.open_tunnel(TunnelOptions::default()).await.unwrap();
    let public = tunnel.public_addr().to_string();

    tunnel.close().await.unwrap();
    for _ in 0..5 {
        let result = timeout(WAIT, tunnel.accept()).await.unwrap();
        assert_eq!(result.unwrap_err(), TunnelError::Closed);
    }
    // The address is no longer served.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(&public).await.is_err());
}

#[tokio::test]
async fn session_failure_ends_every_relay() {
    let backend = silent_backend().await;
    let mut run = start(&backend, Arc::new(TcpConnector::default())).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = TcpStream::connect(&run.public_addr).await.unwrap();
        client.write_all(b"in flight").await.unwrap();
        clients.push(client);
    }
    timeout(WAIT, async {
        while run.tracker.active_count().await < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(run.rendezvous.disconnect(run.session.id()).await);

    for _ in 0..3 {
        let report = next_report(&mut run.reports).await;
        assert!(report.state == RelayState::Failed || report.state == RelayState::Done);
    }
    let summary = timeout(WAIT, run.accept).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.accepted, 3);
    assert!(matches!(run.session.state(), SessionState::Failed(_)));
    assert_eq!(run.tracker.active_count().await, 0);

    // Clients see their streams closed instead of hanging.
    for mut client in clients {
        let mut rest = Vec::new();
        let _ = timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap();
    }
}
