use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::copy::{DirectionEnd, copy_direction};
use crate::backend::BackendConnector;
use crate::error::RelayError;
use crate::session::SessionState;
use crate::stream::{BackendStream, Connection};

/// Relay tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Largest read issued per direction.
    pub chunk_size: usize,
    /// How long the surviving direction may keep flowing after the other one
    /// was cut off by a reset or a rejected write.
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Running,
    Draining,
    Done,
    Failed,
}

impl RelayState {
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Live counters of one relay. Byte counts only ever grow.
#[derive(Debug)]
pub struct RelayStats {
    inbound_bytes: AtomicU64,
    outbound_bytes: AtomicU64,
    state: watch::Sender<RelayState>,
}

impl RelayStats {
    pub(crate) fn new() -> Self {
        Self {
            inbound_bytes: AtomicU64::new(0),
            outbound_bytes: AtomicU64::new(0),
            state: watch::Sender::new(RelayState::Running),
        }
    }

    /// Bytes forwarded from the inbound connection to the backend.
    pub fn inbound_bytes(&self) -> u64 {
        self.inbound_bytes.load(Ordering::Relaxed)
    }

    /// Bytes forwarded from the backend to the inbound connection.
    pub fn outbound_bytes(&self) -> u64 {
        self.outbound_bytes.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: RelayState) {
        self.state.send_if_modified(|current| {
            if current.is_finished() || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// Final outcome of a relay, emitted once when it finishes.
#[derive(Debug, Clone, Serialize)]
pub struct RelayReport {
    pub relay_id: Uuid,
    pub tunnel_id: String,
    pub peer_addr: String,
    pub backend_addr: String,
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
    pub state: RelayState,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Pipes one accepted connection to a fresh backend connection.
pub struct ConnectionRelay {
    connection: Connection,
    backend_addr: String,
    connector: Arc<dyn BackendConnector>,
    config: RelayConfig,
    session_state: watch::Receiver<SessionState>,
    stats: Arc<RelayStats>,
}

impl ConnectionRelay {
    pub fn new(
        connection: Connection,
        backend_addr: impl Into<String>,
        connector: Arc<dyn BackendConnector>,
        config: RelayConfig,
        session_state: watch::Receiver<SessionState>,
    ) -> Self {
        Self {
            connection,
            backend_addr: backend_addr.into(),
            connector,
            config,
            session_state,
            stats: Arc::new(RelayStats::new()),
        }
    }

    /// Connection id, which doubles as the relay id.
    pub fn id(&self) -> Uuid {
        self.connection.id()
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Run to completion. Never fails: every error ends up in the report.
    pub async fn run(self) -> RelayReport {
        let started = Instant::now();
        let Self {
            mut connection,
            backend_addr,
            connector,
            config,
            mut session_state,
            stats,
        } = self;
        let relay_id = connection.id();
        let tunnel_id = connection.tunnel_id().to_string();
        let peer_addr = connection.peer_addr().to_string();

        debug!(relay_id = %relay_id, peer_addr = %peer_addr, backend_addr = %backend_addr, "Relay started");

        let opened = tokio::select! {
            biased;
            () = session_lost(&mut session_state) => Err(RelayError::SessionLost),
            result = connector.open(&backend_addr) => result.map_err(RelayError::from),
        };

        let error = match opened {
            Ok(backend) => pump(connection, backend, &config, &mut session_state, &stats).await,
            Err(e) => {
                // Tell the remote end this stream cannot be served.
                let _ = connection.close().await;
                Some(e)
            }
        };

        let state = if error.is_some() {
            RelayState::Failed
        } else {
            RelayState::Done
        };
        stats.set_state(state);

        let report = RelayReport {
            relay_id,
            tunnel_id,
            peer_addr,
            backend_addr,
            inbound_bytes: stats.inbound_bytes(),
            outbound_bytes: stats.outbound_bytes(),
            state,
            error: error.as_ref().map(ToString::to_string),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        match &error {
            None => info!(
                relay_id = %relay_id,
                inbound_bytes = report.inbound_bytes,
                outbound_bytes = report.outbound_bytes,
                elapsed_ms = report.elapsed_ms,
                "Relay done"
            ),
            Some(e) => warn!(
                relay_id = %relay_id,
                peer_addr = %report.peer_addr,
                backend_addr = %report.backend_addr,
                inbound_bytes = report.inbound_bytes,
                outbound_bytes = report.outbound_bytes,
                error = %e,
                "Relay failed"
            ),
        }
        report
    }
}

/// Copy both directions until they end, the drain deadline passes or the
/// session goes away. Both streams are closed before returning. A drain
/// deadline cut is reported as [`RelayError::Draining`].
async fn pump(
    connection: Connection,
    backend: BackendStream,
    config: &RelayConfig,
    session_state: &mut watch::Receiver<SessionState>,
    stats: &RelayStats,
) -> Option<RelayError> {
    let (mut conn_rd, mut conn_wr) = tokio::io::split(connection);
    let (mut back_rd, mut back_wr) = tokio::io::split(backend);

    let mut error = None;
    {
        let inbound = copy_direction(
            &mut conn_rd,
            &mut back_wr,
            config.chunk_size,
            &stats.inbound_bytes,
        );
        let outbound = copy_direction(
            &mut back_rd,
            &mut conn_wr,
            config.chunk_size,
            &stats.outbound_bytes,
        );
        tokio::pin!(inbound, outbound);

        let mut inbound_done = false;
        let mut outbound_done = false;
        let mut deadline: Option<Instant> = None;

        while !(inbound_done && outbound_done) {
            let drain_cutoff = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let end = tokio::select! {
                biased;
                () = session_lost(session_state) => {
                    error = Some(RelayError::SessionLost);
                    break;
                }
                () = drain_cutoff => {
                    debug!("Drain deadline reached, cutting relay");
                    error.get_or_insert(RelayError::Draining {
                        after: config.drain_timeout,
                    });
                    break;
                }
                end = &mut inbound, if !inbound_done => {
                    inbound_done = true;
                    end
                }
                end = &mut outbound, if !outbound_done => {
                    outbound_done = true;
                    end
                }
            };

            stats.set_state(RelayState::Draining);
            match end {
                DirectionEnd::Eof => {}
                DirectionEnd::PeerClosed => {
                    deadline.get_or_insert_with(|| Instant::now() + config.drain_timeout);
                }
                DirectionEnd::Failed(e) => {
                    deadline.get_or_insert_with(|| Instant::now() + config.drain_timeout);
                    error.get_or_insert(RelayError::Io(e));
                }
            }
        }
    }

    let mut connection = conn_rd.unsplit(conn_wr);
    let mut backend = back_rd.unsplit(back_wr);
    let _ = connection.close().await;
    let _ = backend.close().await;
    error
}

async fn session_lost(state: &mut watch::Receiver<SessionState>) {
    // A dropped session counts as lost.
    let _ = state.wait_for(|s| !s.is_active()).await;
}
