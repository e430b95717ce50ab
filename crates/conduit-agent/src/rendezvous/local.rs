//! In-process rendezvous backed by local TCP listeners.
//!
//! Every bound tunnel is a `TcpListener`; its local address is the tunnel's
//! public address and every accepted socket is delivered to the session as an
//! inbound stream. Used by the binary's local mode and by tests, which can
//! also simulate an unreachable service, rejected credentials and transport
//! loss.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BindRequest, Binding, Handshake, HandshakeRequest, IncomingStream, Rendezvous};
use crate::error::{SessionError, TunnelError};

/// Capacity of the per-session inbound stream channel.
const INCOMING_CAPACITY: usize = 64;

struct LocalSession {
    incoming: mpsc::Sender<IncomingStream>,
    listeners: HashMap<String, JoinHandle<()>>,
}

impl LocalSession {
    fn shutdown(self) {
        for (_, listener) in self.listeners {
            listener.abort();
        }
    }
}

struct LocalInner {
    authtoken: Option<String>,
    bind_host: String,
    unreachable: AtomicBool,
    heartbeat_failing: AtomicBool,
    sessions: Mutex<HashMap<String, LocalSession>>,
}

/// Rendezvous service running inside this process.
#[derive(Clone)]
pub struct LocalRendezvous {
    inner: Arc<LocalInner>,
}

impl LocalRendezvous {
    pub fn new() -> Self {
        Self::build(None, "127.0.0.1".to_string())
    }

    /// Require this authtoken on handshake.
    #[must_use]
    pub fn with_authtoken(self, token: impl Into<String>) -> Self {
        Self::build(Some(token.into()), self.inner.bind_host.clone())
    }

    /// Host used for service-assigned tunnel addresses.
    #[must_use]
    pub fn with_bind_host(self, host: impl Into<String>) -> Self {
        Self::build(self.inner.authtoken.clone(), host.into())
    }

    fn build(authtoken: Option<String>, bind_host: String) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                authtoken,
                bind_host,
                unreachable: AtomicBool::new(false),
                heartbeat_failing: AtomicBool::new(false),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Make new handshakes and heartbeats fail as if the service were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::Release);
    }

    /// Make heartbeats fail while leaving the transport up.
    pub fn set_heartbeat_failing(&self, failing: bool) {
        self.inner.heartbeat_failing.store(failing, Ordering::Release);
    }

    /// Drop a session's transport: listeners stop and its inbound channel
    /// closes, exactly what the engine sees when the connection dies.
    pub async fn disconnect(&self, session_id: &str) -> bool {
        let removed = self.inner.sessions.lock().await.remove(session_id);
        match removed {
            Some(session) => {
                session.shutdown();
                info!(session_id, "Local rendezvous dropped session transport");
                true
            }
            None => false,
        }
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.inner.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn tunnel_count(&self, session_id: &str) -> usize {
        self.inner
            .sessions
            .lock()
            .await
            .get(session_id)
            .map_or(0, |s| s.listeners.len())
    }

    fn is_unreachable(&self) -> bool {
        self.inner.unreachable.load(Ordering::Acquire)
    }
}

impl Default for LocalRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Rendezvous for LocalRendezvous {
    async fn handshake(&self, request: HandshakeRequest) -> Result<Handshake, SessionError> {
        if self.is_unreachable() {
            return Err(SessionError::Unreachable("local rendezvous is offline".into()));
        }
        if let Some(expected) = &self.inner.authtoken
            && request.authtoken.as_deref() != Some(expected.as_str())
        {
            return Err(SessionError::AuthRejected("invalid authtoken".into()));
        }

        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        self.inner.sessions.lock().await.insert(
            session_id.clone(),
            LocalSession {
                incoming: tx,
                listeners: HashMap::new(),
            },
        );
        debug!(session_id = %session_id, metadata = %request.metadata, "Local session accepted");
        Ok(Handshake {
            session_id,
            incoming: rx,
        })
    }

    async fn bind(&self, session_id: &str, request: BindRequest) -> Result<Binding, TunnelError> {
        let incoming = self
            .inner
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.incoming.clone())
            .ok_or_else(|| TunnelError::SessionNotActive {
                session_id: session_id.to_string(),
            })?;

        let addr = request
            .remote_addr
            .clone()
            .unwrap_or_else(|| format!("{}:0", self.inner.bind_host));
        let listener = TcpListener::bind(&addr).await.map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => {
                TunnelError::AddressUnavailable(format!("{addr}: {e}"))
            }
            _ => TunnelError::Rejected(format!("cannot listen on {addr}: {e}")),
        })?;
        let public_addr = listener
            .local_addr()
            .map_err(|e| TunnelError::Rejected(e.to_string()))?
            .to_string();

        let tunnel_id = Uuid::new_v4().to_string();
        let task = tokio::spawn(serve_listener(listener, tunnel_id.clone(), incoming));

        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            // Session vanished while we were binding.
            task.abort();
            return Err(TunnelError::SessionNotActive {
                session_id: session_id.to_string(),
            });
        };
        session.listeners.insert(tunnel_id.clone(), task);
        drop(sessions);

        info!(session_id, tunnel_id = %tunnel_id, public_addr = %public_addr, "Local tunnel bound");
        Ok(Binding {
            tunnel_id,
            public_addr,
        })
    }

    async fn unbind(&self, session_id: &str, tunnel_id: &str) -> Result<(), TunnelError> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| TunnelError::SessionNotActive {
                session_id: session_id.to_string(),
            })?;
        let listener = session
            .listeners
            .remove(tunnel_id)
            .ok_or_else(|| TunnelError::Rejected(format!("unknown tunnel {tunnel_id}")))?;
        drop(sessions);
        listener.abort();
        debug!(session_id, tunnel_id, "Local tunnel unbound");
        Ok(())
    }

    async fn heartbeat(&self, session_id: &str) -> Result<Duration, SessionError> {
        let started = Instant::now();
        if self.is_unreachable() || self.inner.heartbeat_failing.load(Ordering::Acquire) {
            return Err(SessionError::Unreachable("heartbeat not answered".into()));
        }
        if !self.inner.sessions.lock().await.contains_key(session_id) {
            return Err(SessionError::Disconnected(format!(
                "unknown session {session_id}"
            )));
        }
        Ok(started.elapsed())
    }

    async fn close(&self, session_id: &str) {
        if let Some(session) = self.inner.sessions.lock().await.remove(session_id) {
            session.shutdown();
            debug!(session_id, "Local session closed");
        }
    }
}

async fn serve_listener(
    listener: TcpListener,
    tunnel_id: String,
    incoming: mpsc::Sender<IncomingStream>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let _ = socket.set_nodelay(true);
                let stream = IncomingStream {
                    tunnel_id: tunnel_id.clone(),
                    peer_addr: peer.to_string(),
                    stream: Box::new(socket),
                };
                if incoming.send(stream).await.is_err() {
                    debug!(tunnel_id = %tunnel_id, "Session gone, stopping listener");
                    return;
                }
            }
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, error = %e, "Local listener accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
