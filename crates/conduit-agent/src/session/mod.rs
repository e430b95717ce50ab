//! The single outbound session to the rendezvous service.
//!
//! A [`Session`] owns the routing of inbound streams to its tunnels and
//! publishes its [`SessionState`] on a watch channel. Tunnels, accept loops,
//! relays and the liveness monitor subscribe to that channel; once the
//! session leaves `Active` all of them wind down.

pub mod client;
pub mod state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SessionError, TunnelError};
use crate::rendezvous::{BindRequest, Binding, Handshake, IncomingStream, Rendezvous};
use crate::stream::{Connection, OpenStreams};
use crate::tunnel::{TunnelHandle, TunnelOptions, TunnelState};

pub use client::{SessionClient, SessionConfig};
pub use state::SessionState;

/// Connections queued per tunnel; further arrivals are refused until the
/// owner accepts.
const TUNNEL_QUEUE_CAPACITY: usize = 64;

struct TunnelRoute {
    tx: mpsc::Sender<Connection>,
    state: Arc<watch::Sender<TunnelState>>,
}

struct SessionInner {
    id: String,
    metadata: String,
    rendezvous: Arc<dyn Rendezvous>,
    state: watch::Sender<SessionState>,
    routes: RwLock<HashMap<String, TunnelRoute>>,
    router: Mutex<Option<JoinHandle<()>>>,
    open_streams: OpenStreams,
}

impl SessionInner {
    fn transition(&self, next: SessionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_become(&next) {
                *current = next.clone();
                true
            } else {
                false
            }
        });
        if changed {
            info!(session_id = %self.id, state = %next, "Session state changed");
        }
        changed
    }

    async fn route(&self, incoming: IncomingStream) {
        let IncomingStream {
            tunnel_id,
            peer_addr,
            stream,
        } = incoming;

        let tx = self
            .routes
            .read()
            .await
            .get(&tunnel_id)
            .map(|route| route.tx.clone());
        let Some(tx) = tx else {
            warn!(
                session_id = %self.id,
                tunnel_id = %tunnel_id,
                peer_addr = %peer_addr,
                "Dropping stream for unknown tunnel"
            );
            return;
        };

        let conn = Connection::new(tunnel_id.clone(), peer_addr, stream, &self.open_streams);
        debug!(
            session_id = %self.id,
            tunnel_id = %tunnel_id,
            connection_id = %conn.id(),
            peer_addr = %conn.peer_addr(),
            "Routing inbound connection"
        );
        // Never wait on one tunnel's queue: other tunnels share this router.
        match tx.try_send(conn) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(mut conn)) => {
                warn!(
                    session_id = %self.id,
                    tunnel_id = %tunnel_id,
                    connection_id = %conn.id(),
                    capacity = TUNNEL_QUEUE_CAPACITY,
                    "Tunnel queue full, refusing connection"
                );
                let _ = conn.close().await;
            }
            Err(mpsc::error::TrySendError::Closed(mut conn)) => {
                debug!(tunnel_id = %tunnel_id, "Tunnel handle dropped, removing route");
                let _ = conn.close().await;
                self.routes.write().await.remove(&tunnel_id);
            }
        }
    }

    async fn close_routes(&self) {
        let routes: Vec<_> = self.routes.write().await.drain().collect();
        for (tunnel_id, route) in routes {
            route.state.send_replace(TunnelState::Closed);
            debug!(session_id = %self.id, tunnel_id = %tunnel_id, "Tunnel closed with session");
        }
    }

    fn stop_router(&self) {
        if let Ok(mut router) = self.router.lock()
            && let Some(handle) = router.take()
        {
            handle.abort();
        }
    }

    async fn fail(&self, error: SessionError) {
        if self.transition(SessionState::Failed(error.clone())) {
            warn!(session_id = %self.id, error = %error, "Session failed");
            self.close_routes().await;
            self.rendezvous.close(&self.id).await;
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.stop_router();
        if !self.state.borrow().is_terminal()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            let rendezvous = Arc::clone(&self.rendezvous);
            let id = self.id.clone();
            runtime.spawn(async move { rendezvous.close(&id).await });
        }
    }
}

/// An established session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Back-reference to a session that does not keep it alive.
#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    pub(crate) fn start(
        rendezvous: Arc<dyn Rendezvous>,
        handshake: Handshake,
        metadata: String,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        let inner = Arc::new(SessionInner {
            id: handshake.session_id,
            metadata,
            rendezvous,
            state,
            routes: RwLock::new(HashMap::new()),
            router: Mutex::new(None),
            open_streams: OpenStreams::new(),
        });

        let router = tokio::spawn(route_incoming(Arc::downgrade(&inner), handshake.incoming));
        if let Ok(mut slot) = inner.router.lock() {
            *slot = Some(router);
        }
        inner.transition(SessionState::Active);
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn metadata(&self) -> &str {
        &self.inner.metadata
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.state.borrow().is_active()
    }

    /// Watch state changes. The receiver errors once the session is dropped.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    /// Connections routed through this session that are still open.
    pub fn open_connections(&self) -> usize {
        self.inner.open_streams.count()
    }

    pub async fn tunnel_count(&self) -> usize {
        self.inner.routes.read().await.len()
    }

    /// Open a tunnel over this session.
    pub async fn open_tunnel(&self, options: TunnelOptions) -> Result<TunnelHandle, TunnelError> {
        TunnelHandle::open(self, options).await
    }

    pub(crate) async fn bind_tunnel(
        &self,
        request: BindRequest,
    ) -> Result<
        (
            Binding,
            mpsc::Receiver<Connection>,
            Arc<watch::Sender<TunnelState>>,
        ),
        TunnelError,
    > {
        if !self.is_alive() {
            return Err(self.not_active());
        }
        let binding = self.inner.rendezvous.bind(&self.inner.id, request).await?;

        if !self.is_alive() {
            // Lost the session while binding; the service already dropped it.
            return Err(self.not_active());
        }

        let (tx, rx) = mpsc::channel(TUNNEL_QUEUE_CAPACITY);
        let (state, _) = watch::channel(TunnelState::Active);
        let state = Arc::new(state);
        self.inner.routes.write().await.insert(
            binding.tunnel_id.clone(),
            TunnelRoute {
                tx,
                state: Arc::clone(&state),
            },
        );
        Ok((binding, rx, state))
    }

    /// Stop routing a tunnel and release it at the service. Closing an
    /// unknown or already closed tunnel succeeds.
    pub async fn close_tunnel(&self, tunnel_id: &str) -> Result<(), TunnelError> {
        let route = self.inner.routes.write().await.remove(tunnel_id);
        let Some(route) = route else {
            return Ok(());
        };
        route.state.send_replace(TunnelState::Closed);
        drop(route.tx);

        if self.is_alive() {
            self.inner
                .rendezvous
                .unbind(&self.inner.id, tunnel_id)
                .await?;
        }
        info!(session_id = %self.inner.id, tunnel_id, "Tunnel closed");
        Ok(())
    }

    /// Round-trip a heartbeat through the service.
    pub async fn heartbeat(&self) -> Result<Duration, SessionError> {
        if !self.is_alive() {
            return Err(SessionError::Disconnected(format!(
                "session is {}",
                self.state()
            )));
        }
        self.inner.rendezvous.heartbeat(&self.inner.id).await
    }

    /// Mark the session as lost. Every tunnel closes and every relay under it
    /// observes the transition.
    pub async fn fail(&self, error: SessionError) {
        self.inner.fail(error).await;
    }

    /// Close the session and everything opened over it. Idempotent.
    pub async fn close(&self) {
        if self.inner.transition(SessionState::Closed) {
            self.inner.close_routes().await;
            self.inner.stop_router();
            self.inner.rendezvous.close(&self.inner.id).await;
        }
    }

    fn not_active(&self) -> TunnelError {
        TunnelError::SessionNotActive {
            session_id: self.inner.id.clone(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("metadata", &self.inner.metadata)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

async fn route_incoming(session: Weak<SessionInner>, mut incoming: mpsc::Receiver<IncomingStream>) {
    while let Some(stream) = incoming.recv().await {
        let Some(inner) = session.upgrade() else {
            return;
        };
        inner.route(stream).await;
    }
    if let Some(inner) = session.upgrade() {
        inner
            .fail(SessionError::Disconnected(
                "rendezvous transport closed".into(),
            ))
            .await;
    }
}
