//! Tunnels opened over a session.
//!
//! A [`TunnelHandle`] is the accepting end of one public address. Its
//! [`accept`](TunnelHandle::accept) is the steady-state operation of the
//! agent and is driven by an [`AcceptLoop`].

pub mod accept;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::TunnelError;
use crate::rendezvous::BindRequest;
use crate::session::{Session, SessionState, WeakSession};
use crate::stream::Connection;

pub use accept::{AcceptLoop, AcceptStats, AcceptSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Opening,
    Active,
    Closed,
}

/// Parameters for opening a tunnel.
#[derive(Debug, Clone, Default)]
pub struct TunnelOptions {
    pub metadata: String,
    /// Fixed public address to request.
    pub remote_addr: Option<String>,
    /// Deadline for each `accept()`.
    pub accept_timeout: Option<Duration>,
}

/// One opened tunnel.
pub struct TunnelHandle {
    id: String,
    public_addr: String,
    metadata: String,
    session_id: String,
    session: WeakSession,
    session_state: watch::Receiver<SessionState>,
    state: Arc<watch::Sender<TunnelState>>,
    incoming: mpsc::Receiver<Connection>,
    accept_timeout: Option<Duration>,
}

impl TunnelHandle {
    /// Bind a new tunnel on an active session.
    pub async fn open(session: &Session, options: TunnelOptions) -> Result<Self, TunnelError> {
        debug!(
            session_id = %session.id(),
            state = ?TunnelState::Opening,
            remote_addr = ?options.remote_addr,
            "Opening tunnel"
        );
        let (binding, incoming, state) = session
            .bind_tunnel(BindRequest {
                metadata: options.metadata.clone(),
                remote_addr: options.remote_addr.clone(),
            })
            .await?;

        info!(
            session_id = %session.id(),
            tunnel_id = %binding.tunnel_id,
            public_addr = %binding.public_addr,
            metadata = %options.metadata,
            "Tunnel active"
        );
        Ok(Self {
            id: binding.tunnel_id,
            public_addr: binding.public_addr,
            metadata: options.metadata,
            session_id: session.id().to_string(),
            session: session.downgrade(),
            session_state: session.subscribe(),
            state,
            incoming,
            accept_timeout: options.accept_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address assigned by the rendezvous service.
    pub fn public_addr(&self) -> &str {
        &self.public_addr
    }

    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// State feed of the owning session, for components that must stop when
    /// it goes away.
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.session_state.clone()
    }

    /// Handle that can close this tunnel from another task.
    pub fn controller(&self) -> TunnelController {
        TunnelController {
            id: self.id.clone(),
            session: self.session.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Wait for the next inbound connection.
    ///
    /// Fails with [`TunnelError::Closed`] once the tunnel or its session is
    /// closed, every time it is called from then on.
    pub async fn accept(&mut self) -> Result<Connection, TunnelError> {
        if self.state() == TunnelState::Closed {
            return Err(TunnelError::Closed);
        }
        if !self.session_state.borrow().is_active() {
            self.state.send_replace(TunnelState::Closed);
            return Err(TunnelError::Closed);
        }

        let mut tunnel_state = self.state.subscribe();
        let mut session_state = self.session_state.clone();
        let incoming = &mut self.incoming;
        let next = async move {
            tokio::select! {
                biased;
                _ = tunnel_state.wait_for(|s| *s == TunnelState::Closed) => None,
                _ = session_state.wait_for(|s| !s.is_active()) => None,
                conn = incoming.recv() => conn,
            }
        };

        let conn = match self.accept_timeout {
            Some(limit) => tokio::time::timeout(limit, next)
                .await
                .map_err(|_| TunnelError::AcceptTimeout(limit))?,
            None => next.await,
        };

        conn.ok_or_else(|| {
            self.state.send_replace(TunnelState::Closed);
            TunnelError::Closed
        })
    }

    /// Close the tunnel and drop connections that were queued but never
    /// accepted.
    pub async fn close(&mut self) -> Result<(), TunnelError> {
        let result = self.controller().close().await;
        self.incoming.close();
        while let Ok(mut conn) = self.incoming.try_recv() {
            let _ = conn.close().await;
        }
        result
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if self.state() != TunnelState::Closed
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            let controller = self.controller();
            runtime.spawn(async move {
                let _ = controller.close().await;
            });
        }
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("public_addr", &self.public_addr)
            .field("metadata", &self.metadata)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Closes a tunnel from outside its accept loop.
#[derive(Clone)]
pub struct TunnelController {
    id: String,
    session: WeakSession,
    state: Arc<watch::Sender<TunnelState>>,
}

impl TunnelController {
    pub fn is_closed(&self) -> bool {
        *self.state.borrow() == TunnelState::Closed
    }

    /// Close the tunnel, waking any pending `accept()`. Idempotent.
    pub async fn close(&self) -> Result<(), TunnelError> {
        self.state.send_replace(TunnelState::Closed);
        match self.session.upgrade() {
            Some(session) => session.close_tunnel(&self.id).await,
            None => Ok(()),
        }
    }
}
