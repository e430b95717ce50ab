//! Seam to the remote rendezvous service.
//!
//! The wire protocol that authenticates and multiplexes the outbound session
//! lives behind [`Rendezvous`]. The engine only needs a session id, a way to
//! bind and unbind tunnels, a heartbeat, and a channel of inbound streams.

pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{SessionError, TunnelError};
use crate::stream::BoxedStream;

pub use local::LocalRendezvous;

/// Handshake parameters sent when the session is established.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    pub metadata: String,
    pub authtoken: Option<String>,
}

/// Accepted session. When `incoming` yields `None` the transport is gone.
pub struct Handshake {
    pub session_id: String,
    pub incoming: mpsc::Receiver<IncomingStream>,
}

/// Tunnel bind parameters.
#[derive(Debug, Clone, Default)]
pub struct BindRequest {
    pub metadata: String,
    /// Fixed public address to request; `None` lets the service assign one.
    pub remote_addr: Option<String>,
}

/// A tunnel the service agreed to route to this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub tunnel_id: String,
    pub public_addr: String,
}

/// Inbound logical stream routed by the service to one of our tunnels.
pub struct IncomingStream {
    pub tunnel_id: String,
    pub peer_addr: String,
    pub stream: BoxedStream,
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("tunnel_id", &self.tunnel_id)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Operations the engine needs from the rendezvous service.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Authenticate and establish a session.
    async fn handshake(&self, request: HandshakeRequest) -> Result<Handshake, SessionError>;

    /// Ask the service to route a new public address to this session.
    async fn bind(&self, session_id: &str, request: BindRequest) -> Result<Binding, TunnelError>;

    /// Stop routing a tunnel.
    async fn unbind(&self, session_id: &str, tunnel_id: &str) -> Result<(), TunnelError>;

    /// Round-trip a heartbeat and return its latency.
    async fn heartbeat(&self, session_id: &str) -> Result<Duration, SessionError>;

    /// Release every remote resource held by the session.
    async fn close(&self, session_id: &str);
}
