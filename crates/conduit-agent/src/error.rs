//! Error taxonomy of the relay engine.
//!
//! Each component fails with its own enum. Backend and relay errors stay
//! inside the relay that produced them; tunnel errors go to the tunnel owner;
//! session errors invalidate everything opened over the session.

use std::io;
use std::time::Duration;

/// Failures establishing or keeping the rendezvous session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Rendezvous service unreachable: {0}")]
    Unreachable(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Session handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session disconnected: {0}")]
    Disconnected(String),
}

/// Failures opening a tunnel or accepting from it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("Session {session_id} is not active")]
    SessionNotActive { session_id: String },

    #[error("Requested address unavailable: {0}")]
    AddressUnavailable(String),

    #[error("Tunnel rejected: {0}")]
    Rejected(String),

    /// The tunnel or its session closed. Terminal for accept loops.
    #[error("Tunnel closed")]
    Closed,

    #[error("No connection accepted within {0:?}")]
    AcceptTimeout(Duration),
}

/// Failures opening the local backend connection.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend {addr} refused the connection")]
    ConnectionRefused { addr: String },

    #[error("Backend {addr} did not accept within {after:?}")]
    Timeout { addr: String, after: Duration },

    #[error("Cannot resolve backend address {addr}: {reason}")]
    ResolutionFailed { addr: String, reason: String },

    #[error("Cannot connect to backend {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Why a relay ended in `Failed`. Never propagated past the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Relay I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Session left the active state")]
    SessionLost,

    /// The surviving direction was still open when the drain deadline hit.
    #[error("Relay cut while draining after {after:?}")]
    Draining { after: Duration },
}
