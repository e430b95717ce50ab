//! Conduit Agent Library
//!
//! Core functionality for the Conduit agent:
//! - One outbound session to a rendezvous service
//! - Tunnels that accept inbound connections over that session
//! - A byte relay per connection to a local backend
//! - Liveness monitoring and reconnection

pub mod agent;
pub mod backend;
pub mod config;
pub mod error;
pub mod liveness;
pub mod relay;
pub mod rendezvous;
pub mod session;
pub mod stream;
pub mod tunnel;

pub use agent::{Agent, AgentError};
pub use config::{AgentConfig, ReconnectPolicy};
pub use error::{BackendError, RelayError, SessionError, TunnelError};
