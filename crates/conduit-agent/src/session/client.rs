//! Establishes sessions against a rendezvous service.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use super::Session;
use crate::error::SessionError;
use crate::rendezvous::{HandshakeRequest, Rendezvous};

/// Settings applied to every handshake.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub authtoken: Option<String>,
    /// Deadline for the whole handshake; `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            authtoken: None,
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Opens sessions. Holds no session state itself and never reconnects;
/// reconnection is the caller's policy.
#[derive(Clone)]
pub struct SessionClient {
    rendezvous: Arc<dyn Rendezvous>,
    config: SessionConfig,
}

impl SessionClient {
    pub fn new(rendezvous: Arc<dyn Rendezvous>, config: SessionConfig) -> Self {
        Self { rendezvous, config }
    }

    /// Perform the handshake and return an `Active` session.
    pub async fn connect(&self, metadata: &str) -> Result<Session, SessionError> {
        let request = HandshakeRequest {
            metadata: metadata.to_string(),
            authtoken: self.config.authtoken.clone(),
        };

        let handshake = match self.config.connect_timeout {
            Some(limit) => timeout(limit, self.rendezvous.handshake(request))
                .await
                .map_err(|_| SessionError::Timeout(limit))?,
            None => self.rendezvous.handshake(request).await,
        }
        .inspect_err(|e| warn!(error = %e, "Session handshake failed"))?;

        let session = Session::start(
            Arc::clone(&self.rendezvous),
            handshake,
            metadata.to_string(),
        );
        info!(session_id = %session.id(), metadata, "Session established");
        Ok(session)
    }
}
