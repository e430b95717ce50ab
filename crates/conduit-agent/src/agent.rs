//! Process-wide runtime context.
//!
//! The [`Agent`] owns the session for its lifetime: it connects, opens the
//! configured tunnel, relays every connection to the backend and tears all of
//! it down on shutdown. When the session is lost it reconnects according to
//! its [`ReconnectPolicy`](crate::config::ReconnectPolicy).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use crate::backend::BackendConnector;
use crate::config::AgentConfig;
use crate::error::{SessionError, TunnelError};
use crate::liveness::LivenessMonitor;
use crate::relay::{RelayReport, RelayTracker};
use crate::rendezvous::Rendezvous;
use crate::session::{Session, SessionClient, SessionState};
use crate::tunnel::AcceptLoop;

/// A connection that stayed up this long resets the backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Session unhealthy after {consecutive_failures} missed heartbeats")]
    Unhealthy { consecutive_failures: u32 },
}

impl AgentError {
    /// Rejected credentials will be rejected again; everything else may heal.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Session(SessionError::AuthRejected(_)))
    }
}

pub struct Agent {
    config: AgentConfig,
    rendezvous: Arc<dyn Rendezvous>,
    connector: Arc<dyn BackendConnector>,
    tracker: RelayTracker,
    reports: Option<mpsc::UnboundedSender<RelayReport>>,
    public_addr: watch::Sender<Option<String>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        rendezvous: Arc<dyn Rendezvous>,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        Self {
            config,
            rendezvous,
            connector,
            tracker: RelayTracker::new(),
            reports: None,
            public_addr: watch::Sender::new(None),
        }
    }

    /// Receive a [`RelayReport`] for every finished relay.
    #[must_use]
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<RelayReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Relays currently in flight across all sessions.
    pub fn tracker(&self) -> RelayTracker {
        self.tracker.clone()
    }

    /// Public address of the current tunnel; `None` while disconnected.
    pub fn public_addr(&self) -> watch::Receiver<Option<String>> {
        self.public_addr.subscribe()
    }

    /// Serve until `shutdown` flips, reconnecting after session loss.
    ///
    /// Returns `Ok` on shutdown and the last error once reconnection is
    /// disabled, exhausted, or pointless.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Agent shutting down");
                return Ok(());
            }

            let started = Instant::now();
            let err = match self.connect_and_serve(&mut shutdown).await {
                Ok(()) => {
                    info!("Agent stopped");
                    return Ok(());
                }
                Err(e) => e,
            };

            let Some(policy) = &self.config.reconnect else {
                error!(error = %err, "Session ended and reconnect is disabled");
                return Err(err);
            };
            if !err.is_retryable() {
                error!(error = %err, "Session ended with a permanent error");
                return Err(err);
            }
            if started.elapsed() > STABLE_CONNECTION {
                attempt = 0;
            }
            if !policy.should_retry(attempt) {
                error!(error = %err, attempt, "Max reconnect attempts reached");
                return Err(err);
            }

            let delay = policy.delay_for_attempt(attempt);
            warn!(error = %err, attempt, delay_ms = delay.as_millis(), "Reconnecting");
            tokio::select! {
                () = sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("Agent shutting down during reconnect wait");
                    return Ok(());
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// One session lifetime: connect, serve, tear down.
    async fn connect_and_serve(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        let client = SessionClient::new(Arc::clone(&self.rendezvous), self.config.session.clone());
        let session = client.connect(&self.config.session_metadata).await?;

        let result = self.serve(&session, shutdown).await;

        self.public_addr.send_replace(None);
        session.close().await;
        let aborted = self.tracker.abort_all().await;
        info!(session_id = %session.id(), aborted, "Session torn down");
        result
    }

    async fn serve(
        &self,
        session: &Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        let tunnel = session.open_tunnel(self.config.tunnel.clone()).await?;
        info!(
            session_id = %session.id(),
            public_addr = %tunnel.public_addr(),
            backend_addr = %self.config.backend_addr,
            "Forwarding traffic"
        );
        self.public_addr
            .send_replace(Some(tunnel.public_addr().to_string()));

        let mut accept = AcceptLoop::new(
            tunnel,
            self.config.backend_addr.clone(),
            Arc::clone(&self.connector),
        )
        .with_relay_config(self.config.relay.clone())
        .with_tracker(self.tracker.clone());
        if let Some(reports) = &self.reports {
            accept = accept.with_reports(reports.clone());
        }

        let liveness = LivenessMonitor::new(session.clone(), self.config.liveness.clone()).spawn();
        let mut health = liveness.subscribe();
        let unhealthy = async move { health.wait_for(|s| !s.healthy).await.is_ok() };

        let outcome = tokio::select! {
            result = accept.run() => match result {
                Ok(summary) => {
                    info!(accepted = summary.accepted, failed = summary.failed, "Accept loop ended");
                    Err(session_loss(session))
                }
                Err(e) => Err(e.into()),
            },
            true = unhealthy => {
                let consecutive_failures = liveness.status().consecutive_failures;
                session
                    .fail(SessionError::Disconnected("heartbeat tolerance exceeded".into()))
                    .await;
                Err(AgentError::Unhealthy { consecutive_failures })
            }
            _ = shutdown.changed() => Ok(()),
        };

        liveness.stop().await;
        outcome
    }
}

fn session_loss(session: &Session) -> AgentError {
    match session.state() {
        SessionState::Failed(e) => e.into(),
        state => SessionError::Disconnected(format!("tunnel closed while session {state}")).into(),
    }
}
