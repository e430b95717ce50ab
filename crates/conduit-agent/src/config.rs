//! Runtime configuration of the agent.

use std::time::Duration;

use conduit_core::Config;
use conduit_core::config::ReconnectSettings;

use crate::liveness::LivenessConfig;
use crate::relay::RelayConfig;
use crate::session::SessionConfig;
use crate::tunnel::TunnelOptions;

/// Everything the agent needs to serve one tunnel.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub session: SessionConfig,
    /// Opaque metadata sent with the session handshake.
    pub session_metadata: String,
    pub tunnel: TunnelOptions,
    /// Local service every connection is relayed to.
    pub backend_addr: String,
    pub backend_connect_timeout: Option<Duration>,
    pub relay: RelayConfig,
    pub liveness: LivenessConfig,
    /// `None` disables reconnection; the agent exits when the session ends.
    pub reconnect: Option<ReconnectPolicy>,
}

impl AgentConfig {
    /// Config with defaults for everything but the backend address.
    pub fn new(backend_addr: impl Into<String>) -> Self {
        Self {
            session: SessionConfig::default(),
            session_metadata: String::new(),
            tunnel: TunnelOptions::default(),
            backend_addr: backend_addr.into(),
            backend_connect_timeout: Some(Duration::from_secs(5)),
            relay: RelayConfig::default(),
            liveness: LivenessConfig::default(),
            reconnect: Some(ReconnectPolicy::default()),
        }
    }

    /// Build from resolved settings.
    pub fn from_settings(settings: &Config) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            session: SessionConfig {
                authtoken: settings.session.authtoken.clone(),
                connect_timeout: secs(settings.session.connect_timeout_secs),
            },
            session_metadata: settings.session.metadata.clone(),
            tunnel: TunnelOptions {
                metadata: settings.tunnel.metadata.clone(),
                remote_addr: settings.tunnel.remote_addr.clone(),
                accept_timeout: settings.tunnel.accept_timeout_secs.and_then(secs),
            },
            backend_addr: settings.backend.addr.clone(),
            backend_connect_timeout: settings.backend.connect_timeout_secs.and_then(secs),
            relay: RelayConfig {
                chunk_size: settings.relay.chunk_size,
                drain_timeout: Duration::from_secs(settings.relay.drain_timeout_secs),
            },
            liveness: LivenessConfig {
                interval: Duration::from_secs(settings.session.heartbeat_interval_secs),
                tolerance: Duration::from_secs(settings.session.heartbeat_tolerance_secs),
            },
            reconnect: settings
                .reconnect
                .enabled
                .then(|| ReconnectPolicy::from(&settings.reconnect)),
        }
    }
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of reconnect attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            max_attempts: settings.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (0-indexed), capped at `max_delay`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}
