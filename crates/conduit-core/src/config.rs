//! Settings resolution for Conduit.
//!
//! Implements hierarchical settings resolution:
//! 1. Built-in defaults
//! 2. Global settings (~/.config/conduit/settings.json)
//! 3. Explicit settings file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete Conduit configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

/// Outbound session to the rendezvous service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Opaque metadata attached to the session.
    pub metadata: String,
    pub authtoken: Option<String>,
    pub connect_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Grace period past a missed heartbeat before the session is unhealthy.
    pub heartbeat_tolerance_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            metadata: String::new(),
            authtoken: None,
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 10,
            heartbeat_tolerance_secs: 15,
        }
    }
}

/// Tunnel opened over the session.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct TunnelSettings {
    pub metadata: String,
    /// Fixed public address to request instead of a service-assigned one.
    pub remote_addr: Option<String>,
    /// Deadline for a single `accept()`; `None` waits indefinitely.
    pub accept_timeout_secs: Option<u64>,
}

/// Local backend every accepted connection is bridged to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendSettings {
    pub addr: String,
    pub connect_timeout_secs: Option<u64>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            connect_timeout_secs: Some(5),
        }
    }
}

/// Per-connection byte relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySettings {
    /// Maximum bytes read per copy step.
    pub chunk_size: usize,
    /// How long the surviving direction may keep draining after the other
    /// direction failed.
    pub drain_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            drain_timeout_secs: 5,
        }
    }
}

/// Reconnect backoff applied by the agent when the session is lost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl Config {
    /// Check values that would make the engine misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.backend.addr.trim().is_empty() {
            return Err(Error::Config("backend.addr must not be empty".into()));
        }
        if self.relay.chunk_size == 0 {
            return Err(Error::Config("relay.chunk_size must be positive".into()));
        }
        if self.session.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "session.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.session.heartbeat_tolerance_secs == 0 {
            return Err(Error::Config(
                "session.heartbeat_tolerance_secs must be positive".into(),
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(Error::Config(
                "reconnect.multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// A missing global file is ignored; a missing explicit file is an error.
/// The result is not validated: callers merge CLI flags first and then call
/// [`Config::validate`].
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    if let Some(path) = explicit {
        config = load_config_file(path)?;
    }

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Get the global settings file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("conduit").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), "Loaded settings file");
    Ok(config)
}

/// Apply `CONDUIT_*` overrides from the process environment.
pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("CONDUIT_SESSION_METADATA") {
        config.session.metadata = val;
    }
    if let Some(val) = lookup("CONDUIT_AUTHTOKEN") {
        config.session.authtoken = Some(val);
    }
    if let Some(n) = lookup("CONDUIT_HEARTBEAT_INTERVAL").and_then(|v| v.parse().ok()) {
        config.session.heartbeat_interval_secs = n;
    }
    if let Some(val) = lookup("CONDUIT_TUNNEL_METADATA") {
        config.tunnel.metadata = val;
    }
    if let Some(val) = lookup("CONDUIT_REMOTE_ADDR") {
        config.tunnel.remote_addr = Some(val);
    }
    if let Some(val) = lookup("CONDUIT_BACKEND_ADDR") {
        config.backend.addr = val;
    }
    if let Some(n) = lookup("CONDUIT_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
        config.relay.chunk_size = n;
    }
}
