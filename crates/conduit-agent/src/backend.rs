//! Outbound connections to the local backend service.

use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, lookup_host};
use tracing::debug;

use crate::error::BackendError;
use crate::stream::{BackendStream, OpenStreams};

/// Opens a fresh backend connection per relay.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn open(&self, addr: &str) -> Result<BackendStream, BackendError>;
}

/// Run `dial` under an optional deadline; expiry is [`BackendError::Timeout`].
pub(crate) async fn connect_within<T>(
    addr: &str,
    limit: Option<Duration>,
    dial: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    let Some(after) = limit else {
        return dial.await;
    };
    match tokio::time::timeout(after, dial).await {
        Ok(result) => result,
        Err(_) => {
            debug!(addr, after_ms = after.as_millis(), "Backend connect timed out");
            Err(BackendError::Timeout {
                addr: addr.to_string(),
                after,
            })
        }
    }
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Option<Duration>,
    open: OpenStreams,
}

impl TcpConnector {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            open: OpenStreams::new(),
        }
    }

    /// Backend streams opened through this connector that are still open.
    pub fn open_count(&self) -> usize {
        self.open.count()
    }

    async fn dial(addr: &str) -> Result<TcpStream, BackendError> {
        let candidates: Vec<_> = lookup_host(addr)
            .await
            .map_err(|e| BackendError::ResolutionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?
            .collect();
        if candidates.is_empty() {
            return Err(BackendError::ResolutionFailed {
                addr: addr.to_string(),
                reason: "no addresses".into(),
            });
        }

        let mut last_err = None;
        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(addr, candidate = %candidate, error = %e, "Backend candidate failed");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                BackendError::ConnectionRefused {
                    addr: addr.to_string(),
                }
            }
            Some(source) => BackendError::Connect {
                addr: addr.to_string(),
                source,
            },
            None => BackendError::ResolutionFailed {
                addr: addr.to_string(),
                reason: "no addresses".into(),
            },
        })
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(5)))
    }
}

#[async_trait]
impl BackendConnector for TcpConnector {
    async fn open(&self, addr: &str) -> Result<BackendStream, BackendError> {
        let stream = connect_within(addr, self.connect_timeout, Self::dial(addr)).await?;
        let _ = stream.set_nodelay(true);
        debug!(addr, "Backend connection opened");
        Ok(BackendStream::new(addr, Box::new(stream), &self.open))
    }
}
