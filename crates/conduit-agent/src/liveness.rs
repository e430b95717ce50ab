//! Periodic session liveness checks, independent of relay traffic.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Time between heartbeats.
    pub interval: Duration,
    /// How long the session may go without an answered heartbeat before it is
    /// reported unhealthy. Also bounds each heartbeat round-trip.
    pub tolerance: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            tolerance: Duration::from_secs(15),
        }
    }
}

/// Latest observation published by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivenessStatus {
    pub last_latency: Option<Duration>,
    pub consecutive_failures: u32,
    pub healthy: bool,
}

impl Default for LivenessStatus {
    fn default() -> Self {
        Self {
            last_latency: None,
            consecutive_failures: 0,
            healthy: true,
        }
    }
}

type LatencyCallback = Box<dyn FnMut(Duration) + Send>;

/// Heartbeats a session on a fixed period and publishes what it sees.
///
/// Purely diagnostic: it never touches relays or the session itself. The
/// owner decides what an unhealthy status means.
pub struct LivenessMonitor {
    session: Session,
    config: LivenessConfig,
    on_latency: Option<LatencyCallback>,
}

impl LivenessMonitor {
    pub fn new(session: Session, config: LivenessConfig) -> Self {
        Self {
            session,
            config,
            on_latency: None,
        }
    }

    /// Called after every heartbeat with its latency, or `Duration::ZERO`
    /// when it went unanswered.
    #[must_use]
    pub fn with_callback(mut self, callback: impl FnMut(Duration) + Send + 'static) -> Self {
        self.on_latency = Some(Box::new(callback));
        self
    }

    /// Start the monitor. It runs until stopped, until its handle is dropped,
    /// or until the session leaves `Active`.
    pub fn spawn(self) -> LivenessHandle {
        let (status_tx, status) = watch::channel(LivenessStatus::default());
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(status_tx, stop_rx));
        LivenessHandle { status, stop, task }
    }

    async fn run(mut self, status: watch::Sender<LivenessStatus>, mut stop: watch::Receiver<bool>) {
        let session_id = self.session.id().to_string();
        let mut session_state = self.session.subscribe();
        let mut timer = interval(self.config.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        let mut last_ok = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => {
                    debug!(session_id = %session_id, "Liveness monitor stopped");
                    return;
                }
                _ = session_state.wait_for(|s| !s.is_active()) => {
                    info!(session_id = %session_id, "Session no longer active, liveness monitor exiting");
                    return;
                }
                _ = timer.tick() => {}
            }

            let answered = match timeout(self.config.tolerance, self.session.heartbeat()).await {
                Ok(Ok(latency)) => Ok(latency),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("no answer within {:?}", self.config.tolerance)),
            };

            match answered {
                Ok(latency) => {
                    last_ok = Instant::now();
                    debug!(session_id = %session_id, latency_ms = latency.as_millis(), "Heartbeat answered");
                    if let Some(callback) = self.on_latency.as_mut() {
                        callback(latency);
                    }
                    status.send_replace(LivenessStatus {
                        last_latency: Some(latency),
                        consecutive_failures: 0,
                        healthy: true,
                    });
                }
                Err(reason) => {
                    if let Some(callback) = self.on_latency.as_mut() {
                        callback(Duration::ZERO);
                    }
                    let healthy = last_ok.elapsed() <= self.config.tolerance;
                    status.send_modify(|s| {
                        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                        s.healthy = healthy;
                    });
                    warn!(
                        session_id = %session_id,
                        error = %reason,
                        consecutive_failures = status.borrow().consecutive_failures,
                        healthy,
                        "Heartbeat missed"
                    );
                }
            }
        }
    }
}

/// Owner's side of a running monitor.
pub struct LivenessHandle {
    status: watch::Receiver<LivenessStatus>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LivenessHandle {
    pub fn status(&self) -> LivenessStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LivenessStatus> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the monitor and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rendezvous::LocalRendezvous;
    use crate::session::{SessionClient, SessionConfig};
    use std::sync::{Arc, Mutex};

    async fn session(rendezvous: &Arc<LocalRendezvous>) -> Session {
        SessionClient::new(rendezvous.clone(), SessionConfig::default())
            .connect("m")
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn reports_latency_each_interval() {
        let rendezvous = Arc::new(LocalRendezvous::new());
        let session = session(&rendezvous).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let handle = LivenessMonitor::new(session, LivenessConfig::default())
            .with_callback(move |latency| sink.lock().unwrap().push(latency))
            .spawn();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(seen.lock().unwrap().len(), 3);
        let status = handle.status();
        assert!(status.healthy);
        assert!(status.last_latency.is_some());
        assert_eq!(status.consecutive_failures, 0);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_become_unhealthy_after_tolerance() {
        let rendezvous = Arc::new(LocalRendezvous::new());
        let session = session(&rendezvous).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let handle = LivenessMonitor::new(session, LivenessConfig::default())
            .with_callback(move |latency| sink.lock().unwrap().push(latency))
            .spawn();
        rendezvous.set_heartbeat_failing(true);

        // First miss at 10s is still within the 15s tolerance.
        tokio::time::sleep(Duration::from_secs(12)).await;
        let status = handle.status();
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.healthy);

        let mut watch = handle.subscribe();
        watch.wait_for(|s| !s.healthy).await.unwrap();
        assert_eq!(handle.status().consecutive_failures, 2);
        assert!(seen.lock().unwrap().iter().all(|d| d.is_zero()));

        // Recovery flips it back.
        rendezvous.set_heartbeat_failing(false);
        watch.wait_for(|s| s.healthy).await.unwrap();
        assert_eq!(handle.status().consecutive_failures, 0);
        handle.stop().await;
    }

    #[tokio::test]
    async fn exits_when_session_closes() {
        let rendezvous = Arc::new(LocalRendezvous::new());
        let session = session(&rendezvous).await;
        let handle = LivenessMonitor::new(session.clone(), LivenessConfig::default()).spawn();
        assert!(handle.is_running());

        session.close().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        handle.stop().await;
    }
}
