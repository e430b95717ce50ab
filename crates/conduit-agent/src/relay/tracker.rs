//! In-memory registry of relays in flight.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::task::{RelayState, RelayStats};

struct TrackedRelay {
    tunnel_id: String,
    peer_addr: String,
    stats: Arc<RelayStats>,
    started: Instant,
    abort: Option<AbortHandle>,
}

/// Point-in-time view of one running relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub relay_id: Uuid,
    pub tunnel_id: String,
    pub peer_addr: String,
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
    pub state: RelayState,
    pub elapsed_ms: u64,
}

/// Thread-safe registry of running relays. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct RelayTracker {
    relays: Arc<RwLock<HashMap<Uuid, TrackedRelay>>>,
}

impl RelayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        relay_id: Uuid,
        tunnel_id: impl Into<String>,
        peer_addr: impl Into<String>,
        stats: Arc<RelayStats>,
    ) {
        self.relays.write().await.insert(
            relay_id,
            TrackedRelay {
                tunnel_id: tunnel_id.into(),
                peer_addr: peer_addr.into(),
                stats,
                started: Instant::now(),
                abort: None,
            },
        );
    }

    /// Attach the task that runs a relay. Returns false if it already finished.
    pub async fn attach_abort(&self, relay_id: Uuid, handle: AbortHandle) -> bool {
        match self.relays.write().await.get_mut(&relay_id) {
            Some(relay) => {
                relay.abort = Some(handle);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, relay_id: Uuid) -> bool {
        self.relays.write().await.remove(&relay_id).is_some()
    }

    pub async fn active_count(&self) -> usize {
        self.relays.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<RelaySnapshot> {
        let relays = self.relays.read().await;
        let mut out: Vec<_> = relays
            .iter()
            .map(|(id, relay)| RelaySnapshot {
                relay_id: *id,
                tunnel_id: relay.tunnel_id.clone(),
                peer_addr: relay.peer_addr.clone(),
                inbound_bytes: relay.stats.inbound_bytes(),
                outbound_bytes: relay.stats.outbound_bytes(),
                state: relay.stats.state(),
                elapsed_ms: u64::try_from(relay.started.elapsed().as_millis())
                    .unwrap_or(u64::MAX),
            })
            .collect();
        out.sort_by_key(|s| std::cmp::Reverse(s.elapsed_ms));
        out
    }

    /// Cancel every tracked relay and forget it. Dropping a relay task closes
    /// both of its streams.
    pub async fn abort_all(&self) -> usize {
        let drained: Vec<_> = self.relays.write().await.drain().collect();
        for (relay_id, relay) in &drained {
            if let Some(handle) = &relay.abort {
                handle.abort();
            }
            debug!(relay_id = %relay_id, "Relay aborted");
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Aborted in-flight relays");
        }
        drained.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_snapshot_remove() {
        let tracker = RelayTracker::new();
        let id = Uuid::new_v4();

        tracker
            .insert(id, "tun-1", "198.51.100.1:4000", Arc::new(RelayStats::new()))
            .await;
        assert_eq!(tracker.active_count().await, 1);

        let snapshot = tracker.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].relay_id, id);
        assert_eq!(snapshot[0].tunnel_id, "tun-1");
        assert_eq!(snapshot[0].peer_addr, "198.51.100.1:4000");
        assert_eq!(snapshot[0].state, RelayState::Running);
        assert_eq!(snapshot[0].inbound_bytes, 0);

        assert!(tracker.remove(id).await);
        assert!(!tracker.remove(id).await);
        assert_eq!(tracker.active_count().await, 0);
    }

    #[tokio::test]
    async fn attach_after_finish_is_rejected() {
        let tracker = RelayTracker::new();
        let task = tokio::spawn(async {});
        assert!(!tracker.attach_abort(Uuid::new_v4(), task.abort_handle()).await);
    }

    #[tokio::test]
    async fn abort_all_cancels_tasks() {
        let tracker = RelayTracker::new();
        let id = Uuid::new_v4();
        tracker
            .insert(id, "tun-1", "peer", Arc::new(RelayStats::new()))
            .await;

        let task = tokio::spawn(std::future::pending::<()>());
        assert!(tracker.attach_abort(id, task.abort_handle()).await);

        assert_eq!(tracker.abort_all().await, 1);
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(tracker.active_count().await, 0);
        assert_eq!(tracker.abort_all().await, 0);
    }
}
