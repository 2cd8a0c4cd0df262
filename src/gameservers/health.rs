//! Health monitoring driven by sidecar pings.
//!
//! The sidecar streams health pings at `spec.health.period_seconds`. A server
//! that misses `failure_threshold` consecutive periods after its initial
//! delay is marked Unhealthy. Allocated and Reserved servers are never
//! demoted here; neither is anything already terminal.

use crate::resources::{GameServerState, ObjectKey, Resource};
use crate::store::{update_with_retry, EventRecorder, Store};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Tracks sidecar health pings and sweeps for missed deadlines.
pub struct HealthMonitor {
    store: Arc<Store>,
    recorder: EventRecorder,
    last_ping: DashMap<ObjectKey, Instant>,
    first_seen: DashMap<ObjectKey, Instant>,
}

impl HealthMonitor {
    /// Build a monitor over the store.
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        let recorder = EventRecorder::new(store.clone(), "health-controller");
        Arc::new(Self {
            store,
            recorder,
            last_ping: DashMap::new(),
            first_seen: DashMap::new(),
        })
    }

    /// Record a health ping from the sidecar.
    pub fn ping(&self, key: &ObjectKey) {
        self.last_ping.insert(key.clone(), Instant::now());
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        for gs in self.store.game_servers.snapshot() {
            let key = gs.key();
            if gs.spec.health.disabled || gs.metadata.is_being_deleted() {
                continue;
            }
            // Health applies between scheduling and allocation.
            if !matches!(
                gs.status.state,
                GameServerState::Scheduled | GameServerState::RequestReady | GameServerState::Ready
            ) {
                self.first_seen.remove(&key);
                self.last_ping.remove(&key);
                continue;
            }

            let first_seen = *self.first_seen.entry(key.clone()).or_insert(now);
            let grace = Duration::from_secs(gs.spec.health.initial_delay_seconds as u64);
            if now.duration_since(first_seen) < grace {
                continue;
            }

            let budget = Duration::from_secs(
                (gs.spec.health.period_seconds as u64)
                    .saturating_mul(gs.spec.health.failure_threshold as u64),
            );
            let last = self
                .last_ping
                .get(&key)
                .map(|e| *e)
                .unwrap_or(first_seen + grace);
            if now.duration_since(last) <= budget {
                continue;
            }

            warn!(game_server = %key, "health pings missed, marking Unhealthy");
            let result = update_with_retry(&self.store.game_servers, &key, |gs| {
                if matches!(
                    gs.status.state,
                    GameServerState::Scheduled
                        | GameServerState::RequestReady
                        | GameServerState::Ready
                ) {
                    gs.status.state = GameServerState::Unhealthy;
                    true
                } else {
                    false
                }
            });
            match result {
                Ok(updated) => {
                    if updated.status.state == GameServerState::Unhealthy {
                        self.recorder.warning(
                            &updated,
                            "Unhealthy",
                            format!(
                                "no health ping for {}s",
                                now.duration_since(last).as_secs()
                            ),
                        );
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => debug!(game_server = %key, error = %e, "unhealthy transition failed"),
            }
            self.first_seen.remove(&key);
            self.last_ping.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{GameServer, Health, Metadata};

    fn monitored(name: &str, state: GameServerState) -> GameServer {
        let mut gs = GameServer {
            metadata: Metadata::named("default", name),
            ..GameServer::default()
        };
        gs.spec.health = Health {
            disabled: false,
            initial_delay_seconds: 0,
            period_seconds: 1,
            failure_threshold: 1,
        };
        gs.status.state = state;
        gs
    }

    #[tokio::test]
    async fn silent_server_goes_unhealthy() {
        let store = Store::new();
        let monitor = HealthMonitor::new(store.clone());
        let created = store
            .game_servers
            .create(monitored("quiet", GameServerState::Ready))
            .unwrap();

        monitor.sweep(); // establishes first_seen
        tokio::time::sleep(Duration::from_millis(1100)).await;
        monitor.sweep();

        let gs = store.game_servers.get(&created.key()).unwrap();
        assert_eq!(gs.status.state, GameServerState::Unhealthy);
    }

    #[tokio::test]
    async fn pinging_server_stays_ready() {
        let store = Store::new();
        let monitor = HealthMonitor::new(store.clone());
        let created = store
            .game_servers
            .create(monitored("chatty", GameServerState::Ready))
            .unwrap();

        monitor.sweep();
        tokio::time::sleep(Duration::from_millis(600)).await;
        monitor.ping(&created.key());
        tokio::time::sleep(Duration::from_millis(600)).await;
        monitor.sweep();

        let gs = store.game_servers.get(&created.key()).unwrap();
        assert_eq!(gs.status.state, GameServerState::Ready);
    }

    #[tokio::test]
    async fn allocated_servers_are_left_alone() {
        let store = Store::new();
        let monitor = HealthMonitor::new(store.clone());
        let created = store
            .game_servers
            .create(monitored("session", GameServerState::Allocated))
            .unwrap();

        monitor.sweep();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        monitor.sweep();

        let gs = store.game_servers.get(&created.key()).unwrap();
        assert_eq!(gs.status.state, GameServerState::Allocated);
    }
}
