//! Sidecar-facing SDK service. Every call here is what a sidecar proxies on
//! behalf of the game-server binary; each one flips the GameServer's state or
//! metadata in the store.

use super::health::HealthMonitor;
use crate::resources::{GameServer, GameServerState, ObjectKey, Resource};
use crate::store::{update_with_retry, Store, StoreError, WatchEvent};
use crate::SDK_METADATA_PREFIX;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// SDK service result type.
pub type Result<T> = std::result::Result<T, SdkError>;

/// SDK call failures.
#[derive(Debug, Error)]
pub enum SdkError {
    /// The requested transition is not allowed from the current state.
    #[error("cannot move {key} from {from} via {call}")]
    InvalidTransition {
        /// Target server.
        key: ObjectKey,
        /// Its current state.
        from: GameServerState,
        /// The SDK call attempted.
        call: &'static str,
    },

    /// The store rejected the operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Sidecar-facing operations on GameServers.
#[derive(Clone)]
pub struct SdkService {
    store: Arc<Store>,
    health: Arc<HealthMonitor>,
}

impl SdkService {
    /// Build the service.
    pub fn new(store: Arc<Store>, health: Arc<HealthMonitor>) -> Self {
        Self { store, health }
    }

    /// The game binary signalled readiness. Drives Scheduled (and friends)
    /// to RequestReady; a Reserved server returns towards Ready the same way.
    pub fn ready(&self, key: &ObjectKey) -> Result<GameServer> {
        self.transition(key, "Ready", |gs| match gs.status.state {
            GameServerState::Starting
            | GameServerState::Scheduled
            | GameServerState::RequestReady => {
                gs.status.state = GameServerState::RequestReady;
                true
            }
            GameServerState::Reserved => {
                gs.status.state = GameServerState::RequestReady;
                gs.status.reserved_until = None;
                true
            }
            // Already there; idempotent.
            GameServerState::Ready => true,
            _ => false,
        })
    }

    /// Streaming health ping.
    pub fn health(&self, key: &ObjectKey) {
        self.health.ping(key);
    }

    /// The game binary claimed itself for a session.
    pub fn allocate(&self, key: &ObjectKey) -> Result<GameServer> {
        self.transition(key, "Allocate", |gs| match gs.status.state {
            GameServerState::Ready
            | GameServerState::RequestReady
            | GameServerState::Reserved => {
                gs.status.state = GameServerState::Allocated;
                gs.status.reserved_until = None;
                true
            }
            GameServerState::Allocated => true,
            _ => false,
        })
    }

    /// The game binary is exiting; the record moves to Shutdown and the
    /// lifecycle controller deletes it.
    pub fn shutdown(&self, key: &ObjectKey) -> Result<GameServer> {
        info!(game_server = %key, "sidecar requested shutdown");
        self.transition(key, "Shutdown", |gs| {
            gs.status.state = GameServerState::Shutdown;
            true
        })
    }

    /// Withhold the server from allocation for `duration`; zero means until
    /// further notice. Allowed from Ready and, per the session handoff
    /// contract, from Allocated.
    pub fn reserve(&self, key: &ObjectKey, duration: Duration) -> Result<GameServer> {
        self.transition(key, "Reserve", |gs| match gs.status.state {
            GameServerState::Ready
            | GameServerState::RequestReady
            | GameServerState::Allocated
            | GameServerState::Reserved => {
                gs.status.state = GameServerState::Reserved;
                gs.status.reserved_until = if duration.is_zero() {
                    None
                } else {
                    Some(Utc::now() + ChronoDuration::milliseconds(duration.as_millis() as i64))
                };
                true
            }
            _ => false,
        })
    }

    /// Set a label on the GameServer, namespaced under the SDK prefix.
    pub fn set_label(&self, key: &ObjectKey, k: &str, v: &str) -> Result<GameServer> {
        let label = format!("{SDK_METADATA_PREFIX}{k}");
        Ok(update_with_retry(&self.store.game_servers, key, |gs| {
            gs.metadata.labels.insert(label.clone(), v.to_string());
            true
        })?)
    }

    /// Set an annotation on the GameServer, namespaced under the SDK prefix.
    pub fn set_annotation(&self, key: &ObjectKey, k: &str, v: &str) -> Result<GameServer> {
        let annotation = format!("{SDK_METADATA_PREFIX}{k}");
        Ok(update_with_retry(&self.store.game_servers, key, |gs| {
            gs.metadata
                .annotations
                .insert(annotation.clone(), v.to_string());
            true
        })?)
    }

    /// Current GameServer record.
    pub fn get(&self, key: &ObjectKey) -> Result<GameServer> {
        Ok(self.store.game_servers.get(key)?)
    }

    /// Stream of updates to one GameServer, ending when it is deleted.
    pub fn watch(&self, key: &ObjectKey) -> mpsc::UnboundedReceiver<GameServer> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = self.store.game_servers.watch();
        if let Ok(current) = self.store.game_servers.get(key) {
            let _ = tx.send(current);
        }
        let key = key.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event.object().key() != key {
                    continue;
                }
                match event {
                    WatchEvent::Added(gs) | WatchEvent::Modified(gs) => {
                        if tx.send(gs).is_err() {
                            return;
                        }
                    }
                    WatchEvent::Deleted(_) => return,
                }
            }
        });
        rx
    }

    fn transition(
        &self,
        key: &ObjectKey,
        call: &'static str,
        mut apply: impl FnMut(&mut GameServer) -> bool,
    ) -> Result<GameServer> {
        let mut allowed = true;
        let updated = update_with_retry(&self.store.game_servers, key, |gs| {
            allowed = apply(gs);
            allowed
        })?;
        if allowed {
            debug!(game_server = %key, call, state = %updated.status.state, "sdk transition");
            Ok(updated)
        } else {
            Err(SdkError::InvalidTransition {
                key: key.clone(),
                from: updated.status.state,
                call,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Metadata;

    fn service() -> (Arc<Store>, SdkService) {
        let store = Store::new();
        let health = HealthMonitor::new(store.clone());
        (store.clone(), SdkService::new(store, health))
    }

    fn seed(store: &Store, state: GameServerState) -> ObjectKey {
        let mut gs = GameServer {
            metadata: Metadata::named("default", "gs-1"),
            ..GameServer::default()
        };
        gs.status.state = state;
        store.game_servers.create(gs).unwrap().key()
    }

    #[test]
    fn ready_from_scheduled_requests_readiness() {
        let (store, sdk) = service();
        let key = seed(&store, GameServerState::Scheduled);
        let gs = sdk.ready(&key).unwrap();
        assert_eq!(gs.status.state, GameServerState::RequestReady);
    }

    #[test]
    fn ready_never_leaves_allocated() {
        let (store, sdk) = service();
        let key = seed(&store, GameServerState::Allocated);
        let err = sdk.ready(&key).unwrap_err();
        assert!(matches!(err, SdkError::InvalidTransition { .. }));
        assert_eq!(
            store.game_servers.get(&key).unwrap().status.state,
            GameServerState::Allocated
        );
    }

    #[test]
    fn reserve_sets_a_deadline_and_allocate_clears_it() {
        let (store, sdk) = service();
        let key = seed(&store, GameServerState::Ready);
        let gs = sdk.reserve(&key, Duration::from_secs(5)).unwrap();
        assert_eq!(gs.status.state, GameServerState::Reserved);
        assert!(gs.status.reserved_until.is_some());

        let gs = sdk.allocate(&key).unwrap();
        assert_eq!(gs.status.state, GameServerState::Allocated);
        assert!(gs.status.reserved_until.is_none());
    }

    #[test]
    fn reserved_returns_through_request_ready() {
        let (store, sdk) = service();
        let key = seed(&store, GameServerState::Ready);
        sdk.reserve(&key, Duration::ZERO).unwrap();
        let gs = sdk.ready(&key).unwrap();
        assert_eq!(gs.status.state, GameServerState::RequestReady);
        assert!(gs.status.reserved_until.is_none());
    }

    #[test]
    fn sdk_metadata_is_prefixed() {
        let (store, sdk) = service();
        let key = seed(&store, GameServerState::Ready);
        sdk.set_label(&key, "session", "abc").unwrap();
        sdk.set_annotation(&key, "map", "dust").unwrap();
        let gs = store.game_servers.get(&key).unwrap();
        assert_eq!(
            gs.metadata.labels.get("agones.dev/sdk-session"),
            Some(&"abc".to_string())
        );
        assert_eq!(
            gs.metadata.annotations.get("agones.dev/sdk-map"),
            Some(&"dust".to_string())
        );
    }

    #[tokio::test]
    async fn watch_streams_updates_until_deletion() {
        let (store, sdk) = service();
        let key = seed(&store, GameServerState::Ready);
        let mut rx = sdk.watch(&key);

        // Initial snapshot.
        assert!(rx.recv().await.is_some());

        sdk.allocate(&key).unwrap();
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.status.state, GameServerState::Allocated);

        store.game_servers.delete(&key).unwrap();
        assert!(rx.recv().await.is_none());
    }
}
