//! Ready-server cache: the allocation engine's view of every Ready,
//! not-being-deleted GameServer, maintained from the store's watch stream.
//! A generation counter tells the dispatcher when its sorted snapshot is
//! stale.

use crate::resources::{GameServer, GameServerState, ObjectKey, Resource};
use crate::store::{Store, WatchEvent};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::warn;

/// Thread-safe cache of allocatable GameServers.
pub struct ReadyCache {
    items: DashMap<ObjectKey, GameServer>,
    generation: AtomicU64,
}

fn is_allocatable(gs: &GameServer) -> bool {
    gs.status.state == GameServerState::Ready && !gs.metadata.is_being_deleted()
}

impl ReadyCache {
    /// Build the cache and keep it current until shutdown.
    pub fn start(store: Arc<Store>, mut shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let cache = Arc::new(Self {
            items: DashMap::new(),
            generation: AtomicU64::new(0),
        });

        let mut rx = store.game_servers.watch();
        for gs in store.game_servers.snapshot() {
            if is_allocatable(&gs) {
                cache.items.insert(gs.key(), gs);
            }
        }

        let task = Arc::clone(&cache);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    event = rx.recv() => match event {
                        Ok(event) => task.apply(&event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "ready cache fell behind, relisting");
                            task.items.clear();
                            for gs in store.game_servers.snapshot() {
                                if is_allocatable(&gs) {
                                    task.items.insert(gs.key(), gs);
                                }
                            }
                            task.bump();
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });

        cache
    }

    fn apply(&self, event: &WatchEvent<GameServer>) {
        let gs = event.object();
        let key = gs.key();
        match event {
            WatchEvent::Added(gs) | WatchEvent::Modified(gs) if is_allocatable(gs) => {
                self.items.insert(key, gs.clone());
                self.bump();
            }
            _ => {
                if self.items.remove(&key).is_some() {
                    self.bump();
                }
            }
        }
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Snapshot generation; changes whenever the membership does.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Take a server out of the pool so no later request can pick it.
    pub fn remove(&self, key: &ObjectKey) -> Option<GameServer> {
        let removed = self.items.remove(key).map(|(_, gs)| gs);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Put a server back after a failed claim.
    pub fn restore(&self, gs: GameServer) {
        if is_allocatable(&gs) {
            self.items.insert(gs.key(), gs);
            self.bump();
        }
    }

    /// Every allocatable server.
    pub fn snapshot(&self) -> Vec<GameServer> {
        self.items.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of allocatable servers.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Metadata;
    use crate::store::update_with_retry;
    use std::time::Duration;

    fn ready_gs(name: &str) -> GameServer {
        let mut gs = GameServer {
            metadata: Metadata::named("default", name),
            ..GameServer::default()
        };
        gs.status.state = GameServerState::Ready;
        gs
    }

    #[tokio::test]
    async fn only_ready_servers_are_pooled() {
        let store = Store::new();
        let (_tx, shutdown) = watch::channel(false);

        let ready = store.game_servers.create(ready_gs("ready")).unwrap();
        let mut starting = ready_gs("starting");
        starting.status.state = GameServerState::Starting;
        store.game_servers.create(starting).unwrap();

        let cache = ReadyCache::start(store.clone(), shutdown);
        assert_eq!(cache.len(), 1);

        // Allocation elsewhere removes it from the pool.
        update_with_retry(&store.game_servers, &ready.key(), |gs| {
            gs.status.state = GameServerState::Allocated;
            true
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn generation_tracks_membership() {
        let store = Store::new();
        let (_tx, shutdown) = watch::channel(false);
        let cache = ReadyCache::start(store.clone(), shutdown);
        let before = cache.generation();

        store.game_servers.create(ready_gs("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.generation() > before);

        let taken = cache.remove(&ObjectKey::new("default", "a")).unwrap();
        let mid = cache.generation();
        cache.restore(taken);
        assert!(cache.generation() > mid);
        assert_eq!(cache.len(), 1);
    }
}
