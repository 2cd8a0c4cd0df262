//! Per-node Ready/Allocated counts, maintained from GameServer watch events.
//! Consumed by scale-down ordering and the allocation sort key.

use crate::resources::GameServerState;
use crate::store::{Store, WatchEvent};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Counts for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCount {
    /// Servers in Ready state on the node.
    pub ready: u64,
    /// Servers in Allocated state on the node.
    pub allocated: u64,
}

#[derive(Clone)]
struct Tracked {
    node: String,
    state: GameServerState,
}

/// Process-wide per-node GameServer counter.
pub struct NodeCounter {
    counts: DashMap<String, NodeCount>,
    tracked: DashMap<String, Tracked>,
}

impl NodeCounter {
    /// Build a counter seeded from the store and kept current from its watch
    /// stream.
    pub fn start(store: Arc<Store>, mut shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let counter = Arc::new(Self {
            counts: DashMap::new(),
            tracked: DashMap::new(),
        });

        let mut rx = store.game_servers.watch();
        for gs in store.game_servers.snapshot() {
            counter.apply(&WatchEvent::Added(gs));
        }

        let task = Arc::clone(&counter);
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
                            warn!(missed, "node counter fell behind, rebuilding");
                            task.rebuild(&store);
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });

        counter
    }

    fn rebuild(&self, store: &Store) {
        self.counts.clear();
        self.tracked.clear();
        for gs in store.game_servers.snapshot() {
            self.apply(&WatchEvent::Added(gs));
        }
    }

    fn apply(&self, event: &WatchEvent<crate::resources::GameServer>) {
        let gs = event.object();
        let uid = &gs.metadata.uid;
        if uid.is_empty() {
            return;
        }

        if let Some((_, old)) = self.tracked.remove(uid) {
            self.adjust(&old.node, old.state, -1);
        }

        if matches!(event, WatchEvent::Deleted(_)) {
            return;
        }
        let node = &gs.status.node_name;
        if node.is_empty() {
            return;
        }
        self.adjust(node, gs.status.state, 1);
        self.tracked.insert(
            uid.clone(),
            Tracked {
                node: node.clone(),
                state: gs.status.state,
            },
        );
    }

    fn adjust(&self, node: &str, state: GameServerState, delta: i64) {
        let bump = |v: &mut u64| {
            *v = if delta > 0 { v.saturating_add(1) } else { v.saturating_sub(1) };
        };
        let mut entry = self.counts.entry(node.to_string()).or_default();
        match state {
            GameServerState::Ready => bump(&mut entry.ready),
            GameServerState::Allocated => bump(&mut entry.allocated),
            _ => {}
        }
    }

    /// Counts for one node.
    pub fn count(&self, node: &str) -> NodeCount {
        self.counts.get(node).map(|e| *e).unwrap_or_default()
    }

    /// Snapshot of every node's counts.
    pub fn counts(&self) -> HashMap<String, NodeCount> {
        self.counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{GameServer, Metadata, Resource};
    use crate::store::update_with_retry;
    use std::time::Duration;

    fn gs_on(name: &str, node: &str, state: GameServerState) -> GameServer {
        let mut gs = GameServer {
            metadata: Metadata::named("default", name),
            ..GameServer::default()
        };
        gs.status.node_name = node.to_string();
        gs.status.state = state;
        gs
    }

    #[tokio::test]
    async fn transitions_move_counts_between_buckets() {
        let store = Store::new();
        let (_tx, shutdown) = watch::channel(false);
        let counter = NodeCounter::start(store.clone(), shutdown);

        let created = store
            .game_servers
            .create(gs_on("a", "node-1", GameServerState::Ready))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.count("node-1"), NodeCount { ready: 1, allocated: 0 });

        update_with_retry(&store.game_servers, &created.key(), |gs| {
            gs.status.state = GameServerState::Allocated;
            true
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.count("node-1"), NodeCount { ready: 0, allocated: 1 });

        store.game_servers.delete(&created.key()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.count("node-1"), NodeCount::default());
    }
}
