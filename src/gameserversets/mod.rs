//! GameServerSet controller: keeps the count of live, matching-template
//! GameServers equal to the declared replica target. Scale-down never touches
//! Allocated or Reserved servers.

use crate::gameservers::NodeCounter;
use crate::resources::{
    GameServer, GameServerSet, GameServerState, ObjectKey, Resource, SchedulingStrategy,
};
use crate::store::{update_with_retry, Cache, EventRecorder, Store, StoreError};
use crate::workqueue::WorkQueue;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Most GameServers created in one sync pass; the follow-up sync picks up
/// the remainder.
const MAX_CREATION_BURST: usize = 64;

/// Controller result type.
pub type Result<T> = std::result::Result<T, SetControllerError>;

/// Reconcile failures.
#[derive(Debug, Error)]
pub enum SetControllerError {
    /// The store rejected an operation; retried with backoff.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Live-server partition used for the replica diff.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SetCounts {
    /// Ready servers.
    pub ready: u32,
    /// Allocated servers.
    pub allocated: u32,
    /// Reserved servers.
    pub reserved: u32,
    /// Servers on their way up.
    pub starting: u32,
    /// Unhealthy or errored servers.
    pub unhealthy: u32,
    /// Servers already being deleted or shut down.
    pub deleting: u32,
}

impl SetCounts {
    /// Servers counted against the replica target.
    pub fn live(&self) -> u32 {
        self.ready + self.allocated + self.reserved + self.starting
    }
}

/// Partition owned servers into the classes the diff works on.
pub fn partition(servers: &[GameServer]) -> SetCounts {
    let mut counts = SetCounts::default();
    for gs in servers {
        if gs.metadata.is_being_deleted() || gs.status.state == GameServerState::Shutdown {
            counts.deleting += 1;
        } else {
            match gs.status.state {
                GameServerState::Ready => counts.ready += 1,
                GameServerState::Allocated => counts.allocated += 1,
                GameServerState::Reserved => counts.reserved += 1,
                GameServerState::Unhealthy | GameServerState::Error => counts.unhealthy += 1,
                _ => counts.starting += 1,
            }
        }
    }
    counts
}

/// GameServerSet controller.
pub struct GameServerSetController {
    store: Arc<Store>,
    sets: Cache<GameServerSet>,
    queue: Arc<WorkQueue>,
    counter: Arc<NodeCounter>,
    recorder: EventRecorder,
}

impl GameServerSetController {
    /// Wire the controller: set events and owned-server events feed the
    /// work queue.
    pub fn new(
        store: Arc<Store>,
        counter: Arc<NodeCounter>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let queue = WorkQueue::new("gameserversets");

        let set_queue = Arc::clone(&queue);
        let sets = Cache::start(
            store.clone(),
            |s| &s.game_server_sets,
            move |event| set_queue.add(event.object().key()),
            shutdown.clone(),
        );

        // Server events reconcile the owning set; the cache handle itself is
        // not needed beyond the wiring.
        let gs_queue = Arc::clone(&queue);
        Cache::start(
            store.clone(),
            |s| &s.game_servers,
            move |event| {
                let gs = event.object();
                if let Some(owner) = gs.metadata.controller_ref() {
                    if owner.kind == GameServerSet::KIND {
                        gs_queue.add(ObjectKey::new(
                            gs.metadata.namespace.clone(),
                            owner.name.clone(),
                        ));
                    }
                }
            },
            shutdown,
        );

        let recorder = EventRecorder::new(store.clone(), "gameserverset-controller");
        Arc::new(Self {
            store,
            sets,
            queue,
            counter,
            recorder,
        })
    }

    /// Run `workers` reconcile workers until shutdown.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: watch::Receiver<bool>) {
        let stopper = Arc::clone(&self.queue);
        let mut stop_rx = shutdown;
        tokio::spawn(async move {
            while stop_rx.changed().await.is_ok() {
                if *stop_rx.borrow() {
                    stopper.shut_down();
                    return;
                }
            }
            stopper.shut_down();
        });

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let controller = Arc::clone(&self);
            handles.push(tokio::spawn(async move { controller.worker().await }));
        }
        futures::future::join_all(handles).await;
    }

    async fn worker(self: Arc<Self>) {
        while let Some(key) = self.queue.get().await {
            match self.sync(&key) {
                Ok(()) => self.queue.forget(&key),
                Err(e) => {
                    warn!(set = %key, error = %e, "reconcile failed");
                    self.queue.add_rate_limited(key.clone());
                }
            }
            self.queue.done(&key);
        }
    }

    /// Reconcile one GameServerSet key.
    pub fn sync(&self, key: &ObjectKey) -> Result<()> {
        let Some(set) = self.sets.get(key) else {
            self.queue.forget(key);
            return Ok(());
        };
        if set.metadata.is_being_deleted() {
            // Cascade deletion tears the servers down.
            return Ok(());
        }

        // Listed from the store so back-to-back syncs cannot double-create
        // against a stale cache.
        let owned = self.store.game_servers.list_owned(&set.metadata.uid);
        let counts = partition(&owned);
        let live = counts.live() as i64;
        let diff = set.spec.replicas as i64 - live;

        if diff > 0 {
            self.scale_up(&set, diff as usize)?;
        } else if diff < 0 {
            self.scale_down(&set, &owned, (-diff) as usize)?;
        }

        self.update_status(&set, counts)?;
        Ok(())
    }

    fn scale_up(&self, set: &GameServerSet, count: usize) -> Result<()> {
        let burst = count.min(MAX_CREATION_BURST);
        info!(set = %set.key(), count = burst, "scaling up");
        for _ in 0..burst {
            let gs = set.game_server();
            match self.store.game_servers.create(gs) {
                Ok(_) => {}
                // Name collision: try again next sync with a fresh suffix.
                Err(e) if matches!(e, StoreError::AlreadyExists { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.recorder.normal(
            set,
            "ScalingUp",
            format!("created {burst} game servers"),
        );
        Ok(())
    }

    fn scale_down(&self, set: &GameServerSet, owned: &[GameServer], count: usize) -> Result<()> {
        let candidates = self.delete_candidates(set, owned, count);
        if candidates.is_empty() {
            // Everything live is allocated or reserved; the deficit stands
            // until sessions complete.
            return Ok(());
        }
        info!(set = %set.key(), count = candidates.len(), "scaling down");
        for gs in &candidates {
            match self.store.game_servers.delete(&gs.key()) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.recorder.normal(
            set,
            "ScalingDown",
            format!("deleted {} game servers", candidates.len()),
        );
        Ok(())
    }

    /// Pick `count` victims, least valuable first: unhealthy and errored
    /// servers, then starting ones (newest first), then ready ones (newest
    /// first). Allocated, Reserved and already-deleting servers are never
    /// candidates. Packed scheduling prefers servers on the nodes hosting
    /// the fewest allocated servers, so drained nodes free up.
    fn delete_candidates(
        &self,
        set: &GameServerSet,
        owned: &[GameServer],
        count: usize,
    ) -> Vec<GameServer> {
        let mut candidates: Vec<&GameServer> = owned
            .iter()
            .filter(|gs| !gs.metadata.is_being_deleted())
            .filter(|gs| gs.status.state != GameServerState::Shutdown)
            .filter(|gs| {
                !matches!(
                    gs.status.state,
                    GameServerState::Allocated | GameServerState::Reserved
                )
            })
            .collect();

        match set.spec.scheduling {
            SchedulingStrategy::Packed => {
                candidates.sort_by(|a, b| {
                    class_rank(a)
                        .cmp(&class_rank(b))
                        .then_with(|| {
                            let alloc =
                                |gs: &GameServer| self.counter.count(&gs.status.node_name).allocated;
                            alloc(a).cmp(&alloc(b))
                        })
                        .then_with(|| newest_first(a, b))
                });
            }
            SchedulingStrategy::Distributed => {
                candidates.shuffle(&mut rand::thread_rng());
                candidates.sort_by(|a, b| class_rank(a).cmp(&class_rank(b)));
            }
        }

        candidates.into_iter().take(count).cloned().collect()
    }

    fn update_status(&self, set: &GameServerSet, counts: SetCounts) -> Result<()> {
        let status = crate::resources::GameServerSetStatus {
            replicas: counts.live(),
            ready_replicas: counts.ready,
            allocated_replicas: counts.allocated,
            reserved_replicas: counts.reserved,
        };
        if set.status == status {
            return Ok(());
        }
        debug!(set = %set.key(), ?status, "updating status");
        update_with_retry(&self.store.game_server_sets, &set.key(), |set| {
            if set.status == status {
                return false;
            }
            set.status = status.clone();
            true
        })?;
        Ok(())
    }
}

/// Deletion class: lower ranks go first.
fn class_rank(gs: &GameServer) -> u8 {
    match gs.status.state {
        GameServerState::Unhealthy => 0,
        GameServerState::Error => 1,
        GameServerState::Ready => 3,
        // Everything else still starting.
        _ => 2,
    }
}

fn newest_first(a: &GameServer, b: &GameServer) -> Ordering {
    b.metadata
        .creation_timestamp
        .cmp(&a.metadata.creation_timestamp)
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}
