//! Allocation engine: the latency-sensitive path that atomically claims a
//! Ready GameServer for a session.
//!
//! Topology, every hop deadline-aware: HTTP handler (producer) → bounded
//! request channel → single dispatcher over a sorted candidate slice →
//! update-worker pool → per-request oneshot response. The dispatcher removes
//! a chosen server from the pool before handing it to a worker, so no two
//! requests can pick the same server; the store's version check is the final
//! arbiter, and a lost race restores the server and retries the request.

pub mod cache;
pub mod find;
pub mod multicluster;
pub mod service;

pub use cache::ReadyCache;

use crate::gameservers::NodeCounter;
use crate::resources::{
    AllocationState, GameServer, GameServerAllocation, GameServerState, Resource,
};
use crate::store::{EventRecorder, Store, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

/// Allocation result type.
pub type Result<T> = std::result::Result<T, AllocationError>;

/// Allocation failures that are not expressible as a logical response state.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// The engine is shutting down.
    #[error("allocation engine unavailable")]
    Unavailable,

    /// Multi-cluster dispatch found no usable policy.
    #[error("no allocation policy matched the request")]
    NoPolicies,

    /// mTLS client material could not be loaded.
    #[error("client secret {name}: {reason}")]
    ClientSecret {
        /// Secret name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Every remote endpoint failed; carries the last error.
    #[error("all allocation endpoints failed: {0}")]
    Remote(String),

    /// The store rejected an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Engine tuning, from the command line.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Update-worker pool size.
    pub workers: usize,
    /// Bounded request channel length.
    pub queue_length: usize,
    /// Sample the claim from the top N sort-key candidates when above 1.
    pub top_n: usize,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Name this cluster answers to in multi-cluster policies.
    pub cluster_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_length: 512,
            top_n: 1,
            request_timeout: Duration::from_secs(10),
            cluster_name: None,
        }
    }
}

enum DispatchOutcome {
    Fulfilled(Box<GameServerAllocation>),
    NoneReady,
    Conflict,
}

struct PendingRequest {
    allocation: GameServerAllocation,
    deadline: Instant,
    resp: oneshot::Sender<DispatchOutcome>,
}

/// The allocation engine.
pub struct AllocationEngine {
    store: Arc<Store>,
    cache: Arc<ReadyCache>,
    config: EngineConfig,
    tx: mpsc::Sender<PendingRequest>,
    recorder: EventRecorder,
}

impl AllocationEngine {
    /// Build the engine and spawn its dispatcher and worker pool.
    pub fn start(
        store: Arc<Store>,
        counter: Arc<NodeCounter>,
        config: EngineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let cache = ReadyCache::start(store.clone(), shutdown.clone());
        let (tx, rx) = mpsc::channel(config.queue_length.max(1));
        let (work_tx, work_rx) = mpsc::channel::<(PendingRequest, GameServer)>(config.workers.max(1));
        let work_rx = Arc::new(Mutex::new(work_rx));

        tokio::spawn(dispatcher(
            Arc::clone(&cache),
            counter,
            config.clone(),
            rx,
            work_tx,
            shutdown.clone(),
        ));
        for _ in 0..config.workers.max(1) {
            tokio::spawn(update_worker(
                store.clone(),
                Arc::clone(&cache),
                Arc::clone(&work_rx),
            ));
        }

        let recorder = EventRecorder::new(store.clone(), "allocation-engine");
        Arc::new(Self {
            store,
            cache,
            config,
            tx,
            recorder,
        })
    }

    /// The store this engine allocates from.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of servers currently allocatable.
    pub fn ready_count(&self) -> usize {
        self.cache.len()
    }

    /// Entry point: route per multi-cluster settings, then allocate.
    pub async fn route(&self, allocation: GameServerAllocation) -> Result<GameServerAllocation> {
        if allocation.spec.multi_cluster.enabled {
            multicluster::dispatch(self, allocation).await
        } else {
            self.allocate(allocation).await
        }
    }

    /// Serve an allocation locally. Always returns a logical outcome
    /// (`Allocated`, `UnAllocated` or `Contention`) unless the engine itself
    /// is unavailable.
    pub async fn allocate(&self, allocation: GameServerAllocation) -> Result<GameServerAllocation> {
        let deadline = Instant::now() + self.config.request_timeout;
        loop {
            if Instant::now() >= deadline {
                self.recorder.warning(
                    &allocation,
                    "Contention",
                    "conflicts exhausted the request deadline",
                );
                return Ok(contention(allocation));
            }
            let (resp_tx, resp_rx) = oneshot::channel();
            let pending = PendingRequest {
                allocation: allocation.clone(),
                deadline,
                resp: resp_tx,
            };
            self.tx
                .send(pending)
                .await
                .map_err(|_| AllocationError::Unavailable)?;
            match resp_rx.await {
                Ok(DispatchOutcome::Fulfilled(done)) => {
                    self.recorder.normal(
                        &*done,
                        "Allocated",
                        format!("allocated {}", done.status.game_server_name),
                    );
                    return Ok(*done);
                }
                Ok(DispatchOutcome::NoneReady) => {
                    let mut allocation = allocation;
                    allocation.status.state = AllocationState::UnAllocated;
                    return Ok(allocation);
                }
                // A competing writer beat us to the chosen server; go
                // around through the dispatcher again.
                Ok(DispatchOutcome::Conflict) => continue,
                Err(_) => return Err(AllocationError::Unavailable),
            }
        }
    }
}

fn contention(mut allocation: GameServerAllocation) -> GameServerAllocation {
    allocation.status.state = AllocationState::Contention;
    allocation
}

/// Single-threaded dispatcher: serialises candidate selection so removal
/// from the pool happens-before the next request looks at it.
async fn dispatcher(
    cache: Arc<ReadyCache>,
    counter: Arc<NodeCounter>,
    config: EngineConfig,
    mut rx: mpsc::Receiver<PendingRequest>,
    work_tx: mpsc::Sender<(PendingRequest, GameServer)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sorted: Vec<GameServer> = Vec::new();
    let mut seen_generation = u64::MAX;
    let mut seen_scheduling = None;

    loop {
        let request = tokio::select! {
            request = rx.recv() => match request {
                Some(request) => request,
                None => return,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };

        let generation = cache.generation();
        let scheduling = request.allocation.spec.scheduling;
        if generation != seen_generation || seen_scheduling != Some(scheduling) {
            sorted = cache.snapshot();
            find::sort_candidates(&mut sorted, scheduling, &counter);
            seen_generation = generation;
            seen_scheduling = Some(scheduling);
        }

        match find::find_game_server(&sorted, &request.allocation.spec, config.top_n) {
            None => {
                let _ = request.resp.send(DispatchOutcome::NoneReady);
            }
            Some(idx) => {
                let gs = sorted.remove(idx);
                // Claimed synchronously: later requests cannot pick it even
                // before the store write lands.
                cache.remove(&gs.key());
                if work_tx.send((request, gs)).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Update worker: writes `Allocated` plus the metadata patch through the
/// store's version check and answers the request.
async fn update_worker(
    store: Arc<Store>,
    cache: Arc<ReadyCache>,
    work_rx: Arc<Mutex<mpsc::Receiver<(PendingRequest, GameServer)>>>,
) {
    loop {
        let (request, gs) = {
            let mut rx = work_rx.lock().await;
            match rx.recv().await {
                Some(item) => item,
                None => return,
            }
        };

        // Requests past their deadline never touch the store.
        if Instant::now() >= request.deadline {
            cache.restore(gs);
            let _ = request.resp.send(DispatchOutcome::Conflict);
            continue;
        }

        let outcome = claim(&store, &gs, &request.allocation);
        match outcome {
            Ok(allocated) => {
                let mut done = request.allocation.clone();
                done.status.state = AllocationState::Allocated;
                done.status.game_server_name = allocated.metadata.name.clone();
                done.status.address = allocated.status.address.clone();
                done.status.node_name = allocated.status.node_name.clone();
                done.status.ports = allocated.status.ports.clone();
                debug!(game_server = %allocated.key(), "allocation committed");
                let _ = request.resp.send(DispatchOutcome::Fulfilled(Box::new(done)));
            }
            Err(ClaimError::NoLongerReady) => {
                // The server left the pool for real; don't restore it.
                let _ = request.resp.send(DispatchOutcome::Conflict);
            }
            Err(ClaimError::Conflict(restore)) => {
                info!(game_server = %gs.key(), "allocation pre-empted, restoring candidate");
                cache.restore(restore);
                let _ = request.resp.send(DispatchOutcome::Conflict);
            }
            Err(ClaimError::Store(e)) => {
                warn!(game_server = %gs.key(), error = %e, "allocation store write failed");
                let _ = request.resp.send(DispatchOutcome::Conflict);
            }
        }
    }
}

enum ClaimError {
    NoLongerReady,
    Conflict(GameServer),
    Store(StoreError),
}

/// One optimistic claim attempt against the store's current copy.
fn claim(
    store: &Store,
    candidate: &GameServer,
    allocation: &GameServerAllocation,
) -> std::result::Result<GameServer, ClaimError> {
    let key = candidate.key();
    let mut fresh = match store.game_servers.get(&key) {
        Ok(gs) => gs,
        Err(e) if e.is_not_found() => return Err(ClaimError::NoLongerReady),
        Err(e) => return Err(ClaimError::Store(e)),
    };
    if fresh.status.state != GameServerState::Ready || fresh.metadata.is_being_deleted() {
        return Err(ClaimError::NoLongerReady);
    }

    fresh.status.state = GameServerState::Allocated;
    for (k, v) in &allocation.spec.meta_patch.labels {
        fresh.metadata.labels.insert(k.clone(), v.clone());
    }
    for (k, v) in &allocation.spec.meta_patch.annotations {
        fresh.metadata.annotations.insert(k.clone(), v.clone());
    }

    match store.game_servers.update(fresh) {
        Ok(updated) => Ok(updated),
        Err(e) if e.is_conflict() => {
            // Re-read to decide whether the candidate is worth restoring.
            match store.game_servers.get(&key) {
                Ok(current)
                    if current.status.state == GameServerState::Ready
                        && !current.metadata.is_being_deleted() =>
                {
                    Err(ClaimError::Conflict(current))
                }
                _ => Err(ClaimError::NoLongerReady),
            }
        }
        Err(e) => Err(ClaimError::Store(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{LabelSelector, Metadata};
    use crate::store::update_with_retry;

    fn ready_gs(name: &str, labels: &[(&str, &str)]) -> GameServer {
        let mut gs = GameServer {
            metadata: Metadata::named("default", name),
            ..GameServer::default()
        };
        gs.status.state = GameServerState::Ready;
        gs.status.address = "203.0.113.5".to_string();
        gs.status.node_name = "node-a".to_string();
        for (k, v) in labels {
            gs.metadata.labels.insert(k.to_string(), v.to_string());
        }
        gs
    }

    fn request(fleet: &str) -> GameServerAllocation {
        GameServerAllocation {
            metadata: Metadata::named("default", "req"),
            spec: crate::resources::GameServerAllocationSpec {
                required: LabelSelector::from_label("fleet", fleet),
                ..Default::default()
            },
            status: Default::default(),
        }
    }

    fn engine(store: &Arc<Store>) -> (Arc<AllocationEngine>, watch::Sender<bool>) {
        let (tx, shutdown) = watch::channel(false);
        let counter = NodeCounter::start(store.clone(), shutdown.clone());
        let engine = AllocationEngine::start(
            store.clone(),
            counter,
            EngineConfig {
                request_timeout: Duration::from_secs(2),
                ..EngineConfig::default()
            },
            shutdown,
        );
        (engine, tx)
    }

    #[tokio::test]
    async fn allocates_a_matching_server() {
        let store = Store::new();
        store
            .game_servers
            .create(ready_gs("gs-1", &[("fleet", "simple")]))
            .unwrap();
        let (engine, _shutdown) = engine(&store);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = engine.allocate(request("simple")).await.unwrap();
        assert_eq!(result.status.state, AllocationState::Allocated);
        assert_eq!(result.status.game_server_name, "gs-1");
        assert_eq!(result.status.address, "203.0.113.5");

        let gs = store
            .game_servers
            .get(&crate::resources::ObjectKey::new("default", "gs-1"))
            .unwrap();
        assert_eq!(gs.status.state, GameServerState::Allocated);
    }

    #[tokio::test]
    async fn empty_pool_is_unallocated() {
        let store = Store::new();
        let (engine, _shutdown) = engine(&store);
        let result = engine.allocate(request("simple")).await.unwrap();
        assert_eq!(result.status.state, AllocationState::UnAllocated);
    }

    #[tokio::test]
    async fn meta_patch_lands_on_the_server() {
        let store = Store::new();
        store
            .game_servers
            .create(ready_gs("gs-1", &[("fleet", "simple")]))
            .unwrap();
        let (engine, _shutdown) = engine(&store);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut allocation = request("simple");
        allocation
            .spec
            .meta_patch
            .labels
            .insert("session".to_string(), "m-42".to_string());
        let result = engine.allocate(allocation).await.unwrap();
        assert_eq!(result.status.state, AllocationState::Allocated);

        let gs = store
            .game_servers
            .get(&crate::resources::ObjectKey::new("default", "gs-1"))
            .unwrap();
        assert_eq!(gs.metadata.labels.get("session"), Some(&"m-42".to_string()));
    }

    #[tokio::test]
    async fn concurrent_requests_never_share_a_server() {
        let store = Store::new();
        for i in 0..4 {
            store
                .game_servers
                .create(ready_gs(&format!("gs-{i}"), &[("fleet", "simple")]))
                .unwrap();
        }
        let (engine, _shutdown) = engine(&store);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.allocate(request("simple")).await.unwrap()
            }));
        }

        let mut names = std::collections::HashSet::new();
        let mut allocated = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            if result.status.state == AllocationState::Allocated {
                allocated += 1;
                assert!(
                    names.insert(result.status.game_server_name.clone()),
                    "same server handed out twice"
                );
            }
        }
        assert_eq!(allocated, 4);
    }

    #[tokio::test]
    async fn pre_empted_claim_retries_onto_another_server() {
        let store = Store::new();
        let first = store
            .game_servers
            .create(ready_gs("gs-a", &[("fleet", "simple")]))
            .unwrap();
        store
            .game_servers
            .create(ready_gs("gs-b", &[("fleet", "simple")]))
            .unwrap();
        let (engine, _shutdown) = engine(&store);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A sidecar self-allocation races ahead of the engine.
        update_with_retry(&store.game_servers, &first.key(), |gs| {
            gs.status.state = GameServerState::Allocated;
            true
        })
        .unwrap();

        let result = engine.allocate(request("simple")).await.unwrap();
        assert_eq!(result.status.state, AllocationState::Allocated);
        assert_eq!(result.status.game_server_name, "gs-b");
    }
}
