//! In-process object store realising the orchestrator's storage contract:
//! CRUD with optimistic concurrency, label-selector lists, watch streams,
//! finalizer-aware deletion and owner-reference cascade.
//!
//! Controllers never share pointers to live objects; every read hands out a
//! clone and every write is version-checked, so the concurrency behaviour
//! matches a remote store even though everything lives in one process.

pub mod cache;
pub mod election;
pub mod events;
pub mod gc;

pub use cache::Cache;
pub use events::EventRecorder;

use crate::resources::{
    Event, Fleet, FleetAutoscaler, GameServer, GameServerAllocationPolicy, GameServerSet,
    LabelSelector, Lease, Node, ObjectKey, Pod, Resource, Secret,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Store result type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
    },

    /// An object with this key already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
    },

    /// The write carried a stale resource version.
    #[error("conflict on {kind} {key}: have version {stale}, store at {current}")]
    Conflict {
        /// Resource kind.
        kind: &'static str,
        /// Object key.
        key: ObjectKey,
        /// Version the writer held.
        stale: u64,
        /// Version in the store.
        current: u64,
    },
}

impl StoreError {
    /// Whether a retry with a fresh read can succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Whether the object is simply gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// A change observed on a collection.
#[derive(Debug, Clone)]
pub enum WatchEvent<R> {
    /// Object created.
    Added(R),
    /// Object updated.
    Modified(R),
    /// Object removed.
    Deleted(R),
}

impl<R> WatchEvent<R> {
    /// The object the event is about.
    pub fn object(&self) -> &R {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

const WATCH_CHANNEL_CAPACITY: usize = 4096;

/// A typed collection of one resource kind.
pub struct Collection<R: Resource> {
    objects: RwLock<HashMap<ObjectKey, R>>,
    watch_tx: broadcast::Sender<WatchEvent<R>>,
    versions: Arc<AtomicU64>,
}

impl<R: Resource> Collection<R> {
    fn new(versions: Arc<AtomicU64>) -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            watch_tx,
            versions,
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, event: WatchEvent<R>) {
        // Nobody listening is fine; watches are optional.
        let _ = self.watch_tx.send(event);
    }

    /// Create an object. The store assigns UID, version and creation time.
    pub fn create(&self, mut obj: R) -> Result<R> {
        let key = obj.key();
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: R::KIND, key });
        }
        let meta = obj.metadata_mut();
        meta.uid = Uuid::new_v4().to_string();
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;
        meta.resource_version = self.next_version();
        objects.insert(key, obj.clone());
        drop(objects);
        self.emit(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    /// Fetch a clone of the object.
    pub fn get(&self, key: &ObjectKey) -> Result<R> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: R::KIND,
                key: key.clone(),
            })
    }

    /// List objects, optionally narrowed by namespace and label selector.
    pub fn list(&self, namespace: Option<&str>, selector: Option<&LabelSelector>) -> Vec<R> {
        self.objects
            .read()
            .values()
            .filter(|o| namespace.map_or(true, |ns| o.metadata().namespace == ns))
            .filter(|o| selector.map_or(true, |s| s.matches(&o.metadata().labels)))
            .cloned()
            .collect()
    }

    /// List objects controlled by the owner with the given UID.
    pub fn list_owned(&self, owner_uid: &str) -> Vec<R> {
        self.objects
            .read()
            .values()
            .filter(|o| o.metadata().is_controlled_by(owner_uid))
            .cloned()
            .collect()
    }

    /// Every object in the collection.
    pub fn snapshot(&self) -> Vec<R> {
        self.objects.read().values().cloned().collect()
    }

    /// Version-checked update. Fails with [`StoreError::Conflict`] when the
    /// caller's copy is stale. A finalizer-free object already marked for
    /// deletion is removed instead of updated.
    pub fn update(&self, mut obj: R) -> Result<R> {
        let key = obj.key();
        let mut objects = self.objects.write();
        let current = objects.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: R::KIND,
            key: key.clone(),
        })?;
        let current_version = current.metadata().resource_version;
        if current_version != obj.metadata().resource_version {
            return Err(StoreError::Conflict {
                kind: R::KIND,
                key,
                stale: obj.metadata().resource_version,
                current: current_version,
            });
        }

        if obj.metadata().is_being_deleted() && obj.metadata().finalizers.is_empty() {
            objects.remove(&key);
            drop(objects);
            self.emit(WatchEvent::Deleted(obj.clone()));
            return Ok(obj);
        }

        obj.metadata_mut().resource_version = self.next_version();
        objects.insert(key, obj.clone());
        drop(objects);
        self.emit(WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    /// Atomically mutate an object in place, bypassing version checking.
    ///
    /// Convenience for writers that own disjoint fields; the allocation
    /// pipeline deliberately uses [`Collection::update`] instead so that
    /// competing claims surface as conflicts.
    pub fn modify(&self, key: &ObjectKey, f: impl FnOnce(&mut R)) -> Result<R> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(key).ok_or_else(|| StoreError::NotFound {
            kind: R::KIND,
            key: key.clone(),
        })?;
        f(&mut *obj);
        if obj.metadata().is_being_deleted() && obj.metadata().finalizers.is_empty() {
            let obj = obj.clone();
            objects.remove(key);
            drop(objects);
            self.emit(WatchEvent::Deleted(obj.clone()));
            return Ok(obj);
        }
        obj.metadata_mut().resource_version = self.next_version();
        let obj = obj.clone();
        drop(objects);
        self.emit(WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    /// Request deletion. Objects with finalizers are only marked; removal
    /// happens once the last finalizer is dropped. Idempotent for objects
    /// already marked.
    pub fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(key).ok_or_else(|| StoreError::NotFound {
            kind: R::KIND,
            key: key.clone(),
        })?;
        if obj.metadata().finalizers.is_empty() {
            let obj = obj.clone();
            objects.remove(key);
            drop(objects);
            self.emit(WatchEvent::Deleted(obj));
            return Ok(());
        }
        if obj.metadata().deletion_timestamp.is_none() {
            obj.metadata_mut().deletion_timestamp = Some(Utc::now());
            obj.metadata_mut().resource_version = self.next_version();
            let obj = obj.clone();
            drop(objects);
            self.emit(WatchEvent::Modified(obj));
        }
        Ok(())
    }

    /// Subscribe to changes. Slow consumers see a lag error and should
    /// re-list.
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<R>> {
        self.watch_tx.subscribe()
    }
}

/// The orchestrator's object store: one collection per resource kind, with a
/// shared version counter so conflicts are comparable across kinds.
pub struct Store {
    /// GameServer records.
    pub game_servers: Collection<GameServer>,
    /// GameServerSet records.
    pub game_server_sets: Collection<GameServerSet>,
    /// Fleet records.
    pub fleets: Collection<Fleet>,
    /// FleetAutoscaler records.
    pub fleet_autoscalers: Collection<FleetAutoscaler>,
    /// Multi-cluster allocation policies.
    pub allocation_policies: Collection<GameServerAllocationPolicy>,
    /// Pods.
    pub pods: Collection<Pod>,
    /// Nodes.
    pub nodes: Collection<Node>,
    /// Secrets.
    pub secrets: Collection<Secret>,
    /// Emitted events.
    pub events: Collection<Event>,
    /// Leader-election leases.
    pub leases: Collection<Lease>,
}

impl Store {
    /// Build an empty store.
    pub fn new() -> Arc<Self> {
        let versions = Arc::new(AtomicU64::new(0));
        Arc::new(Self {
            game_servers: Collection::new(versions.clone()),
            game_server_sets: Collection::new(versions.clone()),
            fleets: Collection::new(versions.clone()),
            fleet_autoscalers: Collection::new(versions.clone()),
            allocation_policies: Collection::new(versions.clone()),
            pods: Collection::new(versions.clone()),
            nodes: Collection::new(versions.clone()),
            secrets: Collection::new(versions.clone()),
            events: Collection::new(versions.clone()),
            leases: Collection::new(versions),
        })
    }
}

/// Retry `mutate` against the referenced object until the update lands or a
/// non-conflict error surfaces. The closure may return `false` to abort
/// without writing.
pub fn update_with_retry<R: Resource>(
    collection: &Collection<R>,
    key: &ObjectKey,
    mut mutate: impl FnMut(&mut R) -> bool,
) -> Result<R> {
    const MAX_ATTEMPTS: usize = 8;
    let mut last = None;
    for _ in 0..MAX_ATTEMPTS {
        let mut obj = collection.get(key)?;
        if !mutate(&mut obj) {
            return Ok(obj);
        }
        match collection.update(obj) {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() => last = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or(StoreError::NotFound {
        kind: R::KIND,
        key: key.clone(),
    }))
}
