//! Informer caches: eventually consistent local views of a collection,
//! maintained from its watch stream. Readers never block writers.

use super::{Collection, Store, WatchEvent};
use crate::resources::{LabelSelector, ObjectKey, Resource};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, warn};

/// A read-mostly local view of one collection.
pub struct Cache<R: Resource> {
    items: Arc<DashMap<ObjectKey, R>>,
}

impl<R: Resource> Clone for Cache<R> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<R: Resource> Cache<R> {
    /// Start a cache over the collection selected by `select`, invoking
    /// `on_event` for every observed change (typically to enqueue work).
    /// The maintenance task exits when `shutdown` flips to true.
    pub fn start(
        store: Arc<Store>,
        select: impl Fn(&Store) -> &Collection<R> + Send + Sync + 'static,
        on_event: impl Fn(&WatchEvent<R>) + Send + Sync + 'static,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let items: Arc<DashMap<ObjectKey, R>> = Arc::new(DashMap::new());

        // Subscribe before the initial list so no event is lost; replays of
        // already-listed objects are harmless overwrites.
        let mut rx = select(&store).watch();
        for obj in select(&store).snapshot() {
            items.insert(obj.key(), obj);
        }

        let task_items = Arc::clone(&items);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    event = rx.recv() => match event {
                        Ok(event) => {
                            match &event {
                                WatchEvent::Added(o) | WatchEvent::Modified(o) => {
                                    task_items.insert(o.key(), o.clone());
                                }
                                WatchEvent::Deleted(o) => {
                                    task_items.remove(&o.key());
                                }
                            }
                            on_event(&event);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(kind = R::KIND, missed, "cache fell behind, relisting");
                            task_items.clear();
                            for obj in select(&store).snapshot() {
                                task_items.insert(obj.key(), obj);
                            }
                        }
                        Err(RecvError::Closed) => {
                            debug!(kind = R::KIND, "watch closed, cache task exiting");
                            return;
                        }
                    }
                }
            }
        });

        Self { items }
    }

    /// Fetch a clone from the cache.
    pub fn get(&self, key: &ObjectKey) -> Option<R> {
        self.items.get(key).map(|entry| entry.value().clone())
    }

    /// List cached objects, optionally narrowed by namespace and selector.
    pub fn list(&self, namespace: Option<&str>, selector: Option<&LabelSelector>) -> Vec<R> {
        self.items
            .iter()
            .filter(|e| namespace.map_or(true, |ns| e.metadata().namespace == ns))
            .filter(|e| selector.map_or(true, |s| s.matches(&e.metadata().labels)))
            .map(|e| e.value().clone())
            .collect()
    }

    /// List cached objects controlled by the owner with the given UID.
    pub fn list_owned(&self, owner_uid: &str) -> Vec<R> {
        self.items
            .iter()
            .filter(|e| e.metadata().is_controlled_by(owner_uid))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
