//! Rate-limited work queue feeding controller workers.
//!
//! Queue discipline: a key is processed by at most one worker at a time, and
//! an enqueue arriving mid-processing coalesces into a single follow-up pass
//! once the current one finishes. Failed keys come back with per-key
//! exponential backoff.

use crate::resources::ObjectKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
}

/// A rate-limited, coalescing work queue of object keys.
pub struct WorkQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    notify: Notify,
    shutting_down: AtomicBool,
}

impl WorkQueue {
    /// Build a queue. The name shows up in traces only.
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Enqueue a key. No-op if the key is already waiting; a key currently
    /// being processed is re-queued when its worker calls [`WorkQueue::done`].
    pub fn add(&self, key: ObjectKey) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueue a key after a delay.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueue a key with exponential backoff derived from its failure count.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        let failures = {
            let mut state = self.state.lock();
            let entry = state.failures.entry(key.clone()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        let delay = backoff(failures);
        trace!(queue = self.name, %key, failures, ?delay, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Clear a key's failure history after a successful pass.
    pub fn forget(&self, key: &ObjectKey) {
        self.state.lock().failures.remove(key);
    }

    /// Number of times the key has failed since it was last forgotten.
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Wake another waiter in case more items remain.
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if self.shutting_down.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key's processing pass finished, re-queueing it if an enqueue
    /// arrived in the meantime.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting work and wake all waiting workers.
    pub fn shut_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Keys currently waiting (excluding in-flight ones).
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(24);
    let delay = BASE_DELAY.saturating_mul(1u32 << exp);
    delay.min(MAX_DELAY)
}
