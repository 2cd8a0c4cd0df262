//! Event recording for notable transitions.

use super::Store;
use crate::resources::{Event, EventType, Metadata, Resource};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Records events against involved objects.
#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<Store>,
    component: &'static str,
    sequence: Arc<AtomicU64>,
}

impl EventRecorder {
    /// Build a recorder attributed to `component`.
    pub fn new(store: Arc<Store>, component: &'static str) -> Self {
        Self {
            store,
            component,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record an informational event.
    pub fn normal<R: Resource>(&self, obj: &R, reason: &str, message: impl Into<String>) {
        self.record(obj, EventType::Normal, reason, message.into());
    }

    /// Record a warning event.
    pub fn warning<R: Resource>(&self, obj: &R, reason: &str, message: impl Into<String>) {
        self.record(obj, EventType::Warning, reason, message.into());
    }

    fn record<R: Resource>(&self, obj: &R, event_type: EventType, reason: &str, message: String) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let meta = obj.metadata();
        debug!(
            kind = R::KIND,
            object = %meta.key(),
            reason,
            %message,
            "event"
        );
        let event = Event {
            metadata: Metadata::named(
                meta.namespace.clone(),
                format!("{}.{}.{seq}", meta.name, self.component),
            ),
            event_type,
            reason: reason.to_string(),
            message,
            involved_kind: R::KIND.to_string(),
            involved_name: meta.name.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.events.create(event) {
            warn!(error = %e, "failed to record event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::GameServer;

    #[test]
    fn events_land_in_the_store() {
        let store = Store::new();
        let recorder = EventRecorder::new(store.clone(), "test");
        let gs = GameServer {
            metadata: Metadata::named("default", "gs-1"),
            ..GameServer::default()
        };
        recorder.normal(&gs, "Created", "created for test");
        recorder.warning(&gs, "Unhealthy", "missed 3 health pings");

        let events = store.events.list(Some("default"), None);
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.reason == "Unhealthy"));
        assert!(events.iter().all(|e| e.involved_name == "gs-1"));
    }
}
