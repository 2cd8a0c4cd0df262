//! Owner-reference garbage collection: when a controller owner disappears,
//! everything it controlled is deleted in turn. Deletion still honours
//! finalizers, so a cascaded GameServer is only marked until its controller
//! releases it.

use super::{Store, WatchEvent};
use crate::resources::Resource;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Run the cascade task until `shutdown` flips to true.
pub async fn run(store: Arc<Store>, mut shutdown: watch::Receiver<bool>) {
    let mut fleets = store.fleets.watch();
    let mut sets = store.game_server_sets.watch();
    let mut game_servers = store.game_servers.watch();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            event = fleets.recv() => {
                if let Ok(WatchEvent::Deleted(fleet)) = event {
                    cascade(&store, |s| &s.game_server_sets, &fleet.metadata.uid);
                }
            }
            event = sets.recv() => {
                if let Ok(WatchEvent::Deleted(set)) = event {
                    cascade(&store, |s| &s.game_servers, &set.metadata.uid);
                }
            }
            event = game_servers.recv() => {
                if let Ok(WatchEvent::Deleted(gs)) = event {
                    cascade(&store, |s| &s.pods, &gs.metadata.uid);
                }
            }
        }
    }
}

fn cascade<R: Resource>(
    store: &Store,
    select: impl Fn(&Store) -> &super::Collection<R>,
    owner_uid: &str,
) {
    for owned in select(store).list_owned(owner_uid) {
        let key = owned.key();
        debug!(kind = R::KIND, object = %key, "cascading deletion");
        match select(store).delete(&key) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(kind = R::KIND, object = %key, error = %e, "cascade delete failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Fleet, GameServer, GameServerSet, Metadata, Pod};
    use std::time::Duration;

    #[tokio::test]
    async fn deleting_a_fleet_cascades_to_servers_and_pods() {
        let store = Store::new();
        let (_tx, shutdown) = watch::channel(false);
        tokio::spawn(run(store.clone(), shutdown));

        let fleet = store
            .fleets
            .create(Fleet {
                metadata: Metadata::named("default", "simple"),
                ..Fleet::default()
            })
            .unwrap();

        let mut set = GameServerSet {
            metadata: Metadata::named("default", "simple-abcde"),
            ..GameServerSet::default()
        };
        set.metadata.owner_references.push(fleet.controller_owner_ref());
        let set = store.game_server_sets.create(set).unwrap();

        let mut gs = GameServer {
            metadata: Metadata::named("default", "simple-abcde-12345"),
            ..GameServer::default()
        };
        gs.metadata.owner_references.push(set.controller_owner_ref());
        let gs = store.game_servers.create(gs).unwrap();

        let mut pod = Pod {
            metadata: Metadata::named("default", "simple-abcde-12345"),
            ..Pod::default()
        };
        pod.metadata.owner_references.push(gs.controller_owner_ref());
        store.pods.create(pod).unwrap();

        store.fleets.delete(&fleet.key()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.game_server_sets.snapshot().is_empty());
        assert!(store.game_servers.snapshot().is_empty());
        assert!(store.pods.snapshot().is_empty());
    }
}
