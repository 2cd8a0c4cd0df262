//! Fleet controller: owns the GameServerSets realising a fleet's template
//! revisions and steps rollouts without ever interrupting allocated sessions.

use crate::resources::{
    DeploymentStrategy, Fleet, FleetStatus, GameServerSet, ObjectKey, Resource,
};
use crate::store::{update_with_retry, Cache, EventRecorder, Store, StoreError};
use crate::workqueue::WorkQueue;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Controller result type.
pub type Result<T> = std::result::Result<T, FleetControllerError>;

/// Reconcile failures.
#[derive(Debug, Error)]
pub enum FleetControllerError {
    /// The store rejected an operation; retried with backoff.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Rolling-update parameters failed to resolve.
    #[error("invalid rollout parameters: {0}")]
    InvalidStrategy(String),
}

/// Fleet controller.
pub struct FleetController {
    store: Arc<Store>,
    fleets: Cache<Fleet>,
    queue: Arc<WorkQueue>,
    recorder: EventRecorder,
}

impl FleetController {
    /// Wire the controller: fleet events and owned-set events feed the work
    /// queue.
    pub fn new(store: Arc<Store>, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let queue = WorkQueue::new("fleets");

        let fleet_queue = Arc::clone(&queue);
        let fleets = Cache::start(
            store.clone(),
            |s| &s.fleets,
            move |event| fleet_queue.add(event.object().key()),
            shutdown.clone(),
        );

        // Set events reconcile the owning fleet; the cache handle itself is
        // not needed beyond the wiring.
        let set_queue = Arc::clone(&queue);
        Cache::start(
            store.clone(),
            |s| &s.game_server_sets,
            move |event| {
                let set = event.object();
                if let Some(owner) = set.metadata.controller_ref() {
                    if owner.kind == Fleet::KIND {
                        set_queue.add(ObjectKey::new(
                            set.metadata.namespace.clone(),
                            owner.name.clone(),
                        ));
                    }
                }
            },
            shutdown,
        );

        let recorder = EventRecorder::new(store.clone(), "fleet-controller");
        Arc::new(Self {
            store,
            fleets,
            queue,
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
                    warn!(fleet = %key, error = %e, "reconcile failed");
                    self.queue.add_rate_limited(key.clone());
                }
            }
            self.queue.done(&key);
        }
    }

    /// Reconcile one Fleet key.
    pub fn sync(&self, key: &ObjectKey) -> Result<()> {
        let Some(fleet) = self.fleets.get(key) else {
            self.queue.forget(key);
            return Ok(());
        };
        if fleet.metadata.is_being_deleted() {
            return Ok(());
        }

        // Listed from the store, not the informer cache: two quick syncs
        // against a stale cache would otherwise create duplicate active sets.
        let owned = self.store.game_server_sets.list_owned(&fleet.metadata.uid);
        let (mut matching, rest): (Vec<GameServerSet>, Vec<GameServerSet>) = owned
            .into_iter()
            .partition(|set| set.spec.template == fleet.spec.template);
        // Oldest matching set is the active one; any duplicate joins the
        // scale-down pool.
        matching.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        let mut matching = matching.into_iter();
        let mut active = matching.next();
        let rest: Vec<GameServerSet> = rest
            .into_iter()
            .chain(matching)
            .filter(|set| !set.metadata.is_being_deleted())
            .collect();

        // Empty superseded sets are reaped before anything else.
        let mut live_rest = Vec::new();
        for set in rest {
            if set.status.replicas == 0 && set.spec.replicas == 0 {
                info!(fleet = %key, set = %set.key(), "deleting empty superseded set");
                match self.store.game_server_sets.delete(&set.key()) {
                    Ok(()) => {
                        self.recorder.normal(
                            &fleet,
                            "DeletingGameServerSet",
                            format!("deleted empty set {}", set.metadata.name),
                        );
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                live_rest.push(set);
            }
        }

        let active_ref = match active.take() {
            Some(set) => set,
            None => {
                let set = fleet.game_server_set();
                debug!(fleet = %key, set = %set.metadata.name, "creating active set");
                let set = match self.store.game_server_sets.create(set) {
                    Ok(set) => set,
                    Err(e) if matches!(e, StoreError::AlreadyExists { .. }) => {
                        // Name collision; retry with a fresh suffix next pass.
                        return Err(e.into());
                    }
                    Err(e) => return Err(e.into()),
                };
                self.recorder.normal(
                    &fleet,
                    "CreatingGameServerSet",
                    format!("created set {}", set.metadata.name),
                );
                set
            }
        };

        let active_target = match &fleet.spec.strategy {
            DeploymentStrategy::Recreate => self.apply_recreate(&fleet, &live_rest)?,
            DeploymentStrategy::RollingUpdate {
                max_surge,
                max_unavailable,
            } => self.apply_rolling_update(
                &fleet,
                &active_ref,
                &live_rest,
                max_surge,
                max_unavailable,
            )?,
        };

        if active_ref.spec.replicas != active_target {
            debug!(
                fleet = %key,
                set = %active_ref.metadata.name,
                from = active_ref.spec.replicas,
                to = active_target,
                "resizing active set"
            );
            update_with_retry(&self.store.game_server_sets, &active_ref.key(), |set| {
                if set.spec.replicas == active_target {
                    return false;
                }
                set.spec.replicas = active_target;
                true
            })?;
        }

        self.update_status(&fleet)?;
        Ok(())
    }

    /// Recreate: superseded sets drop straight to zero. Their allocated
    /// servers survive scale-down and the empty sets are reaped later.
    fn apply_recreate(&self, fleet: &Fleet, rest: &[GameServerSet]) -> Result<u32> {
        for set in rest {
            if set.spec.replicas != 0 {
                update_with_retry(&self.store.game_server_sets, &set.key(), |set| {
                    if set.spec.replicas == 0 {
                        return false;
                    }
                    set.spec.replicas = 0;
                    true
                })?;
            }
        }
        Ok(self.active_target(fleet, rest))
    }

    /// RollingUpdate: step old sets down by up to maxUnavailable ready
    /// servers per pass, and let the active set grow only as far as the
    /// surge budget above the declared size allows.
    fn apply_rolling_update(
        &self,
        fleet: &Fleet,
        active: &GameServerSet,
        rest: &[GameServerSet],
        max_surge: &crate::resources::IntOrString,
        max_unavailable: &crate::resources::IntOrString,
    ) -> Result<u32> {
        let desired = fleet.spec.replicas;
        let surge = max_surge
            .resolve_round_up(desired)
            .map_err(FleetControllerError::InvalidStrategy)?
            .max(1);
        let unavailable = max_unavailable
            .resolve_round_down(desired)
            .map_err(FleetControllerError::InvalidStrategy)?
            .max(1);

        // Step the largest superseded set down first.
        let mut rest_sorted: Vec<&GameServerSet> = rest.iter().collect();
        rest_sorted.sort_by(|a, b| b.spec.replicas.cmp(&a.spec.replicas));
        let mut down_budget = unavailable;
        for set in rest_sorted {
            if down_budget == 0 || set.spec.replicas == 0 {
                continue;
            }
            let step = set.spec.replicas.min(down_budget);
            let target = set.spec.replicas - step;
            down_budget -= step;
            update_with_retry(&self.store.game_server_sets, &set.key(), |set| {
                if set.spec.replicas <= target {
                    return false;
                }
                set.spec.replicas = target;
                true
            })?;
        }

        // Grow the active set within the surge budget over everything still
        // standing, converging on the recreate target as old sets drain.
        let ceiling = self.active_target(fleet, rest);
        let total_rest: u32 = rest.iter().map(|s| s.status.replicas).sum();
        let room = (desired + surge).saturating_sub(total_rest);
        let grown = active.spec.replicas.max(room.min(ceiling));
        Ok(grown.min(ceiling))
    }

    /// Replicas the active set converges to: the declared size less every
    /// allocated server still living in superseded sets.
    fn active_target(&self, fleet: &Fleet, rest: &[GameServerSet]) -> u32 {
        let rest_allocated: u32 = rest.iter().map(|s| s.status.allocated_replicas).sum();
        fleet.spec.replicas.saturating_sub(rest_allocated)
    }

    /// Fleet status is the sum over every owned set.
    fn update_status(&self, fleet: &Fleet) -> Result<()> {
        let owned = self.store.game_server_sets.list_owned(&fleet.metadata.uid);
        let mut status = FleetStatus::default();
        for set in &owned {
            status.replicas += set.status.replicas;
            status.ready_replicas += set.status.ready_replicas;
            status.allocated_replicas += set.status.allocated_replicas;
            status.reserved_replicas += set.status.reserved_replicas;
        }
        if fleet.status == status {
            return Ok(());
        }
        update_with_retry(&self.store.fleets, &fleet.key(), |fleet| {
            if fleet.status == status {
                return false;
            }
            fleet.status = status.clone();
            true
        })?;
        Ok(())
    }
}
