//! GameServer lifecycle controller: drives each server through its state
//! machine and owns its pod.

pub mod counter;
pub mod health;
pub mod sdk;

pub use counter::{NodeCount, NodeCounter};
pub use health::HealthMonitor;
pub use sdk::{SdkError, SdkService};

use crate::ports::{PortAllocator, PortError};
use crate::resources::{
    Container, ContainerPort, EnvVar, GameServer, GameServerState, GameServerStatusPort, Metadata,
    ObjectKey, Pod, Probe, Resource, ResourceRequests,
};
use crate::store::{update_with_retry, Cache, EventRecorder, Store, StoreError, WatchEvent};
use crate::workqueue::WorkQueue;
use crate::GAME_SERVER_FINALIZER;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Name of the injected sidecar container.
pub const SIDECAR_CONTAINER: &str = "gameserver-sidecar";
/// Label tying a pod to its GameServer.
pub const GAME_SERVER_POD_LABEL: &str = "agones.dev/gameserver";
/// Sidecar liveness endpoint.
const SIDECAR_HEALTH_PATH: &str = "/gshealthz";
/// Sidecar liveness port.
const SIDECAR_HEALTH_PORT: u16 = 8080;

/// Controller result type.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Reconcile failures. Transient ones re-queue with backoff.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The store rejected an operation; retried with backoff.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Port exhaustion; the server stays in PortAllocation for retry.
    #[error(transparent)]
    Ports(#[from] PortError),
}

/// Sidecar injection settings, from the command line.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Sidecar image reference.
    pub image: String,
    /// CPU request quantity.
    pub cpu_request: String,
    /// CPU limit quantity.
    pub cpu_limit: String,
    /// Always pull the sidecar image.
    pub always_pull: bool,
}

/// GameServer lifecycle controller.
pub struct GameServerController {
    store: Arc<Store>,
    game_servers: Cache<GameServer>,
    pods: Cache<Pod>,
    queue: Arc<WorkQueue>,
    port_allocator: Arc<PortAllocator>,
    sidecar: SidecarConfig,
    recorder: EventRecorder,
}

impl GameServerController {
    /// Wire the controller: caches feed the work queue, node events feed the
    /// port allocator.
    pub fn new(
        store: Arc<Store>,
        port_allocator: Arc<PortAllocator>,
        sidecar: SidecarConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let queue = WorkQueue::new("gameservers");

        let gs_queue = Arc::clone(&queue);
        let game_servers = Cache::start(
            store.clone(),
            |s| &s.game_servers,
            move |event| gs_queue.add(event.object().key()),
            shutdown.clone(),
        );

        // Pod events reconcile the owning GameServer.
        let pod_queue = Arc::clone(&queue);
        let pods = Cache::start(
            store.clone(),
            |s| &s.pods,
            move |event| {
                let pod = event.object();
                if pod.metadata.labels.contains_key(GAME_SERVER_POD_LABEL) {
                    pod_queue.add(pod.key());
                }
            },
            shutdown.clone(),
        );

        let recorder = EventRecorder::new(store.clone(), "gameserver-controller");
        Arc::new(Self {
            store,
            game_servers,
            pods,
            queue,
            port_allocator,
            sidecar,
            recorder,
        })
    }

    /// Run `workers` reconcile workers plus the node watcher until shutdown.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: watch::Receiver<bool>) {
        let stopper = Arc::clone(&self.queue);
        let mut stop_rx = shutdown.clone();
        tokio::spawn(async move {
            while stop_rx.changed().await.is_ok() {
                if *stop_rx.borrow() {
                    stopper.shut_down();
                    return;
                }
            }
            stopper.shut_down();
        });

        tokio::spawn(Arc::clone(&self).watch_nodes(shutdown.clone()));

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
                    warn!(game_server = %key, error = %e, "reconcile failed");
                    self.queue.add_rate_limited(key.clone());
                }
            }
            self.queue.done(&key);
        }
    }

    /// Keep the port-allocator node table current and re-reconcile servers
    /// stranded by node removal.
    async fn watch_nodes(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.store.nodes.watch();
        for node in self.store.nodes.snapshot() {
            self.port_allocator.node_added(&node.metadata.name);
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                event = rx.recv() => match event {
                    Ok(WatchEvent::Added(node)) => {
                        self.port_allocator.node_added(&node.metadata.name);
                    }
                    Ok(WatchEvent::Deleted(node)) => {
                        let orphaned = self.port_allocator.node_removed(&node.metadata.name);
                        for uid in orphaned {
                            self.requeue_stranded(&uid);
                        }
                    }
                    Ok(WatchEvent::Modified(_)) => {}
                    Err(RecvError::Lagged(_)) => {
                        for node in self.store.nodes.snapshot() {
                            self.port_allocator.node_added(&node.metadata.name);
                        }
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }
    }

    /// A node vanished under this server. Not-yet-scheduled servers go back
    /// through port allocation; anything already serving there is lost and
    /// marked Unhealthy.
    fn requeue_stranded(&self, uid: &str) {
        let Some(gs) = self
            .store
            .game_servers
            .snapshot()
            .into_iter()
            .find(|gs| gs.metadata.uid == uid)
        else {
            return;
        };
        let key = gs.key();
        let result = update_with_retry(&self.store.game_servers, &key, |gs| {
            if gs.status.state.is_before_ready() && gs.status.node_name.is_empty() {
                for port in &mut gs.spec.ports {
                    if port.port_policy != crate::resources::PortPolicy::Static {
                        port.host_port = None;
                    }
                }
                gs.status.state = GameServerState::PortAllocation;
            } else if !gs.status.state.is_terminal() {
                gs.status.state = GameServerState::Unhealthy;
            } else {
                return false;
            }
            true
        });
        if let Err(e) = result {
            if !e.is_not_found() {
                warn!(game_server = %key, error = %e, "failed to reset stranded server");
            }
        }
        self.queue.add(key);
    }

    /// Reconcile one GameServer key.
    pub fn sync(&self, key: &ObjectKey) -> Result<()> {
        let Some(gs) = self.game_servers.get(key) else {
            // Deleted while queued.
            self.queue.forget(key);
            return Ok(());
        };

        if gs.metadata.is_being_deleted() {
            return self.sync_deletion_timestamp(&gs);
        }

        match gs.status.state {
            GameServerState::PortAllocation => self.sync_port_allocation(&gs),
            GameServerState::Creating => self.sync_creating(&gs),
            GameServerState::Starting => self.sync_starting(&gs),
            GameServerState::RequestReady => self.sync_request_ready(&gs),
            GameServerState::Reserved => self.sync_reserved(&gs),
            GameServerState::Shutdown => self.sync_shutdown(&gs),
            // Scheduled waits on the sidecar; Ready and Allocated idle;
            // Unhealthy and Error are terminal for reconciliation.
            _ => Ok(()),
        }
    }

    /// The record is going away: delete the owned pod, then drop the
    /// finalizer once it is gone.
    fn sync_deletion_timestamp(&self, gs: &GameServer) -> Result<()> {
        let key = gs.key();
        if gs.is_dev_address().is_none() {
            let pods = self.owned_pods(gs);
            let mut waiting = false;
            for pod in pods {
                waiting = true;
                if !pod.metadata.is_being_deleted() {
                    debug!(game_server = %key, pod = %pod.key(), "deleting pod for teardown");
                    match self.store.pods.delete(&pod.key()) {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            if waiting {
                // Pod deletion events will re-queue us.
                return Ok(());
            }
        }

        self.port_allocator.release(&gs.metadata.uid);
        update_with_retry(&self.store.game_servers, &key, |gs| {
            let before = gs.metadata.finalizers.len();
            gs.metadata.finalizers.retain(|f| f != GAME_SERVER_FINALIZER);
            gs.metadata.finalizers.len() != before
        })?;
        info!(game_server = %key, "finalizer removed, record released");
        Ok(())
    }

    fn sync_port_allocation(&self, gs: &GameServer) -> Result<()> {
        let key = gs.key();

        if let Some(address) = gs.is_dev_address() {
            let address = address.to_string();
            update_with_retry(&self.store.game_servers, &key, |gs| {
                if gs.status.state != GameServerState::PortAllocation {
                    return false;
                }
                gs.status.address = address.clone();
                gs.status.ports = gs
                    .spec
                    .ports
                    .iter()
                    .map(|p| GameServerStatusPort {
                        name: p.name.clone(),
                        port: p.host_port.unwrap_or(p.container_port),
                    })
                    .collect();
                gs.status.state = GameServerState::Ready;
                true
            })?;
            info!(game_server = %key, "development server ready, no pod managed");
            return Ok(());
        }

        if !gs.needs_port_allocation() {
            update_with_retry(&self.store.game_servers, &key, |gs| {
                if gs.status.state != GameServerState::PortAllocation {
                    return false;
                }
                gs.status.state = GameServerState::Creating;
                true
            })?;
            return Ok(());
        }

        let mut candidate = gs.clone();
        match self.port_allocator.allocate(&mut candidate) {
            Ok(node) => {
                let ports = candidate.spec.ports.clone();
                update_with_retry(&self.store.game_servers, &key, |gs| {
                    if gs.status.state != GameServerState::PortAllocation {
                        return false;
                    }
                    gs.spec.ports = ports.clone();
                    gs.status.state = GameServerState::Creating;
                    true
                })?;
                debug!(game_server = %key, node = %node, "ports assigned");
                Ok(())
            }
            Err(e) => {
                self.recorder
                    .warning(gs, "PortAllocation", format!("{e}"));
                Err(e.into())
            }
        }
    }

    fn sync_creating(&self, gs: &GameServer) -> Result<()> {
        let key = gs.key();
        if self.owned_pods(gs).is_empty() {
            match self.build_pod(gs) {
                Ok(pod) => {
                    match self.store.pods.create(pod) {
                        Ok(created) => {
                            self.recorder.normal(
                                gs,
                                "Creating",
                                format!("pod {} created", created.metadata.name),
                            );
                        }
                        Err(e) if matches!(e, StoreError::AlreadyExists { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(reason) => {
                    warn!(game_server = %key, %reason, "invalid pod spec");
                    self.recorder.warning(gs, "InvalidPodSpec", reason);
                    update_with_retry(&self.store.game_servers, &key, |gs| {
                        gs.status.state = GameServerState::Error;
                        true
                    })?;
                    return Ok(());
                }
            }
        }
        update_with_retry(&self.store.game_servers, &key, |gs| {
            if gs.status.state != GameServerState::Creating {
                return false;
            }
            gs.status.state = GameServerState::Starting;
            true
        })?;
        Ok(())
    }

    fn sync_starting(&self, gs: &GameServer) -> Result<()> {
        self.resolve_address(gs, GameServerState::Starting, GameServerState::Scheduled)
    }

    fn sync_request_ready(&self, gs: &GameServer) -> Result<()> {
        if gs.status.address.is_empty() {
            return self.resolve_address(gs, GameServerState::RequestReady, GameServerState::Ready);
        }
        update_with_retry(&self.store.game_servers, &gs.key(), |gs| {
            if gs.status.state != GameServerState::RequestReady {
                return false;
            }
            gs.status.state = GameServerState::Ready;
            true
        })?;
        Ok(())
    }

    /// Populate address, node and ports from the scheduled pod, then advance.
    /// Waits (without error) while the pod is still unscheduled.
    fn resolve_address(
        &self,
        gs: &GameServer,
        from: GameServerState,
        to: GameServerState,
    ) -> Result<()> {
        let key = gs.key();
        let Some(pod) = self.owned_pods(gs).into_iter().next() else {
            // Pod lost before scheduling; recreate via Creating.
            update_with_retry(&self.store.game_servers, &key, |gs| {
                if gs.status.state != from {
                    return false;
                }
                gs.status.state = GameServerState::Creating;
                true
            })?;
            return Ok(());
        };
        let Some(node_name) = pod.spec.node_name.clone() else {
            // Not scheduled yet; the pod update will re-queue us.
            return Ok(());
        };

        let node = self
            .store
            .nodes
            .get(&ObjectKey::new("", node_name.clone()))?;
        let address = node.external_address().unwrap_or_default().to_string();

        update_with_retry(&self.store.game_servers, &key, |gs| {
            if gs.status.state != from {
                return false;
            }
            gs.status.address = address.clone();
            gs.status.node_name = node_name.clone();
            gs.status.ports = gs
                .spec
                .ports
                .iter()
                .filter_map(|p| {
                    p.host_port.map(|port| GameServerStatusPort {
                        name: p.name.clone(),
                        port,
                    })
                })
                .collect();
            gs.status.state = to;
            true
        })?;
        debug!(game_server = %key, node = %node_name, state = %to, "address resolved");
        Ok(())
    }

    /// A Reserved server returns to Ready once its deadline passes.
    fn sync_reserved(&self, gs: &GameServer) -> Result<()> {
        let key = gs.key();
        let Some(deadline) = gs.status.reserved_until else {
            return Ok(());
        };
        let now = Utc::now();
        if deadline <= now {
            update_with_retry(&self.store.game_servers, &key, |gs| {
                if gs.status.state != GameServerState::Reserved {
                    return false;
                }
                gs.status.state = GameServerState::Ready;
                gs.status.reserved_until = None;
                true
            })?;
            return Ok(());
        }
        let remaining = (deadline - now)
            .to_std()
            .unwrap_or(Duration::from_millis(100));
        self.queue.add_after(key, remaining + Duration::from_millis(50));
        Ok(())
    }

    fn sync_shutdown(&self, gs: &GameServer) -> Result<()> {
        match self.store.game_servers.delete(&gs.key()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn owned_pods(&self, gs: &GameServer) -> Vec<Pod> {
        self.pods.list_owned(&gs.metadata.uid)
    }

    /// Construct the pod for a GameServer: template containers with the game
    /// container's ports bound, plus the injected sidecar.
    fn build_pod(&self, gs: &GameServer) -> std::result::Result<Pod, String> {
        let mut containers = gs.spec.template.spec.containers.clone();
        let game = containers
            .iter_mut()
            .find(|c| c.name == gs.spec.container)
            .ok_or_else(|| {
                format!(
                    "container {:?} not present in pod template",
                    gs.spec.container
                )
            })?;

        game.ports = gs
            .spec
            .ports
            .iter()
            .map(|p| ContainerPort {
                container_port: p.container_port,
                host_port: p.host_port,
                protocol: p.protocol.to_string(),
            })
            .collect();

        containers.push(Container {
            name: SIDECAR_CONTAINER.to_string(),
            image: self.sidecar.image.clone(),
            always_pull: self.sidecar.always_pull,
            env: vec![
                EnvVar {
                    name: "GAMESERVER_NAME".to_string(),
                    value: gs.metadata.name.clone(),
                },
                EnvVar {
                    name: "POD_NAMESPACE".to_string(),
                    value: gs.metadata.namespace.clone(),
                },
            ],
            ports: Vec::new(),
            resources: ResourceRequests {
                cpu_request: Some(self.sidecar.cpu_request.clone()),
                cpu_limit: Some(self.sidecar.cpu_limit.clone()),
            },
            liveness_probe: Some(Probe {
                path: SIDECAR_HEALTH_PATH.to_string(),
                port: SIDECAR_HEALTH_PORT,
                initial_delay_seconds: gs.spec.health.initial_delay_seconds,
                period_seconds: gs.spec.health.period_seconds,
                failure_threshold: gs.spec.health.failure_threshold,
            }),
        });

        let mut metadata = Metadata::named(gs.metadata.namespace.clone(), gs.metadata.name.clone());
        metadata.labels = gs.spec.template.labels.clone();
        metadata
            .labels
            .insert(GAME_SERVER_POD_LABEL.to_string(), gs.metadata.name.clone());
        metadata.annotations = gs.spec.template.annotations.clone();
        metadata.owner_references.push(gs.controller_owner_ref());

        Ok(Pod {
            metadata,
            spec: crate::resources::PodSpec {
                // Host ports were reserved on a specific node; bind there.
                node_name: self.port_allocator.node_for(&gs.metadata.uid),
                containers,
            },
            status: Default::default(),
        })
    }
}
