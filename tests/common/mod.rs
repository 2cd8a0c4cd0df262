//! Cluster simulation fixture: runs the real store, controllers and
//! allocation engine in-process, with small background tasks standing in for
//! the orchestrator's scheduler and the per-pod sidecar.

use fleetforge::allocator::{AllocationEngine, EngineConfig};
use fleetforge::fleetautoscalers::FleetAutoscalerController;
use fleetforge::fleets::FleetController;
use fleetforge::gameservers::{
    GameServerController, HealthMonitor, NodeCounter, SdkService, SidecarConfig,
};
use fleetforge::gameserversets::GameServerSetController;
use fleetforge::ports::PortAllocator;
use fleetforge::resources::{
    Container, Fleet, FleetSpec, GameServerPort, GameServerSpec, GameServerState,
    GameServerTemplate, Health, Metadata, Node, NodeAddress, NodeAddressType, ObjectKey, PodPhase,
    PodSpec, PodTemplateSpec, Resource,
};
use fleetforge::store::{gc, update_with_retry, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A simulated cluster running the full control plane.
pub struct Cluster {
    /// The object store everything reconciles against.
    pub store: Arc<Store>,
    /// Sidecar-facing SDK operations.
    pub sdk: SdkService,
    /// The allocation engine.
    pub engine: Arc<AllocationEngine>,
    shutdown_tx: watch::Sender<bool>,
}

impl Cluster {
    /// Start the control plane over `node_count` simulated nodes.
    pub async fn start(node_count: usize) -> Self {
        Self::start_with_ports(node_count, 7000, 8000).await
    }

    /// Start with an explicit dynamic port range.
    pub async fn start_with_ports(node_count: usize, min_port: u16, max_port: u16) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = Store::new();
        tokio::spawn(gc::run(store.clone(), shutdown_rx.clone()));

        for i in 0..node_count {
            store
                .nodes
                .create(Node {
                    metadata: Metadata::named("", format!("node-{i}")),
                    status: fleetforge::resources::core::NodeStatus {
                        addresses: vec![
                            NodeAddress {
                                address_type: NodeAddressType::ExternalIP,
                                address: format!("203.0.113.{}", i + 1),
                            },
                            NodeAddress {
                                address_type: NodeAddressType::InternalIP,
                                address: format!("10.0.0.{}", i + 1),
                            },
                        ],
                    },
                })
                .unwrap();
        }

        let counter = NodeCounter::start(store.clone(), shutdown_rx.clone());
        let health = HealthMonitor::new(store.clone());
        tokio::spawn(Arc::clone(&health).run(shutdown_rx.clone()));
        let sdk = SdkService::new(store.clone(), Arc::clone(&health));

        let port_allocator = Arc::new(PortAllocator::new(min_port, max_port));
        port_allocator.sync(&store.nodes.snapshot(), &store.game_servers.snapshot());

        let gs_controller = GameServerController::new(
            store.clone(),
            Arc::clone(&port_allocator),
            SidecarConfig {
                image: "fleetforge/sdk-server:0.1".to_string(),
                cpu_request: "30m".to_string(),
                cpu_limit: "500m".to_string(),
                always_pull: false,
            },
            shutdown_rx.clone(),
        );
        tokio::spawn(gs_controller.run(4, shutdown_rx.clone()));

        let set_controller =
            GameServerSetController::new(store.clone(), Arc::clone(&counter), shutdown_rx.clone());
        tokio::spawn(set_controller.run(1, shutdown_rx.clone()));

        let fleet_controller = FleetController::new(store.clone(), shutdown_rx.clone());
        tokio::spawn(fleet_controller.run(1, shutdown_rx.clone()));

        let autoscaler_controller =
            FleetAutoscalerController::new(store.clone(), Duration::from_millis(500));
        tokio::spawn(autoscaler_controller.run(shutdown_rx.clone()));

        let engine = AllocationEngine::start(
            store.clone(),
            counter,
            EngineConfig {
                workers: 2,
                request_timeout: Duration::from_secs(2),
                cluster_name: Some("local".to_string()),
                ..EngineConfig::default()
            },
            shutdown_rx.clone(),
        );

        tokio::spawn(fake_scheduler(store.clone(), shutdown_rx.clone()));
        tokio::spawn(fake_sidecar(store.clone(), sdk.clone(), shutdown_rx));

        Self {
            store,
            sdk,
            engine,
            shutdown_tx,
        }
    }

    /// Stop every background task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Create a fleet of `replicas` with the standard template.
    pub fn create_fleet(&self, name: &str, replicas: u32) -> Fleet {
        self.store
            .fleets
            .create(Fleet {
                metadata: Metadata::named("default", name),
                spec: FleetSpec {
                    replicas,
                    template: game_server_template(),
                    ..FleetSpec::default()
                },
                status: Default::default(),
            })
            .unwrap()
    }

    /// Patch a fleet's replica count.
    pub fn scale_fleet(&self, name: &str, replicas: u32) {
        update_with_retry(
            &self.store.fleets,
            &ObjectKey::new("default", name),
            |fleet| {
                fleet.spec.replicas = replicas;
                true
            },
        )
        .unwrap();
    }

    /// Current fleet status.
    pub fn fleet_status(&self, name: &str) -> fleetforge::resources::FleetStatus {
        self.store
            .fleets
            .get(&ObjectKey::new("default", name))
            .map(|f| f.status)
            .unwrap_or_default()
    }

    /// Poll until `cond` holds, panicking with `what` after ten seconds.
    pub async fn wait_for(&self, what: &str, cond: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if cond() {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// The standard fleet template: one dynamic UDP port, health checking off so
/// nothing needs to stream pings.
pub fn game_server_template() -> GameServerTemplate {
    GameServerTemplate {
        spec: GameServerSpec {
            ports: vec![GameServerPort {
                name: "game".to_string(),
                container_port: 7654,
                ..Default::default()
            }],
            health: Health {
                disabled: true,
                ..Health::default()
            },
            template: PodTemplateSpec {
                spec: PodSpec {
                    node_name: None,
                    containers: vec![Container {
                        name: "game".to_string(),
                        image: "example/simple-game:0.1".to_string(),
                        ..Container::default()
                    }],
                },
                ..PodTemplateSpec::default()
            },
            ..GameServerSpec::default()
        },
        ..GameServerTemplate::default()
    }
}

/// Stands in for the orchestrator's scheduler and kubelet: binds unscheduled
/// pods to a node and marks pods running. Sweep-based so it never misses a
/// pod, whatever the event volume.
async fn fake_scheduler(store: Arc<Store>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_millis(25));
    let mut next_node = 0usize;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                let nodes = store.nodes.snapshot();
                if nodes.is_empty() {
                    continue;
                }
                for pod in store.pods.snapshot() {
                    if pod.metadata.is_being_deleted() || pod.status.phase == PodPhase::Running {
                        continue;
                    }
                    next_node = (next_node + 1) % nodes.len();
                    let assigned = nodes[next_node].metadata.name.clone();
                    let _ = update_with_retry(&store.pods, &pod.key(), |pod| {
                        if pod.spec.node_name.is_none() {
                            pod.spec.node_name = Some(assigned.clone());
                        }
                        pod.status.phase = PodPhase::Running;
                        true
                    });
                }
            }
        }
    }
}

/// Stands in for the per-pod sidecar: calls Ready as soon as the controller
/// reports the server Scheduled.
async fn fake_sidecar(store: Arc<Store>, sdk: SdkService, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_millis(25));
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                for gs in store.game_servers.snapshot() {
                    if gs.status.state == GameServerState::Scheduled
                        && !gs.metadata.is_being_deleted()
                    {
                        let _ = sdk.ready(&gs.key());
                    }
                }
            }
        }
    }
}
