//! Host-port allocation for Dynamic and Passthrough port policies.
//!
//! One table guards the whole cluster: per node, a map of `(port, protocol)`
//! to the UID of the non-terminal GameServer holding it. Allocation picks a
//! node (Packed prefers nodes already hosting servers from the same set,
//! Distributed picks at random) and binds the lowest-numbered free ports on
//! it; all ports of one server land on the same node, and the pod is later
//! bound there so the host ports actually resolve.

use crate::resources::{GameServer, Node, PortPolicy, Protocol, Resource, SchedulingStrategy};
use crate::GAME_SERVER_SET_LABEL;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Port allocation result type.
pub type Result<T> = std::result::Result<T, PortError>;

/// Port allocation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// Every `(node, port)` pair in range is taken.
    #[error("no ports available in range {min}-{max}")]
    NoPortsAvailable {
        /// Low end of the configured range.
        min: u16,
        /// High end of the configured range.
        max: u16,
    },
}

#[derive(Clone)]
struct Binding {
    uid: String,
    set: Option<String>,
}

#[derive(Default)]
struct NodePorts {
    bindings: HashMap<(u16, Protocol), Binding>,
}

impl NodePorts {
    fn holds_set(&self, set: &str) -> bool {
        self.bindings
            .values()
            .any(|b| b.set.as_deref() == Some(set))
    }
}

#[derive(Default)]
struct Table {
    // BTreeMap keeps node scanning order deterministic.
    nodes: BTreeMap<String, NodePorts>,
    node_by_uid: HashMap<String, String>,
}

/// Process-wide host-port allocator.
pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    table: Mutex<Table>,
}

impl PortAllocator {
    /// Build an allocator over `[min_port, max_port]`.
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            min_port,
            max_port,
            table: Mutex::new(Table::default()),
        }
    }

    /// Replay cluster state into the table: register every node and re-bind
    /// the ports of every non-terminal GameServer that already has them.
    /// Called when the leader lease is acquired.
    pub fn sync(&self, nodes: &[Node], game_servers: &[GameServer]) {
        let mut table = self.table.lock();
        table.nodes.clear();
        table.node_by_uid.clear();
        for node in nodes {
            table.nodes.entry(node.metadata.name.clone()).or_default();
        }
        let mut replayed = 0usize;
        for gs in game_servers {
            if gs.status.state.is_terminal() || gs.metadata.is_being_deleted() {
                continue;
            }
            let node_name = &gs.status.node_name;
            if node_name.is_empty() {
                continue;
            }
            let set = gs.metadata.labels.get(GAME_SERVER_SET_LABEL).cloned();
            let node = table.nodes.entry(node_name.clone()).or_default();
            for port in &gs.spec.ports {
                if let Some(host_port) = port.host_port {
                    node.bindings.insert(
                        (host_port, port.protocol),
                        Binding {
                            uid: gs.metadata.uid.clone(),
                            set: set.clone(),
                        },
                    );
                    replayed += 1;
                }
            }
            table
                .node_by_uid
                .insert(gs.metadata.uid.clone(), node_name.clone());
        }
        info!(
            nodes = table.nodes.len(),
            bindings = replayed,
            "port allocator synchronised"
        );
    }

    /// Assign host ports to every port of `gs` that needs one and record the
    /// node they were bound on. Returns the chosen node name.
    pub fn allocate(&self, gs: &mut GameServer) -> Result<String> {
        let mut table = self.table.lock();
        let set = gs.metadata.labels.get(GAME_SERVER_SET_LABEL).cloned();
        let node_order = self.node_order(&table, gs);

        for node_name in node_order {
            if let Some(assignments) = self.fit_on_node(&table, &node_name, gs) {
                for (idx, host_port) in &assignments {
                    let port = &mut gs.spec.ports[*idx];
                    port.host_port = Some(*host_port);
                    if port.port_policy == PortPolicy::Passthrough {
                        port.container_port = *host_port;
                    }
                }
                // Record every bound port, static declarations included, so
                // later dynamic assignments cannot land on them.
                let node = table.nodes.entry(node_name.clone()).or_default();
                for port in &gs.spec.ports {
                    if let Some(host_port) = port.host_port {
                        node.bindings.insert(
                            (host_port, port.protocol),
                            Binding {
                                uid: gs.metadata.uid.clone(),
                                set: set.clone(),
                            },
                        );
                    }
                }
                table
                    .node_by_uid
                    .insert(gs.metadata.uid.clone(), node_name.clone());
                debug!(
                    game_server = %gs.key(),
                    node = %node_name,
                    ports = assignments.len(),
                    "allocated host ports"
                );
                return Ok(node_name);
            }
        }

        Err(PortError::NoPortsAvailable {
            min: self.min_port,
            max: self.max_port,
        })
    }

    /// Node scan order. Packed prefers nodes already holding bindings from
    /// the same GameServerSet, then denser nodes, then name; Distributed
    /// shuffles.
    fn node_order(&self, table: &Table, gs: &GameServer) -> Vec<String> {
        let mut names: Vec<String> = table.nodes.keys().cloned().collect();
        match gs.spec.scheduling {
            SchedulingStrategy::Packed => {
                let set = gs.metadata.labels.get(GAME_SERVER_SET_LABEL);
                names.sort_by(|a, b| {
                    let affinity = |n: &String| {
                        set.map(|s| {
                            table
                                .nodes
                                .get(n)
                                .map(|np| np.holds_set(s))
                                .unwrap_or(false)
                        })
                        .unwrap_or(false)
                    };
                    let density =
                        |n: &String| table.nodes.get(n).map(|np| np.bindings.len()).unwrap_or(0);
                    affinity(b)
                        .cmp(&affinity(a))
                        .then_with(|| density(b).cmp(&density(a)))
                        .then_with(|| a.cmp(b))
                });
            }
            SchedulingStrategy::Distributed => {
                names.shuffle(&mut rand::thread_rng());
            }
        }
        names
    }

    /// Try to place all of `gs`'s unassigned ports on one node. Returns the
    /// `(spec index, host port)` assignments on success.
    fn fit_on_node(
        &self,
        table: &Table,
        node_name: &str,
        gs: &GameServer,
    ) -> Option<Vec<(usize, u16)>> {
        let empty = NodePorts::default();
        let node = table.nodes.get(node_name).unwrap_or(&empty);
        let mut taken: HashMap<(u16, Protocol), ()> = node
            .bindings
            .keys()
            .map(|k| (*k, ()))
            .collect();

        let mut assignments = Vec::new();
        for (idx, port) in gs.spec.ports.iter().enumerate() {
            match (port.port_policy, port.host_port) {
                (PortPolicy::Static, Some(host)) => {
                    if taken.contains_key(&(host, port.protocol)) {
                        return None;
                    }
                    taken.insert((host, port.protocol), ());
                }
                (PortPolicy::Dynamic | PortPolicy::Passthrough, None) => {
                    let found = (self.min_port..=self.max_port)
                        .find(|p| !taken.contains_key(&(*p, port.protocol)));
                    match found {
                        Some(host) => {
                            taken.insert((host, port.protocol), ());
                            assignments.push((idx, host));
                        }
                        None => return None,
                    }
                }
                // Already assigned, nothing to do.
                _ => {}
            }
        }
        Some(assignments)
    }

    /// Release every binding held by the GameServer with this UID.
    /// Idempotent.
    pub fn release(&self, uid: &str) {
        let mut table = self.table.lock();
        if let Some(node_name) = table.node_by_uid.remove(uid) {
            if let Some(node) = table.nodes.get_mut(&node_name) {
                node.bindings.retain(|_, binding| binding.uid != uid);
            }
        }
    }

    /// Node the given GameServer's ports were bound on.
    pub fn node_for(&self, uid: &str) -> Option<String> {
        self.table.lock().node_by_uid.get(uid).cloned()
    }

    /// Register a node as allocatable.
    pub fn node_added(&self, name: &str) {
        self.table.lock().nodes.entry(name.to_string()).or_default();
    }

    /// Drop a node's row. Returns the UIDs whose assignments referred to the
    /// node; their GameServers need re-reconciliation.
    pub fn node_removed(&self, name: &str) -> Vec<String> {
        let mut table = self.table.lock();
        let Some(node) = table.nodes.remove(name) else {
            return Vec::new();
        };
        let mut orphaned: Vec<String> = node.bindings.into_values().map(|b| b.uid).collect();
        orphaned.sort();
        orphaned.dedup();
        for uid in &orphaned {
            table.node_by_uid.remove(uid);
        }
        if !orphaned.is_empty() {
            warn!(node = name, orphaned = orphaned.len(), "node removed with live port bindings");
        }
        orphaned
    }

    /// Total number of live bindings, across all nodes.
    pub fn bound_count(&self) -> usize {
        self.table
            .lock()
            .nodes
            .values()
            .map(|n| n.bindings.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{GameServerPort, GameServerSpec, Metadata};

    fn allocator_with_nodes(min: u16, max: u16, nodes: &[&str]) -> PortAllocator {
        let alloc = PortAllocator::new(min, max);
        for n in nodes {
            alloc.node_added(n);
        }
        alloc
    }

    fn gs(name: &str, uid: &str, ports: Vec<GameServerPort>) -> GameServer {
        let mut gs = GameServer {
            metadata: Metadata::named("default", name),
            spec: GameServerSpec {
                ports,
                ..GameServerSpec::default()
            },
            ..GameServer::default()
        };
        gs.metadata.uid = uid.to_string();
        gs
    }

    fn dynamic_port(name: &str) -> GameServerPort {
        GameServerPort {
            name: name.to_string(),
            port_policy: PortPolicy::Dynamic,
            container_port: 7654,
            host_port: None,
            protocol: Protocol::Udp,
        }
    }

    #[test]
    fn assigns_lowest_free_port() {
        let alloc = allocator_with_nodes(7000, 7010, &["node-a"]);
        let mut a = gs("a", "uid-a", vec![dynamic_port("game")]);
        let mut b = gs("b", "uid-b", vec![dynamic_port("game")]);
        alloc.allocate(&mut a).unwrap();
        alloc.allocate(&mut b).unwrap();
        assert_eq!(a.spec.ports[0].host_port, Some(7000));
        assert_eq!(b.spec.ports[0].host_port, Some(7001));
    }

    #[test]
    fn different_protocols_share_a_port_number() {
        let alloc = allocator_with_nodes(7000, 7000, &["node-a"]);
        let mut a = gs("a", "uid-a", vec![dynamic_port("game")]);
        let mut tcp = dynamic_port("query");
        tcp.protocol = Protocol::Tcp;
        let mut b = gs("b", "uid-b", vec![tcp]);
        alloc.allocate(&mut a).unwrap();
        alloc.allocate(&mut b).unwrap();
        assert_eq!(a.spec.ports[0].host_port, Some(7000));
        assert_eq!(b.spec.ports[0].host_port, Some(7000));
    }

    #[test]
    fn exhaustion_reports_no_ports() {
        let alloc = allocator_with_nodes(7000, 7001, &["node-a"]);
        for i in 0..2 {
            let mut gs = gs(&format!("gs-{i}"), &format!("uid-{i}"), vec![dynamic_port("game")]);
            alloc.allocate(&mut gs).unwrap();
        }
        let mut overflow = gs("gs-x", "uid-x", vec![dynamic_port("game")]);
        assert_eq!(
            alloc.allocate(&mut overflow).unwrap_err(),
            PortError::NoPortsAvailable { min: 7000, max: 7001 }
        );
    }

    #[test]
    fn no_duplicate_pairs_under_churn() {
        // 5 nodes x range of 100: 100 servers with 5 ports each fit exactly.
        let nodes: Vec<String> = (0..5).map(|i| format!("node-{i}")).collect();
        let node_refs: Vec<&str> = nodes.iter().map(String::as_str).collect();
        let alloc = allocator_with_nodes(7000, 7099, &node_refs);

        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let ports = (0..5)
                .map(|j| dynamic_port(&format!("p{j}")))
                .collect();
            let mut server = gs(&format!("gs-{i}"), &format!("uid-{i}"), ports);
            let node = alloc.allocate(&mut server).unwrap();
            for port in &server.spec.ports {
                let pair = (node.clone(), port.host_port.unwrap(), port.protocol);
                assert!(seen.insert(pair), "duplicate (node, port) binding");
            }
        }
        assert_eq!(alloc.bound_count(), 500);
    }

    #[test]
    fn release_is_idempotent_and_frees_ports() {
        let alloc = allocator_with_nodes(7000, 7000, &["node-a"]);
        let mut a = gs("a", "uid-a", vec![dynamic_port("game")]);
        alloc.allocate(&mut a).unwrap();

        let mut blocked = gs("b", "uid-b", vec![dynamic_port("game")]);
        assert!(alloc.allocate(&mut blocked).is_err());

        alloc.release("uid-a");
        alloc.release("uid-a");
        let mut c = gs("c", "uid-c", vec![dynamic_port("game")]);
        assert_eq!(alloc.allocate(&mut c).unwrap(), "node-a");
    }

    #[test]
    fn node_removal_flags_holders() {
        let alloc = allocator_with_nodes(7000, 7010, &["node-a"]);
        let mut a = gs("a", "uid-a", vec![dynamic_port("game")]);
        alloc.allocate(&mut a).unwrap();
        let orphaned = alloc.node_removed("node-a");
        assert_eq!(orphaned, vec!["uid-a".to_string()]);
        assert!(alloc.node_removed("node-a").is_empty());
    }

    #[test]
    fn static_ports_are_respected() {
        let alloc = allocator_with_nodes(7000, 7001, &["node-a"]);
        let static_port = GameServerPort {
            name: "fixed".to_string(),
            port_policy: PortPolicy::Static,
            container_port: 9000,
            host_port: Some(7000),
            protocol: Protocol::Udp,
        };
        let mut a = gs("a", "uid-a", vec![static_port, dynamic_port("game")]);
        alloc.allocate(&mut a).unwrap();
        // Dynamic port skips the statically held 7000.
        assert_eq!(a.spec.ports[1].host_port, Some(7001));
    }

    #[test]
    fn sync_replays_existing_assignments() {
        let alloc = PortAllocator::new(7000, 7000);
        let mut existing = gs("a", "uid-a", vec![dynamic_port("game")]);
        existing.spec.ports[0].host_port = Some(7000);
        existing.status.node_name = "node-a".to_string();

        let node = Node {
            metadata: Metadata::named("", "node-a"),
            ..Node::default()
        };
        alloc.sync(&[node], &[existing]);

        let mut fresh = gs("b", "uid-b", vec![dynamic_port("game")]);
        assert!(alloc.allocate(&mut fresh).is_err());
    }
}
