//! Collaborator records owned by the container orchestrator: pods, nodes,
//! secrets, events and leases. The control plane only reads and writes the
//! fields modelled here.

use super::{impl_resource, Labels, Metadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A pod hosting one game-server process plus its sidecar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pod {
    /// Object metadata.
    pub metadata: Metadata,
    /// Desired pod layout.
    pub spec: PodSpec,
    /// Observed pod state.
    pub status: PodStatus,
}

impl_resource!(Pod, "Pod");

/// Desired pod layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Node the pod is bound to. Empty until scheduled.
    #[serde(default)]
    pub node_name: Option<String>,
    /// Containers to run.
    pub containers: Vec<Container>,
}

/// Observed pod state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodStatus {
    /// Lifecycle phase.
    pub phase: PodPhase,
}

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not yet running.
    #[default]
    Pending,
    /// All containers started.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// At least one container terminated in failure.
    Failed,
}

/// A single container within a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Always pull the image before starting.
    #[serde(default)]
    pub always_pull: bool,
    /// Environment variables.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Exposed ports.
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    /// CPU requests and limits.
    #[serde(default)]
    pub resources: ResourceRequests,
    /// Liveness probe, if configured.
    #[serde(default)]
    pub liveness_probe: Option<Probe>,
}

/// Environment variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// Container port mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerPort {
    /// Port inside the container.
    pub container_port: u16,
    /// Port on the host, when bound.
    #[serde(default)]
    pub host_port: Option<u16>,
    /// Transport protocol name.
    pub protocol: String,
}

/// CPU requests and limits, expressed as quantity strings (e.g. `"30m"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequests {
    /// Requested CPU.
    #[serde(default)]
    pub cpu_request: Option<String>,
    /// CPU limit.
    #[serde(default)]
    pub cpu_limit: Option<String>,
}

/// HTTP liveness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    /// Path to probe.
    pub path: String,
    /// Port to probe.
    pub port: u16,
    /// Seconds to wait before the first probe.
    pub initial_delay_seconds: u32,
    /// Seconds between probes.
    pub period_seconds: u32,
    /// Consecutive failures before the container is restarted.
    pub failure_threshold: u32,
}

/// A cluster node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    /// Object metadata. Nodes are cluster-scoped; namespace is left empty.
    pub metadata: Metadata,
    /// Observed node state.
    pub status: NodeStatus,
}

impl_resource!(Node, "Node");

/// Observed node state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Addresses the node is reachable at.
    pub addresses: Vec<NodeAddress>,
}

/// A node address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Address class.
    pub address_type: NodeAddressType,
    /// The address itself.
    pub address: String,
}

/// Node address class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeAddressType {
    /// Cluster-internal address.
    InternalIP,
    /// Externally routable address.
    ExternalIP,
}

impl Node {
    /// Preferred address for game traffic: external if present, else internal.
    pub fn external_address(&self) -> Option<&str> {
        let find = |t: NodeAddressType| {
            self.status
                .addresses
                .iter()
                .find(|a| a.address_type == t)
                .map(|a| a.address.as_str())
        };
        find(NodeAddressType::ExternalIP).or_else(|| find(NodeAddressType::InternalIP))
    }
}

/// Opaque secret material, e.g. mTLS client certificates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secret {
    /// Object metadata.
    pub metadata: Metadata,
    /// Secret payload, keyed by file name.
    pub data: BTreeMap<String, Vec<u8>>,
}

impl_resource!(Secret, "Secret");

/// Severity class of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something went wrong.
    Warning,
}

/// A recorded notable occurrence tied to an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Object metadata.
    pub metadata: Metadata,
    /// Severity.
    pub event_type: EventType,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
    /// Kind of the object the event is about.
    pub involved_kind: String,
    /// Name of the object the event is about.
    pub involved_name: String,
    /// When the event fired.
    pub timestamp: DateTime<Utc>,
}

impl_resource!(Event, "Event");

/// Leader-election lease.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lease {
    /// Object metadata.
    pub metadata: Metadata,
    /// Identity of the current holder.
    pub holder_identity: String,
    /// When the lease was first acquired by the holder.
    pub acquire_time: Option<DateTime<Utc>>,
    /// Last renewal by the holder.
    pub renew_time: Option<DateTime<Utc>>,
    /// Seconds the lease is valid past the last renewal.
    pub lease_duration_seconds: u64,
}

impl_resource!(Lease, "Lease");

/// Pod template carried inside GameServer specs: metadata to stamp onto the
/// pod plus the containers to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    /// Labels to stamp onto created pods.
    #[serde(default)]
    pub labels: Labels,
    /// Annotations to stamp onto created pods.
    #[serde(default)]
    pub annotations: Labels,
    /// Pod layout.
    pub spec: PodSpec,
}
