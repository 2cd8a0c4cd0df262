//! GameServerAllocation: a one-shot request that claims a Ready GameServer
//! for a game session. Resolved synchronously, never persisted.

use super::{
    impl_resource, GameServerStatusPort, LabelSelector, Labels, Metadata, SchedulingStrategy,
};
use serde::{Deserialize, Serialize};

/// Labels and annotations merged onto the claimed server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaPatch {
    /// Labels to merge.
    #[serde(default)]
    pub labels: Labels,
    /// Annotations to merge.
    #[serde(default)]
    pub annotations: Labels,
}

/// Multi-cluster routing settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiClusterSetting {
    /// Route this request through allocation policies.
    #[serde(default)]
    pub enabled: bool,
    /// Selects the candidate policies.
    #[serde(default)]
    pub policy_selector: LabelSelector,
}

/// Desired allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameServerAllocationSpec {
    /// Selector a candidate must satisfy.
    #[serde(default)]
    pub required: LabelSelector,
    /// Selectors tried in order before falling back to any required match.
    #[serde(default)]
    pub preferred: Vec<LabelSelector>,
    /// Scheduling bias for candidate ordering.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Metadata merged onto the claimed server.
    #[serde(default)]
    pub meta_patch: MetaPatch,
    /// Multi-cluster routing.
    #[serde(default)]
    pub multi_cluster: MultiClusterSetting,
}

/// Outcome of an allocation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationState {
    /// A server was claimed.
    Allocated,
    /// No candidate matched.
    #[default]
    UnAllocated,
    /// Conflicts exhausted the request's deadline.
    Contention,
}

/// Allocation result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameServerAllocationStatus {
    /// Outcome.
    pub state: AllocationState,
    /// Name of the claimed server, when allocated.
    #[serde(default)]
    pub game_server_name: String,
    /// Ports of the claimed server.
    #[serde(default)]
    pub ports: Vec<GameServerStatusPort>,
    /// Address of the claimed server.
    #[serde(default)]
    pub address: String,
    /// Node hosting the claimed server.
    #[serde(default)]
    pub node_name: String,
}

/// A one-shot request to claim a Ready GameServer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameServerAllocation {
    /// Object metadata. Only namespace is meaningful; allocations are not
    /// retained in the store.
    #[serde(default)]
    pub metadata: Metadata,
    /// What to allocate.
    pub spec: GameServerAllocationSpec,
    /// Populated in the response.
    #[serde(default)]
    pub status: GameServerAllocationStatus,
}

impl_resource!(GameServerAllocation, "GameServerAllocation");
