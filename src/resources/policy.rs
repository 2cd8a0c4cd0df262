//! GameServerAllocationPolicy: where multi-cluster allocation requests may be
//! routed, and how to authenticate with the remote cluster.

use super::{impl_resource, Metadata};
use serde::{Deserialize, Serialize};

/// Connection details for one candidate cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConnectionInfo {
    /// Cluster name. A locally recognised name short-circuits forwarding.
    #[serde(default)]
    pub cluster_name: String,
    /// Allocation endpoints, tried in order.
    #[serde(default)]
    pub allocation_endpoints: Vec<String>,
    /// Name of the secret holding `ca.crt`, `tls.crt` and `tls.key` for mTLS.
    #[serde(default)]
    pub secret_name: String,
    /// Namespace requests are made against on the remote cluster.
    #[serde(default)]
    pub namespace: String,
}

/// Desired policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameServerAllocationPolicySpec {
    /// Priority class; lower values are tried first.
    pub priority: u32,
    /// Weight within a priority class for weighted-random selection.
    pub weight: u32,
    /// Target cluster.
    pub connection_info: ClusterConnectionInfo,
}

/// Routing policy for multi-cluster allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameServerAllocationPolicy {
    /// Object metadata.
    pub metadata: Metadata,
    /// Desired configuration.
    pub spec: GameServerAllocationPolicySpec,
}

impl_resource!(GameServerAllocationPolicy, "GameServerAllocationPolicy");
