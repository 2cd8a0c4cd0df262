//! Typed resource model shared by every control loop.
//!
//! Resources follow the object-store contract: metadata with a UID, a
//! monotonically increasing resource version for optimistic concurrency,
//! labels/annotations, owner references for cascade deletion, and finalizers
//! that delay removal until a controller acknowledges teardown.

pub mod allocation;
pub mod autoscaler;
pub mod core;
pub mod fleet;
pub mod game_server;
pub mod game_server_set;
pub mod policy;

pub use allocation::{
    AllocationState, GameServerAllocation, GameServerAllocationSpec, GameServerAllocationStatus,
    MetaPatch, MultiClusterSetting,
};
pub use autoscaler::{
    AutoscalerPolicy, FleetAutoscaleRequest, FleetAutoscaleResponse, FleetAutoscaleReview,
    FleetAutoscaler, FleetAutoscalerSpec, FleetAutoscalerStatus, WebhookService,
};
pub use self::core::{
    Container, ContainerPort, EnvVar, Event, EventType, Lease, Node, NodeAddress, NodeAddressType,
    Pod, PodPhase, PodSpec, PodStatus, PodTemplateSpec, Probe, ResourceRequests, Secret,
};
pub use fleet::{DeploymentStrategy, Fleet, FleetSpec, FleetStatus, GameServerTemplate};
pub use game_server::{
    GameServer, GameServerPort, GameServerSpec, GameServerState, GameServerStatus,
    GameServerStatusPort, Health, PortPolicy, Protocol, SdkServer,
};
pub use game_server_set::{GameServerSet, GameServerSetSpec, GameServerSetStatus};
pub use policy::{ClusterConnectionInfo, GameServerAllocationPolicy, GameServerAllocationPolicySpec};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Label and annotation maps. Ordered so that serialized forms are stable.
pub type Labels = BTreeMap<String, String>;

/// Namespace/name pair identifying an object within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace the object lives in.
    pub namespace: String,
    /// Object name, unique within the namespace.
    pub name: String,
}

impl ObjectKey {
    /// Build a key from namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(Self::new(ns, name)),
            _ => Err(format!("invalid object key {s:?}, expected namespace/name")),
        }
    }
}

/// Reference from an owned object back to its managing owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    /// Kind of the owner.
    pub kind: String,
    /// Name of the owner.
    pub name: String,
    /// UID of the owner.
    pub uid: String,
    /// Whether the owner is the managing controller.
    pub controller: bool,
}

/// Common object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Object name.
    pub name: String,
    /// Object namespace.
    pub namespace: String,
    /// Store-assigned unique identifier.
    #[serde(default)]
    pub uid: String,
    /// Store-assigned version, bumped on every write.
    #[serde(default)]
    pub resource_version: u64,
    /// When the object was created.
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when deletion has been requested but finalizers remain.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Object labels.
    #[serde(default)]
    pub labels: Labels,
    /// Object annotations.
    #[serde(default)]
    pub annotations: Labels,
    /// Owners of this object; removal of a controller owner cascades.
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    /// Names of controllers that must acknowledge teardown before removal.
    #[serde(default)]
    pub finalizers: Vec<String>,
}

impl Metadata {
    /// Metadata with just namespace and name filled in.
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Key for this object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// The managing controller reference, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    /// Whether this object is controlled by the owner with the given UID.
    pub fn is_controlled_by(&self, uid: &str) -> bool {
        self.controller_ref().map(|r| r.uid == uid).unwrap_or(false)
    }

    /// Whether deletion has been requested.
    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Trait implemented by every stored resource type.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Kind name, used in owner references and error messages.
    const KIND: &'static str;

    /// Shared metadata.
    fn metadata(&self) -> &Metadata;

    /// Mutable shared metadata.
    fn metadata_mut(&mut self) -> &mut Metadata;

    /// Namespace/name key.
    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }

    /// Owner reference pointing at this object as the managing controller.
    fn controller_owner_ref(&self) -> OwnerReference {
        OwnerReference {
            kind: Self::KIND.to_string(),
            name: self.metadata().name.clone(),
            uid: self.metadata().uid.clone(),
            controller: true,
        }
    }
}

/// Scheduling bias: concentrate load for bin-packing or spread it out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingStrategy {
    /// Concentrate allocations on busy nodes so empty nodes can be reclaimed.
    #[default]
    Packed,
    /// Spread servers and allocations uniformly across nodes.
    Distributed,
}

/// Integer count or percentage, used by rolling-update and buffer parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrString {
    /// Absolute count.
    Int(u32),
    /// Percentage, formatted as `"25%"`.
    String(String),
}

impl IntOrString {
    /// Resolve against a total, rounding up. Percentages must parse.
    pub fn resolve_round_up(&self, total: u32) -> Result<u32, String> {
        match self {
            IntOrString::Int(n) => Ok(*n),
            IntOrString::String(s) => {
                let pct = parse_percentage(s)?;
                Ok(((total as u64 * pct as u64 + 99) / 100) as u32)
            }
        }
    }

    /// Resolve against a total, rounding down. Percentages must parse.
    pub fn resolve_round_down(&self, total: u32) -> Result<u32, String> {
        match self {
            IntOrString::Int(n) => Ok(*n),
            IntOrString::String(s) => {
                let pct = parse_percentage(s)?;
                Ok((total as u64 * pct as u64 / 100) as u32)
            }
        }
    }
}

fn parse_percentage(s: &str) -> Result<u32, String> {
    s.strip_suffix('%')
        .ok_or_else(|| format!("{s:?} is not a percentage"))?
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("{s:?} is not a percentage: {e}"))
}

/// Operator used by label selector expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOperator {
    /// The label value must be one of the listed values.
    In,
    /// The label value must not be one of the listed values.
    NotIn,
    /// The label key must be present.
    Exists,
    /// The label key must be absent.
    DoesNotExist,
}

/// A single label selector expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelExpression {
    /// Label key.
    pub key: String,
    /// Operator.
    pub operator: LabelOperator,
    /// Values, where the operator takes them.
    #[serde(default)]
    pub values: Vec<String>,
}

/// Label selector: exact matches plus expressions, all of which must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Labels that must match exactly.
    #[serde(default)]
    pub match_labels: Labels,
    /// Expressions that must all evaluate to true.
    #[serde(default)]
    pub match_expressions: Vec<LabelExpression>,
}

impl LabelSelector {
    /// Selector matching a single key/value pair.
    pub fn from_label(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut match_labels = Labels::new();
        match_labels.insert(key.into(), value.into());
        Self {
            match_labels,
            match_expressions: Vec::new(),
        }
    }

    /// Whether the given label set satisfies this selector.
    pub fn matches(&self, labels: &Labels) -> bool {
        for (k, v) in &self.match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
        self.match_expressions.iter().all(|expr| {
            let value = labels.get(&expr.key);
            match expr.operator {
                LabelOperator::In => value.map(|v| expr.values.contains(v)).unwrap_or(false),
                LabelOperator::NotIn => value.map(|v| !expr.values.contains(v)).unwrap_or(true),
                LabelOperator::Exists => value.is_some(),
                LabelOperator::DoesNotExist => value.is_none(),
            }
        })
    }
}

/// Implements [`Resource`] for a type with `metadata`, kind given literally.
macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl crate::resources::Resource for $ty {
            const KIND: &'static str = $kind;

            fn metadata(&self) -> &crate::resources::Metadata {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut crate::resources::Metadata {
                &mut self.metadata
            }
        }
    };
}
pub(crate) use impl_resource;
