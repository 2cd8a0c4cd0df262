//! Fleet: user-declared intent for a pool of interchangeable game servers.

use super::game_server_set::generate_name;
use super::{
    impl_resource, GameServerSet, GameServerSetSpec, GameServerSpec, IntOrString, Labels, Metadata,
    Resource, SchedulingStrategy,
};
use crate::FLEET_LABEL;
use serde::{Deserialize, Serialize};

/// GameServer template carried by fleets and sets: metadata stamped onto
/// created servers plus their spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameServerTemplate {
    /// Labels stamped onto created servers.
    #[serde(default)]
    pub labels: Labels,
    /// Annotations stamped onto created servers.
    #[serde(default)]
    pub annotations: Labels,
    /// Server spec.
    pub spec: GameServerSpec,
}

/// How a fleet converges onto a new template revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeploymentStrategy {
    /// Scale every superseded set to zero immediately. Allocated servers in
    /// old sets linger until their sessions end.
    Recreate,
    /// Step the new set up and old sets down within surge/unavailability
    /// bounds.
    RollingUpdate {
        /// How many servers above the declared replica count may exist
        /// during a rollout. Absolute or percentage.
        max_surge: IntOrString,
        /// How many ready servers below the declared replica count may be
        /// missing during a rollout. Absolute or percentage.
        max_unavailable: IntOrString,
    },
}

impl Default for DeploymentStrategy {
    fn default() -> Self {
        DeploymentStrategy::RollingUpdate {
            max_surge: IntOrString::String("25%".to_string()),
            max_unavailable: IntOrString::String("25%".to_string()),
        }
    }
}

/// Desired fleet configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSpec {
    /// Declared pool size.
    pub replicas: u32,
    /// Rollout strategy.
    #[serde(default)]
    pub strategy: DeploymentStrategy,
    /// Scheduling bias inherited by sets and servers.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Template the active set stamps servers from.
    pub template: GameServerTemplate,
}

/// Observed fleet counters, summed over owned sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetStatus {
    /// Live servers across all owned sets.
    pub replicas: u32,
    /// Ready servers across all owned sets.
    pub ready_replicas: u32,
    /// Allocated servers across all owned sets.
    pub allocated_replicas: u32,
    /// Reserved servers across all owned sets.
    pub reserved_replicas: u32,
}

/// User-declared intent for a pool of interchangeable game servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fleet {
    /// Object metadata.
    pub metadata: Metadata,
    /// Desired configuration.
    pub spec: FleetSpec,
    /// Observed counters.
    pub status: FleetStatus,
}

impl_resource!(Fleet, "Fleet");

impl Fleet {
    /// Construct (without persisting) the set realising the current template.
    pub fn game_server_set(&self) -> GameServerSet {
        let mut set = GameServerSet {
            metadata: Metadata::named(
                self.metadata.namespace.clone(),
                generate_name(&self.metadata.name),
            ),
            spec: GameServerSetSpec {
                replicas: 0,
                scheduling: self.spec.scheduling,
                template: self.spec.template.clone(),
            },
            status: Default::default(),
        };
        // The template stays verbatim: it is the identity of the revision,
        // and the active set is recognised by deep template equality. The
        // fleet label rides on set metadata and flows onto servers from
        // there.
        set.metadata
            .labels
            .insert(FLEET_LABEL.to_string(), self.metadata.name.clone());
        set.metadata.owner_references.push(self.controller_owner_ref());
        set
    }

    /// Fill in defaulted fields. Applying this twice is a no-op.
    pub fn apply_defaults(&mut self) {
        // Strategy and scheduling carry their own serde defaults; nothing
        // further to do today, but admission still routes through here.
    }

    /// Validate the spec. Returns every violation found.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        if let DeploymentStrategy::RollingUpdate {
            max_surge,
            max_unavailable,
        } = &self.spec.strategy
        {
            for (field, value) in [("maxSurge", max_surge), ("maxUnavailable", max_unavailable)] {
                if let Err(e) = value.resolve_round_up(self.spec.replicas) {
                    errs.push(format!("spec.strategy.{field}: {e}"));
                }
            }
        }
        let mut gs = super::GameServer {
            metadata: Metadata::named(self.metadata.namespace.clone(), "template"),
            spec: self.spec.template.spec.clone(),
            status: Default::default(),
        };
        gs.apply_defaults();
        errs.extend(
            gs.validate()
                .into_iter()
                .map(|e| format!("spec.template: {e}")),
        );
        errs
    }
}
