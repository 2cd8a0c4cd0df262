//! GameServerSet: a homogeneous replica set of GameServers for a single
//! template revision.

use super::fleet::GameServerTemplate;
use super::{impl_resource, GameServer, Metadata, Resource, SchedulingStrategy};
use crate::GAME_SERVER_SET_LABEL;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Desired GameServerSet configuration. The template is immutable; a fleet
/// rolls out template changes by creating a fresh set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameServerSetSpec {
    /// Target number of live (non-terminal, non-allocated-excluded) servers.
    pub replicas: u32,
    /// Scheduling bias inherited by created servers.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Template servers are stamped from.
    pub template: GameServerTemplate,
}

/// Observed GameServerSet counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameServerSetStatus {
    /// Live servers owned by the set.
    pub replicas: u32,
    /// Servers in Ready state.
    pub ready_replicas: u32,
    /// Servers claimed by sessions.
    pub allocated_replicas: u32,
    /// Servers temporarily withheld from allocation.
    pub reserved_replicas: u32,
}

/// A homogeneous replica set of GameServers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameServerSet {
    /// Object metadata.
    pub metadata: Metadata,
    /// Desired configuration.
    pub spec: GameServerSetSpec,
    /// Observed counters.
    pub status: GameServerSetStatus,
}

impl_resource!(GameServerSet, "GameServerSet");

impl GameServerSet {
    /// Stamp a new GameServer from the template, owned by this set.
    pub fn game_server(&self) -> GameServer {
        let mut gs = GameServer {
            metadata: Metadata::named(
                self.metadata.namespace.clone(),
                generate_name(&self.metadata.name),
            ),
            spec: self.spec.template.spec.clone(),
            status: Default::default(),
        };
        gs.metadata.labels = self.spec.template.labels.clone();
        gs.metadata.annotations = self.spec.template.annotations.clone();
        gs.metadata
            .labels
            .insert(GAME_SERVER_SET_LABEL.to_string(), self.metadata.name.clone());
        if let Some(fleet) = self.metadata.labels.get(crate::FLEET_LABEL) {
            gs.metadata
                .labels
                .insert(crate::FLEET_LABEL.to_string(), fleet.clone());
        }
        gs.metadata.owner_references.push(self.controller_owner_ref());
        gs.spec.scheduling = self.spec.scheduling;
        gs.apply_defaults();
        gs
    }
}

/// `<base>-` plus a random lowercase suffix, the way owned objects are named.
pub fn generate_name(base: &str) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{base}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Container, GameServerSpec, PodSpec, PodTemplateSpec};

    #[test]
    fn stamped_game_server_carries_ownership() {
        let mut set = GameServerSet {
            metadata: Metadata::named("default", "simple-x7k2p"),
            spec: GameServerSetSpec {
                replicas: 3,
                scheduling: SchedulingStrategy::Distributed,
                template: GameServerTemplate {
                    spec: GameServerSpec {
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
                },
            },
            status: Default::default(),
        };
        set.metadata.uid = "set-uid".to_string();
        set.metadata
            .labels
            .insert(crate::FLEET_LABEL.to_string(), "simple".to_string());

        let gs = set.game_server();
        assert!(gs.metadata.name.starts_with("simple-x7k2p-"));
        assert_eq!(
            gs.metadata.labels.get(GAME_SERVER_SET_LABEL),
            Some(&"simple-x7k2p".to_string())
        );
        assert_eq!(
            gs.metadata.labels.get(crate::FLEET_LABEL),
            Some(&"simple".to_string())
        );
        assert!(gs.metadata.is_controlled_by("set-uid"));
        assert_eq!(gs.spec.scheduling, SchedulingStrategy::Distributed);
        assert_eq!(gs.spec.container, "game");
    }

    #[test]
    fn generated_names_are_distinct() {
        let a = generate_name("fleet");
        let b = generate_name("fleet");
        assert_ne!(a, b);
        assert!(a.starts_with("fleet-"));
    }
}
