//! FleetForge - Dedicated Game Server Fleet Orchestration
//!
//! Control plane for pools of long-lived, stateful game-server processes:
//! - GameServer lifecycle controller (state machine + pod ownership)
//! - GameServerSet controller (homogeneous replica sets per template revision)
//! - Fleet controller (rolling / recreate deployments that never evict sessions)
//! - Allocation engine (batched single-writer claim pipeline)
//! - FleetAutoscaler (buffer and webhook policies)

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod allocator;
pub mod config;
pub mod fleetautoscalers;
pub mod fleets;
pub mod gameservers;
pub mod gameserversets;
pub mod ports;
pub mod resources;
pub mod store;
pub mod webhooks;
pub mod workqueue;

/// API group for first-class resources.
pub const GROUP: &str = "agones.dev";
/// API group for allocation resources.
pub const ALLOCATION_GROUP: &str = "allocation.agones.dev";
/// API group for autoscaling resources.
pub const AUTOSCALING_GROUP: &str = "autoscaling.agones.dev";
/// API group for multi-cluster resources.
pub const MULTICLUSTER_GROUP: &str = "multicluster.agones.dev";

/// Label placed on GameServers to tie them back to their owning fleet.
pub const FLEET_LABEL: &str = "agones.dev/fleet";
/// Label placed on GameServers to tie them back to their owning set.
pub const GAME_SERVER_SET_LABEL: &str = "agones.dev/gameserverset";
/// Annotation that short-circuits pod management for local development.
pub const DEV_ADDRESS_ANNOTATION: &str = "agones.dev/dev-address";
/// Prefix applied to labels and annotations set through the sidecar SDK.
pub const SDK_METADATA_PREFIX: &str = "agones.dev/sdk-";
/// Finalizer that guarantees the controller observes GameServer teardown.
pub const GAME_SERVER_FINALIZER: &str = "agones.dev/controller";
