//! GameServer: a single game-server process managed as a stateful unit.

use super::{impl_resource, Metadata, PodTemplateSpec, SchedulingStrategy};
use crate::{DEV_ADDRESS_ANNOTATION, GAME_SERVER_FINALIZER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host-port assignment policy for a declared port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortPolicy {
    /// Host port drawn from the configured range by the port allocator.
    #[default]
    Dynamic,
    /// Host port declared explicitly in the spec.
    Static,
    /// Host port drawn dynamically and mirrored into the container port.
    Passthrough,
}

/// Transport protocol of a game port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// UDP, the default for game traffic.
    #[default]
    #[serde(rename = "UDP")]
    Udp,
    /// TCP.
    #[serde(rename = "TCP")]
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// A port the game server listens on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameServerPort {
    /// Port name, unique within the spec.
    pub name: String,
    /// Assignment policy.
    #[serde(default)]
    pub port_policy: PortPolicy,
    /// Port the process binds inside the container.
    #[serde(default)]
    pub container_port: u16,
    /// Host port. Populated by the allocator for Dynamic/Passthrough.
    #[serde(default)]
    pub host_port: Option<u16>,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

/// Health checking configuration, enforced through the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    /// Disable health checking entirely.
    #[serde(default)]
    pub disabled: bool,
    /// Seconds to wait before health checking starts.
    pub initial_delay_seconds: u32,
    /// Expected cadence of health pings, in seconds.
    pub period_seconds: u32,
    /// Consecutive missed periods before the server is marked Unhealthy.
    pub failure_threshold: u32,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            disabled: false,
            initial_delay_seconds: 5,
            period_seconds: 5,
            failure_threshold: 3,
        }
    }
}

/// Sidecar server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdkServer {
    /// Sidecar log level.
    pub log_level: String,
    /// gRPC port the sidecar listens on.
    pub grpc_port: u16,
    /// HTTP port the sidecar listens on.
    pub http_port: u16,
}

impl Default for SdkServer {
    fn default() -> Self {
        Self {
            log_level: "Info".to_string(),
            grpc_port: 9357,
            http_port: 9358,
        }
    }
}

/// Desired GameServer configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameServerSpec {
    /// Name of the container running the game binary. Defaulted when the
    /// template holds exactly one container.
    #[serde(default)]
    pub container: String,
    /// Declared ports.
    #[serde(default)]
    pub ports: Vec<GameServerPort>,
    /// Health checking configuration.
    #[serde(default)]
    pub health: Health,
    /// Scheduling bias.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Sidecar configuration.
    #[serde(default)]
    pub sdk_server: SdkServer,
    /// Pod template the server runs in.
    #[serde(default)]
    pub template: PodTemplateSpec,
}

/// GameServer lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameServerState {
    /// Waiting for host ports to be assigned.
    #[default]
    PortAllocation,
    /// Ports assigned; pod not yet created.
    Creating,
    /// Pod created; waiting for it to be scheduled.
    Starting,
    /// Pod bound to a node; waiting for the game binary to signal readiness.
    Scheduled,
    /// Readiness signalled; address being finalised.
    RequestReady,
    /// Available for allocation.
    Ready,
    /// Claimed by a game session.
    Allocated,
    /// Temporarily withheld from allocation.
    Reserved,
    /// Shutting down; the record will be deleted.
    Shutdown,
    /// Failed health checking.
    Unhealthy,
    /// Spec or pod construction failed terminally.
    Error,
}

impl GameServerState {
    /// States from which the server can never return to service.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GameServerState::Shutdown | GameServerState::Unhealthy | GameServerState::Error
        )
    }

    /// States earlier than Ready in the happy path.
    pub fn is_before_ready(self) -> bool {
        matches!(
            self,
            GameServerState::PortAllocation
                | GameServerState::Creating
                | GameServerState::Starting
                | GameServerState::Scheduled
                | GameServerState::RequestReady
        )
    }
}

impl fmt::Display for GameServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A port as published in status: name plus the bound host port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameServerStatusPort {
    /// Port name.
    pub name: String,
    /// Bound host port.
    pub port: u16,
}

/// Observed GameServer state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameServerStatus {
    /// Lifecycle state.
    pub state: GameServerState,
    /// Ports bound on the host.
    #[serde(default)]
    pub ports: Vec<GameServerStatusPort>,
    /// Address game clients connect to.
    #[serde(default)]
    pub address: String,
    /// Node hosting the pod.
    #[serde(default)]
    pub node_name: String,
    /// For Reserved servers, when the reservation expires.
    #[serde(default)]
    pub reserved_until: Option<DateTime<Utc>>,
}

/// A single game-server process managed as a stateful unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameServer {
    /// Object metadata.
    pub metadata: Metadata,
    /// Desired configuration.
    pub spec: GameServerSpec,
    /// Observed state.
    pub status: GameServerStatus,
}

impl_resource!(GameServer, "GameServer");

impl GameServer {
    /// Whether this server runs in development mode with a caller-supplied
    /// address and no managed pod.
    pub fn is_dev_address(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(DEV_ADDRESS_ANNOTATION)
            .map(String::as_str)
    }

    /// Whether the server can be deleted without interrupting a session.
    pub fn is_deletable(&self) -> bool {
        !matches!(
            self.status.state,
            GameServerState::Allocated | GameServerState::Reserved
        ) || self.metadata.is_being_deleted()
    }

    /// Whether any declared port still needs a host port from the allocator.
    pub fn needs_port_allocation(&self) -> bool {
        self.spec.ports.iter().any(|p| {
            matches!(p.port_policy, PortPolicy::Dynamic | PortPolicy::Passthrough)
                && p.host_port.is_none()
        })
    }

    /// Attach the teardown finalizer and fill in defaulted fields.
    ///
    /// Applying this twice is a no-op.
    pub fn apply_defaults(&mut self) {
        if !self
            .metadata
            .finalizers
            .iter()
            .any(|f| f == GAME_SERVER_FINALIZER)
        {
            self.metadata
                .finalizers
                .push(GAME_SERVER_FINALIZER.to_string());
        }

        if self.spec.container.is_empty() && self.spec.template.spec.containers.len() == 1 {
            self.spec.container = self.spec.template.spec.containers[0].name.clone();
        }

        for port in &mut self.spec.ports {
            if port.port_policy == PortPolicy::Passthrough {
                // Container port follows whatever host port gets assigned.
                if let Some(host) = port.host_port {
                    port.container_port = host;
                }
            }
        }

        if self.status.state == GameServerState::default()
            && self.status.address.is_empty()
            && !self.needs_port_allocation()
        {
            self.status.state = GameServerState::Creating;
        }
    }

    /// Validate the spec. Returns every violation found.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();

        let containers = &self.spec.template.spec.containers;
        if self.spec.container.is_empty() {
            if containers.len() != 1 {
                errs.push(
                    "spec.container is required when the template has multiple containers"
                        .to_string(),
                );
            }
        } else if !containers.iter().any(|c| c.name == self.spec.container) {
            errs.push(format!(
                "spec.container {:?} does not match any template container",
                self.spec.container
            ));
        }

        for port in &self.spec.ports {
            match port.port_policy {
                PortPolicy::Dynamic | PortPolicy::Passthrough => {
                    if port.host_port.is_some() && self.status.state == GameServerState::default() {
                        errs.push(format!(
                            "port {:?}: hostPort cannot be declared with policy {:?}",
                            port.name, port.port_policy
                        ));
                    }
                }
                PortPolicy::Static => {
                    if port.host_port.is_none() {
                        errs.push(format!(
                            "port {:?}: Static policy requires an explicit hostPort",
                            port.name
                        ));
                    }
                }
            }
            if port.port_policy != PortPolicy::Passthrough && port.container_port == 0 {
                errs.push(format!("port {:?}: containerPort is required", port.name));
            }
        }

        for key in self
            .metadata
            .labels
            .keys()
            .chain(self.metadata.annotations.keys())
        {
            if !valid_metadata_key(key) {
                errs.push(format!("malformed metadata key {key:?}"));
            }
        }

        errs
    }
}

fn valid_metadata_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 253
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}
