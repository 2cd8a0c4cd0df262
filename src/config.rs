//! Binary configuration. Flags mirror the deployment surface: sidecar
//! injection, the dynamic port range, TLS material location and bind
//! addresses. Every flag can also come from the environment.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line options for the controller binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "fleetforge", about = "Game server fleet orchestration control plane")]
pub struct Options {
    /// Sidecar image injected into every game server pod.
    #[arg(long, env = "SIDECAR_IMAGE", default_value = "fleetforge/sdk-server:0.1")]
    pub sidecar_image: String,

    /// CPU request for the sidecar container.
    #[arg(long, env = "SIDECAR_CPU_REQUEST", default_value = "30m")]
    pub sidecar_cpu_request: String,

    /// CPU limit for the sidecar container.
    #[arg(long, env = "SIDECAR_CPU_LIMIT", default_value = "500m")]
    pub sidecar_cpu_limit: String,

    /// Always pull the sidecar image before starting it.
    #[arg(long, env = "ALWAYS_PULL_SIDECAR", default_value_t = false)]
    pub always_pull_sidecar: bool,

    /// Dynamic host-port range as `min-max`. Overrides min/max-port.
    #[arg(long, env = "PORT_RANGE")]
    pub port_range: Option<String>,

    /// Low end of the dynamic host-port range.
    #[arg(long, env = "MIN_PORT", default_value_t = 7000)]
    pub min_port: u16,

    /// High end of the dynamic host-port range.
    #[arg(long, env = "MAX_PORT", default_value_t = 8000)]
    pub max_port: u16,

    /// Directory holding `server.crt` and `server.key` for TLS serving.
    #[arg(long, env = "CERT_DIR", default_value = "/certs")]
    pub cert_dir: PathBuf,

    /// Bind address for the allocation HTTP endpoint.
    #[arg(long, env = "ALLOCATION_BIND", default_value = "0.0.0.0:8443")]
    pub allocation_bind: SocketAddr,

    /// Bind address for the admission webhook endpoint.
    #[arg(long, env = "WEBHOOK_BIND", default_value = "0.0.0.0:8081")]
    pub webhook_bind: SocketAddr,

    /// Reconcile workers for the GameServer controller.
    #[arg(long, env = "GAMESERVER_WORKERS", default_value_t = 8)]
    pub gameserver_workers: usize,

    /// Update workers for the allocation engine.
    #[arg(long, env = "ALLOCATION_WORKERS", default_value_t = 4)]
    pub allocation_workers: usize,

    /// Seconds between autoscaler syncs.
    #[arg(long, env = "AUTOSCALER_SYNC_PERIOD", default_value_t = 30)]
    pub autoscaler_sync_period_seconds: u64,

    /// Sample allocations from the top N candidates to spread contention.
    #[arg(long, env = "TOP_N_GAME_SERVER_COUNT", default_value_t = 1)]
    pub top_n_game_server_count: usize,

    /// Name this cluster answers to in multi-cluster allocation policies.
    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    /// Leader lease duration in seconds.
    #[arg(long, env = "LEASE_DURATION", default_value_t = 15)]
    pub lease_duration_seconds: u64,
}

impl Options {
    /// Resolve the dynamic port range, preferring `--port-range`.
    pub fn resolved_port_range(&self) -> Result<(u16, u16), String> {
        let (min, max) = match &self.port_range {
            Some(range) => {
                let (min, max) = range
                    .split_once('-')
                    .ok_or_else(|| format!("port range {range:?} is not of the form min-max"))?;
                let parse = |s: &str| {
                    s.trim()
                        .parse::<u16>()
                        .map_err(|e| format!("port range {range:?}: {e}"))
                };
                (parse(min)?, parse(max)?)
            }
            None => (self.min_port, self.max_port),
        };
        if min >= max {
            return Err(format!("port range {min}-{max} is empty"));
        }
        Ok((min, max))
    }

    /// Autoscaler sync period.
    pub fn autoscaler_sync_period(&self) -> Duration {
        Duration::from_secs(self.autoscaler_sync_period_seconds.max(1))
    }

    /// Leader lease duration.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Options {
        Options::parse_from(["fleetforge"])
    }

    #[test]
    fn default_port_range_resolves() {
        assert_eq!(defaults().resolved_port_range().unwrap(), (7000, 8000));
    }

    #[test]
    fn explicit_port_range_wins() {
        let mut opts = defaults();
        opts.port_range = Some("7100-7200".to_string());
        opts.min_port = 1;
        assert_eq!(opts.resolved_port_range().unwrap(), (7100, 7200));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut opts = defaults();
        opts.min_port = 9000;
        opts.max_port = 7000;
        assert!(opts.resolved_port_range().is_err());
        opts.port_range = Some("nonsense".to_string());
        assert!(opts.resolved_port_range().is_err());
    }
}
