//! FleetAutoscaler: resizes a fleet from usage signals.

use super::{impl_resource, IntOrString, Metadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to an in-cluster webhook service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookService {
    /// Service name.
    pub name: String,
    /// Service namespace.
    pub namespace: String,
    /// Service port. Defaults to 8000.
    #[serde(default)]
    pub port: Option<u16>,
}

/// Sizing policy applied on every sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AutoscalerPolicy {
    /// Keep a buffer of ready servers on top of the allocated count.
    Buffer {
        /// Buffer size: an absolute count of ready servers, or a percentage
        /// of the total the buffer should represent.
        buffer_size: IntOrString,
        /// Lower clamp on the computed replica target.
        min_replicas: u32,
        /// Upper clamp on the computed replica target.
        max_replicas: u32,
    },
    /// Ask an external endpoint for the replica target.
    Webhook {
        /// Absolute endpoint URL. Takes precedence over `service`.
        #[serde(default)]
        url: Option<String>,
        /// In-cluster service reference, used when `url` is absent.
        #[serde(default)]
        service: Option<WebhookService>,
        /// Base64-encoded PEM bundle for verifying the endpoint.
        #[serde(default)]
        ca_bundle: Option<String>,
        /// Path appended to a service-derived URL.
        #[serde(default)]
        path: Option<String>,
    },
}

/// Desired autoscaler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetAutoscalerSpec {
    /// Fleet to resize, in the autoscaler's namespace.
    pub fleet_name: String,
    /// Sizing policy.
    pub policy: AutoscalerPolicy,
}

/// Observed autoscaler state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetAutoscalerStatus {
    /// Fleet replicas at the last sync.
    pub current_replicas: u32,
    /// Replica target computed at the last sync.
    pub desired_replicas: u32,
    /// Last time the fleet was actually resized.
    #[serde(default)]
    pub last_scale_time: Option<DateTime<Utc>>,
    /// Whether the last sync could compute and apply a target.
    pub able_to_scale: bool,
    /// Whether the computed target hit a min/max clamp.
    pub scaling_limited: bool,
}

/// Resizes a fleet from usage signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetAutoscaler {
    /// Object metadata.
    pub metadata: Metadata,
    /// Desired configuration.
    pub spec: FleetAutoscalerSpec,
    /// Observed state.
    #[serde(default)]
    pub status: FleetAutoscalerStatus,
}

impl_resource!(FleetAutoscaler, "FleetAutoscaler");

impl FleetAutoscaler {
    /// Validate the spec. Returns every violation found.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        if self.spec.fleet_name.is_empty() {
            errs.push("spec.fleetName is required".to_string());
        }
        match &self.spec.policy {
            AutoscalerPolicy::Buffer {
                buffer_size,
                min_replicas,
                max_replicas,
            } => {
                if min_replicas > max_replicas {
                    errs.push(format!(
                        "spec.policy: minReplicas {min_replicas} exceeds maxReplicas {max_replicas}"
                    ));
                }
                match buffer_size {
                    IntOrString::Int(0) => {
                        errs.push("spec.policy.bufferSize must be positive".to_string())
                    }
                    IntOrString::String(s) => match buffer_size.resolve_round_up(100) {
                        Ok(pct) if !(1..=99).contains(&pct) => errs.push(format!(
                            "spec.policy.bufferSize {s:?} must be between 1% and 99%"
                        )),
                        Err(e) => errs.push(format!("spec.policy.bufferSize: {e}")),
                        _ => {}
                    },
                    _ => {}
                }
            }
            AutoscalerPolicy::Webhook { url, service, .. } => {
                if url.is_none() && service.is_none() {
                    errs.push("spec.policy: one of url or service is required".to_string());
                }
            }
        }
        errs
    }
}

/// Request sent to a webhook autoscaler endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetAutoscaleReview {
    /// The fleet under review.
    pub request: FleetAutoscaleRequest,
    /// Filled in by the endpoint.
    #[serde(default)]
    pub response: Option<FleetAutoscaleResponse>,
}

/// Fleet snapshot handed to the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetAutoscaleRequest {
    /// Fleet name.
    pub name: String,
    /// Fleet namespace.
    pub namespace: String,
    /// Fleet spec.
    pub spec: super::FleetSpec,
    /// Fleet status.
    pub status: super::FleetStatus,
}

/// Endpoint verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetAutoscaleResponse {
    /// Whether to resize at all.
    pub scale: bool,
    /// Replica target when `scale` is true.
    pub replicas: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_policy_validation() {
        let fas = FleetAutoscaler {
            metadata: Metadata::named("default", "fas"),
            spec: FleetAutoscalerSpec {
                fleet_name: "simple".to_string(),
                policy: AutoscalerPolicy::Buffer {
                    buffer_size: IntOrString::Int(2),
                    min_replicas: 2,
                    max_replicas: 10,
                },
            },
            status: Default::default(),
        };
        assert!(fas.validate().is_empty());

        let mut bad = fas.clone();
        bad.spec.policy = AutoscalerPolicy::Buffer {
            buffer_size: IntOrString::String("150%".to_string()),
            min_replicas: 5,
            max_replicas: 2,
        };
        let errs = bad.validate();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn webhook_policy_requires_a_target() {
        let fas = FleetAutoscaler {
            metadata: Metadata::named("default", "fas"),
            spec: FleetAutoscalerSpec {
                fleet_name: "simple".to_string(),
                policy: AutoscalerPolicy::Webhook {
                    url: None,
                    service: None,
                    ca_bundle: None,
                    path: None,
                },
            },
            status: Default::default(),
        };
        assert_eq!(fas.validate().len(), 1);
    }

    #[test]
    fn policy_round_trips_as_tagged_json() {
        let policy = AutoscalerPolicy::Buffer {
            buffer_size: IntOrString::String("20%".to_string()),
            min_replicas: 1,
            max_replicas: 50,
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["type"], "Buffer");
        let back: AutoscalerPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
