//! FleetAutoscaler controller: a periodic sync loop that applies a Buffer or
//! Webhook policy to resize a fleet from usage signals.

use crate::resources::{
    AutoscalerPolicy, Fleet, FleetAutoscaleRequest, FleetAutoscaleResponse, FleetAutoscaleReview,
    FleetAutoscaler, IntOrString, ObjectKey, Resource,
};
use crate::store::{update_with_retry, EventRecorder, Store, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Autoscaler result type.
pub type Result<T> = std::result::Result<T, AutoscalerError>;

/// Autoscaler sync failures. Surfaced as events; the loop keeps going.
#[derive(Debug, Error)]
pub enum AutoscalerError {
    /// The target fleet does not exist.
    #[error("fleet {0} not found")]
    FleetNotFound(String),

    /// Buffer parameters failed to resolve.
    #[error("invalid buffer policy: {0}")]
    InvalidPolicy(String),

    /// The webhook endpoint misbehaved.
    #[error("webhook call failed: {0}")]
    Webhook(String),

    /// The store rejected a write.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Computed sizing verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleDecision {
    /// Replica target for the fleet.
    pub replicas: u32,
    /// Whether to resize at all.
    pub scale: bool,
    /// Whether a min/max clamp truncated the target.
    pub limited: bool,
}

/// Buffer policy arithmetic, shared with tests.
///
/// An absolute buffer keeps `allocated + buffer` servers; a percentage buffer
/// sizes the fleet so the ready headroom is the given share of the total.
pub fn apply_buffer_policy(
    buffer_size: &IntOrString,
    min_replicas: u32,
    max_replicas: u32,
    fleet: &Fleet,
) -> Result<ScaleDecision> {
    let allocated = fleet.status.allocated_replicas;
    let raw = match buffer_size {
        IntOrString::Int(buffer) => allocated + buffer,
        IntOrString::String(_) => {
            let pct = buffer_size
                .resolve_round_up(100)
                .map_err(AutoscalerError::InvalidPolicy)?;
            if !(1..=99).contains(&pct) {
                return Err(AutoscalerError::InvalidPolicy(format!(
                    "buffer percentage {pct}% out of range"
                )));
            }
            // allocated / (1 - pct/100), rounded up.
            let denominator = 100 - pct;
            ((allocated as u64 * 100 + denominator as u64 - 1) / denominator as u64) as u32
        }
    };
    let clamped = raw.clamp(min_replicas, max_replicas);
    Ok(ScaleDecision {
        replicas: clamped,
        scale: true,
        limited: clamped != raw,
    })
}

/// FleetAutoscaler controller.
pub struct FleetAutoscalerController {
    store: Arc<Store>,
    recorder: EventRecorder,
    client: reqwest::Client,
    sync_period: Duration,
}

impl FleetAutoscalerController {
    /// Build the controller.
    pub fn new(store: Arc<Store>, sync_period: Duration) -> Arc<Self> {
        let recorder = EventRecorder::new(store.clone(), "fleetautoscaler-controller");
        Arc::new(Self {
            store,
            recorder,
            client: reqwest::Client::new(),
            sync_period,
        })
    }

    /// Run the sync loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.sync_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sync_all().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn sync_all(&self) {
        for fas in self.store.fleet_autoscalers.snapshot() {
            let key = fas.key();
            if let Err(e) = self.sync(&fas).await {
                warn!(autoscaler = %key, error = %e, "autoscaler sync failed");
                self.recorder.warning(&fas, "FailedScale", format!("{e}"));
                let _ = self.record_failure(&key);
            }
        }
    }

    fn record_failure(&self, key: &ObjectKey) -> Result<()> {
        update_with_retry(&self.store.fleet_autoscalers, key, |fas| {
            if !fas.status.able_to_scale {
                return false;
            }
            fas.status.able_to_scale = false;
            true
        })?;
        Ok(())
    }

    /// Sync one autoscaler: compute the policy verdict and apply it.
    pub async fn sync(&self, fas: &FleetAutoscaler) -> Result<()> {
        let fleet_key = ObjectKey::new(fas.metadata.namespace.clone(), fas.spec.fleet_name.clone());
        let fleet = self
            .store
            .fleets
            .get(&fleet_key)
            .map_err(|_| AutoscalerError::FleetNotFound(fleet_key.to_string()))?;

        let decision = match &fas.spec.policy {
            AutoscalerPolicy::Buffer {
                buffer_size,
                min_replicas,
                max_replicas,
            } => apply_buffer_policy(buffer_size, *min_replicas, *max_replicas, &fleet)?,
            AutoscalerPolicy::Webhook {
                url,
                service,
                ca_bundle,
                path,
            } => {
                self.apply_webhook_policy(url.as_deref(), service.as_ref(), ca_bundle.as_deref(), path.as_deref(), &fleet)
                    .await?
            }
        };

        let scaled = decision.scale && decision.replicas != fleet.spec.replicas;
        if scaled {
            info!(
                autoscaler = %fas.key(),
                fleet = %fleet_key,
                from = fleet.spec.replicas,
                to = decision.replicas,
                "applying scale decision"
            );
            update_with_retry(&self.store.fleets, &fleet_key, |fleet| {
                if fleet.spec.replicas == decision.replicas {
                    return false;
                }
                fleet.spec.replicas = decision.replicas;
                true
            })?;
            self.recorder.normal(
                fas,
                "AutoScalingFleet",
                format!("scaled fleet {} to {}", fas.spec.fleet_name, decision.replicas),
            );
        } else {
            debug!(autoscaler = %fas.key(), "no scale needed");
        }

        update_with_retry(&self.store.fleet_autoscalers, &fas.key(), |fas| {
            fas.status.current_replicas = fleet.status.replicas;
            fas.status.desired_replicas = if decision.scale {
                decision.replicas
            } else {
                fleet.spec.replicas
            };
            fas.status.able_to_scale = true;
            fas.status.scaling_limited = decision.limited;
            if scaled {
                fas.status.last_scale_time = Some(Utc::now());
            }
            true
        })?;
        Ok(())
    }

    async fn apply_webhook_policy(
        &self,
        url: Option<&str>,
        service: Option<&crate::resources::WebhookService>,
        ca_bundle: Option<&str>,
        path: Option<&str>,
        fleet: &Fleet,
    ) -> Result<ScaleDecision> {
        let endpoint = match (url, service) {
            (Some(url), _) => url.to_string(),
            (None, Some(svc)) => format!(
                "https://{}.{}.svc:{}{}",
                svc.name,
                svc.namespace,
                svc.port.unwrap_or(8000),
                path.unwrap_or("/")
            ),
            (None, None) => {
                return Err(AutoscalerError::Webhook(
                    "neither url nor service configured".to_string(),
                ))
            }
        };

        let client = match ca_bundle {
            Some(bundle) => {
                use base64::Engine as _;
                let pem = base64::engine::general_purpose::STANDARD
                    .decode(bundle)
                    .map_err(|e| AutoscalerError::Webhook(format!("bad caBundle: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| AutoscalerError::Webhook(format!("bad caBundle: {e}")))?;
                reqwest::Client::builder()
                    .add_root_certificate(cert)
                    .build()
                    .map_err(|e| AutoscalerError::Webhook(e.to_string()))?
            }
            None => self.client.clone(),
        };

        let review = FleetAutoscaleReview {
            request: FleetAutoscaleRequest {
                name: fleet.metadata.name.clone(),
                namespace: fleet.metadata.namespace.clone(),
                spec: fleet.spec.clone(),
                status: fleet.status.clone(),
            },
            response: None,
        };

        let response: FleetAutoscaleResponse = client
            .post(&endpoint)
            .json(&review)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| AutoscalerError::Webhook(e.to_string()))?
            .error_for_status()
            .map_err(|e| AutoscalerError::Webhook(e.to_string()))?
            .json()
            .await
            .map_err(|e| AutoscalerError::Webhook(format!("bad response body: {e}")))?;

        Ok(ScaleDecision {
            replicas: response.replicas,
            scale: response.scale,
            limited: false,
        })
    }
}
