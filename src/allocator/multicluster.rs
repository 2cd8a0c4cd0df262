//! Multi-cluster allocation dispatch.
//!
//! One policy is selected from the records matching the request's policy
//! selector: policies are grouped by ascending priority value and the group
//! winner is drawn weighted-random by weight (uniform when the group's
//! weights sum to zero). A policy naming this cluster is served locally;
//! otherwise the policy's endpoints are walked in order until one accepts
//! the request, and the last error is surfaced if none does.

use super::{AllocationEngine, AllocationError, Result};
use crate::resources::{GameServerAllocation, GameServerAllocationPolicy, ObjectKey};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Secret key holding the CA bundle for the remote cluster.
const CA_CERT_KEY: &str = "ca.crt";
/// Secret key holding the client certificate.
const TLS_CERT_KEY: &str = "tls.crt";
/// Secret key holding the client private key.
const TLS_KEY_KEY: &str = "tls.key";

/// Dispatch a multi-cluster allocation request.
pub async fn dispatch(
    engine: &AllocationEngine,
    allocation: GameServerAllocation,
) -> Result<GameServerAllocation> {
    let namespace = allocation.metadata.namespace.clone();
    let policies = engine.store().allocation_policies.list(
        Some(&namespace),
        Some(&allocation.spec.multi_cluster.policy_selector),
    );
    let Some(policy) = select_policy(&policies) else {
        return Err(AllocationError::NoPolicies);
    };
    debug!(
        policy = %policy.metadata.name,
        cluster = %policy.spec.connection_info.cluster_name,
        "selected allocation policy"
    );

    let info = &policy.spec.connection_info;
    let local_cluster = engine.config().cluster_name.as_deref();
    if local_cluster == Some(info.cluster_name.as_str()) || info.allocation_endpoints.is_empty() {
        // Recognised locally; serve without forwarding.
        let mut local = allocation;
        local.spec.multi_cluster.enabled = false;
        return engine.allocate(local).await;
    }

    let client = build_client(engine, &namespace, info.secret_name.as_str(), info).await?;

    let mut forwarded = allocation;
    if !info.namespace.is_empty() {
        forwarded.metadata.namespace = info.namespace.clone();
    }
    forwarded.spec.multi_cluster.enabled = false;

    let mut last_error = "no endpoints configured".to_string();
    for endpoint in &info.allocation_endpoints {
        let url = allocation_url(endpoint, &forwarded.metadata.namespace);
        info!(%url, "forwarding allocation");
        match forward(&client, &url, &forwarded).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                warn!(%url, error = %e, "remote allocation endpoint failed");
                last_error = e;
            }
        }
    }
    Err(AllocationError::Remote(last_error))
}

/// Group by ascending priority, then draw weighted-random within the
/// winning group.
pub fn select_policy(
    policies: &[GameServerAllocationPolicy],
) -> Option<&GameServerAllocationPolicy> {
    let top_priority = policies.iter().map(|p| p.spec.priority).min()?;
    let group: Vec<&GameServerAllocationPolicy> = policies
        .iter()
        .filter(|p| p.spec.priority == top_priority)
        .collect();

    let total_weight: u64 = group.iter().map(|p| p.spec.weight as u64).sum();
    let mut rng = rand::thread_rng();
    if total_weight == 0 {
        return Some(group[rng.gen_range(0..group.len())]);
    }
    let mut roll = rng.gen_range(0..total_weight);
    for policy in &group {
        let weight = policy.spec.weight as u64;
        if roll < weight {
            return Some(policy);
        }
        roll -= weight;
    }
    group.last().copied()
}

/// Build the HTTP client for a policy's endpoints. TLS endpoints require the
/// policy's secret to carry complete mTLS material; plain-HTTP endpoints
/// (local development) need none.
async fn build_client(
    engine: &AllocationEngine,
    namespace: &str,
    secret_name: &str,
    info: &crate::resources::ClusterConnectionInfo,
) -> Result<reqwest::Client> {
    let needs_tls = info
        .allocation_endpoints
        .iter()
        .any(|e| e.starts_with("https://"));
    if !needs_tls {
        return reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AllocationError::Remote(e.to_string()));
    }

    let secret_err = |reason: String| AllocationError::ClientSecret {
        name: secret_name.to_string(),
        reason,
    };
    if secret_name.is_empty() {
        return Err(secret_err("no secret named for TLS endpoints".to_string()));
    }
    let secret = engine
        .store()
        .secrets
        .get(&ObjectKey::new(namespace, secret_name))
        .map_err(|e| secret_err(e.to_string()))?;

    let field = |key: &str| -> Result<&[u8]> {
        secret
            .data
            .get(key)
            .map(|v| v.as_slice())
            .ok_or_else(|| secret_err(format!("missing {key}")))
    };
    let ca = field(CA_CERT_KEY)?;
    let cert = field(TLS_CERT_KEY)?;
    let key = field(TLS_KEY_KEY)?;

    let ca = reqwest::Certificate::from_pem(ca)
        .map_err(|e| secret_err(format!("bad {CA_CERT_KEY}: {e}")))?;
    let mut identity_pem = Vec::with_capacity(cert.len() + key.len() + 1);
    identity_pem.extend_from_slice(cert);
    identity_pem.push(b'\n');
    identity_pem.extend_from_slice(key);
    let identity = reqwest::Identity::from_pem(&identity_pem)
        .map_err(|e| secret_err(format!("bad client certificate: {e}")))?;

    reqwest::Client::builder()
        .add_root_certificate(ca)
        .identity(identity)
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| AllocationError::Remote(e.to_string()))
}

fn allocation_url(endpoint: &str, namespace: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    format!("{base}/apis/allocation.agones.dev/v1/namespaces/{namespace}/gameserverallocations")
}

async fn forward(
    client: &reqwest::Client,
    url: &str,
    allocation: &GameServerAllocation,
) -> std::result::Result<GameServerAllocation, String> {
    let response = client
        .post(url)
        .json(allocation)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("endpoint returned {}", response.status()));
    }
    response.json().await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{GameServerAllocationPolicySpec, Metadata};
    use std::collections::HashMap;

    fn policy(name: &str, priority: u32, weight: u32) -> GameServerAllocationPolicy {
        GameServerAllocationPolicy {
            metadata: Metadata::named("default", name),
            spec: GameServerAllocationPolicySpec {
                priority,
                weight,
                connection_info: Default::default(),
            },
        }
    }

    #[test]
    fn lowest_priority_value_wins() {
        let policies = vec![
            policy("low", 10, 100),
            policy("high", 1, 1),
            policy("mid", 5, 1000),
        ];
        for _ in 0..20 {
            assert_eq!(select_policy(&policies).unwrap().metadata.name, "high");
        }
    }

    #[test]
    fn weights_bias_the_draw() {
        let policies = vec![policy("heavy", 1, 99), policy("light", 1, 1)];
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..500 {
            let name = select_policy(&policies).unwrap().metadata.name.clone();
            *counts.entry(name).or_default() += 1;
        }
        let heavy = counts.get("heavy").copied().unwrap_or(0);
        assert!(heavy > 400, "heavy policy drawn only {heavy}/500 times");
    }

    #[test]
    fn zero_weights_fall_back_to_uniform() {
        let policies = vec![policy("a", 1, 0), policy("b", 1, 0)];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(select_policy(&policies).unwrap().metadata.name.clone());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn no_policies_is_none() {
        assert!(select_policy(&[]).is_none());
    }

    #[test]
    fn allocation_urls_are_namespaced() {
        assert_eq!(
            allocation_url("http://peer.example:8443/", "default"),
            "http://peer.example:8443/apis/allocation.agones.dev/v1/namespaces/default/gameserverallocations"
        );
    }
}
