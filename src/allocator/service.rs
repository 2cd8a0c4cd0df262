//! HTTP surface of the allocation engine.
//!
//! `POST /apis/allocation.agones.dev/v1/namespaces/{namespace}/gameserverallocations`
//! takes a GameServerAllocation and answers with the same object, status
//! populated. Logical outcomes (including `UnAllocated` and `Contention`)
//! are 200s; malformed bodies are 422; non-POST methods are 405 courtesy of
//! the method router.

use super::AllocationEngine;
use crate::resources::GameServerAllocation;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;
use tracing::{debug, warn};

/// Build the allocation router.
pub fn router(engine: Arc<AllocationEngine>) -> Router {
    Router::new()
        .route(
            "/apis/allocation.agones.dev/v1/namespaces/:namespace/gameserverallocations",
            post(allocate),
        )
        .with_state(engine)
}

async fn allocate(
    State(engine): State<Arc<AllocationEngine>>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> Response {
    let mut allocation: GameServerAllocation = match serde_json::from_slice(&body) {
        Ok(allocation) => allocation,
        Err(e) => {
            debug!(error = %e, "rejecting malformed allocation body");
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("invalid GameServerAllocation: {e}"),
            )
                .into_response();
        }
    };
    allocation.metadata.namespace = namespace;

    match engine.route(allocation).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => {
            warn!(error = %e, "allocation request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::EngineConfig;
    use crate::gameservers::NodeCounter;
    use crate::resources::{AllocationState, GameServerState, Metadata};
    use crate::store::Store;
    use std::time::Duration;
    use tokio::sync::watch;

    async fn serve() -> (Arc<Store>, String, watch::Sender<bool>) {
        let store = Store::new();
        let (tx, shutdown) = watch::channel(false);
        let counter = NodeCounter::start(store.clone(), shutdown.clone());
        let engine = AllocationEngine::start(
            store.clone(),
            counter,
            EngineConfig {
                request_timeout: Duration::from_secs(2),
                ..EngineConfig::default()
            },
            shutdown,
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(engine);
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (store, format!("http://{addr}"), tx)
    }

    fn ready_gs(name: &str, fleet: &str) -> crate::resources::GameServer {
        let mut gs = crate::resources::GameServer {
            metadata: Metadata::named("default", name),
            ..Default::default()
        };
        gs.metadata
            .labels
            .insert("agones.dev/fleet".to_string(), fleet.to_string());
        gs.status.state = GameServerState::Ready;
        gs.status.address = "203.0.113.9".to_string();
        gs
    }

    #[tokio::test]
    async fn post_allocates_and_returns_status() {
        let (store, base, _tx) = serve().await;
        store.game_servers.create(ready_gs("gs-1", "simple")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let body = serde_json::json!({
            "spec": {
                "required": { "match_labels": { "agones.dev/fleet": "simple" } }
            }
        });
        let client = reqwest::Client::new();
        let response = client
            .post(format!(
                "{base}/apis/allocation.agones.dev/v1/namespaces/default/gameserverallocations"
            ))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let result: GameServerAllocation = response.json().await.unwrap();
        assert_eq!(result.status.state, AllocationState::Allocated);
        assert_eq!(result.status.game_server_name, "gs-1");
    }

    #[tokio::test]
    async fn empty_pool_returns_unallocated_as_200() {
        let (_store, base, _tx) = serve().await;
        let body = serde_json::json!({ "spec": {} });
        let client = reqwest::Client::new();
        let response = client
            .post(format!(
                "{base}/apis/allocation.agones.dev/v1/namespaces/default/gameserverallocations"
            ))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let result: GameServerAllocation = response.json().await.unwrap();
        assert_eq!(result.status.state, AllocationState::UnAllocated);
    }

    #[tokio::test]
    async fn malformed_body_is_422_and_get_is_405() {
        let (_store, base, _tx) = serve().await;
        let client = reqwest::Client::new();
        let url = format!(
            "{base}/apis/allocation.agones.dev/v1/namespaces/default/gameserverallocations"
        );

        let response = client
            .post(&url)
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 422);

        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 405);
    }
}
