//! Admission webhook router: one mutation (defaulting) and one validation
//! endpoint per resource kind, speaking `AdmissionReview` JSON.
//!
//! Handler failures reject the request (fail-closed); reconcile loops still
//! demote invalid specs that slip through to `Error`.

use crate::resources::{Fleet, FleetAutoscaler, GameServer};
use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Admission request wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionReview {
    /// The request under review.
    #[serde(default)]
    pub request: Option<AdmissionRequest>,
    /// The verdict, filled in by the webhook.
    #[serde(default)]
    pub response: Option<AdmissionResponse>,
}

/// One object under admission review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Correlation id, echoed in the response.
    pub uid: String,
    /// Kind of the object.
    #[serde(default)]
    pub kind: String,
    /// CREATE or UPDATE.
    #[serde(default)]
    pub operation: String,
    /// The object itself.
    pub object: Value,
}

/// Admission verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionResponse {
    /// Correlation id from the request.
    pub uid: String,
    /// Whether the object is admitted.
    pub allowed: bool,
    /// Failure detail when not allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AdmissionStatus>,
    /// Base64-encoded JSON patch applying the defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    /// Patch encoding; always `JSONPatch` when `patch` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
}

/// Failure detail carried in a rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionStatus {
    /// Human-readable message.
    pub message: String,
}

/// A single JSON-patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    /// `add`, `replace` or `remove`.
    pub op: String,
    /// JSON-pointer path.
    pub path: String,
    /// Value for add/replace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Build the admission router.
pub fn router() -> Router {
    Router::new()
        .route("/mutate/gameservers", post(mutate_game_servers))
        .route("/mutate/fleets", post(mutate_fleets))
        .route("/validate/gameservers", post(validate_game_servers))
        .route("/validate/fleets", post(validate_fleets))
        .route("/validate/fleetautoscalers", post(validate_autoscalers))
}

async fn mutate_game_servers(body: Bytes) -> Response {
    mutate(body, |mut gs: GameServer| {
        gs.apply_defaults();
        gs
    })
}

async fn mutate_fleets(body: Bytes) -> Response {
    mutate(body, |mut fleet: Fleet| {
        fleet.apply_defaults();
        fleet
    })
}

async fn validate_game_servers(body: Bytes) -> Response {
    validate(body, |gs: GameServer| gs.validate())
}

async fn validate_fleets(body: Bytes) -> Response {
    validate(body, |fleet: Fleet| fleet.validate())
}

async fn validate_autoscalers(body: Bytes) -> Response {
    validate(body, |fas: FleetAutoscaler| fas.validate())
}

fn mutate<T, F>(body: Bytes, apply: F) -> Response
where
    T: serde::de::DeserializeOwned + Serialize,
    F: FnOnce(T) -> T,
{
    with_review(body, |request| {
        let original = request.object.clone();
        let typed: T = match serde_json::from_value(request.object.clone()) {
            Ok(t) => t,
            Err(e) => return reject(&request.uid, format!("malformed object: {e}")),
        };
        let mutated = match serde_json::to_value(apply(typed)) {
            Ok(v) => v,
            Err(e) => return reject(&request.uid, format!("defaulting failed: {e}")),
        };
        let patch = json_patch(&original, &mutated, String::new());
        let mut response = AdmissionResponse {
            uid: request.uid.clone(),
            allowed: true,
            result: None,
            patch: None,
            patch_type: None,
        };
        if !patch.is_empty() {
            debug!(ops = patch.len(), "admission defaulting produced a patch");
            match serde_json::to_vec(&patch) {
                Ok(bytes) => {
                    response.patch =
                        Some(base64::engine::general_purpose::STANDARD.encode(bytes));
                    response.patch_type = Some("JSONPatch".to_string());
                }
                Err(e) => return reject(&request.uid, format!("patch encoding failed: {e}")),
            }
        }
        response
    })
}

fn validate<T, F>(body: Bytes, check: F) -> Response
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(T) -> Vec<String>,
{
    with_review(body, |request| {
        let typed: T = match serde_json::from_value(request.object.clone()) {
            Ok(t) => t,
            Err(e) => return reject(&request.uid, format!("malformed object: {e}")),
        };
        let violations = check(typed);
        if violations.is_empty() {
            AdmissionResponse {
                uid: request.uid.clone(),
                allowed: true,
                result: None,
                patch: None,
                patch_type: None,
            }
        } else {
            reject(&request.uid, violations.join("; "))
        }
    })
}

fn with_review(
    body: Bytes,
    handle: impl FnOnce(&AdmissionRequest) -> AdmissionResponse,
) -> Response {
    let review: AdmissionReview = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid AdmissionReview: {e}"))
                .into_response()
        }
    };
    let Some(request) = review.request else {
        return (
            StatusCode::BAD_REQUEST,
            "AdmissionReview carries no request".to_string(),
        )
            .into_response();
    };
    let response = handle(&request);
    Json(AdmissionReview {
        request: None,
        response: Some(response),
    })
    .into_response()
}

fn reject(uid: &str, message: String) -> AdmissionResponse {
    AdmissionResponse {
        uid: uid.to_string(),
        allowed: false,
        result: Some(AdmissionStatus { message }),
        patch: None,
        patch_type: None,
    }
}

/// Compute a JSON patch transforming `original` into `mutated`.
///
/// Objects are diffed field by field; arrays and scalars are replaced
/// wholesale when they differ.
pub fn json_patch(original: &Value, mutated: &Value, path: String) -> Vec<PatchOp> {
    if original == mutated {
        return Vec::new();
    }
    match (original, mutated) {
        (Value::Object(old), Value::Object(new)) => {
            let mut ops = Vec::new();
            for (key, old_value) in old {
                let child = format!("{path}/{}", escape_pointer(key));
                match new.get(key) {
                    Some(new_value) => ops.extend(json_patch(old_value, new_value, child)),
                    None => ops.push(PatchOp {
                        op: "remove".to_string(),
                        path: child,
                        value: None,
                    }),
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    ops.push(PatchOp {
                        op: "add".to_string(),
                        path: format!("{path}/{}", escape_pointer(key)),
                        value: Some(new_value.clone()),
                    });
                }
            }
            ops
        }
        _ => vec![PatchOp {
            op: "replace".to_string(),
            path,
            value: Some(mutated.clone()),
        }],
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review_body(object: Value) -> Bytes {
        Bytes::from(
            serde_json::to_vec(&json!({
                "request": {
                    "uid": "req-1",
                    "kind": "GameServer",
                    "operation": "CREATE",
                    "object": object,
                }
            }))
            .unwrap(),
        )
    }

    async fn response_review(response: Response) -> AdmissionReview {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn game_server_object() -> Value {
        json!({
            "metadata": { "name": "gs-1", "namespace": "default" },
            "spec": {
                "ports": [],
                "template": {
                    "spec": {
                        "containers": [
                            { "name": "game", "image": "example/simple-game:0.1" }
                        ]
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn mutation_emits_a_defaulting_patch() {
        let response = mutate_game_servers(review_body(game_server_object())).await;
        let review = response_review(response).await;
        let admission = review.response.unwrap();
        assert!(admission.allowed);
        let patch = admission.patch.expect("defaulting should patch");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(patch)
            .unwrap();
        let ops: Vec<PatchOp> = serde_json::from_slice(&decoded).unwrap();
        // The finalizer lands and the single container is filled in.
        assert!(ops
            .iter()
            .any(|op| op.path == "/metadata/finalizers"));
        assert!(ops
            .iter()
            .any(|op| op.path == "/spec/container"));
    }

    #[tokio::test]
    async fn mutation_is_idempotent_for_defaulted_objects() {
        let response = mutate_game_servers(review_body(game_server_object())).await;
        let review = response_review(response).await;
        let patch = review.response.unwrap().patch.unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(patch)
            .unwrap();
        let ops: Vec<PatchOp> = serde_json::from_slice(&decoded).unwrap();

        // Apply the defaults by round-tripping through the typed object, then
        // mutate again: no further patch.
        let mut gs: GameServer =
            serde_json::from_value(game_server_object()).unwrap();
        gs.apply_defaults();
        let defaulted = serde_json::to_value(&gs).unwrap();
        let response = mutate_game_servers(review_body(defaulted)).await;
        let review = response_review(response).await;
        assert!(review.response.unwrap().patch.is_none());
        assert!(!ops.is_empty());
    }

    #[tokio::test]
    async fn validation_rejects_bad_specs_with_detail() {
        let mut object = game_server_object();
        object["spec"]["container"] = json!("absent");
        let response = validate_game_servers(review_body(object)).await;
        let review = response_review(response).await;
        let admission = review.response.unwrap();
        assert!(!admission.allowed);
        assert!(admission.result.unwrap().message.contains("absent"));
    }

    #[tokio::test]
    async fn unparseable_objects_fail_closed() {
        let response = validate_game_servers(review_body(json!({ "spec": 42 }))).await;
        let review = response_review(response).await;
        assert!(!review.response.unwrap().allowed);
    }

    #[test]
    fn patch_paths_escape_pointer_characters() {
        let original = json!({ "metadata": { "labels": {} } });
        let mutated = json!({ "metadata": { "labels": { "agones.dev/fleet": "simple" } } });
        let ops = json_patch(&original, &mutated, String::new());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].path, "/metadata/labels/agones.dev~1fleet");
        assert_eq!(ops[0].op, "add");
    }

    #[test]
    fn identical_documents_need_no_patch() {
        let doc = json!({ "a": [1, 2, 3], "b": { "c": true } });
        assert!(json_patch(&doc, &doc, String::new()).is_empty());
    }
}
