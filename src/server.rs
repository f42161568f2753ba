use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::HeaderValue;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::manager::ChildRegistry;
use crate::routing::{broadcast_cancel, forward_completion, forward_models, ChildRequestError};
use crate::types::ChildProcess;

const DEPRECATION_NOTICE: &str = "Use /ready instead of /health.";
const NO_HEALTHY_CHILDREN: &str = "No healthy child proxies available.";

/// Response headers that must not be relayed from a child.
const HOP_BY_HOP: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ChildRegistry>,
    pub client: reqwest::Client,
}

/// Subset of an OpenAI chat completion request the coordinator validates.
/// The original payload is forwarded untouched; this only gates schema and
/// the streaming flag.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Message {
    pub role: String,
    pub content: Value,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/cancel/:req_id", post(cancel_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn live() -> Json<Value> {
    Json(json!({"status": "alive"}))
}

fn ready_payload(registry: &ChildRegistry) -> (StatusCode, Json<Value>) {
    let ready: Vec<String> = registry
        .ready_children()
        .iter()
        .map(|child| child.name().to_string())
        .collect();
    let unhealthy = registry.unhealthy_names();
    let total = registry.all_children().len();

    let status_code = if ready.is_empty() {
        warn!(
            unhealthy = ?unhealthy,
            "Coordinator readiness failing: no healthy children"
        );
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let status = if ready.is_empty() { "degraded" } else { "ready" };
    (
        status_code,
        Json(json!({
            "status": status,
            "ready_children": ready,
            "unhealthy_children": unhealthy,
            "total_children": total,
        })),
    )
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    ready_payload(&state.registry)
}

async fn health(State(state): State<AppState>) -> Response {
    let mut response = ready_payload(&state.registry).into_response();
    response.headers_mut().insert(
        "x-deprecation-notice",
        HeaderValue::from_static(DEPRECATION_NOTICE),
    );
    response
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(json!({"detail": detail.into()}))).into_response()
}

fn no_healthy_children() -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, NO_HEALTHY_CHILDREN)
}

/// Relay a child response: status and body verbatim, headers minus the
/// hop-by-hop set.
async fn relay_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    match upstream.bytes().await {
        Ok(body) => (status, headers, body).into_response(),
        Err(err) => error_response(
            StatusCode::BAD_GATEWAY,
            format!("Failed to read child response: {err}"),
        ),
    }
}

/// Round-robin over healthy children with retry-on-unhealthy failover. The
/// attempted set guarantees termination even if a demoted name reappears.
async fn route_with_retry<F, Fut>(state: &AppState, kind: &str, send: F) -> Response
where
    F: Fn(Arc<ChildProcess>) -> Fut,
    Fut: Future<Output = Result<reqwest::Response, ChildRequestError>>,
{
    let mut attempted: HashSet<String> = HashSet::new();
    loop {
        let Some(child) = state.registry.next_child() else {
            return no_healthy_children();
        };
        if !attempted.insert(child.name().to_string()) {
            return no_healthy_children();
        }

        info!(profile = %child.name(), kind, "Routing request to child");
        match send(child.clone()).await {
            Ok(response) => return relay_response(response).await,
            Err(err) if err.retryable => {
                state.registry.mark_unhealthy(&child, &err.message);
                continue;
            }
            Err(err) => return error_response(StatusCode::BAD_GATEWAY, err.message),
        }
    }
}

async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let request: ChatCompletionRequest = match serde_json::from_value(payload.clone()) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
    };
    if request.stream {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Streaming is not supported by the coordinator.",
        );
    }

    route_with_retry(&state, "completion", |child| {
        let client = state.client.clone();
        let payload = payload.clone();
        async move { forward_completion(&client, &child, &payload).await }
    })
    .await
}

async fn list_models(State(state): State<AppState>) -> Response {
    route_with_retry(&state, "models", |child| {
        let client = state.client.clone();
        async move { forward_models(&client, &child).await }
    })
    .await
}

async fn cancel_request(State(state): State<AppState>, Path(req_id): Path<String>) -> Response {
    info!(request = %req_id, "Broadcasting cancellation");
    let children = state.registry.all_children();
    let result = broadcast_cancel(&state.client, &children, &req_id).await;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (
        status,
        Json(json!({
            "success": result.success,
            "completed": result.responders,
            "failed": result.failures,
        })),
    )
        .into_response()
}
