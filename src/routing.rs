use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::debug;

use crate::types::{CancelResult, ChildProcess};

pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);
pub const MODELS_TIMEOUT: Duration = Duration::from_secs(15);
pub const CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// A request to a child backend failed.
///
/// Retryable errors (transport failures, 5xx responses) demote the child and
/// move the request on to the next one; anything else surfaces to the caller.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ChildRequestError {
    pub profile: String,
    pub message: String,
    pub retryable: bool,
}

impl ChildRequestError {
    fn transport(child: &ChildProcess, err: &reqwest::Error) -> Self {
        Self {
            profile: child.name().to_string(),
            message: format!("Request failed: {err}"),
            retryable: true,
        }
    }

    fn server_status(child: &ChildProcess, status: reqwest::StatusCode) -> Self {
        Self {
            profile: child.name().to_string(),
            message: format!("Child responded with {}", status.as_u16()),
            retryable: true,
        }
    }
}

fn child_url(child: &ChildProcess, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", child.ports().api_port, path)
}

fn classify(
    child: &ChildProcess,
    result: Result<reqwest::Response, reqwest::Error>,
) -> Result<reqwest::Response, ChildRequestError> {
    let response = result.map_err(|err| ChildRequestError::transport(child, &err))?;
    if response.status().is_server_error() {
        return Err(ChildRequestError::server_status(child, response.status()));
    }
    Ok(response)
}

/// Forward a completion request to the specified child.
pub async fn forward_completion(
    client: &reqwest::Client,
    child: &Arc<ChildProcess>,
    payload: &serde_json::Value,
) -> Result<reqwest::Response, ChildRequestError> {
    let result = client
        .post(child_url(child, "/v1/chat/completions"))
        .timeout(COMPLETION_TIMEOUT)
        .json(payload)
        .send()
        .await;
    classify(child, result)
}

/// Forward a `/v1/models` request to the specified child.
pub async fn forward_models(
    client: &reqwest::Client,
    child: &Arc<ChildProcess>,
) -> Result<reqwest::Response, ChildRequestError> {
    let result = client
        .get(child_url(child, "/v1/models"))
        .timeout(MODELS_TIMEOUT)
        .send()
        .await;
    classify(child, result)
}

/// Send a cancellation for `req_id` to every known child. Only a 200 counts
/// as a response; transport errors and any other status are failures.
pub async fn broadcast_cancel(
    client: &reqwest::Client,
    children: &[Arc<ChildProcess>],
    req_id: &str,
) -> CancelResult {
    let outcomes = join_all(children.iter().map(|child| async move {
        let url = child_url(child, &format!("/v1/cancel/{req_id}"));
        let responded = match client.post(&url).timeout(CANCEL_TIMEOUT).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => true,
            Ok(response) => {
                debug!(
                    request = %req_id,
                    profile = %child.name(),
                    status = %response.status(),
                    "Cancellation rejected by child"
                );
                false
            }
            Err(err) => {
                debug!(
                    request = %req_id,
                    profile = %child.name(),
                    error = %err,
                    "Cancellation delivery failed"
                );
                false
            }
        };
        (child.name().to_string(), responded)
    }))
    .await;

    let mut responders = Vec::new();
    let mut failures = Vec::new();
    for (name, responded) in outcomes {
        if responded {
            responders.push(name);
        } else {
            failures.push(name);
        }
    }

    CancelResult {
        success: !responders.is_empty(),
        responders,
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_util::fake_child;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    async fn spawn_child_server(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn completion_response_is_returned_verbatim() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                Json(json!({"echo": body, "object": "chat.completion"}))
            }),
        );
        let port = spawn_child_server(app).await;
        let (child, _state) = fake_child("a", port);
        let client = reqwest::Client::new();

        let payload = json!({"model": "m", "messages": []});
        let response = forward_completion(&client, &child, &payload).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["echo"]["model"], "m");
    }

    #[tokio::test]
    async fn child_4xx_is_not_an_error() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "bad request") }),
        );
        let port = spawn_child_server(app).await;
        let (child, _state) = fake_child("a", port);
        let client = reqwest::Client::new();

        let response = forward_completion(&client, &child, &json!({})).await.unwrap();
        assert_eq!(response.status().as_u16(), 422);
    }

    #[tokio::test]
    async fn child_5xx_is_retryable() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let port = spawn_child_server(app).await;
        let (child, _state) = fake_child("a", port);
        let client = reqwest::Client::new();

        let err = forward_completion(&client, &child, &json!({})).await.unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.profile, "a");
        assert!(err.message.contains("500"), "{}", err.message);
    }

    #[tokio::test]
    async fn transport_failure_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (child, _state) = fake_child("a", port);
        let client = reqwest::Client::new();

        let err = forward_models(&client, &child).await.unwrap_err();
        assert!(err.retryable);
        assert!(err.message.starts_with("Request failed:"), "{}", err.message);
    }

    #[tokio::test]
    async fn cancel_fan_out_partitions_responders_and_failures() {
        let ok_app = Router::new().route("/v1/cancel/:id", post(|| async { StatusCode::OK }));
        let fail_app = Router::new().route(
            "/v1/cancel/:id",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let ok_port = spawn_child_server(ok_app).await;
        let fail_port = spawn_child_server(fail_app).await;
        let (ok_child, _s1) = fake_child("OK", ok_port);
        let (fail_child, _s2) = fake_child("FAIL", fail_port);
        let client = reqwest::Client::new();

        let result = broadcast_cancel(&client, &[ok_child, fail_child], "req-1").await;
        assert!(result.success);
        assert_eq!(result.responders, vec!["OK"]);
        assert_eq!(result.failures, vec!["FAIL"]);
    }

    #[tokio::test]
    async fn cancel_with_no_responders_is_unsuccessful() {
        let gone = Router::new().route("/v1/cancel/:id", post(|| async { StatusCode::NOT_FOUND }));
        let port = spawn_child_server(gone).await;
        let (child, _state) = fake_child("a", port);
        let client = reqwest::Client::new();

        let result = broadcast_cancel(&client, &[child], "req-2").await;
        assert!(!result.success);
        assert_eq!(result.failures, vec!["a"]);
        assert!(result.responders.is_empty());
    }
}
