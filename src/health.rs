use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::ChildProcess;

/// Per-attempt client timeout for a single health poll.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_DELAY: Duration = Duration::from_secs(1);

/// Poll the child `/health` endpoint until it reports ready or the deadline
/// elapses.
///
/// A child is ready when `/health` answers 200 with `{"status":"OK"}`.
/// Individual attempt failures (transport errors, non-200, undecodable
/// bodies) never propagate; they just consume attempts until the deadline.
pub async fn wait_for_ready(child: Arc<ChildProcess>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let url = format!("http://127.0.0.1:{}/health", child.ports().api_port);
    let Ok(client) = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() else {
        warn!(profile = %child.name(), "Failed to build health probe client");
        return false;
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match client.get(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                match response.json::<serde_json::Value>().await {
                    Ok(body) if body.get("status").and_then(|v| v.as_str()) == Some("OK") => {
                        child.set_ready(true);
                        info!(
                            profile = %child.name(),
                            attempts = attempt,
                            "Child became ready"
                        );
                        return true;
                    }
                    Ok(body) => {
                        debug!(profile = %child.name(), %body, "Health check not OK yet");
                    }
                    Err(err) => {
                        debug!(profile = %child.name(), error = %err, "Health body undecodable");
                    }
                }
            }
            Ok(response) => {
                debug!(
                    profile = %child.name(),
                    status = %response.status(),
                    "Health check returned non-200"
                );
            }
            Err(err) => {
                debug!(profile = %child.name(), error = %err, "Health check failed");
            }
        }

        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(POLL_DELAY).await;
        if Instant::now() > deadline {
            break;
        }
    }

    warn!(
        profile = %child.name(),
        attempts = attempt,
        "Timed out waiting for child to become ready"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_util::fake_child;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn spawn_fake_child(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn ready_child_flips_ready_flag() {
        let app = Router::new().route("/health", get(|| async { Json(json!({"status": "OK"})) }));
        let port = spawn_fake_child(app).await;
        let (child, _state) = fake_child("alpha", port);

        assert!(wait_for_ready(child.clone(), Duration::from_secs(5)).await);
        assert!(child.is_ready());
    }

    #[tokio::test]
    async fn non_ok_status_times_out() {
        let app =
            Router::new().route("/health", get(|| async { Json(json!({"status": "STARTING"})) }));
        let port = spawn_fake_child(app).await;
        let (child, _state) = fake_child("beta", port);

        assert!(!wait_for_ready(child.clone(), Duration::ZERO).await);
        assert!(!child.is_ready());
    }

    #[tokio::test]
    async fn unreachable_child_times_out() {
        // Bind and immediately drop a listener so the port is closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (child, _state) = fake_child("gamma", port);

        assert!(!wait_for_ready(child, Duration::ZERO).await);
    }
}
