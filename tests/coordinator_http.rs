//! End-to-end test of the coordinator HTTP surface against in-process fake
//! children: the coordinator is served on a real port and driven with a
//! plain HTTP client, with child backends stood up as tiny axum servers.

use std::collections::HashMap;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use proxy_coordinator::launcher::{LaunchConfig, LaunchError};
use proxy_coordinator::manager::{ChildRegistry, LaunchFn, SlotManager};
use proxy_coordinator::server::{create_router, AppState};
use proxy_coordinator::types::{AuthProfile, ChildPorts, ChildProcess, ProcessControl, ProfileQueue};
use serde_json::{json, Value};

/// Process stand-in that stays alive until told otherwise.
struct StubProcess {
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl ProcessControl for StubProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        use std::os::unix::process::ExitStatusExt;
        Ok(self
            .exited
            .load(Ordering::SeqCst)
            .then(|| ExitStatus::from_raw(0)))
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.exited.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        use std::os::unix::process::ExitStatusExt;
        Ok(ExitStatus::from_raw(0))
    }
}

fn stub_child(name: &str, api_port: u16) -> Arc<ChildProcess> {
    Arc::new(ChildProcess::new(
        AuthProfile::new(name, format!("/tmp/{name}.json")),
        ChildPorts {
            api_port,
            stream_port: api_port.wrapping_add(100),
            debug_port: api_port.wrapping_add(6000),
        },
        Box::new(StubProcess {
            pid: api_port as u32,
            exited: Arc::new(AtomicBool::new(false)),
        }),
        None,
    ))
}

async fn spawn_server(router: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

fn serving_child_app(name: &'static str) -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(move |Json(body): Json<Value>| async move {
                Json(json!({
                    "object": "chat.completion",
                    "served_by": name,
                    "model": body["model"],
                }))
            }),
        )
        .route(
            "/v1/models",
            get(|| async { Json(json!({"object": "list", "data": [{"id": "default"}]})) }),
        )
        .route("/v1/cancel/:id", post(|| async { StatusCode::OK }))
}

fn failing_child_app() -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "broken") }),
        )
        .route("/v1/cancel/:id", post(|| async { StatusCode::BAD_GATEWAY }))
}

async fn start_coordinator(registry: Arc<ChildRegistry>) -> (String, reqwest::Client) {
    let state = AppState {
        registry,
        client: reqwest::Client::new(),
    };
    let port = spawn_server(create_router(state)).await;
    (format!("http://127.0.0.1:{port}"), reqwest::Client::new())
}

#[tokio::test]
async fn coordinator_routes_cancels_and_reports_health() {
    let good_port = spawn_server(serving_child_app("good")).await;
    let bad_port = spawn_server(failing_child_app()).await;

    let good = stub_child("good", good_port);
    let bad = stub_child("bad", bad_port);
    let registry = ChildRegistry::new(vec![good.clone(), bad.clone()]);
    registry.mark_ready(&good);
    registry.mark_ready(&bad);

    let (base, client) = start_coordinator(registry.clone()).await;

    // Liveness is unconditional.
    let live: Value = client
        .get(format!("{base}/live"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(live, json!({"status": "alive"}));

    // Readiness reflects both children while they are still trusted.
    let ready = client.get(format!("{base}/ready")).send().await.unwrap();
    assert_eq!(ready.status(), reqwest::StatusCode::OK);
    let ready_body: Value = ready.json().await.unwrap();
    assert_eq!(ready_body["status"], "ready");
    assert_eq!(ready_body["total_children"], 2);

    // The legacy alias mirrors /ready and flags itself deprecated.
    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(
        health
            .headers()
            .get("x-deprecation-notice")
            .and_then(|v| v.to_str().ok()),
        Some("Use /ready instead of /health.")
    );
    let health_body: Value = health.json().await.unwrap();
    assert_eq!(health_body["status"], ready_body["status"]);

    // Completions fail over from the broken child to the serving one.
    for _ in 0..2 {
        let response = client
            .post(format!("{base}/v1/chat/completions"))
            .json(&json!({
                "model": "gpt-test",
                "messages": [{"role": "user", "content": "ping"}],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["served_by"], "good");
        assert_eq!(body["model"], "gpt-test");
    }
    assert_eq!(registry.unhealthy_names(), vec!["bad"]);

    // Models go through the same retry loop.
    let models: Value = client
        .get(format!("{base}/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["object"], "list");

    // Cancellation fans out to every known child, including the demoted one.
    let cancel = client
        .post(format!("{base}/v1/cancel/req-7"))
        .send()
        .await
        .unwrap();
    assert_eq!(cancel.status(), reqwest::StatusCode::OK);
    let cancel_body: Value = cancel.json().await.unwrap();
    assert_eq!(cancel_body["success"], true);
    assert_eq!(cancel_body["completed"], json!(["good"]));
    assert_eq!(cancel_body["failed"], json!(["bad"]));
}

#[tokio::test]
async fn streaming_requests_are_rejected_up_front() {
    let registry = ChildRegistry::new(vec![]);
    let (base, client) = start_coordinator(registry).await;

    let response = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-test",
            "messages": [{"role": "user", "content": "ping"}],
            "stream": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "Streaming is not supported by the coordinator.");
}

#[tokio::test]
async fn recycled_slots_swap_registry_membership() {
    // Scripted launcher so the slot manager can rotate profiles without
    // spawning real processes.
    let launch: LaunchFn = Arc::new(|profile, ports, _config| {
        Ok::<_, LaunchError>(stub_child(&profile.name, ports.api_port))
    });
    let ports = proxy_coordinator::ports::assign_ports(2, 3100, 3200, 9222, 1).unwrap();
    let profiles: Vec<AuthProfile> = ["one", "two", "three", "four", "five"]
        .iter()
        .map(|name| AuthProfile::new(*name, format!("/tmp/{name}.json")))
        .collect();
    let config = LaunchConfig {
        command: "/bin/true".into(),
        env: HashMap::new(),
        headless: true,
        log_dir: "/tmp/coordinator-e2e-logs".into(),
    };
    let manager = Arc::new(SlotManager::with_launcher(
        ports,
        profiles[2..].iter().cloned().collect::<ProfileQueue>(),
        config,
        launch,
    ));
    let children = manager.bootstrap(&profiles[..2]).unwrap();
    let registry = ChildRegistry::new(children.clone());
    for child in &children {
        registry.mark_ready(child);
    }
    registry.set_slot_manager(manager.clone());

    registry.mark_unhealthy(&children[0], "request failed");

    // Slot 0 keeps its ports but now runs the queue head; the evicted
    // profile cools off at the tail.
    let snapshot = manager.snapshot();
    assert_eq!(snapshot[0].0.api_port, 3100);
    assert_eq!(snapshot[0].1.as_deref(), Some("three"));
    assert_eq!(manager.queued_profiles(), vec!["four", "five", "one"]);

    let names: Vec<String> = registry
        .all_children()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    assert!(!names.contains(&"one".to_string()));
    assert!(names.contains(&"three".to_string()));
    assert!(!registry
        .ready_children()
        .iter()
        .any(|c| c.name() == "one"));
}
