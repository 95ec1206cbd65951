//! `/compile` routes driven through the router without a socket.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower::ServiceExt;

use common::{fixture, wait_for_status, FakeToolchain, Fixture, Produces};
use folio_compile::{router, AppState, JobStatus, QueueConfig};

fn app(fx: &Fixture) -> Router {
    router(AppState::new(fx.queue.clone(), fx.store.clone()))
}

fn submit_request(user: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/compile/submit")
        .header("content-type", "application/json");
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn as_json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_submit_returns_job_id_and_stats() {
    let fx = fixture(
        Arc::new(FakeToolchain::producing(Produces::Pdf)),
        QueueConfig::default(),
    );
    let app = app(&fx);

    let (status, body) = send(
        &app,
        submit_request(
            Some("bob"),
            json!({ "fileName": "main.tex", "content": "\\relax", "resourceId": "p1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = as_json(&body);
    assert!(body["jobId"].is_string());
    assert_eq!(body["stats"]["total"], 1);

    let id = body["jobId"].as_str().unwrap().parse().unwrap();
    wait_for_status(&fx.queue, &id, JobStatus::Completed).await;

    let (status, body) = send(&app, get(&format!("/compile/status/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let view = as_json(&body);
    assert_eq!(view["status"], "completed");
    assert!(view["completedAt"].is_u64());

    let (status, pdf) = send(&app, get(&format!("/compile/artifact/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(pdf.starts_with(b"%PDF"));

    let (status, log) = send(&app, get(&format!("/compile/log/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&log).contains("fake pass 3"));
}

#[tokio::test]
async fn test_submit_rejections() {
    let fx = fixture(
        Arc::new(FakeToolchain::producing(Produces::Pdf)),
        QueueConfig::default(),
    );
    let app = app(&fx);
    let body = json!({ "fileName": "main.tex", "content": "x", "resourceId": "p1" });

    let (status, _) = send(&app, submit_request(None, body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, submit_request(Some("mallory"), body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    for name in ["notes.txt", "../escape.tex", "/etc/passwd.tex"] {
        let (status, _) = send(
            &app,
            submit_request(
                Some("alice"),
                json!({ "fileName": name, "content": "x", "resourceId": "p1" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{name} accepted");
    }

    let (status, _) = send(
        &app,
        submit_request(
            Some("alice"),
            json!({ "fileName": "main.tex", "content": "x", "resourceId": "missing" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(fx.queue.stats().total_ever_seen, 0);
}

#[tokio::test]
async fn test_unknown_job_reports_expired() {
    let fx = fixture(
        Arc::new(FakeToolchain::producing(Produces::Pdf)),
        QueueConfig::default(),
    );
    let app = app(&fx);
    let id = uuid::Uuid::new_v4();

    for route in ["status", "artifact", "log"] {
        let (status, body) = send(&app, get(&format!("/compile/{route}/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{route}");
        assert_eq!(as_json(&body)["expired"], true);
    }
}

#[tokio::test]
async fn test_artifact_conflicts_until_completed() {
    let gate = Arc::new(Semaphore::new(0));
    let fx = fixture(Arc::new(FakeToolchain::gated(gate.clone())), QueueConfig::default());
    let app = app(&fx);

    let (_, body) = send(
        &app,
        submit_request(
            Some("alice"),
            json!({ "fileName": "main.tex", "content": "x", "resourceId": "p1" }),
        ),
    )
    .await;
    let id = as_json(&body)["jobId"].as_str().unwrap().to_string();

    let (status, body) = send(&app, get(&format!("/compile/artifact/{id}"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(as_json(&body)["error"].as_str().unwrap().contains("not ready"));

    gate.add_permits(3);
    wait_for_status(&fx.queue, &id.parse().unwrap(), JobStatus::Completed).await;
    let (status, _) = send(&app, get(&format!("/compile/artifact/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_stats_routes() {
    let gate = Arc::new(Semaphore::new(0));
    let config = QueueConfig {
        max_concurrent: 2,
        ..QueueConfig::default()
    };
    let fx = fixture(Arc::new(FakeToolchain::gated(gate)), config);
    let app = app(&fx);

    for resource in ["r1", "r2", "r3"] {
        let (status, _) = send(
            &app,
            submit_request(
                Some("alice"),
                json!({ "fileName": "main.tex", "content": "x", "resourceId": resource }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(&app, get("/compile/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        as_json(&body),
        json!({ "compiling": 2, "queued": 1, "total": 3, "availableSlots": 0 })
    );

    let (status, body) = send(&app, get("/compile/queue-stats")).await;
    assert_eq!(status, StatusCode::OK);
    let stats = as_json(&body);
    assert_eq!(stats["totalEverSeen"], 3);
    assert_eq!(stats["completed"], 0);
}
