// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP surface: routing, caller identity and error mapping.

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::time::Instant;
use tower::ServiceExt;

use common::Harness;
use hearth_core::domain::server::ServerId;
use hearth_core::presentation::api::{self, AppState, USER_HEADER};

const TOKEN: &str = "backend-secret";

fn router(h: &Harness, backend_token: Option<&str>) -> Router {
    app_with(h, backend_token, false)
}

fn app_with(h: &Harness, backend_token: Option<&str>, insecure_open_access: bool) -> Router {
    api::app(AppState {
        node_id: "node-test".to_string(),
        lifecycle: h.lifecycle.clone(),
        console: h.console.clone(),
        telemetry: h.telemetry.clone(),
        files: h.files.clone(),
        backend_token: backend_token.map(str::to_string),
        insecure_open_access,
        start_time: Instant::now(),
    })
}

fn backend(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
}

/// A request forwarded by the proxy on behalf of `user`.
fn as_user(method: Method, uri: &str, user: &str) -> axum::http::request::Builder {
    backend(method, uri).header(USER_HEADER, user)
}

fn json_body(value: Value) -> Body {
    Body::from(value.to_string())
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, request).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn create_body(sid: &str, port: u16) -> Value {
    json!({
        "sid": sid,
        "owner": "owner",
        "users": ["friend"],
        "allocations": [{ "ip": "10.0.0.5", "port": port }],
        "resource_limit": { "cpu_percent": 50, "ram_mb": 1024, "swap_mb": 0, "storage_mb": 4096 },
        "image": "img:java21",
        "blueprint_id": "bp1"
    })
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new().await;
    let app = router(&h, Some(TOKEN));

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send_json(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["node_id"], "node-test");
}

#[tokio::test]
async fn test_create_then_status() {
    let h = Harness::new().await;
    let app = router(&h, Some(TOKEN));

    let request = backend(Method::POST, "/api/servers")
        .header(header::CONTENT_TYPE, "application/json")
        .body(json_body(create_body("s1", 25565)))
        .unwrap();
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "INSTALLING");

    h.lifecycle.wait_idle(&ServerId::new("s1").unwrap()).await.unwrap();

    let request = as_user(Method::GET, "/api/servers/s1", "friend")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "STARTING");
    assert_eq!(body["allocations"][0]["port"], 25565);
}

#[tokio::test]
async fn test_errors_map_to_status_codes() {
    let h = Harness::new().await;
    let app = router(&h, Some(TOKEN));

    let request = backend(Method::POST, "/api/servers")
        .header(header::CONTENT_TYPE, "application/json")
        .body(json_body(create_body("s1", 80)))
        .unwrap();
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let request = backend(Method::GET, "/api/servers/ghost").body(Body::empty()).unwrap();
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    h.running_server("s1").await;
    let request = as_user(Method::POST, "/api/servers/s1/power", "mallory")
        .header(header::CONTENT_TYPE, "application/json")
        .body(json_body(json!({ "action": "kill" })))
        .unwrap();
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "access_denied");
}

#[tokio::test]
async fn test_caller_identity() {
    let h = Harness::new().await;
    h.running_server("s1").await;
    let app = router(&h, Some(TOKEN));

    // wrong token is rejected even with a user header
    let request = Request::builder()
        .uri("/api/servers/s1")
        .header(header::AUTHORIZATION, "Bearer nope")
        .header(USER_HEADER, "owner")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::FORBIDDEN);

    // anonymous requests are refused
    let request = Request::builder().uri("/api/servers/s1").body(Body::empty()).unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::FORBIDDEN);

    // a user header alone is not trusted
    let request = Request::builder()
        .uri("/api/servers/s1")
        .header(USER_HEADER, "owner")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::FORBIDDEN);

    // forwarded users get their own rights, not the backend's
    let request = as_user(Method::GET, "/api/servers/s1", "owner")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::OK);
    let request = as_user(Method::POST, "/api/servers", "owner")
        .header(header::CONTENT_TYPE, "application/json")
        .body(json_body(create_body("s2", 25566)))
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_node_without_token_refuses_requests() {
    let h = Harness::new().await;
    h.running_server("s1").await;
    let closed = router(&h, None);

    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/api/servers/s1?force=true")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&closed, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "access_denied");
    assert!(h.server("s1").await.is_some());

    let request = as_user(Method::GET, "/api/servers/s1", "owner")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&closed, request).await.0, StatusCode::FORBIDDEN);

    // health stays reachable without a token
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    assert_eq!(send(&closed, request).await.0, StatusCode::OK);

    // explicit opt-in restores anonymous backend access
    let open = app_with(&h, None, true);
    let request = Request::builder().uri("/api/servers/s1").body(Body::empty()).unwrap();
    assert_eq!(send(&open, request).await.0, StatusCode::OK);
}

#[tokio::test]
async fn test_power_and_delete() {
    let h = Harness::new().await;
    h.running_server("s1").await;
    let app = router(&h, Some(TOKEN));

    let request = as_user(Method::POST, "/api/servers/s1/power", "owner")
        .header(header::CONTENT_TYPE, "application/json")
        .body(json_body(json!({ "action": "stop" })))
        .unwrap();
    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "STOPPING");

    let sid = ServerId::new("s1").unwrap();
    h.lifecycle.wait_idle(&sid).await.unwrap();

    let request = backend(Method::DELETE, "/api/servers/s1?force=true")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::NO_CONTENT);
    assert!(h.server("s1").await.is_none());
    assert!(!h.engine.has_volume("server_s1"));
}

#[tokio::test]
async fn test_file_routes() {
    let h = Harness::new().await;
    h.running_server("s1").await;
    std::fs::write(h.engine.volume_path("server_s1").join("secret.key"), b"k").unwrap();
    let app = router(&h, Some(TOKEN));

    let request = as_user(Method::PUT, "/api/servers/s1/files/content?path=/motd.txt", "owner")
        .body(Body::from("welcome"))
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::NO_CONTENT);

    let request = as_user(Method::GET, "/api/servers/s1/files/content?path=/motd.txt", "friend")
        .body(Body::empty())
        .unwrap();
    let (status, content) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content, b"welcome");

    let request = as_user(Method::GET, "/api/servers/s1/files?path=/", "owner")
        .body(Body::empty())
        .unwrap();
    let (status, listing) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = listing
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"motd.txt"));
    assert!(!names.contains(&"secret.key"));

    let request = as_user(Method::GET, "/api/servers/s1/files/content?path=../etc/passwd", "owner")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::BAD_REQUEST);

    let request = as_user(Method::POST, "/api/servers/s1/files/move", "owner")
        .header(header::CONTENT_TYPE, "application/json")
        .body(json_body(json!({ "from": "/motd.txt", "to": "/motd.old" })))
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::NO_CONTENT);

    let request = as_user(Method::GET, "/api/servers/s1/files/search?query=MOTD", "owner")
        .body(Body::empty())
        .unwrap();
    let (_, found) = send_json(&app, request).await;
    assert_eq!(found[0]["path"], "/motd.old");

    let request = as_user(Method::POST, "/api/servers/s1/files/compress", "owner")
        .header(header::CONTENT_TYPE, "application/json")
        .body(json_body(json!({ "paths": ["/motd.old"], "archive": "/a.tar.gz" })))
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_terminal_command_route() {
    let h = Harness::new().await;
    h.running_server("s1").await;
    let app = router(&h, Some(TOKEN));

    let request = as_user(Method::POST, "/api/servers/s1/terminal/command", "friend")
        .header(header::CONTENT_TYPE, "application/json")
        .body(json_body(json!({ "command": "ls -la" })))
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::NO_CONTENT);
    assert_eq!(h.engine.exec_sessions(), 1);
}
