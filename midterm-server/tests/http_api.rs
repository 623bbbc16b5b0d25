//! Integration tests for the REST session surface, driven straight through
//! `http::app()` the way a real request would hit it (no process spawned).

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use midterm_server::clock::SystemClock;
use midterm_server::http::{app, AppState};
use midterm_server::registry::SessionRegistry;
use midterm_server::spawner::StdProcessSpawner;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn test_registry_with_shutdown(shutdown: CancellationToken) -> SessionRegistry {
    SessionRegistry::new(
        std::path::PathBuf::from("/nonexistent/midterm-host-binary"),
        Arc::new(StdProcessSpawner),
        Arc::new(SystemClock),
        shutdown,
    )
}

fn test_state() -> AppState {
    AppState::new(test_registry_with_shutdown(CancellationToken::new()))
}

#[tokio::test]
async fn empty_registry_lists_no_sessions() {
    let app = app(test_state(), None);
    let response = app
        .oneshot(Request::builder().uri("/api/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"[]");
}

#[tokio::test]
async fn create_session_reports_service_unavailable_when_host_binary_is_missing() {
    let app = app(test_state(), None);
    let request = Request::builder()
        .method("POST")
        .uri("/api/sessions")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn closing_an_unknown_session_is_not_found() {
    let app = app(test_state(), None);
    let request = Request::builder()
        .method("DELETE")
        .uri("/api/sessions/deadbeef")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Cancelling the registry's root shutdown token must unwind every
/// `HostClient` supervisor it owns, not just drain axum's own HTTP
/// connections (§11 testable property 5).
#[tokio::test]
async fn shutdown_token_stops_adopted_host_client_supervisors() {
    use midterm_server::host_client::{HostClient, HostClientState};
    use midterm_proto::session::SessionId;

    let shutdown = CancellationToken::new();
    let registry = test_registry_with_shutdown(shutdown.clone());

    let client = HostClient::new(
        SessionId::from_raw("deadbeef".to_string()),
        std::path::PathBuf::from("/nonexistent/host-endpoint.sock"),
        1,
        Arc::new(SystemClock),
        registry.shutdown(),
    );
    registry.adopt(SessionId::from_raw("deadbeef".to_string()), Arc::clone(&client));
    client.start_read_loop();

    shutdown.cancel();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while client.state() != HostClientState::Closed && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(client.state(), HostClientState::Closed);
}
