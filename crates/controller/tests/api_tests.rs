//! Integration tests for the controller API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use controller_lib::{health::components, HealthRegistry, OutboxMetrics, Shutdown};
use insights_controller::api::{create_router, serve_on, AppState};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    metrics: OutboxMetrics,
}

async fn setup_test_app() -> TestApp {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::STORE).await;
    health_registry.register(components::PUSHER).await;
    health_registry.register(components::HOUSEKEEPER).await;

    let registry = Registry::new();
    let metrics = OutboxMetrics::new(&registry).unwrap();
    let state = Arc::new(AppState::new(health_registry, registry));

    TestApp {
        router: create_router(state.clone()),
        state,
        metrics,
    }
}

async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn get_text(router: Router, uri: &str) -> (StatusCode, String, String) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let app = setup_test_app().await;
    let (status, health) = get_json(app.router, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_stays_ok_when_a_flush_failed() {
    let app = setup_test_app().await;

    // A failed flush degrades the pusher; the next tick retries
    app.state
        .health_registry
        .set_degraded(components::PUSHER, "retries exhausted")
        .await;

    let (status, health) = get_json(app.router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["pusher"]["message"],
        "retries exhausted"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let app = setup_test_app().await;
    app.state
        .health_registry
        .set_unhealthy(components::STORE, "connection closed")
        .await;

    let (status, health) = get_json(app.router, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_until_ready() {
    let app = setup_test_app().await;

    let (status, readiness) = get_json(app.router.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    app.state.health_registry.set_ready(true).await;
    let (status, readiness) = get_json(app.router, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
    assert!(readiness.get("reason").is_none());
}

#[tokio::test]
async fn test_readyz_names_unhealthy_components() {
    let app = setup_test_app().await;
    app.state.health_registry.set_ready(true).await;
    app.state
        .health_registry
        .set_unhealthy(components::HOUSEKEEPER, "database locked")
        .await;

    let (status, readiness) = get_json(app.router, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Unhealthy components: housekeeper");
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_outbox_collectors() {
    let app = setup_test_app().await;
    let endpoint = "https://api.cloudzero.com/v1/container-metrics";

    app.metrics
        .observe_request(endpoint, "204", Duration::from_millis(40));
    app.metrics.observe_batch(endpoint, 12, 2048);
    app.metrics.set_backlog(endpoint, 3);
    app.metrics.inc_storage_write_failure("pod", "default", "upsert");
    app.metrics.inc_records_reclaimed(5);

    let (status, content_type, text) = get_text(app.router, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.contains("text/plain"));

    assert!(text.contains("remote_write_response_codes_total"));
    assert!(text.contains(r#"status_code="204""#));
    assert!(text.contains("remote_write_timeseries_total"));
    assert!(text.contains("remote_write_backlog_records"));
    assert!(text.contains(r#"storage_write_failure_total{action="upsert",namespace="default",resource_type="pod"} 1"#));
    assert!(text.contains("housekeeper_records_deleted_total 5"));
}

#[tokio::test]
async fn test_metrics_contains_histogram_buckets() {
    let app = setup_test_app().await;
    let endpoint = "https://api.cloudzero.com/v1/container-metrics";
    app.metrics.observe_batch(endpoint, 1, 300);
    app.metrics.observe_batch(endpoint, 1, 5000);

    let (_, _, text) = get_text(app.router, "/metrics").await;
    assert!(text.contains("remote_write_payload_size_bytes_bucket"));
    assert!(text.contains("remote_write_payload_size_bytes_count"));
    assert!(text.contains("remote_write_payload_size_bytes_sum"));
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let app = setup_test_app().await;
    let (_, health) = get_json(app.router, "/healthz").await;

    assert!(health["components"].is_object());
    for name in ["store", "pusher", "housekeeper"] {
        assert_eq!(health["components"][name]["status"], "healthy", "{name}");
    }
}

#[tokio::test]
async fn test_serve_stops_on_shutdown() {
    let app = setup_test_app().await;
    app.state.health_registry.set_ready(true).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (trigger, shutdown) = Shutdown::new();
    let server = tokio::spawn(serve_on(listener, app.state.clone(), async move {
        shutdown.signalled().await
    }));

    let response = reqwest::get(format!("http://{addr}/readyz")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let readiness: serde_json::Value =
        serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(readiness["ready"], true);

    trigger.signal();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server stops after shutdown")
        .unwrap()
        .unwrap();
}
