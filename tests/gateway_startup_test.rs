use admission_gate::api::api_router;
use admission_gate::config::GatewayConfig;
use admission_gate::store::{StoreBackend, StoreMode};
use admission_gate::Gateway;
use axum::body::Body;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

async fn health(gateway: &Gateway) -> Value {
    let response = api_router(gateway.api_state())
        .oneshot(
            http::Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_unreachable_redis_at_startup_runs_degraded() {
    let mut config = GatewayConfig::default();
    // Nothing listens on port 1
    config.store.redis_url = Some("redis://127.0.0.1:1".to_string());
    config.store.operation_timeout_ms = 100;
    config.store.recovery_interval_ms = 60_000;

    let gateway = Gateway::build(&config).await.unwrap();

    let failover = gateway.failover.clone().expect("a configured store is always wrapped");
    assert_eq!(failover.mode(), StoreMode::Degraded);
    assert_eq!(*failover.subscribe().borrow(), StoreMode::Degraded);
    assert_eq!(gateway.limiter.backend(), StoreBackend::Memory);

    let body = health(&gateway).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["store"], "degraded");
}

#[tokio::test]
async fn test_local_only_gateway_reports_local_store() {
    let gateway = Gateway::build(&GatewayConfig::default()).await.unwrap();

    assert!(gateway.failover.is_none());
    let body = health(&gateway).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "local");
}

#[tokio::test]
async fn test_invalid_redis_url_fails_startup() {
    let mut config = GatewayConfig::default();
    config.store.redis_url = Some("not a url".to_string());

    assert!(Gateway::build(&config).await.is_err());
}
