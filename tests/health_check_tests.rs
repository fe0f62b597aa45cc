use admission_gate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerService, CircuitState};
use admission_gate::healthcheck::{
    HealthCheckConfig, HealthCheckSettings, HealthChecker, ProbeStrategy,
};
use admission_gate::registry::{RegistrationRequest, RegistryConfig, ServiceRegistry};
use admission_gate::store::{KeySpace, MemoryStore, SharedStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn backend(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn settings(threshold: u32) -> HealthCheckSettings {
    let mut services = HashMap::new();
    services.insert(
        "inventory".to_string(),
        HealthCheckConfig {
            timeout_ms: 200,
            failure_threshold: threshold,
            strategy: ProbeStrategy::Http {
                path: "/healthz".to_string(),
            },
            ..Default::default()
        },
    );

    HealthCheckSettings {
        services,
        ..Default::default()
    }
}

async fn setup(threshold: u32) -> (Arc<ServiceRegistry>, Arc<CircuitBreakerService>, HealthChecker) {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(ServiceRegistry::new(
        store.clone(),
        KeySpace::new("test"),
        RegistryConfig::default(),
    ));
    let breakers = Arc::new(CircuitBreakerService::new(
        store,
        KeySpace::new("test"),
        CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        },
    ));
    let checker = HealthChecker::new(settings(threshold), registry.clone(), breakers.clone()).unwrap();
    (registry, breakers, checker)
}

async fn register(registry: &ServiceRegistry, id: &str, address: String) {
    registry
        .register(RegistrationRequest {
            service_name: "inventory".to_string(),
            instance_id: id.to_string(),
            address,
            ttl: Some(60),
            metadata: BTreeMap::new(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_http_probe_marks_failing_instance_unhealthy() {
    let healthy = backend(200).await;
    let failing = backend(503).await;
    let (registry, breakers, checker) = setup(2).await;

    register(&registry, "inventory-1", healthy.uri()).await;
    register(&registry, "inventory-2", failing.uri()).await;

    let statuses = checker.check_service("inventory").await;
    assert_eq!(statuses.len(), 2);

    let view = checker.view();
    assert!(view.is_healthy("inventory-1"));
    assert!(view.is_healthy("inventory-2"), "one failure is below the threshold");
    assert_eq!(view.status("inventory-2").unwrap().consecutive_failures, 1);

    checker.check_service("inventory").await;
    assert!(view.is_healthy("inventory-1"));
    assert!(!view.is_healthy("inventory-2"));

    let routable = view.filter_healthy(registry.lookup("inventory").await.unwrap());
    assert_eq!(routable.len(), 1);
    assert_eq!(routable[0].instance_id, "inventory-1");

    // The unhealthy transition is a breaker failure signal
    assert_eq!(breakers.state("inventory").await, CircuitState::Open);
}

#[tokio::test]
async fn test_slow_health_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let (registry, _breakers, checker) = setup(1).await;
    register(&registry, "inventory-1", server.uri()).await;

    let status = checker.check_service("inventory").await.remove(0);
    assert!(!status.healthy);
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.last_checked_at > 0);
}

#[tokio::test]
async fn test_unreachable_instance_is_unhealthy() {
    let (registry, _breakers, checker) = setup(1).await;

    // Nothing listens on port 1
    register(&registry, "inventory-1", "http://127.0.0.1:1".to_string()).await;

    let status = checker.check_service("inventory").await.remove(0);
    assert!(!status.healthy);
}

#[tokio::test]
async fn test_supervisor_probes_registered_services() {
    let failing = backend(500).await;
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(ServiceRegistry::new(
        store.clone(),
        KeySpace::new("test"),
        RegistryConfig::default(),
    ));
    let breakers = Arc::new(CircuitBreakerService::new(
        store,
        KeySpace::new("test"),
        CircuitBreakerConfig::default(),
    ));

    let mut settings = settings(1);
    settings.discovery_interval_ms = 20;
    if let Some(config) = settings.services.get_mut("inventory") {
        config.interval_ms = 20;
    }

    register(&registry, "inventory-1", failing.uri()).await;

    let checker = Arc::new(HealthChecker::new(settings, registry, breakers).unwrap());
    let view = checker.view();
    let handle = checker.spawn();

    let mut marked = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if !view.is_healthy("inventory-1") {
            marked = true;
            break;
        }
    }
    handle.abort();

    assert!(marked, "background checks should mark the instance unhealthy");
}
