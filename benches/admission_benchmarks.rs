use admission_gate::admission::{AdmissionGate, AdmissionRequest, Identity};
use admission_gate::circuit_breaker::{
    transition, BreakerEvent, BreakerState, CircuitBreakerConfig, CircuitBreakerService,
};
use admission_gate::config::GatewayConfig;
use admission_gate::rate_limit::{RateLimitKey, RateLimiterService, Tier, TierConfig, TierTable};
use admission_gate::registry::{RegistrationRequest, RegistryConfig, ServiceRegistry};
use admission_gate::router::{RouteConfig, Router};
use admission_gate::store::{KeySpace, MemoryStore, SharedStore};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::Method;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn route(path: &str, service: &str) -> RouteConfig {
    RouteConfig {
        path: path.to_string(),
        service: service.to_string(),
        methods: vec![],
        rate_limit: None,
        description: String::new(),
    }
}

fn benchmark_router_param_match(c: &mut Criterion) {
    let router = Router::new(vec![
        route("/api/users/:id", "users"),
        route("/api/orders/:id/items/:item", "orders"),
    ])
    .expect("Failed to create router");

    c.bench_function("router_param_match", |b| {
        b.iter(|| black_box(router.match_route("/api/orders/42/items/7", &Method::GET)))
    });
}

fn benchmark_router_scale(c: &mut Criterion) {
    let mut group = c.benchmark_group("router_scale");

    for num_routes in [10, 50, 100, 500].iter() {
        let routes = (0..*num_routes)
            .map(|i| route(&format!("/api/service{}", i), &format!("service{}", i)))
            .collect();
        let router = Router::new(routes).expect("Failed to create router");

        group.bench_with_input(
            BenchmarkId::from_parameter(num_routes),
            num_routes,
            |b, &_num| b.iter(|| black_box(router.match_route("/api/service5", &Method::GET))),
        );
    }
    group.finish();
}

fn benchmark_key_construction(c: &mut Criterion) {
    c.bench_function("rate_limit_key_consultant", |b| {
        b.iter(|| {
            black_box(RateLimitKey::consultant(
                Tier::Consultant,
                black_box("c-1001"),
                black_box("firm:acme"),
                "/api/firms/:firm/reports",
            ))
        })
    });
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create runtime");
    let limiter = RateLimiterService::local_only(KeySpace::default());
    let tier = TierConfig::new(1_000_000, 60_000, 0);
    let key = RateLimitKey::api(Tier::Authenticated, "u-1", "/api/orders/:id");

    c.bench_function("rate_limiter_allow_local", |b| {
        b.to_async(&rt).iter(|| async { black_box(limiter.allow(&key, &tier).await) })
    });
}

fn benchmark_breaker_transition(c: &mut Criterion) {
    let config = CircuitBreakerConfig::default();
    let state = BreakerState::default();

    c.bench_function("breaker_transition", |b| {
        b.iter(|| {
            black_box(transition(
                black_box(&state),
                BreakerEvent::CallFailed,
                1_700_000_000_000,
                &config,
            ))
        })
    });
}

fn benchmark_admit(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create runtime");

    let gate = rt.block_on(async {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let keys = KeySpace::default();
        let registry = Arc::new(ServiceRegistry::new(
            store.clone(),
            keys.clone(),
            RegistryConfig {
                max_ttl_secs: 3_600,
                ..Default::default()
            },
        ));
        for i in 0..4 {
            registry
                .register(RegistrationRequest {
                    service_name: "orders".to_string(),
                    instance_id: format!("orders-{}", i),
                    address: format!("http://10.0.0.{}:8080", i + 1),
                    ttl: Some(3_600),
                    metadata: BTreeMap::new(),
                })
                .await
                .expect("Failed to register instance");
        }

        AdmissionGate::new(
            Router::new(vec![route("/api/orders/:id", "orders")]).expect("Failed to create router"),
            TierTable::default(),
            Arc::new(RateLimiterService::new(store.clone(), keys.clone())),
            registry,
            Arc::new(CircuitBreakerService::new(
                store,
                keys,
                CircuitBreakerConfig::default(),
            )),
        )
    });

    // Internal callers have the largest window
    let request = AdmissionRequest {
        method: Method::GET,
        path: "/api/orders/17".to_string(),
        client_ip: "10.1.1.1".to_string(),
        identity: Identity::InternalService {
            service: "billing".to_string(),
        },
        login_username: None,
    };

    c.bench_function("admission_gate_admit", |b| {
        b.to_async(&rt).iter(|| async { black_box(gate.admit(&request).await) })
    });
}

fn benchmark_config_parsing(c: &mut Criterion) {
    let yaml = r#"
server:
  host: "0.0.0.0"
  port: 8080

routes:
  - path: "/auth/login"
    service: "auth"
    methods: ["POST"]
    rate_limit: { key: login, limit: 5, window_ms: 300000, burst: 0 }
  - path: "/api/orders/:id"
    service: "orders"
"#;

    c.bench_function("config_parsing", |b| {
        b.iter(|| black_box(GatewayConfig::from_yaml(yaml)))
    });
}

criterion_group!(
    benches,
    benchmark_router_param_match,
    benchmark_router_scale,
    benchmark_key_construction,
    benchmark_rate_limiter,
    benchmark_breaker_transition,
    benchmark_admit,
    benchmark_config_parsing
);
criterion_main!(benches);
