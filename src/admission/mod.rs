//! Admission gate
//!
//! Answers one question per request: is it allowed right now, and if so to
//! which healthy instance. The checks always run in the same order:
//!
//! 1. rate limit for the caller's key and tier
//! 2. registry lookup filtered by instance health
//! 3. circuit breaker for the target service
//! 4. instance selection
//!
//! Forwarding happens elsewhere; the forwarder reports the call's outcome
//! back through [`AdmissionGate::record_result`].

use crate::circuit_breaker::CircuitBreakerService;
use crate::error::{GatewayError, Result};
use crate::healthcheck::HealthView;
use crate::loadbalancer::{InstanceSelector, RoundRobinSelector};
use crate::metrics;
use crate::rate_limit::{
    add_rate_limit_headers, rate_limit_headers, rate_limit_response, RateLimitKey,
    RateLimitResult, RateLimiterService, Tier, TierConfig, TierTable,
};
use crate::registry::{ServiceInstance, ServiceRegistry};
use crate::router::{KeyStrategy, Route, Router};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Caller identity as established by the authentication layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Identity {
    #[default]
    Anonymous,
    #[serde(rename_all = "camelCase")]
    User { user_id: String },
    #[serde(rename_all = "camelCase")]
    Consultant {
        consultant_id: String,
        firm_id: String,
    },
    InternalService { service: String },
}

impl Identity {
    /// Rate-limit tier of the caller
    pub fn tier(&self) -> Tier {
        match self {
            Identity::Anonymous => Tier::Unauthenticated,
            Identity::User { .. } => Tier::Authenticated,
            Identity::Consultant { .. } => Tier::Consultant,
            Identity::InternalService { .. } => Tier::InternalService,
        }
    }
}

/// Username of a login attempt, set as a request extension by the login handler's
/// body parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginUsername(pub String);

/// Everything the gate needs to know about a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    #[serde(with = "method_serde")]
    pub method: Method,
    pub path: String,
    pub client_ip: String,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub login_username: Option<String>,
}

mod method_serde {
    use http::Method;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(method.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Method, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Method::from_bytes(raw.to_uppercase().as_bytes()).map_err(D::Error::custom)
    }
}

/// Outcome of admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    RejectRateLimited,
    RejectNoHealthyInstance,
    RejectCircuitOpen,
}

impl Decision {
    /// Stable reason code, shared with error bodies
    pub fn reason_code(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::RejectRateLimited => "rate_limited",
            Decision::RejectNoHealthyInstance => "no_healthy_instance",
            Decision::RejectCircuitOpen => "circuit_open",
        }
    }
}

/// Structured admission result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub decision: Decision,
    pub reason: &'static str,
    pub service: String,
    /// Route pattern that matched
    pub route: String,
    pub instance: Option<ServiceInstance>,
    pub rate_limit: RateLimitResult,
}

impl AdmissionDecision {
    fn new(decision: Decision, route: &Route, rate_limit: RateLimitResult) -> Self {
        Self {
            decision,
            reason: decision.reason_code(),
            service: route.service.clone(),
            route: route.pattern.clone(),
            instance: None,
            rate_limit,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }

    pub fn reason_code(&self) -> &'static str {
        self.decision.reason_code()
    }

    /// Rate limit headers, present on every decision
    pub fn headers(&self) -> HeaderMap {
        rate_limit_headers(&self.rate_limit)
    }
}

impl IntoResponse for AdmissionDecision {
    fn into_response(self) -> Response {
        match self.decision {
            Decision::Allow => (StatusCode::OK, self.headers(), Json(self)).into_response(),
            Decision::RejectRateLimited => rate_limit_response(&self.rate_limit),
            Decision::RejectNoHealthyInstance => {
                let mut response = GatewayError::NoHealthyInstance(self.service.clone()).into_response();
                response.headers_mut().extend(self.headers());
                response
            }
            Decision::RejectCircuitOpen => {
                let mut response = GatewayError::CircuitOpen(self.service.clone()).into_response();
                response.headers_mut().extend(self.headers());
                response
            }
        }
    }
}

/// Admission gate over the limiter, registry, health view and breakers
pub struct AdmissionGate {
    router: Router,
    tiers: TierTable,
    limiter: Arc<RateLimiterService>,
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerService>,
    health: HealthView,
    selector: Arc<dyn InstanceSelector>,
    trusted_proxies: Vec<IpAddr>,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("routes", &self.router.routes())
            .field("selector", &self.selector)
            .finish()
    }
}

impl AdmissionGate {
    /// Create a gate with round-robin selection and no health information
    pub fn new(
        router: Router,
        tiers: TierTable,
        limiter: Arc<RateLimiterService>,
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerService>,
    ) -> Self {
        Self {
            router,
            tiers,
            limiter,
            registry,
            breakers,
            health: HealthView::default(),
            selector: Arc::new(RoundRobinSelector::new()),
            trusted_proxies: Vec::new(),
        }
    }

    /// Read instance health from a checker's view
    pub fn with_health(mut self, health: HealthView) -> Self {
        self.health = health;
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn InstanceSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Peers whose `X-Forwarded-For` header is believed
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }

    /// Client address used for IP-keyed limits
    ///
    /// The socket peer, unless the peer is a trusted proxy. Then the
    /// rightmost `X-Forwarded-For` hop that is not itself a trusted proxy
    /// is used, so a client cannot choose its own key by prepending
    /// entries.
    pub fn client_ip(&self, peer: Option<IpAddr>, headers: &HeaderMap) -> String {
        let Some(peer) = peer else {
            return "unknown".to_string();
        };
        if !self.trusted_proxies.contains(&peer) {
            return peer.to_string();
        }

        let hops: Vec<IpAddr> = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|hop| hop.trim().parse::<IpAddr>())
            .collect::<std::result::Result<_, _>>()
            .unwrap_or_else(|_| {
                debug!(peer = %peer, "Ignoring malformed X-Forwarded-For");
                Vec::new()
            });

        hops.into_iter()
            .rev()
            .find(|hop| !self.trusted_proxies.contains(hop))
            .unwrap_or(peer)
            .to_string()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    fn limits_for(&self, route: &Route, tier: Tier) -> TierConfig {
        match &route.rate_limit {
            Some(limits) => limits.resolve(&self.tiers, tier),
            None => *self.tiers.get(tier),
        }
    }

    fn key_for(&self, route: &Route, request: &AdmissionRequest) -> RateLimitKey {
        let strategy = route.rate_limit.as_ref().map(|l| l.key).unwrap_or_default();
        let tier = request.identity.tier();
        let endpoint = route.pattern.as_str();

        match strategy {
            KeyStrategy::Login => RateLimitKey::login(
                &request.client_ip,
                request.login_username.as_deref().unwrap_or_default(),
            ),
            KeyStrategy::Ip => RateLimitKey::ip(tier, &request.client_ip, endpoint),
            KeyStrategy::Identity => match &request.identity {
                Identity::Anonymous => RateLimitKey::ip(tier, &request.client_ip, endpoint),
                Identity::User { user_id } => RateLimitKey::api(tier, user_id, endpoint),
                Identity::Consultant {
                    consultant_id,
                    firm_id,
                } => RateLimitKey::consultant(tier, consultant_id, firm_id, endpoint),
                Identity::InternalService { service } => RateLimitKey::internal(service, endpoint),
            },
        }
    }

    /// Decide whether a request may proceed and to which instance
    ///
    /// Errors only for requests that match no route or use a method the
    /// route does not allow; every other outcome is a [`Decision`].
    pub async fn admit(&self, request: &AdmissionRequest) -> Result<AdmissionDecision> {
        let started = Instant::now();
        let matched = self.router.match_route(&request.path, &request.method)?;
        let route = matched.route;

        let decision = self.decide(&route, request).await;

        metrics::record_admission_decision(
            &route.pattern,
            decision.reason_code(),
            started.elapsed().as_secs_f64(),
        );
        Ok(decision)
    }

    async fn decide(&self, route: &Route, request: &AdmissionRequest) -> AdmissionDecision {
        let service = route.service.as_str();

        // 1. Rate limit
        let key = self.key_for(route, request);
        let limits = self.limits_for(route, request.identity.tier());
        let rate_limit = self.limiter.allow(&key, &limits).await;
        if !rate_limit.allowed {
            return AdmissionDecision::new(Decision::RejectRateLimited, route, rate_limit);
        }

        // 2. Healthy instances
        let instances = match self.registry.lookup(service).await {
            Ok(instances) => self.health.filter_healthy(instances),
            Err(e) => {
                warn!(service = %service, error = %e, "Registry lookup failed");
                Vec::new()
            }
        };
        if instances.is_empty() {
            warn!(service = %service, route = %route.pattern, "No healthy instance available");
            return AdmissionDecision::new(Decision::RejectNoHealthyInstance, route, rate_limit);
        }

        // 3. Circuit breaker
        if !self.breakers.before_call(service).await {
            return AdmissionDecision::new(Decision::RejectCircuitOpen, route, rate_limit);
        }

        // 4. Selection
        let Some(instance) = self.selector.select(service, &instances) else {
            return AdmissionDecision::new(Decision::RejectNoHealthyInstance, route, rate_limit);
        };

        debug!(
            service = %service,
            instance_id = %instance.instance_id,
            key = %key,
            remaining = rate_limit.remaining,
            "Request admitted"
        );

        let mut decision = AdmissionDecision::new(Decision::Allow, route, rate_limit);
        decision.instance = Some(instance.clone());
        decision
    }

    /// Report the outcome of a forwarded call to the service's breaker
    pub async fn record_result(&self, service: &str, success: bool) {
        self.breakers.record_result(service, success).await;
    }

    /// Report a forwarded call that timed out
    pub async fn record_timeout(&self, service: &str) {
        self.breakers.record_timeout(service).await;
    }
}

/// Instance chosen for an admitted request, available to downstream handlers
#[derive(Debug, Clone)]
pub struct SelectedInstance(pub ServiceInstance);

/// Admission middleware
///
/// Rejections are answered directly. Admitted requests continue with a
/// [`SelectedInstance`] extension; the downstream response status is
/// reported to the breaker (5xx counts as a failure) and the response is
/// stamped with the rate limit headers.
pub async fn admission_middleware(
    State(gate): State<Arc<AdmissionGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let admission = AdmissionRequest {
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        client_ip: gate.client_ip(
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip()),
            request.headers(),
        ),
        identity: request.extensions().get::<Identity>().cloned().unwrap_or_default(),
        login_username: request
            .extensions()
            .get::<LoginUsername>()
            .map(|LoginUsername(name)| name.clone()),
    };

    let decision = match gate.admit(&admission).await {
        Ok(decision) => decision,
        Err(e) => return e.into_response(),
    };

    let Some(instance) = decision.instance.clone().filter(|_| decision.is_allowed()) else {
        return decision.into_response();
    };

    request.extensions_mut().insert(SelectedInstance(instance));
    let mut response = next.run(request).await;

    gate.record_result(&decision.service, !response.status().is_server_error())
        .await;
    add_rate_limit_headers(&mut response, &decision.rate_limit);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::registry::{RegistrationRequest, RegistryConfig};
    use crate::router::{RateLimitOverride, RouteConfig};
    use crate::store::{KeySpace, MemoryStore, SharedStore};
    use std::collections::BTreeMap;

    async fn gate() -> AdmissionGate {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::with_clock(clock));
        let keys = KeySpace::default();

        let registry = Arc::new(ServiceRegistry::new(
            store.clone(),
            keys.clone(),
            RegistryConfig::default(),
        ));
        registry
            .register(RegistrationRequest {
                service_name: "auth".to_string(),
                instance_id: "auth-1".to_string(),
                address: "http://10.0.0.1:8080".to_string(),
                ttl: Some(60),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();

        let router = Router::new(vec![
            RouteConfig {
                path: "/login".to_string(),
                service: "auth".to_string(),
                methods: vec!["POST".to_string()],
                rate_limit: Some(RateLimitOverride {
                    key: KeyStrategy::Login,
                    limit: Some(2),
                    window_ms: Some(300_000),
                    burst: Some(0),
                    ..Default::default()
                }),
                description: String::new(),
            },
            RouteConfig {
                path: "/reports/:id".to_string(),
                service: "reports".to_string(),
                methods: vec![],
                rate_limit: None,
                description: String::new(),
            },
        ])
        .unwrap();

        AdmissionGate::new(
            router,
            TierTable::default(),
            Arc::new(RateLimiterService::new(store.clone(), keys.clone())),
            registry,
            Arc::new(CircuitBreakerService::new(
                store,
                keys,
                CircuitBreakerConfig::default(),
            )),
        )
    }

    fn login(username: &str) -> AdmissionRequest {
        AdmissionRequest {
            method: Method::POST,
            path: "/login".to_string(),
            client_ip: "1.2.3.4".to_string(),
            identity: Identity::Anonymous,
            login_username: Some(username.to_string()),
        }
    }

    #[test]
    fn test_identity_tiers() {
        assert_eq!(Identity::Anonymous.tier(), Tier::Unauthenticated);
        assert_eq!(
            Identity::Consultant {
                consultant_id: "c1".to_string(),
                firm_id: "f1".to_string()
            }
            .tier(),
            Tier::Consultant
        );
    }

    #[test]
    fn test_admission_request_from_json() {
        let request: AdmissionRequest = serde_json::from_str(
            r#"{"method":"get","path":"/reports/1","clientIp":"10.1.1.1",
                "identity":{"type":"user","userId":"u-1"}}"#,
        )
        .unwrap();

        assert_eq!(request.method, Method::GET);
        assert_eq!(
            request.identity,
            Identity::User {
                user_id: "u-1".to_string()
            }
        );
        assert!(request.login_username.is_none());
    }

    #[tokio::test]
    async fn test_login_route_uses_override() {
        let gate = gate().await;

        let first = gate.admit(&login("alice")).await.unwrap();
        assert!(first.is_allowed());
        assert_eq!(first.instance.unwrap().instance_id, "auth-1");
        assert_eq!(first.rate_limit.limit, 2);

        assert!(gate.admit(&login("alice")).await.unwrap().is_allowed());

        let third = gate.admit(&login("alice")).await.unwrap();
        assert_eq!(third.decision, Decision::RejectRateLimited);
        assert_eq!(third.reason_code(), "rate_limited");
        assert!(third.instance.is_none());

        // Another username from the same IP has its own window
        assert!(gate.admit(&login("bob")).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_unregistered_service_has_no_instance() {
        let gate = gate().await;
        let request = AdmissionRequest {
            method: Method::GET,
            path: "/reports/7".to_string(),
            client_ip: "1.2.3.4".to_string(),
            identity: Identity::User {
                user_id: "u-1".to_string(),
            },
            login_username: None,
        };

        let decision = gate.admit(&request).await.unwrap();
        assert_eq!(decision.decision, Decision::RejectNoHealthyInstance);
        assert_eq!(decision.service, "reports");
        assert_eq!(decision.route, "/reports/:id");

        let response = decision.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_an_error() {
        let gate = gate().await;
        let mut request = login("alice");
        request.path = "/nowhere".to_string();

        assert!(matches!(
            gate.admit(&request).await,
            Err(GatewayError::RouteNotFound(_))
        ));
    }

    fn forwarded(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", value.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_client_ip_ignores_forwarded_for_from_untrusted_peer() {
        let gate = gate().await;
        let peer: IpAddr = "198.51.100.4".parse().unwrap();

        assert_eq!(gate.client_ip(Some(peer), &forwarded("203.0.113.7")), "198.51.100.4");
        assert_eq!(gate.client_ip(None, &forwarded("203.0.113.7")), "unknown");
    }

    #[tokio::test]
    async fn test_client_ip_through_trusted_proxies() {
        let proxy: IpAddr = "10.0.0.2".parse().unwrap();
        let gate = gate()
            .await
            .with_trusted_proxies(vec![proxy, "10.0.0.3".parse().unwrap()]);

        // Entries prepended by the client are skipped
        assert_eq!(
            gate.client_ip(Some(proxy), &forwarded("6.6.6.6, 203.0.113.7, 10.0.0.3")),
            "203.0.113.7"
        );
        assert_eq!(gate.client_ip(Some(proxy), &HeaderMap::new()), "10.0.0.2");
        assert_eq!(gate.client_ip(Some(proxy), &forwarded("not-an-ip")), "10.0.0.2");
    }
}
