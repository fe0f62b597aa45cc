use crate::error::{GatewayError, Result};
use crate::rate_limit::{Tier, TierConfig, TierTable};
use crate::registry::validate_service_name;
use http::Method;
use matchit::Router as MatchitRouter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Which request attributes a route's rate-limit key is built from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// The caller's identity: user, consultant+firm, internal service, or IP
    #[default]
    Identity,
    /// `(ip, username)` for login endpoints
    Login,
    /// Client IP only, whoever the caller is
    Ip,
}

/// Per-route rate limit override
///
/// Starts from the named tier (or the caller's tier) and replaces any of
/// `limit`, `window_ms` and `burst` that are given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitOverride {
    #[serde(default)]
    pub key: KeyStrategy,
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub burst: Option<u64>,
}

impl RateLimitOverride {
    /// Effective limits for a caller in `caller_tier`
    pub fn resolve(&self, tiers: &TierTable, caller_tier: Tier) -> TierConfig {
        let base = *tiers.get(self.tier.unwrap_or(caller_tier));
        TierConfig {
            limit: self.limit.unwrap_or(base.limit),
            window_ms: self.window_ms.unwrap_or(base.window_ms),
            burst: self.burst.unwrap_or(base.burst),
        }
    }
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    /// Path pattern (`/orders/:id`, `/files/*rest`)
    pub path: String,
    /// Registered service that serves the route
    pub service: String,
    /// Allowed HTTP methods (empty means all)
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitOverride>,
    #[serde(default)]
    pub description: String,
}

/// Route information
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Configured pattern, also the route class in rate-limit keys
    pub pattern: String,
    /// Target service
    pub service: String,
    /// Allowed HTTP methods (empty means all methods allowed)
    pub methods: Vec<Method>,
    pub rate_limit: Option<RateLimitOverride>,
}

/// Matches inbound paths to target services
#[derive(Debug, Clone)]
pub struct Router {
    /// Path-based router using matchit
    matcher: MatchitRouter<Arc<Route>>,
    patterns: Vec<String>,
}

impl Router {
    /// Create a new router from route configurations
    pub fn new(routes: Vec<RouteConfig>) -> Result<Self> {
        let mut matcher = MatchitRouter::new();
        let mut patterns = Vec::with_capacity(routes.len());

        for route_config in routes {
            validate_service_name(&route_config.service).map_err(|_| {
                GatewayError::InvalidRoute(format!(
                    "route {} targets invalid service '{}'",
                    route_config.path, route_config.service
                ))
            })?;

            if let Some(limits) = &route_config.rate_limit {
                if limits.limit == Some(0) || limits.window_ms == Some(0) {
                    return Err(GatewayError::InvalidRoute(format!(
                        "route {} has a zero rate limit or window",
                        route_config.path
                    )));
                }
            }

            let methods = route_config
                .methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_uppercase().as_bytes())
                        .map_err(|_| GatewayError::InvalidMethod(m.clone()))
                })
                .collect::<Result<Vec<_>>>()?;

            // Convert path syntax from :param to {param} and *path to {*path}
            let matchit_path = convert_path_syntax(&route_config.path);

            let route = Route {
                pattern: route_config.path.clone(),
                service: route_config.service,
                methods,
                rate_limit: route_config.rate_limit,
            };

            matcher
                .insert(&matchit_path, Arc::new(route))
                .map_err(|e| GatewayError::InvalidRoute(format!("Failed to insert route: {}", e)))?;
            patterns.push(route_config.path);
        }

        Ok(Self { matcher, patterns })
    }

    /// Match a request path and method to a route
    pub fn match_route(&self, path: &str, method: &Method) -> Result<RouteMatch> {
        let matched = self
            .matcher
            .at(path)
            .map_err(|_| GatewayError::RouteNotFound(path.to_string()))?;

        let route = matched.value;

        if !route.methods.is_empty() && !route.methods.contains(method) {
            return Err(GatewayError::InvalidMethod(format!(
                "Method {} not allowed for path {}",
                method, path
            )));
        }

        let params: HashMap<String, String> = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Ok(RouteMatch {
            route: route.clone(),
            params,
        })
    }

    /// Configured route patterns, in configuration order
    pub fn routes(&self) -> &[String] {
        &self.patterns
    }
}

/// Result of matching a route
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    /// Path parameters extracted from the URL
    pub params: HashMap<String, String>,
}

/// Convert path syntax from Express-style (:param, *path) to matchit syntax ({param}, {*path})
fn convert_path_syntax(path: &str) -> String {
    let mut result = String::with_capacity(path.len() + 4);
    let mut chars = path.chars().peekable();

    while let Some(ch) = chars.next() {
        let wildcard = match ch {
            ':' => false,
            '*' => true,
            _ => {
                result.push(ch);
                continue;
            }
        };

        result.push_str(if wildcard { "{*" } else { "{" });
        while let Some(next) = chars.next_if(|c| c.is_alphanumeric() || *c == '_') {
            result.push(next);
        }
        result.push('}');
    }

    result
}
