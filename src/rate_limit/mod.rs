//! Rate limiting module
//!
//! Sliding-window rate limiting over the shared store, with tiered limits and
//! composite keys:
//!
//! - **Tiers**: unauthenticated, authenticated, consultant and internal
//!   service, each with `limit`, `window_ms` and `burst`
//! - **Composite keys**: `(ip, username)` for logins, `(user, endpoint)` for
//!   API calls, `(consultant, firm, endpoint)` for multi-firm access
//! - **Degraded mode**: the per-instance window takes over while the shared
//!   store is unreachable, so limits stay enforced
//! - Rate limit headers in responses (`X-RateLimit-*`)
//!
//! # Example
//!
//! ```rust,no_run
//! use admission_gate::rate_limit::{RateLimitKey, RateLimiterService, TierConfig};
//! use admission_gate::store::KeySpace;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiterService::local_only(KeySpace::default());
//!     let login = TierConfig::new(5, 300_000, 0);
//!
//!     let result = limiter
//!         .allow(&RateLimitKey::login("1.2.3.4", "alice"), &login)
//!         .await;
//!     assert!(result.allowed);
//! }
//! ```

pub mod middleware;
pub mod service;
pub mod tiers;
pub mod types;

// Re-export commonly used types
pub use middleware::{add_rate_limit_headers, rate_limit_headers, rate_limit_response};
pub use service::RateLimiterService;
pub use tiers::{Tier, TierConfig, TierTable};
pub use types::{RateLimitKey, RateLimitResult};
