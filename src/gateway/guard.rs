//! Identity resolution and per-identity rate limiting.

use crate::config::GatewayConfig;
use axum::http::{HeaderMap, Method, header};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;

/// Request identity, derived from a bearer token (cloud) or the caller's
/// address (local). Used as the rate-limit bucket key.
#[derive(Debug, Clone)]
pub struct Identity(pub String);

pub struct ApiGuard {
    limiter: RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>,
    tokens: Vec<String>,
}

impl ApiGuard {
    pub fn new(config: &GatewayConfig) -> Self {
        let per_minute =
            NonZeroU32::new(config.rate_limit_per_minute.max(1)).expect("nonzero rate limit");
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
            tokens: config.auth_tokens.clone(),
        }
    }

    /// Routes exempt from auth and rate limiting.
    pub fn is_public(method: &Method, path: &str) -> bool {
        path == "/health"
            || (*method == Method::GET && matches!(path, "/mcp" | "/events/stream"))
    }

    /// Resolve the caller's identity. `None` means unauthorized (tokens are
    /// configured and the request carries none of them).
    pub fn identity(&self, headers: &HeaderMap) -> Option<Identity> {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        if self.tokens.is_empty() {
            // Local mode: key buckets by forwarded address when present.
            let key = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map_or_else(|| "local:shared".to_string(), |ip| format!("ip:{ip}"));
            return Some(Identity(key));
        }

        let token = bearer?;
        if !self.tokens.iter().any(|t| t == token) {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Some(Identity(format!("user:{}", &digest[..8])))
    }

    /// Token-bucket check for one request.
    pub fn check_rate(&self, identity: &Identity) -> Result<(), ()> {
        self.limiter.check_key(&identity.0).map_err(|_| ())
    }
}
