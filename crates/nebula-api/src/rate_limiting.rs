//! Rate limiting middleware for the NebulaDB data API
//!
//! Sliding-window-log admission control keyed by caller identity:
//! - Authenticated requests are keyed by principal (`user:{id}`)
//! - Anonymous requests are keyed by client IP (`ip:{addr}`)
//! - Trusted proxy support (X-Forwarded-For / X-Real-IP extraction)
//! - 429 responses carry `limit`, `window`, and `retry_after`
//!
//! ## Configuration
//!
//! - `NEBULA_RATE_LIMIT`: Requests allowed per window (default: 100)
//! - `NEBULA_RATE_LIMIT_WINDOW_SECS`: Window length in seconds (default: 60)
//! - `NEBULA_TRUSTED_PROXIES`: Comma-separated list of trusted proxy IPs (optional, IPv4/IPv6)
//! - `NEBULA_RATE_LIMIT_MAX_KEYS`: Key count that triggers idle-window cleanup at half (default: 10000)
//!
//! ## Algorithm
//!
//! Each key keeps the timestamps of its admitted requests. On every check,
//! timestamps older than the window are pruned; the request is admitted only
//! if fewer than `limit` remain. A key never holds more than `limit` entries.

use crate::api_keys::Principal;
use crate::error::ApiError;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use nebuladb_core::{NebulaError, Result};
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Requests allowed per window
pub const DEFAULT_LIMIT: u32 = 100;

/// Default window in seconds
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Default key cardinality bound
pub const DEFAULT_MAX_KEYS: usize = 10_000;

/// Configuration for rate limiting
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_secs: u64,
    pub trusted_proxies: Option<Vec<String>>,
    pub max_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window_secs: DEFAULT_WINDOW_SECS,
            trusted_proxies: None,
            max_keys: DEFAULT_MAX_KEYS,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        Self {
            limit: std::env::var("NEBULA_RATE_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_LIMIT),
            window_secs: std::env::var("NEBULA_RATE_LIMIT_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_WINDOW_SECS),
            trusted_proxies: std::env::var("NEBULA_TRUSTED_PROXIES").ok().map(|s| {
                s.split(',')
                    .map(|ip| ip.trim().to_string())
                    .filter(|ip| !ip.is_empty())
                    .collect()
            }),
            max_keys: std::env::var("NEBULA_RATE_LIMIT_MAX_KEYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_KEYS),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(NebulaError::ValidationError(
                "rate limit must be at least 1".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(NebulaError::ValidationError(
                "rate limit window must be positive".to_string(),
            ));
        }
        if self.max_keys < 2 {
            return Err(NebulaError::ValidationError(
                "rate limit max_keys must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Admitted-request log for one key
#[derive(Debug)]
struct RateWindow {
    hits: VecDeque<Instant>,
    last_accessed: Instant,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        remaining: u32,
    },
    Limited {
        limit: u32,
        window_secs: u64,
        retry_after_secs: u64,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Shared rate limiter state
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    windows: Arc<DashMap<String, RateWindow>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("tracked_keys", &self.windows.len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Arc::new(config),
            windows: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Admission check for `key` at the current time.
    pub fn allow(&self, key: &str) -> RateDecision {
        self.allow_at(key, Instant::now())
    }

    /// Admission check for `key` at `now`.
    pub fn allow_at(&self, key: &str, now: Instant) -> RateDecision {
        let cleanup_threshold = self.config.max_keys / 2;
        if self.windows.len() > cleanup_threshold {
            debug!(
                key_count = self.windows.len(),
                threshold = cleanup_threshold,
                "Rate limit key threshold reached, cleaning up"
            );
            self.cleanup_idle_windows(now);
        }

        let window = self.config.window();
        let limit = self.config.limit;

        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, "Creating rate window");
            RateWindow {
                hits: VecDeque::with_capacity(limit.min(64) as usize),
                last_accessed: now,
            }
        });
        entry.last_accessed = now;

        while let Some(oldest) = entry.hits.front() {
            if now.saturating_duration_since(*oldest) >= window {
                entry.hits.pop_front();
            } else {
                break;
            }
        }

        let used = entry.hits.len() as u32;
        if used < limit {
            entry.hits.push_back(now);
            debug!(key = %key, used = used + 1, limit = limit, "Request allowed");
            return RateDecision::Allowed {
                remaining: limit - used - 1,
            };
        }

        let retry_after_secs = entry
            .hits
            .front()
            .map(|oldest| {
                let elapsed = now.saturating_duration_since(*oldest);
                let wait = window.saturating_sub(elapsed);
                wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
            })
            .unwrap_or(self.config.window_secs);

        warn!(
            key = %key,
            limit = limit,
            retry_after = retry_after_secs,
            "Rate limit exceeded"
        );
        RateDecision::Limited {
            limit,
            window_secs: self.config.window_secs,
            retry_after_secs,
        }
    }

    /// Drop windows whose every entry has expired.
    fn cleanup_idle_windows(&self, now: Instant) {
        let window = self.config.window();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.last_accessed) < window);
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            debug!(
                evicted = evicted,
                remaining = self.windows.len(),
                "Cleaned up idle rate windows"
            );
        }
    }

    fn extract_client_ip<B>(&self, req: &axum::http::Request<B>) -> Option<String> {
        let peer_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip());

        if let (Some(trusted_proxies), Some(peer_ip)) = (&self.config.trusted_proxies, peer_addr) {
            let peer_ip_str = peer_ip.to_string();
            if trusted_proxies.contains(&peer_ip_str) {
                let forwarded = req
                    .headers()
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.split(',').next())
                    .map(|ip| ip.trim().to_string())
                    .filter(|ip| !ip.is_empty());
                if let Some(client_ip) = forwarded {
                    debug!(client_ip = %client_ip, peer_ip = %peer_ip_str, "Extracted IP from X-Forwarded-For");
                    return Some(client_ip);
                }

                if let Some(real_ip) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
                    debug!(client_ip = %real_ip, peer_ip = %peer_ip_str, "Extracted IP from X-Real-IP");
                    return Some(real_ip.trim().to_string());
                }
            } else {
                debug!(peer_ip = %peer_ip_str, "Peer is not a trusted proxy, ignoring forwarded headers");
            }
        }

        peer_addr.map(|ip| ip.to_string())
    }

    /// Key for a request: the authenticated principal, else the client address.
    pub fn rate_limit_key<B>(&self, req: &axum::http::Request<B>) -> String {
        if let Some(principal) = req.extensions().get::<Principal>() {
            return format!("user:{}", principal.user_id);
        }
        self.client_key(req)
    }

    /// Key for the client address alone, ignoring any identity.
    pub fn client_key<B>(&self, req: &axum::http::Request<B>) -> String {
        match self.extract_client_ip(req) {
            Some(ip) => format!("ip:{}", ip),
            None => {
                warn!("Could not determine rate limit key, using 'unknown'");
                "ip:unknown".to_string()
            }
        }
    }
}

/// Rate limiting middleware
///
/// Install with `axum::middleware::from_fn_with_state(limiter, rate_limit_middleware)`
/// inside the identity layer so authenticated callers are keyed by principal.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Response {
    let key = limiter.rate_limit_key(&req);
    match limiter.allow(&key) {
        RateDecision::Allowed { .. } => next.run(req).await,
        RateDecision::Limited {
            limit,
            window_secs,
            retry_after_secs,
        } => ApiError::from(NebulaError::RateLimited {
            limit,
            window_secs,
            retry_after_secs,
        })
        .into_response(),
    }
}
