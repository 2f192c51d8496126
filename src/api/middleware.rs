//! HTTP middleware for the reward API
//!
//! Provides:
//! - Per-requester throttling of reward grants
//! - Security headers

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Header carrying the authenticated actor, set by the web tier
pub const REQUESTER_HEADER: &str = "userid";

/// Fixed-window counter keyed by requester
#[derive(Debug)]
pub struct RequesterThrottle {
    /// requester -> (grants in window, window start)
    requests: DashMap<String, (u32, Instant)>,
    limit: u32,
    window: Duration,
}

impl RequesterThrottle {
    pub fn new(requests_per_minute: u32) -> Self {
        Self::with_window(requests_per_minute, Duration::from_secs(60))
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            requests: DashMap::new(),
            limit,
            window,
        }
    }

    /// Count a request. Returns (allowed, remaining, reset_after_secs)
    pub fn check_request(&self, key: &str) -> (bool, u32, u64) {
        let now = Instant::now();

        let mut entry = self.requests.entry(key.to_string()).or_insert((0, now));
        let (count, window_start) = entry.value_mut();

        if now.duration_since(*window_start) >= self.window {
            *count = 0;
            *window_start = now;
        }

        let reset_after = self
            .window
            .checked_sub(now.duration_since(*window_start))
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if *count >= self.limit {
            return (false, 0, reset_after);
        }

        *count += 1;
        (true, self.limit - *count, reset_after)
    }

    /// Drop windows that ended long ago
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.requests.len();
        self.requests
            .retain(|_, (_, window_start)| now.duration_since(*window_start) < self.window * 2);
        before - self.requests.len()
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[derive(Clone)]
pub struct ThrottleState {
    pub throttle: Arc<RequesterThrottle>,
}

impl ThrottleState {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            throttle: Arc::new(RequesterThrottle::new(requests_per_minute)),
        }
    }
}

/// Throttle key: the requester header, else the client address
fn throttle_key(headers: &HeaderMap, addr: Option<&SocketAddr>) -> String {
    if let Some(requester) = headers
        .get(REQUESTER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return format!("user:{}", requester);
    }

    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return format!("ip:{}", ip.trim());
    }

    addr.map(|a| format!("ip:{}", a.ip()))
        .unwrap_or_else(|| "ip:unknown".to_string())
}

/// Reject grant requests over the per-requester limit with 429
pub async fn throttle_middleware(
    State(state): State<ThrottleState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = throttle_key(&headers, addr.as_ref());
    let (allowed, remaining, reset_after) = state.throttle.check_request(&key);

    if !allowed {
        warn!(key = %key, path = %request.uri().path(), "Reward rate limit exceeded");

        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({
                "message": "Too many reward requests",
                "code": "rate_limited",
            })),
        )
            .into_response();
        let headers = response.headers_mut();
        headers.insert("X-RateLimit-Limit", HeaderValue::from(state.throttle.limit()));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
        headers.insert("Retry-After", HeaderValue::from(reset_after));
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(state.throttle.limit()));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
    response
}

/// Security headers middleware
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    // Balances and transfer states go stale immediately
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    headers.remove("Server");

    response
}
