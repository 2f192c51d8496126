//! HTTP API for reward issuance
//!
//! - Reward endpoints (grant, balance, transfer status, stats)
//! - Middleware (per-requester throttle, security headers)

pub mod middleware;
pub mod reward;

pub use middleware::{
    REQUESTER_HEADER, RequesterThrottle, ThrottleState, security_headers_middleware,
    throttle_middleware,
};
pub use reward::{RewardApiState, create_router};
