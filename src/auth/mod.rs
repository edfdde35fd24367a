// src/auth/mod.rs

pub mod middleware;
pub mod operator;
pub mod rate_limit;

pub use middleware::{auth_middleware, require_operator, AuthContext, AuthState, ToggleState};
pub use operator::{OperatorAuthManager, SESSION_COOKIE};
pub use rate_limit::{RateLimiter, RateLimiterConfig};
