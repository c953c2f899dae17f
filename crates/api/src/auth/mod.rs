//! Authentication module for Stockroom

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{require_auth, require_plan, AuthState, AuthUser, PlanGate};
