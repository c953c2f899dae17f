//! Stockroom API Library
//!
//! HTTP surface for Stockroom billing: JWT auth, plan gating and the
//! checkout, subscription and webhook routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
