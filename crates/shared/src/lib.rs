//! Stockroom Shared Types and Utilities
//!
//! Types, errors, and database helpers shared by the billing core and the API server.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
