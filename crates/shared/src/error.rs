//! Error types for Stockroom

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharedError {
    #[error("Invalid subscription status: {0}")]
    InvalidStatus(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),
}
