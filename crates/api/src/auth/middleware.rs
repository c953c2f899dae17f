//! Request authentication and plan gating

use std::sync::Arc;

use axum::{
    extract::{Extension, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use stockroom_billing::{can_access, Feature, UserStore};
use stockroom_shared::Plan;
use time::OffsetDateTime;
use uuid::Uuid;

use super::jwt::{JwtError, JwtManager};
use crate::error::ApiError;

/// Authenticated caller, inserted as a request extension by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Clone)]
pub struct AuthState {
    pub jwt: JwtManager,
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Reject requests without a valid bearer token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request).ok_or(ApiError::Unauthorized)?;

    let claims = auth_state.jwt.validate_token(token).map_err(|e| {
        match &e {
            JwtError::Expired => tracing::debug!("Rejected expired token"),
            _ => tracing::warn!(error = %e, "Rejected invalid token"),
        }
        ApiError::InvalidToken
    })?;

    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        email: claims.email,
    });

    Ok(next.run(request).await)
}

/// State for [`require_plan`]: the store to read the caller's subscription
/// from and the plan the wrapped routes need.
#[derive(Clone)]
pub struct PlanGate {
    users: Arc<dyn UserStore>,
    required: Plan,
}

impl PlanGate {
    pub fn new(users: Arc<dyn UserStore>, required: Plan) -> Self {
        Self { users, required }
    }

    pub fn for_feature(users: Arc<dyn UserStore>, feature: Feature) -> Self {
        Self::new(users, feature.required_plan())
    }
}

/// Only let callers whose subscription grants `gate.required` through.
///
/// Must run inside [`require_auth`].
pub async fn require_plan(
    State(gate): State<PlanGate>,
    Extension(auth_user): Extension<AuthUser>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = gate
        .users
        .find_by_id(auth_user.user_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    if !can_access(&user.subscription, gate.required, OffsetDateTime::now_utc()) {
        tracing::debug!(
            user_id = %auth_user.user_id,
            required_plan = %gate.required,
            "Plan gate denied request"
        );
        return Err(ApiError::SubscriptionRequired);
    }

    Ok(next.run(request).await)
}
