//! Billing routes for Stripe integration

use std::collections::BTreeMap;

use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use stockroom_billing::{feature_access, SubscriptionSnapshot};
use stockroom_shared::{Plan, UserRecord};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Request to create a checkout session
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    /// `starter` or `premium`
    pub price_type: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
pub struct ReactivateResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct FeaturesResponse {
    pub plan: Option<Plan>,
    pub features: BTreeMap<&'static str, bool>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

async fn load_user(state: &AppState, user_id: Uuid) -> ApiResult<UserRecord> {
    state
        .users
        .find_by_id(user_id)
        .await?
        .ok_or(ApiError::NotFound)
}

/// Create a checkout session for a subscription
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let plan: Plan = req
        .price_type
        .parse()
        .map_err(|_| ApiError::Validation(format!("Unknown price type: {}", req.price_type)))?;

    let user = load_user(&state, auth_user.user_id).await?;
    let url = billing.checkout.start_checkout(&user, plan).await?;

    Ok(Json(CheckoutResponse { url }))
}

/// Current entitlement snapshot for the caller
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionSnapshot>> {
    let user = load_user(&state, auth_user.user_id).await?;
    Ok(Json(SubscriptionSnapshot::build(
        &user.subscription,
        OffsetDateTime::now_utc(),
    )))
}

/// Per-feature access for the caller
pub async fn get_features(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<FeaturesResponse>> {
    let user = load_user(&state, auth_user.user_id).await?;
    Ok(Json(FeaturesResponse {
        plan: user.subscription.plan,
        features: feature_access(&user.subscription, OffsetDateTime::now_utc()),
    }))
}

/// Cancel the caller's subscription (immediately during a trial, else at period end)
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CancelResponse>> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let user = load_user(&state, auth_user.user_id).await?;
    let outcome = billing.subscriptions.cancel(&user).await?;

    let message = if outcome.canceled_immediately {
        "Your trial has been canceled and access has ended."
    } else {
        "Your subscription will end at the close of the current billing period."
    };

    Ok(Json(CancelResponse {
        success: true,
        message: message.to_string(),
        cancel_at: outcome.cancel_at,
    }))
}

/// Undo a pending period-end cancellation
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<ReactivateResponse>> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let user = load_user(&state, auth_user.user_id).await?;
    billing.subscriptions.reactivate(&user).await?;

    Ok(Json(ReactivateResponse {
        success: true,
        message: "Your subscription has been reactivated.".to_string(),
    }))
}

/// Handle Stripe webhooks
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    tracing::debug!(body_len = body.len(), "Stripe webhook received");

    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook rejected");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    // Failures here answer 5xx so Stripe redelivers
    billing.webhooks.handle_event(&event).await.map_err(|e| {
        tracing::error!(
            event_id = %event.id,
            event_type = %event.kind,
            error = %e,
            "Webhook handling failed"
        );
        ApiError::from(e)
    })?;

    Ok(Json(WebhookAck { received: true }))
}
