//! Billing provider seam
//!
//! Everything the reconciler, checkout and cancel/reactivate flows need from
//! the payment provider goes through [`BillingProvider`]. The Stripe-backed
//! implementation maps SDK objects into [`ProviderSubscription`] so the rest of
//! the crate never touches `stripe::` types directly.

use std::collections::HashMap;

use async_trait::async_trait;
use stockroom_shared::{Plan, SubscriptionStatus};
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, CreateCustomer,
    Customer, CustomerId, Expandable, RequestStrategy, StripeError, Subscription, SubscriptionId,
    UpdateSubscription,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Live view of a provider subscription, normalised at the boundary
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    /// Unit amount of the first price, in cents
    pub unit_amount: Option<i64>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub metadata: HashMap<String, String>,
}

impl ProviderSubscription {
    /// Any cancellation signal the provider reports, scheduled or effective
    pub fn has_cancellation_signal(&self) -> bool {
        self.cancel_at_period_end || self.cancel_at.is_some() || self.canceled_at.is_some()
    }
}

/// Parameters for a subscription-mode checkout session
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub price_id: String,
    pub user_id: Uuid,
    pub plan: Plan,
    /// Requested trial length, `None` when the user is not eligible
    pub trial_days: Option<u32>,
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutRequest {
    /// Metadata attached to both the session and the subscription it creates
    pub fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert("userId".to_string(), self.user_id.to_string());
        metadata.insert("plan".to_string(), self.plan.as_str().to_string());
        metadata
    }
}

/// Hosted checkout session handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionHandle {
    pub id: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Create a customer; repeated calls for the same user are collapsed provider-side
    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<String>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionHandle>;

    /// Fetch the authoritative subscription state. Unknown IDs yield
    /// [`BillingError::SubscriptionNotFound`].
    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<ProviderSubscription>;

    /// Email on file for a customer, `None` for deleted or email-less customers
    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>>;

    async fn cancel_subscription_now(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<ProviderSubscription>;
}

/// Convert a provider unix timestamp, dropping values that are not valid instants
pub fn timestamp_from_unix(seconds: i64) -> Option<OffsetDateTime> {
    if seconds <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}

/// Stripe-backed provider
#[derive(Clone)]
pub struct StripeProvider {
    stripe: StripeClient,
}

impl StripeProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
        id.parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
    }

    fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
        id.parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))
    }

    fn map_subscription(sub: Subscription) -> BillingResult<ProviderSubscription> {
        let status: SubscriptionStatus = sub
            .status
            .as_str()
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("{}", e)))?;

        let customer_id = match &sub.customer {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(obj) => obj.id.to_string(),
        };

        let price = sub
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref());

        Ok(ProviderSubscription {
            id: sub.id.to_string(),
            customer_id: Some(customer_id),
            status,
            price_id: price.map(|p| p.id.to_string()),
            unit_amount: price.and_then(|p| p.unit_amount),
            cancel_at_period_end: sub.cancel_at_period_end,
            cancel_at: sub.cancel_at.and_then(timestamp_from_unix),
            canceled_at: sub.canceled_at.and_then(timestamp_from_unix),
            current_period_end: timestamp_from_unix(sub.current_period_end),
            trial_end: sub.trial_end.and_then(timestamp_from_unix),
            metadata: sub.metadata,
        })
    }

    fn map_retrieve_error(subscription_id: &str, err: StripeError) -> BillingError {
        match err {
            StripeError::Stripe(ref request) if request.http_status == 404 => {
                BillingError::SubscriptionNotFound(subscription_id.to_string())
            }
            other => other.into(),
        }
    }
}

#[async_trait]
impl BillingProvider for StripeProvider {
    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("userId".to_string(), user_id.to_string());
        metadata.insert("platform".to_string(), "stockroom".to_string());

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(metadata),
            ..Default::default()
        };

        // Same key for every attempt so a retried request returns the first customer
        let client = self
            .stripe
            .inner()
            .clone()
            .with_strategy(RequestStrategy::Idempotent(format!("customer-{}", user_id)));

        let customer = Customer::create(&client, params).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionHandle> {
        let customer_id = Self::parse_customer_id(&request.customer_id)?;
        let metadata = request.metadata();
        let client_reference_id = request.user_id.to_string();

        let subscription_data = CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata.clone()),
            trial_period_days: request.trial_days,
            ..Default::default()
        };

        let params = CreateCheckoutSession {
            customer: Some(customer_id),
            client_reference_id: Some(&client_reference_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(request.price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&request.success_url),
            cancel_url: Some(&request.cancel_url),
            metadata: Some(metadata),
            subscription_data: Some(subscription_data),
            allow_promotion_codes: Some(true),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %request.user_id,
            session_id = %session.id,
            plan = %request.plan,
            trial_days = ?request.trial_days,
            "Created checkout session"
        );

        Ok(CheckoutSessionHandle {
            id: session.id.to_string(),
            url: session.url,
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let id = Self::parse_subscription_id(subscription_id)?;
        let sub = Subscription::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map_err(|e| Self::map_retrieve_error(subscription_id, e))?;
        Self::map_subscription(sub)
    }

    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let id = Self::parse_customer_id(customer_id)?;
        let customer = Customer::retrieve(self.stripe.inner(), &id, &[]).await?;

        if customer.deleted {
            return Ok(None);
        }
        Ok(customer.email)
    }

    async fn cancel_subscription_now(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let id = Self::parse_subscription_id(subscription_id)?;
        let sub = Subscription::cancel(self.stripe.inner(), &id, CancelSubscription::default())
            .await
            .map_err(|e| Self::map_retrieve_error(subscription_id, e))?;

        tracing::info!(subscription_id = %subscription_id, "Canceled Stripe subscription immediately");

        Self::map_subscription(sub)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<ProviderSubscription> {
        let id = Self::parse_subscription_id(subscription_id)?;
        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel_at_period_end),
            ..Default::default()
        };
        let sub = Subscription::update(self.stripe.inner(), &id, params)
            .await
            .map_err(|e| Self::map_retrieve_error(subscription_id, e))?;

        tracing::info!(
            subscription_id = %subscription_id,
            cancel_at_period_end,
            "Updated Stripe cancel_at_period_end"
        );

        Self::map_subscription(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_from_unix_drops_invalid_values() {
        assert!(timestamp_from_unix(0).is_none());
        assert!(timestamp_from_unix(-5).is_none());
        assert!(timestamp_from_unix(i64::MAX).is_none());
        assert_eq!(
            timestamp_from_unix(1_700_000_000).map(|t| t.unix_timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn test_checkout_metadata_carries_user_and_plan() {
        let user_id = Uuid::new_v4();
        let request = CheckoutRequest {
            customer_id: "cus_1".to_string(),
            price_id: "price_1".to_string(),
            user_id,
            plan: Plan::Premium,
            trial_days: Some(14),
            success_url: "https://app/success".to_string(),
            cancel_url: "https://app/cancel".to_string(),
        };

        let metadata = request.metadata();
        assert_eq!(metadata.get("userId"), Some(&user_id.to_string()));
        assert_eq!(metadata.get("plan").map(String::as_str), Some("premium"));
    }
}
