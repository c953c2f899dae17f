//! In-memory doubles for exercising billing flows without Postgres or Stripe.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use stockroom_shared::{Plan, SubscriptionStatus, UserRecord};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::client::{BillingMode, PriceIds, StripeConfig};
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, CheckoutRequest, CheckoutSessionHandle, ProviderSubscription,
};
use crate::store::{SubscriptionUpdate, UserStore};

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const STARTER_PRICE: &str = "price_starter_test";
pub const PREMIUM_PRICE: &str = "price_premium_test";

/// Config with both test prices and a webhook secret configured
pub fn test_config() -> StripeConfig {
    StripeConfig {
        mode: BillingMode::Test,
        secret_key: "sk_test_dummy".to_string(),
        webhook_secret: Some(TEST_WEBHOOK_SECRET.to_string()),
        test_prices: PriceIds {
            starter: Some(STARTER_PRICE.to_string()),
            premium: Some(PREMIUM_PRICE.to_string()),
        },
        live_prices: PriceIds::default(),
        trial_days: 14,
        starter_max_amount_cents: 1999,
        app_base_url: "https://app.stockroom.test".to_string(),
    }
}

/// Build a `Stripe-Signature` header for `payload`
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

#[derive(Default, Clone)]
pub struct MemoryUserStore {
    users: Arc<RwLock<HashMap<Uuid, UserRecord>>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: UserRecord) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn get(&self, user_id: Uuid) -> Option<UserRecord> {
        self.users.read().await.get(&user_id).cloned()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>> {
        Ok(self.get(user_id).await)
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<UserRecord>> {
        let needle = email.trim().to_lowercase();
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email.to_lowercase() == needle)
            .cloned())
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<UserRecord>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.subscription.billing_customer_ref.as_deref() == Some(customer_ref))
            .cloned())
    }

    async fn set_customer_ref_if_absent(
        &self,
        user_id: Uuid,
        customer_ref: &str,
    ) -> BillingResult<String> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        Ok(user
            .subscription
            .billing_customer_ref
            .get_or_insert_with(|| customer_ref.to_string())
            .clone())
    }

    async fn apply_update(&self, user_id: Uuid, update: &SubscriptionUpdate) -> BillingResult<()> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        update.apply_to(&mut user.subscription);
        Ok(())
    }
}

#[derive(Default)]
struct FakeProviderState {
    subscriptions: HashMap<String, ProviderSubscription>,
    customer_emails: HashMap<String, Option<String>>,
    customers_by_user: HashMap<Uuid, String>,
    checkout_requests: Vec<CheckoutRequest>,
    calls: Vec<String>,
    failing: bool,
}

/// Scriptable provider double. Subscriptions are seeded with
/// [`FakeProvider::put_subscription`] and mutated by cancel calls the way
/// Stripe would mutate them.
#[derive(Default, Clone)]
pub struct FakeProvider {
    state: Arc<RwLock<FakeProviderState>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_subscription(&self, sub: ProviderSubscription) {
        self.state
            .write()
            .await
            .subscriptions
            .insert(sub.id.clone(), sub);
    }

    pub async fn subscription(&self, id: &str) -> Option<ProviderSubscription> {
        self.state.read().await.subscriptions.get(id).cloned()
    }

    pub async fn put_customer(&self, customer_id: &str, email: Option<&str>) {
        self.state
            .write()
            .await
            .customer_emails
            .insert(customer_id.to_string(), email.map(str::to_string));
    }

    /// Make every subsequent call fail with a provider error
    pub async fn set_failing(&self, failing: bool) {
        self.state.write().await.failing = failing;
    }

    pub async fn checkout_requests(&self) -> Vec<CheckoutRequest> {
        self.state.read().await.checkout_requests.clone()
    }

    /// Names of provider operations invoked so far, in order
    pub async fn calls(&self) -> Vec<String> {
        self.state.read().await.calls.clone()
    }

    async fn record(&self, call: &str) -> BillingResult<()> {
        let mut state = self.state.write().await;
        state.calls.push(call.to_string());
        if state.failing {
            return Err(BillingError::StripeApi("simulated provider outage".to_string()));
        }
        Ok(())
    }
}

/// Subscription fixture with sensible defaults
pub fn provider_subscription(
    id: &str,
    customer_id: &str,
    status: SubscriptionStatus,
    plan: Plan,
) -> ProviderSubscription {
    let (price_id, unit_amount) = match plan {
        Plan::Starter => (STARTER_PRICE, 1999),
        Plan::Premium => (PREMIUM_PRICE, 4999),
    };
    ProviderSubscription {
        id: id.to_string(),
        customer_id: Some(customer_id.to_string()),
        status,
        price_id: Some(price_id.to_string()),
        unit_amount: Some(unit_amount),
        cancel_at_period_end: false,
        cancel_at: None,
        canceled_at: None,
        current_period_end: None,
        trial_end: None,
        metadata: HashMap::new(),
    }
}

#[async_trait]
impl BillingProvider for FakeProvider {
    async fn create_customer(&self, user_id: Uuid, _email: &str) -> BillingResult<String> {
        self.record("create_customer").await?;
        let mut state = self.state.write().await;
        let id = state
            .customers_by_user
            .entry(user_id)
            .or_insert_with(|| format!("cus_{}", user_id.simple()))
            .clone();
        Ok(id)
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutSessionHandle> {
        self.record("create_checkout_session").await?;
        let mut state = self.state.write().await;
        state.checkout_requests.push(request.clone());
        let id = format!("cs_test_{}", state.checkout_requests.len());
        Ok(CheckoutSessionHandle {
            url: Some(format!("https://checkout.stripe.test/{}", id)),
            id,
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        self.record("retrieve_subscription").await?;
        self.subscription(subscription_id)
            .await
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))
    }

    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>> {
        self.record("customer_email").await?;
        Ok(self
            .state
            .read()
            .await
            .customer_emails
            .get(customer_id)
            .cloned()
            .flatten())
    }

    async fn cancel_subscription_now(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        self.record("cancel_subscription_now").await?;
        let mut state = self.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;
        sub.status = SubscriptionStatus::Canceled;
        sub.canceled_at = Some(time::OffsetDateTime::now_utc());
        Ok(sub.clone())
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<ProviderSubscription> {
        self.record("set_cancel_at_period_end").await?;
        let mut state = self.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;
        sub.cancel_at_period_end = cancel_at_period_end;
        sub.cancel_at = if cancel_at_period_end {
            sub.current_period_end
        } else {
            None
        };
        Ok(sub.clone())
    }
}
