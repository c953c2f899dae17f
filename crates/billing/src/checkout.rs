//! Stripe Checkout sessions

use std::sync::Arc;

use stockroom_shared::{Plan, UserRecord};

use crate::client::StripeConfig;
use crate::customer::get_or_create_customer;
use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, CheckoutRequest};
use crate::store::UserStore;

/// Checkout service for creating Stripe checkout sessions
#[derive(Clone)]
pub struct CheckoutService {
    config: Arc<StripeConfig>,
    store: Arc<dyn UserStore>,
    provider: Arc<dyn BillingProvider>,
}

impl CheckoutService {
    pub fn new(
        config: Arc<StripeConfig>,
        store: Arc<dyn UserStore>,
        provider: Arc<dyn BillingProvider>,
    ) -> Self {
        Self {
            config,
            store,
            provider,
        }
    }

    /// Create a subscription-mode checkout session and return its hosted URL.
    ///
    /// Subscription state is not touched here; it is written once the
    /// provider confirms the session through a webhook.
    pub async fn start_checkout(&self, user: &UserRecord, plan: Plan) -> BillingResult<String> {
        let price_id = self
            .config
            .price_id_for_plan(plan)
            .ok_or_else(|| {
                BillingError::Config(format!(
                    "No {} price configured for {} mode",
                    plan,
                    self.config.mode.as_str()
                ))
            })?
            .to_string();

        let customer_id =
            get_or_create_customer(self.store.as_ref(), self.provider.as_ref(), user).await?;

        // One trial per user, ever
        let trial_days = if user.subscription.had_trial_before() {
            None
        } else {
            self.config.trial_period()
        };

        let request = CheckoutRequest {
            customer_id,
            price_id,
            user_id: user.id,
            plan,
            trial_days,
            success_url: self.config.success_url(),
            cancel_url: self.config.cancel_url(),
        };

        let session = self.provider.create_checkout_session(&request).await?;

        tracing::info!(
            user_id = %user.id,
            session_id = %session.id,
            plan = %plan,
            trial_granted = trial_days.is_some(),
            "Checkout session ready"
        );

        session.url.ok_or_else(|| {
            BillingError::StripeApi(format!("Checkout session {} has no URL", session.id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, FakeProvider, MemoryUserStore, PREMIUM_PRICE};
    use stockroom_shared::SubscriptionStatus;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn service(store: &MemoryUserStore, provider: &FakeProvider) -> CheckoutService {
        CheckoutService::new(
            Arc::new(test_config()),
            Arc::new(store.clone()),
            Arc::new(provider.clone()),
        )
    }

    #[tokio::test]
    async fn test_first_checkout_requests_trial() {
        let store = MemoryUserStore::new();
        let provider = FakeProvider::new();
        let user = UserRecord::new(Uuid::new_v4(), "new@example.com");
        store.insert(user.clone()).await;

        let url = service(&store, &provider)
            .start_checkout(&user, Plan::Premium)
            .await;
        assert!(url.is_ok());

        let requests = provider.checkout_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].trial_days, Some(14));
        assert_eq!(requests[0].price_id, PREMIUM_PRICE);
        assert_eq!(requests[0].user_id, user.id);

        // Customer ref persisted, subscription fields untouched
        let stored = store.get(user.id).await.map(|u| u.subscription);
        assert!(stored.as_ref().is_some_and(|s| s.billing_customer_ref.is_some()));
        assert!(stored.is_some_and(|s| s.subscription_status.is_none()));
    }

    #[tokio::test]
    async fn test_repeat_checkout_gets_no_trial() {
        let store = MemoryUserStore::new();
        let provider = FakeProvider::new();
        let mut user = UserRecord::new(Uuid::new_v4(), "returning@example.com");
        user.subscription.billing_customer_ref = Some("cus_returning".to_string());
        user.subscription.subscription_status = Some(SubscriptionStatus::Canceled);
        user.subscription.trial_ends_at = Some(OffsetDateTime::now_utc() - Duration::days(40));
        store.insert(user.clone()).await;

        service(&store, &provider)
            .start_checkout(&user, Plan::Starter)
            .await
            .ok();

        let requests = provider.checkout_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].trial_days, None);
        assert_eq!(requests[0].customer_id, "cus_returning");
    }

    #[tokio::test]
    async fn test_revoked_trial_still_counts_as_used() {
        let store = MemoryUserStore::new();
        let provider = FakeProvider::new();
        let mut user = UserRecord::new(Uuid::new_v4(), "revoked@example.com");
        user.subscription.trial_consumed = true;
        store.insert(user.clone()).await;

        service(&store, &provider)
            .start_checkout(&user, Plan::Premium)
            .await
            .ok();

        let requests = provider.checkout_requests().await;
        assert_eq!(requests.first().and_then(|r| r.trial_days), None);
    }

    #[tokio::test]
    async fn test_missing_price_is_config_error() {
        let store = MemoryUserStore::new();
        let provider = FakeProvider::new();
        let user = UserRecord::new(Uuid::new_v4(), "x@example.com");
        store.insert(user.clone()).await;

        let mut config = test_config();
        config.test_prices.premium = None;
        let service = CheckoutService::new(
            Arc::new(config),
            Arc::new(store.clone()),
            Arc::new(provider.clone()),
        );

        let result = service.start_checkout(&user, Plan::Premium).await;
        assert!(matches!(result, Err(BillingError::Config(_))));
        assert!(provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_surfaces_as_stripe_error() {
        let store = MemoryUserStore::new();
        let provider = FakeProvider::new();
        let user = UserRecord::new(Uuid::new_v4(), "y@example.com");
        store.insert(user.clone()).await;
        provider.set_failing(true).await;

        let result = service(&store, &provider)
            .start_checkout(&user, Plan::Starter)
            .await;
        assert!(matches!(result, Err(ref e) if e.is_provider_failure()));
        assert!(store
            .get(user.id)
            .await
            .is_some_and(|u| u.subscription.billing_customer_ref.is_none()));
    }
}
