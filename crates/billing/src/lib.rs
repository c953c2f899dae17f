//! Stockroom Billing
//!
//! Reconciles Stripe subscription state with the user record and answers
//! entitlement questions from it:
//!
//! - [`checkout`]: hosted checkout sessions, one trial per user
//! - [`webhooks`]: signature verification and idempotent event reconciliation
//! - [`subscriptions`]: user-initiated cancel and reactivate
//! - [`entitlement`]: pure access evaluation and plan gating

use std::sync::Arc;

use sqlx::PgPool;

pub mod checkout;
pub mod client;
pub mod customer;
pub mod entitlement;
pub mod error;
pub mod provider;
pub mod resolve;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use checkout::CheckoutService;
pub use client::{BillingMode, PriceIds, StripeClient, StripeConfig};
pub use customer::get_or_create_customer;
pub use entitlement::{
    can_access, evaluate, feature_access, AccessReason, Entitlement, Feature, SubscriptionSnapshot,
};
pub use error::{BillingError, BillingResult};
pub use provider::{BillingProvider, ProviderSubscription, StripeProvider};
pub use store::{FieldUpdate, PgUserStore, SubscriptionUpdate, UserStore};
pub use subscriptions::{CancelOutcome, SubscriptionService};
pub use webhooks::{WebhookEvent, WebhookHandler, WebhookOutcome};

/// Billing services sharing one config, store and provider
#[derive(Clone)]
pub struct BillingService {
    pub config: Arc<StripeConfig>,
    pub store: Arc<dyn UserStore>,
    pub checkout: CheckoutService,
    pub webhooks: WebhookHandler,
    pub subscriptions: SubscriptionService,
}

impl BillingService {
    pub fn new(
        config: StripeConfig,
        store: Arc<dyn UserStore>,
        provider: Arc<dyn BillingProvider>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            checkout: CheckoutService::new(config.clone(), store.clone(), provider.clone()),
            webhooks: WebhookHandler::new(config.clone(), store.clone(), provider.clone()),
            subscriptions: SubscriptionService::new(store.clone(), provider),
            store,
            config,
        }
    }

    /// Wire the Stripe provider and the Postgres store
    pub fn with_stripe(config: StripeConfig, pool: PgPool) -> Self {
        let provider = StripeProvider::new(StripeClient::new(&config));
        Self::new(config, Arc::new(PgUserStore::new(pool)), Arc::new(provider))
    }

    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        tracing::info!(
            mode = config.mode.as_str(),
            webhooks_enabled = config.webhook_secret.is_some(),
            trial_days = config.trial_days,
            "Billing configured"
        );
        Ok(Self::with_stripe(config, pool))
    }
}
