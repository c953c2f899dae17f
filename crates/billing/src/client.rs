//! Stripe client configuration

use std::str::FromStr;

use stockroom_shared::Plan;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Default trial length offered to first-time subscribers
pub const DEFAULT_TRIAL_DAYS: u32 = 14;

/// Highest unit amount (in cents) still classified as the starter tier
pub const DEFAULT_STARTER_MAX_AMOUNT_CENTS: i64 = 1999;

/// Which Stripe environment the process talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BillingMode {
    #[default]
    Test,
    Live,
}

impl BillingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingMode::Test => "test",
            BillingMode::Live => "live",
        }
    }

    fn env_suffix(&self) -> &'static str {
        match self {
            BillingMode::Test => "TEST",
            BillingMode::Live => "LIVE",
        }
    }
}

impl FromStr for BillingMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "test" => Ok(BillingMode::Test),
            "live" | "production" => Ok(BillingMode::Live),
            other => Err(BillingError::Config(format!(
                "STRIPE_MODE must be 'test' or 'live', got '{}'",
                other
            ))),
        }
    }
}

/// Stripe price IDs for the two subscription tiers in one environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceIds {
    pub starter: Option<String>,
    pub premium: Option<String>,
}

impl PriceIds {
    fn plan_for(&self, price_id: &str) -> Option<Plan> {
        if self.starter.as_deref() == Some(price_id) {
            Some(Plan::Starter)
        } else if self.premium.as_deref() == Some(price_id) {
            Some(Plan::Premium)
        } else {
            None
        }
    }

    fn price_for(&self, plan: Plan) -> Option<&str> {
        match plan {
            Plan::Starter => self.starter.as_deref(),
            Plan::Premium => self.premium.as_deref(),
        }
    }
}

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub mode: BillingMode,
    /// Stripe secret API key for the selected mode
    pub secret_key: String,
    /// Webhook signing secret for the selected mode. Without one every webhook is rejected.
    pub webhook_secret: Option<String>,
    pub test_prices: PriceIds,
    pub live_prices: PriceIds,
    pub trial_days: u32,
    pub starter_max_amount_cents: i64,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup (environment, file, test map)
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mode = match var("STRIPE_MODE") {
            Some(raw) => raw.parse()?,
            None => BillingMode::Test,
        };
        let suffix = mode.env_suffix();

        let secret_key_var = format!("STRIPE_SECRET_KEY_{}", suffix);
        let secret_key = var(&secret_key_var)
            .ok_or_else(|| BillingError::Config(format!("{} not set", secret_key_var)))?;

        let prices = |env: &str| PriceIds {
            starter: var(&format!("STRIPE_PRICE_STARTER_{}", env)),
            premium: var(&format!("STRIPE_PRICE_PREMIUM_{}", env)),
        };

        let trial_days = match var("TRIAL_PERIOD_DAYS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                BillingError::Config(format!("TRIAL_PERIOD_DAYS must be a number, got '{}'", raw))
            })?,
            None => DEFAULT_TRIAL_DAYS,
        };

        let starter_max_amount_cents = match var("STARTER_MAX_AMOUNT_CENTS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                BillingError::Config(format!(
                    "STARTER_MAX_AMOUNT_CENTS must be a number, got '{}'",
                    raw
                ))
            })?,
            None => DEFAULT_STARTER_MAX_AMOUNT_CENTS,
        };

        Ok(Self {
            mode,
            secret_key,
            webhook_secret: var(&format!("STRIPE_WEBHOOK_SECRET_{}", suffix)),
            test_prices: prices("TEST"),
            live_prices: prices("LIVE"),
            trial_days,
            starter_max_amount_cents,
            app_base_url: var("APP_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
        })
    }

    /// Price table for the selected mode
    pub fn active_prices(&self) -> &PriceIds {
        match self.mode {
            BillingMode::Test => &self.test_prices,
            BillingMode::Live => &self.live_prices,
        }
    }

    /// Get price ID for a plan in the selected mode
    pub fn price_id_for_plan(&self, plan: Plan) -> Option<&str> {
        self.active_prices().price_for(plan)
    }

    /// Get plan from price ID. Both environments are consulted so that events
    /// replayed across modes still resolve.
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<Plan> {
        self.active_prices()
            .plan_for(price_id)
            .or_else(|| self.test_prices.plan_for(price_id))
            .or_else(|| self.live_prices.plan_for(price_id))
    }

    /// Trial days to request at checkout, `None` when trials are switched off
    pub fn trial_period(&self) -> Option<u32> {
        (self.trial_days > 0).then_some(self.trial_days)
    }

    pub fn success_url(&self) -> String {
        format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.app_base_url.trim_end_matches('/')
        )
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/billing/cancel", self.app_base_url.trim_end_matches('/'))
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: Client::new(&config.secret_key),
        }
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> BillingResult<StripeConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StripeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_to_test_mode() {
        let config = config_from(&[
            ("STRIPE_SECRET_KEY_TEST", "sk_test_123"),
            ("STRIPE_PRICE_STARTER_TEST", "price_starter_test"),
        ])
        .unwrap();

        assert_eq!(config.mode, BillingMode::Test);
        assert_eq!(config.trial_days, DEFAULT_TRIAL_DAYS);
        assert_eq!(config.starter_max_amount_cents, 1999);
        assert!(config.webhook_secret.is_none());
        assert_eq!(
            config.price_id_for_plan(Plan::Starter),
            Some("price_starter_test")
        );
        assert_eq!(config.price_id_for_plan(Plan::Premium), None);
    }

    #[test]
    fn test_live_mode_selects_live_secrets() {
        let config = config_from(&[
            ("STRIPE_MODE", "live"),
            ("STRIPE_SECRET_KEY_TEST", "sk_test_123"),
            ("STRIPE_SECRET_KEY_LIVE", "sk_live_123"),
            ("STRIPE_WEBHOOK_SECRET_TEST", "whsec_test"),
            ("STRIPE_WEBHOOK_SECRET_LIVE", "whsec_live"),
            ("STRIPE_PRICE_PREMIUM_LIVE", "price_premium_live"),
        ])
        .unwrap();

        assert_eq!(config.mode, BillingMode::Live);
        assert_eq!(config.secret_key, "sk_live_123");
        assert_eq!(config.webhook_secret.as_deref(), Some("whsec_live"));
        assert_eq!(
            config.price_id_for_plan(Plan::Premium),
            Some("price_premium_live")
        );
    }

    #[test]
    fn test_missing_secret_key_is_config_error() {
        let err = config_from(&[("STRIPE_MODE", "live")]).unwrap_err();
        assert!(matches!(err, BillingError::Config(msg) if msg.contains("STRIPE_SECRET_KEY_LIVE")));
    }

    #[test]
    fn test_invalid_mode_rejected() {
        assert!("staging".parse::<BillingMode>().is_err());
        assert_eq!("LIVE".parse::<BillingMode>().unwrap(), BillingMode::Live);
    }

    #[test]
    fn test_plan_for_price_checks_both_environments() {
        let config = config_from(&[
            ("STRIPE_SECRET_KEY_TEST", "sk_test_123"),
            ("STRIPE_PRICE_STARTER_TEST", "price_s_test"),
            ("STRIPE_PRICE_PREMIUM_LIVE", "price_p_live"),
        ])
        .unwrap();

        assert_eq!(config.plan_for_price_id("price_s_test"), Some(Plan::Starter));
        assert_eq!(config.plan_for_price_id("price_p_live"), Some(Plan::Premium));
        assert_eq!(config.plan_for_price_id("price_unknown"), None);
    }

    #[test]
    fn test_zero_trial_days_disables_trial() {
        let config = config_from(&[
            ("STRIPE_SECRET_KEY_TEST", "sk_test_123"),
            ("TRIAL_PERIOD_DAYS", "0"),
        ])
        .unwrap();
        assert_eq!(config.trial_period(), None);

        let bad = config_from(&[
            ("STRIPE_SECRET_KEY_TEST", "sk_test_123"),
            ("TRIAL_PERIOD_DAYS", "two weeks"),
        ]);
        assert!(bad.is_err());
    }
}
