//! Ordered lookup strategies for webhook reconciliation
//!
//! Provider events identify a user in several ways (checkout metadata, customer
//! ID, email). Each handler declares which strategies it trusts and in what
//! order; the first strategy that yields a result wins and is logged.

use std::collections::HashMap;

use stockroom_shared::{Plan, UserRecord};
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::BillingResult;
use crate::provider::BillingProvider;
use crate::store::UserStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStrategy {
    /// `userId` written into checkout metadata
    Metadata,
    /// Stored provider customer ID
    CustomerRef,
    /// Email reported in the event payload
    Email,
    /// Email fetched from the provider's customer object
    ProviderCustomerEmail,
}

impl UserStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStrategy::Metadata => "metadata",
            UserStrategy::CustomerRef => "customer_ref",
            UserStrategy::Email => "email",
            UserStrategy::ProviderCustomerEmail => "provider_customer_email",
        }
    }
}

/// Identifiers an event carries for locating its user
#[derive(Debug, Clone, Default)]
pub struct UserHints<'a> {
    pub metadata_user_id: Option<&'a str>,
    pub customer_id: Option<&'a str>,
    pub email: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub user: UserRecord,
    pub strategy: UserStrategy,
}

impl ResolvedUser {
    /// Found by email although the event named a customer we have not stored yet
    pub fn needs_customer_backfill<'a>(&self, hints: &UserHints<'a>) -> Option<&'a str> {
        match self.user.subscription.billing_customer_ref {
            None => hints.customer_id,
            Some(_) => None,
        }
    }
}

/// Try each strategy in order and return the first user found
pub async fn resolve_user(
    strategies: &[UserStrategy],
    hints: &UserHints<'_>,
    store: &dyn UserStore,
    provider: &dyn BillingProvider,
) -> BillingResult<Option<ResolvedUser>> {
    for strategy in strategies {
        let found = match strategy {
            UserStrategy::Metadata => match hints.metadata_user_id {
                Some(raw) => match raw.trim().parse::<Uuid>() {
                    Ok(user_id) => store.find_by_id(user_id).await?,
                    Err(_) => {
                        tracing::warn!(metadata_user_id = %raw, "Ignoring malformed userId metadata");
                        None
                    }
                },
                None => None,
            },
            UserStrategy::CustomerRef => match hints.customer_id {
                Some(customer_id) => store.find_by_customer_ref(customer_id).await?,
                None => None,
            },
            UserStrategy::Email => match hints.email.filter(|e| !e.trim().is_empty()) {
                Some(email) => store.find_by_email(email).await?,
                None => None,
            },
            UserStrategy::ProviderCustomerEmail => match hints.customer_id {
                Some(customer_id) => match provider.customer_email(customer_id).await? {
                    Some(email) => store.find_by_email(&email).await?,
                    None => None,
                },
                None => None,
            },
        };

        if let Some(user) = found {
            tracing::debug!(
                user_id = %user.id,
                strategy = strategy.as_str(),
                "Resolved webhook user"
            );
            return Ok(Some(ResolvedUser {
                user,
                strategy: *strategy,
            }));
        }
    }

    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStrategy {
    /// `plan` written into checkout metadata
    Metadata,
    /// Configured price ID lookup
    ExactPrice,
    /// Unit amount compared against the starter ceiling. Breaks silently if
    /// pricing changes, so it is only ever a last resort.
    AmountThreshold,
}

impl PlanStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStrategy::Metadata => "metadata",
            PlanStrategy::ExactPrice => "exact_price",
            PlanStrategy::AmountThreshold => "amount_threshold",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanHints<'a> {
    pub metadata: Option<&'a HashMap<String, String>>,
    pub price_id: Option<&'a str>,
    pub unit_amount: Option<i64>,
}

/// Try each strategy in order; `None` means the plan stays unresolved
pub fn resolve_plan(
    strategies: &[PlanStrategy],
    hints: &PlanHints<'_>,
    config: &StripeConfig,
) -> Option<(Plan, PlanStrategy)> {
    strategies.iter().find_map(|strategy| {
        let plan = match strategy {
            PlanStrategy::Metadata => hints
                .metadata
                .and_then(|m| m.get("plan"))
                .and_then(|raw| raw.parse::<Plan>().ok()),
            PlanStrategy::ExactPrice => hints
                .price_id
                .and_then(|price_id| config.plan_for_price_id(price_id)),
            PlanStrategy::AmountThreshold => hints.unit_amount.map(|amount| {
                let plan = if amount <= config.starter_max_amount_cents {
                    Plan::Starter
                } else {
                    Plan::Premium
                };
                tracing::warn!(
                    price_id = ?hints.price_id,
                    unit_amount = amount,
                    plan = %plan,
                    "Plan resolved from price amount; price ID is not configured"
                );
                plan
            }),
        };
        plan.map(|plan| (plan, *strategy))
    })
}
