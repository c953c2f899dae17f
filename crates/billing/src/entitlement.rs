//! Entitlement Module
//!
//! Answers "may this user use the product right now, and which parts of it?"
//! from the persisted subscription fields and the current time.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: [`evaluate`] is THE function that determines access
//! 2. **Deterministic**: Same record and instant always produce the same answer
//! 3. **No I/O**: callable from any request path with only its two inputs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stockroom_shared::{Plan, SubscriptionStatus, UserSubscription};
use time::OffsetDateTime;

const MILLIS_PER_DAY: i128 = 86_400_000;

/// Why access was granted or denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    NoSubscription,
    Trialing,
    Active,
    /// Canceled but still inside the paid period
    Canceled,
    Expired,
    PastDue,
}

impl AccessReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessReason::NoSubscription => "no_subscription",
            AccessReason::Trialing => "trialing",
            AccessReason::Active => "active",
            AccessReason::Canceled => "canceled",
            AccessReason::Expired => "expired",
            AccessReason::PastDue => "past_due",
        }
    }
}

impl std::fmt::Display for AccessReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub has_access: bool,
    pub reason: AccessReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_left: Option<i64>,
}

impl Entitlement {
    fn granted(reason: AccessReason, days_left: Option<i64>) -> Self {
        Self {
            has_access: true,
            reason,
            days_left,
        }
    }

    fn denied(reason: AccessReason) -> Self {
        Self {
            has_access: false,
            reason,
            days_left: None,
        }
    }
}

/// Whole days remaining until `end`, rounded up. A trial ending in 1.2 days reports 2.
pub fn days_until(end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let millis = (end - now).whole_milliseconds();
    let days = if millis > 0 {
        (millis + MILLIS_PER_DAY - 1) / MILLIS_PER_DAY
    } else {
        millis / MILLIS_PER_DAY
    };
    i64::try_from(days).unwrap_or(i64::MAX)
}

fn days_left_if_future(end: Option<OffsetDateTime>, now: OffsetDateTime) -> Option<i64> {
    end.filter(|end| *end > now).map(|end| days_until(end, now))
}

/// Compute access for a subscription record at `now`
pub fn evaluate(sub: &UserSubscription, now: OffsetDateTime) -> Entitlement {
    let status = match (sub.subscription_status, sub.plan) {
        (Some(status), Some(_)) => status,
        _ => return Entitlement::denied(AccessReason::NoSubscription),
    };

    match status {
        SubscriptionStatus::Trialing => match days_left_if_future(sub.trial_ends_at, now) {
            Some(days) => Entitlement::granted(AccessReason::Trialing, Some(days)),
            None => Entitlement::denied(AccessReason::Expired),
        },
        SubscriptionStatus::Active => Entitlement::granted(
            AccessReason::Active,
            days_left_if_future(sub.current_period_end, now),
        ),
        SubscriptionStatus::Canceled => match days_left_if_future(sub.current_period_end, now) {
            Some(days) => Entitlement::granted(AccessReason::Canceled, Some(days)),
            None => Entitlement::denied(AccessReason::Expired),
        },
        // Payment failure blocks immediately, whatever the period end says
        SubscriptionStatus::PastDue => Entitlement::denied(AccessReason::PastDue),
        _ => Entitlement::denied(AccessReason::NoSubscription),
    }
}

/// Whether the user may use something gated on `required`
pub fn can_access(sub: &UserSubscription, required: Plan, now: OffsetDateTime) -> bool {
    evaluate(sub, now).has_access && sub.plan.is_some_and(|plan| plan.satisfies(required))
}

/// Plan-gated application areas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Inventory,
    StockMovements,
    Suppliers,
    Customers,
    Storefront,
    Analytics,
    Reports,
}

impl Feature {
    pub const ALL: [Feature; 7] = [
        Feature::Inventory,
        Feature::StockMovements,
        Feature::Suppliers,
        Feature::Customers,
        Feature::Storefront,
        Feature::Analytics,
        Feature::Reports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Inventory => "inventory",
            Feature::StockMovements => "stock_movements",
            Feature::Suppliers => "suppliers",
            Feature::Customers => "customers",
            Feature::Storefront => "storefront",
            Feature::Analytics => "analytics",
            Feature::Reports => "reports",
        }
    }

    pub fn required_plan(&self) -> Plan {
        match self {
            Feature::Inventory | Feature::StockMovements | Feature::Suppliers | Feature::Customers => {
                Plan::Starter
            }
            Feature::Storefront | Feature::Analytics | Feature::Reports => Plan::Premium,
        }
    }
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown feature: {}", s))
    }
}

/// Access map for every feature, keyed by feature name
pub fn feature_access(sub: &UserSubscription, now: OffsetDateTime) -> BTreeMap<&'static str, bool> {
    Feature::ALL
        .into_iter()
        .map(|feature| (feature.as_str(), can_access(sub, feature.required_plan(), now)))
        .collect()
}

/// Read model returned by the subscription status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSnapshot {
    pub is_active: bool,
    pub is_trialing: bool,
    pub plan: Option<Plan>,
    pub status: Option<SubscriptionStatus>,
    pub reason: AccessReason,
    pub days_left_in_trial: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    pub has_stripe_customer: bool,
}

impl SubscriptionSnapshot {
    pub fn build(sub: &UserSubscription, now: OffsetDateTime) -> Self {
        let entitlement = evaluate(sub, now);
        let is_trialing = entitlement.reason == AccessReason::Trialing;

        Self {
            is_active: entitlement.has_access,
            is_trialing,
            plan: sub.plan,
            status: sub.subscription_status,
            reason: entitlement.reason,
            days_left_in_trial: if is_trialing {
                entitlement.days_left
            } else {
                None
            },
            current_period_end: sub.current_period_end,
            trial_ends_at: sub.trial_ends_at,
            has_stripe_customer: sub.billing_customer_ref.is_some(),
        }
    }
}
