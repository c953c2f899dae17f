//! Core types for the Stockroom billing domain

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SharedError;

// =============================================================================
// Enums
// =============================================================================

/// Subscription status as reported by the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    Canceled,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
        }
    }

    /// Statuses from which the provider never transitions back
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trialing" => Ok(Self::Trialing),
            "active" => Ok(Self::Active),
            // The provider has used both spellings over time
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "incomplete" => Ok(Self::Incomplete),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            "past_due" => Ok(Self::PastDue),
            "unpaid" => Ok(Self::Unpaid),
            "paused" => Ok(Self::Paused),
            _ => Err(SharedError::InvalidStatus(s.to_string())),
        }
    }
}

/// Plan tier gating application features
/// Tier hierarchy: Starter → Premium (premium includes everything starter has)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Premium => "premium",
        }
    }

    /// Whether a subscriber on this plan may use something that requires `required`
    pub fn satisfies(&self, required: Plan) -> bool {
        match (self, required) {
            (Self::Premium, _) => true,
            (Self::Starter, Self::Starter) => true,
            (Self::Starter, Self::Premium) => false,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Plan {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "starter" => Ok(Self::Starter),
            "premium" => Ok(Self::Premium),
            _ => Err(SharedError::InvalidPlan(s.to_string())),
        }
    }
}

// =============================================================================
// User subscription record
// =============================================================================

/// Subscription fields embedded in the user entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSubscription {
    /// Provider customer ID; assigned once and never changed afterwards
    pub billing_customer_ref: Option<String>,
    /// Provider subscription ID of the current subscription
    pub billing_subscription_ref: Option<String>,
    /// Provider price ID the plan is derived from
    pub price_ref: Option<String>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub plan: Option<Plan>,
    pub trial_ends_at: Option<OffsetDateTime>,
    /// Latched the first time `trial_ends_at` is written; never reset
    pub trial_consumed: bool,
    pub current_period_end: Option<OffsetDateTime>,
}

impl UserSubscription {
    /// Whether the one-time trial has already been used.
    ///
    /// Depends on whether a trial end was ever recorded, not on its current value:
    /// an immediately revoked trial clears `trial_ends_at` but keeps the latch.
    pub fn had_trial_before(&self) -> bool {
        self.trial_consumed || self.trial_ends_at.is_some()
    }

    /// Trialing with a trial end still in the future
    pub fn is_trialing_at(&self, now: OffsetDateTime) -> bool {
        self.subscription_status == Some(SubscriptionStatus::Trialing)
            && self.trial_ends_at.map(|end| end > now).unwrap_or(false)
    }
}

/// A user as seen by the billing core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub subscription: UserSubscription,
}

impl UserRecord {
    pub fn new(id: Uuid, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            subscription: UserSubscription::default(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_status_accepts_british_spelling() {
        assert_eq!(
            "cancelled".parse::<SubscriptionStatus>(),
            Ok(SubscriptionStatus::Canceled)
        );
        assert!("bogus".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_plan_hierarchy() {
        assert!(Plan::Premium.satisfies(Plan::Premium));
        assert!(Plan::Premium.satisfies(Plan::Starter));
        assert!(Plan::Starter.satisfies(Plan::Starter));
        assert!(!Plan::Starter.satisfies(Plan::Premium));
    }

    #[test]
    fn test_plan_parse() {
        assert_eq!("Premium".parse::<Plan>(), Ok(Plan::Premium));
        assert_eq!(" starter ".parse::<Plan>(), Ok(Plan::Starter));
        assert_eq!(
            "enterprise".parse::<Plan>(),
            Err(SharedError::InvalidPlan("enterprise".to_string()))
        );
    }

    #[test]
    fn test_had_trial_before_survives_cleared_trial_end() {
        let mut sub = UserSubscription::default();
        assert!(!sub.had_trial_before());

        sub.trial_ends_at = Some(OffsetDateTime::now_utc());
        assert!(sub.had_trial_before());

        // Revocation clears the timestamp but keeps the latch
        sub.trial_ends_at = None;
        sub.trial_consumed = true;
        assert!(sub.had_trial_before());
    }

    #[test]
    fn test_is_trialing_at() {
        let now = OffsetDateTime::now_utc();
        let mut sub = UserSubscription {
            subscription_status: Some(SubscriptionStatus::Trialing),
            trial_ends_at: Some(now + Duration::days(3)),
            ..Default::default()
        };
        assert!(sub.is_trialing_at(now));

        sub.trial_ends_at = Some(now - Duration::days(1));
        assert!(!sub.is_trialing_at(now));

        sub.subscription_status = Some(SubscriptionStatus::Active);
        sub.trial_ends_at = Some(now + Duration::days(3));
        assert!(!sub.is_trialing_at(now));
    }
}
