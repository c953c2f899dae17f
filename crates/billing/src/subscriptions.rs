//! User-initiated cancel and reactivate

use std::sync::Arc;

use serde::Serialize;
use stockroom_shared::{SubscriptionStatus, UserRecord};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::provider::BillingProvider;
use crate::store::{FieldUpdate, SubscriptionUpdate, UserStore};

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    /// Access ended when the call returned (trial cancellation)
    pub canceled_immediately: bool,
    /// When access ends for a period-end cancellation
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn UserStore>,
    provider: Arc<dyn BillingProvider>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn UserStore>, provider: Arc<dyn BillingProvider>) -> Self {
        Self { store, provider }
    }

    /// Cancel the user's subscription.
    ///
    /// During a live trial the subscription is canceled at the provider right
    /// away and access ends now. Otherwise it is flagged to end with the paid
    /// period, and `current_period_end` is left alone so access lasts until then.
    pub async fn cancel(&self, user: &UserRecord) -> BillingResult<CancelOutcome> {
        let subscription_id = user
            .subscription
            .billing_subscription_ref
            .as_deref()
            .ok_or(BillingError::NoActiveSubscription)?;

        let now = OffsetDateTime::now_utc();

        if user.subscription.is_trialing_at(now) {
            self.provider.cancel_subscription_now(subscription_id).await?;

            let update = SubscriptionUpdate {
                status: FieldUpdate::Set(SubscriptionStatus::Canceled),
                trial_ends_at: FieldUpdate::Clear,
                // A trial has no paid period to honour
                current_period_end: FieldUpdate::Clear,
                mark_trial_consumed: true,
                ..Default::default()
            };
            self.store.apply_update(user.id, &update).await?;

            tracing::info!(
                user_id = %user.id,
                subscription_id = %subscription_id,
                "Trial canceled; access revoked immediately"
            );

            return Ok(CancelOutcome {
                canceled_immediately: true,
                cancel_at: None,
            });
        }

        let live = self
            .provider
            .set_cancel_at_period_end(subscription_id, true)
            .await?;
        let cancel_at = live
            .cancel_at
            .or(live.current_period_end)
            .or(user.subscription.current_period_end);

        let update = SubscriptionUpdate {
            status: FieldUpdate::Set(SubscriptionStatus::Canceled),
            ..Default::default()
        };
        self.store.apply_update(user.id, &update).await?;

        tracing::info!(
            user_id = %user.id,
            subscription_id = %subscription_id,
            cancel_at = ?cancel_at,
            "Subscription set to cancel at period end"
        );

        Ok(CancelOutcome {
            canceled_immediately: false,
            cancel_at,
        })
    }

    /// Undo a period-end cancellation and store the status the provider reports
    pub async fn reactivate(&self, user: &UserRecord) -> BillingResult<SubscriptionStatus> {
        let subscription_id = user
            .subscription
            .billing_subscription_ref
            .as_deref()
            .ok_or(BillingError::NoActiveSubscription)?;

        let live = match self.provider.retrieve_subscription(subscription_id).await {
            Ok(live) => live,
            Err(BillingError::SubscriptionNotFound(_)) => return Err(BillingError::SubscriptionEnded),
            Err(e) => return Err(e),
        };
        if live.status.is_terminal() {
            tracing::info!(
                user_id = %user.id,
                subscription_id = %subscription_id,
                status = %live.status,
                "Refusing to reactivate an ended subscription"
            );
            return Err(BillingError::SubscriptionEnded);
        }

        let live = self
            .provider
            .set_cancel_at_period_end(subscription_id, false)
            .await?;

        let update = SubscriptionUpdate {
            status: FieldUpdate::Set(live.status),
            current_period_end: FieldUpdate::set_if_some(live.current_period_end),
            ..Default::default()
        };
        self.store.apply_update(user.id, &update).await?;

        tracing::info!(
            user_id = %user.id,
            subscription_id = %subscription_id,
            status = %live.status,
            "Subscription reactivated"
        );

        Ok(live.status)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entitlement::{evaluate, AccessReason};
    use crate::testing::{provider_subscription, FakeProvider, MemoryUserStore};
    use stockroom_shared::Plan;
    use time::Duration;
    use uuid::Uuid;

    struct Harness {
        store: MemoryUserStore,
        provider: FakeProvider,
        service: SubscriptionService,
    }

    fn harness() -> Harness {
        let store = MemoryUserStore::new();
        let provider = FakeProvider::new();
        let service = SubscriptionService::new(Arc::new(store.clone()), Arc::new(provider.clone()));
        Harness {
            store,
            provider,
            service,
        }
    }

    async fn subscribed_user(
        h: &Harness,
        status: SubscriptionStatus,
        configure: impl FnOnce(&mut UserRecord),
    ) -> UserRecord {
        let mut user = UserRecord::new(Uuid::new_v4(), "sub@example.com");
        user.subscription.billing_customer_ref = Some("cus_1".to_string());
        user.subscription.billing_subscription_ref = Some("sub_1".to_string());
        user.subscription.subscription_status = Some(status);
        user.subscription.plan = Some(Plan::Premium);
        configure(&mut user);
        h.store.insert(user.clone()).await;

        let mut live = provider_subscription("sub_1", "cus_1", status, Plan::Premium);
        live.trial_end = user.subscription.trial_ends_at;
        live.current_period_end = user.subscription.current_period_end;
        h.provider.put_subscription(live).await;
        user
    }

    #[tokio::test]
    async fn test_cancel_during_trial_is_immediate() {
        let h = harness();
        let user = subscribed_user(&h, SubscriptionStatus::Trialing, |u| {
            u.subscription.trial_ends_at = Some(OffsetDateTime::now_utc() + Duration::days(5));
            u.subscription.trial_consumed = true;
        })
        .await;

        let outcome = h.service.cancel(&user).await.unwrap();
        assert!(outcome.canceled_immediately);

        let sub = h.store.get(user.id).await.unwrap().subscription;
        assert_eq!(sub.subscription_status, Some(SubscriptionStatus::Canceled));
        assert_eq!(sub.trial_ends_at, None);
        assert!(sub.had_trial_before());
        assert!(!evaluate(&sub, OffsetDateTime::now_utc()).has_access);
        assert_eq!(
            h.provider.subscription("sub_1").await.map(|s| s.status),
            Some(SubscriptionStatus::Canceled)
        );
    }

    #[tokio::test]
    async fn test_cancel_while_active_keeps_period() {
        let h = harness();
        let now = OffsetDateTime::now_utc();
        let period_end = now + Duration::days(20);
        let user = subscribed_user(&h, SubscriptionStatus::Active, |u| {
            u.subscription.current_period_end = Some(period_end);
        })
        .await;

        let outcome = h.service.cancel(&user).await.unwrap();
        assert!(!outcome.canceled_immediately);
        assert_eq!(outcome.cancel_at, Some(period_end));

        let sub = h.store.get(user.id).await.unwrap().subscription;
        assert_eq!(sub.subscription_status, Some(SubscriptionStatus::Canceled));
        assert_eq!(sub.current_period_end, Some(period_end));

        let result = evaluate(&sub, now);
        assert!(result.has_access);
        assert_eq!(result.reason, AccessReason::Canceled);
        assert_eq!(result.days_left, Some(20));

        assert_eq!(
            h.provider.subscription("sub_1").await.map(|s| s.cancel_at_period_end),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_cancel_without_subscription_skips_provider() {
        let h = harness();
        let user = UserRecord::new(Uuid::new_v4(), "none@example.com");
        h.store.insert(user.clone()).await;

        let result = h.service.cancel(&user).await;
        assert!(matches!(result, Err(BillingError::NoActiveSubscription)));
        assert!(h.provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_reactivate_restores_provider_status() {
        let h = harness();
        let user = subscribed_user(&h, SubscriptionStatus::Active, |u| {
            u.subscription.current_period_end = Some(OffsetDateTime::now_utc() + Duration::days(20));
        })
        .await;
        h.service.cancel(&user).await.unwrap();
        let canceled = h.store.get(user.id).await.unwrap();

        let status = h.service.reactivate(&canceled).await.unwrap();
        assert_eq!(status, SubscriptionStatus::Active);

        let sub = h.store.get(user.id).await.unwrap().subscription;
        assert_eq!(sub.subscription_status, Some(SubscriptionStatus::Active));
        assert_eq!(
            h.provider.subscription("sub_1").await.map(|s| s.cancel_at_period_end),
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_reactivate_ended_subscription_fails_cleanly() {
        let h = harness();
        let user = subscribed_user(&h, SubscriptionStatus::Trialing, |u| {
            u.subscription.trial_ends_at = Some(OffsetDateTime::now_utc() + Duration::days(5));
        })
        .await;
        h.service.cancel(&user).await.unwrap();
        let before = h.store.get(user.id).await.unwrap();

        let result = h.service.reactivate(&before).await;
        assert!(matches!(result, Err(BillingError::SubscriptionEnded)));
        assert_eq!(h.store.get(user.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_reactivate_missing_provider_subscription() {
        let h = harness();
        let mut user = UserRecord::new(Uuid::new_v4(), "gone@example.com");
        user.subscription.billing_subscription_ref = Some("sub_gone".to_string());
        h.store.insert(user.clone()).await;

        let result = h.service.reactivate(&user).await;
        assert!(matches!(result, Err(BillingError::SubscriptionEnded)));
    }
}
