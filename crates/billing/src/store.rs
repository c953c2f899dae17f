//! User subscription persistence
//!
//! Writes are expressed as a [`SubscriptionUpdate`]: every field is either left
//! alone, overwritten, or cleared. Handlers always recompute the complete set of
//! fields they own from the provider, so applying the same update twice has the
//! same effect as applying it once.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use stockroom_shared::{Plan, SubscriptionStatus, UserRecord, UserSubscription};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A single-field write
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> FieldUpdate<T> {
    /// `Set` when a value is present, otherwise leave the stored value alone
    pub fn set_if_some(value: Option<T>) -> Self {
        match value {
            Some(v) => FieldUpdate::Set(v),
            None => FieldUpdate::Keep,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> FieldUpdate<U> {
        match self {
            FieldUpdate::Keep => FieldUpdate::Keep,
            FieldUpdate::Set(v) => FieldUpdate::Set(f(v)),
            FieldUpdate::Clear => FieldUpdate::Clear,
        }
    }

    fn apply(self, slot: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(v) => *slot = Some(v),
            FieldUpdate::Clear => *slot = None,
        }
    }
}

/// Field-by-field overwrite of a user's subscription columns.
/// The customer ref is deliberately absent: it goes through
/// [`UserStore::set_customer_ref_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriptionUpdate {
    pub subscription_ref: FieldUpdate<String>,
    pub price_ref: FieldUpdate<String>,
    pub status: FieldUpdate<SubscriptionStatus>,
    pub plan: FieldUpdate<Plan>,
    pub trial_ends_at: FieldUpdate<OffsetDateTime>,
    pub current_period_end: FieldUpdate<OffsetDateTime>,
    /// Latch trial eligibility even when no trial end is stored
    pub mark_trial_consumed: bool,
}

impl SubscriptionUpdate {
    pub fn is_empty(&self) -> bool {
        self.subscription_ref.is_keep()
            && self.price_ref.is_keep()
            && self.status.is_keep()
            && self.plan.is_keep()
            && self.trial_ends_at.is_keep()
            && self.current_period_end.is_keep()
            && !self.mark_trial_consumed
    }

    fn latches_trial(&self) -> bool {
        self.mark_trial_consumed || matches!(self.trial_ends_at, FieldUpdate::Set(_))
    }

    /// Apply to an in-memory record with the same semantics as the SQL write
    pub fn apply_to(&self, sub: &mut UserSubscription) {
        if self.latches_trial() {
            sub.trial_consumed = true;
        }
        self.subscription_ref
            .clone()
            .apply(&mut sub.billing_subscription_ref);
        self.price_ref.clone().apply(&mut sub.price_ref);
        self.status.clone().apply(&mut sub.subscription_status);
        self.plan.clone().apply(&mut sub.plan);
        self.trial_ends_at.clone().apply(&mut sub.trial_ends_at);
        self.current_period_end
            .clone()
            .apply(&mut sub.current_period_end);
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>>;

    /// Case-insensitive email lookup
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<UserRecord>>;

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<UserRecord>>;

    /// Store `customer_ref` only if the user has none yet. Returns the ref that
    /// is stored after the write, which may be one written by a concurrent request.
    async fn set_customer_ref_if_absent(
        &self,
        user_id: Uuid,
        customer_ref: &str,
    ) -> BillingResult<String>;

    async fn apply_update(&self, user_id: Uuid, update: &SubscriptionUpdate) -> BillingResult<()>;
}

const USER_COLUMNS: &str = "id, email, billing_customer_ref, billing_subscription_ref, price_ref, \
     subscription_status, plan, trial_ends_at, trial_consumed, current_period_end";

/// Postgres-backed user store
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &PgRow) -> Result<UserRecord, sqlx::Error> {
        let status: Option<String> = row.try_get("subscription_status")?;
        let plan: Option<String> = row.try_get("plan")?;

        let subscription_status = status
            .map(|s| s.parse::<SubscriptionStatus>())
            .transpose()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let plan = plan
            .map(|p| p.parse::<Plan>())
            .transpose()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(UserRecord {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            subscription: UserSubscription {
                billing_customer_ref: row.try_get("billing_customer_ref")?,
                billing_subscription_ref: row.try_get("billing_subscription_ref")?,
                price_ref: row.try_get("price_ref")?,
                subscription_status,
                plan,
                trial_ends_at: row.try_get("trial_ends_at")?,
                trial_consumed: row.try_get("trial_consumed")?,
                current_period_end: row.try_get("current_period_end")?,
            },
        })
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        value: &str,
    ) -> BillingResult<Option<UserRecord>> {
        let sql = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, clause);
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::record_from_row).transpose()?)
    }
}

fn push_field<'args, T>(
    qb: &mut QueryBuilder<'args, Postgres>,
    column: &str,
    field: FieldUpdate<T>,
) where
    T: 'args + sqlx::Encode<'args, Postgres> + sqlx::Type<Postgres> + Send,
{
    match field {
        FieldUpdate::Keep => {}
        FieldUpdate::Set(value) => {
            qb.push(", ").push(column).push(" = ").push_bind(value);
        }
        FieldUpdate::Clear => {
            qb.push(", ").push(column).push(" = NULL");
        }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, user_id: Uuid) -> BillingResult<Option<UserRecord>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::record_from_row).transpose()?)
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<UserRecord>> {
        self.fetch_one_where("LOWER(email) = LOWER($1)", email.trim())
            .await
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> BillingResult<Option<UserRecord>> {
        self.fetch_one_where("billing_customer_ref = $1", customer_ref)
            .await
    }

    async fn set_customer_ref_if_absent(
        &self,
        user_id: Uuid,
        customer_ref: &str,
    ) -> BillingResult<String> {
        let stored: Option<(Option<String>,)> = sqlx::query_as(
            "UPDATE users
             SET billing_customer_ref = COALESCE(billing_customer_ref, $1), updated_at = NOW()
             WHERE id = $2
             RETURNING billing_customer_ref",
        )
        .bind(customer_ref)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match stored {
            Some((Some(stored_ref),)) => Ok(stored_ref),
            Some((None,)) => Err(BillingError::Internal(format!(
                "customer ref not persisted for user {}",
                user_id
            ))),
            None => Err(BillingError::UserNotFound(user_id.to_string())),
        }
    }

    async fn apply_update(&self, user_id: Uuid, update: &SubscriptionUpdate) -> BillingResult<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("UPDATE users SET updated_at = NOW()");

        push_field(&mut qb, "billing_subscription_ref", update.subscription_ref.clone());
        push_field(&mut qb, "price_ref", update.price_ref.clone());
        push_field(
            &mut qb,
            "subscription_status",
            update.status.clone().map(|s| s.as_str().to_string()),
        );
        push_field(
            &mut qb,
            "plan",
            update.plan.clone().map(|p| p.as_str().to_string()),
        );
        push_field(&mut qb, "trial_ends_at", update.trial_ends_at.clone());
        push_field(&mut qb, "current_period_end", update.current_period_end.clone());
        if update.latches_trial() {
            qb.push(", trial_consumed = TRUE");
        }

        qb.push(" WHERE id = ").push_bind(user_id);

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_field_update_semantics() {
        let mut slot = Some(1);
        FieldUpdate::Keep.apply(&mut slot);
        assert_eq!(slot, Some(1));
        FieldUpdate::Set(2).apply(&mut slot);
        assert_eq!(slot, Some(2));
        FieldUpdate::Clear.apply(&mut slot);
        assert_eq!(slot, None);
    }

    #[test]
    fn test_set_if_some_keeps_on_none() {
        assert_eq!(FieldUpdate::<i32>::set_if_some(None), FieldUpdate::Keep);
        assert_eq!(FieldUpdate::set_if_some(Some(3)), FieldUpdate::Set(3));
    }

    #[test]
    fn test_clearing_trial_end_keeps_latch() {
        let trial_end = OffsetDateTime::now_utc() + Duration::days(5);
        let mut sub = UserSubscription::default();

        SubscriptionUpdate {
            trial_ends_at: FieldUpdate::Set(trial_end),
            ..Default::default()
        }
        .apply_to(&mut sub);
        assert!(sub.trial_consumed);

        SubscriptionUpdate {
            status: FieldUpdate::Set(SubscriptionStatus::Canceled),
            trial_ends_at: FieldUpdate::Clear,
            ..Default::default()
        }
        .apply_to(&mut sub);

        assert!(sub.trial_ends_at.is_none());
        assert!(sub.had_trial_before());
    }

    #[test]
    fn test_empty_update() {
        assert!(SubscriptionUpdate::default().is_empty());
        assert!(!SubscriptionUpdate {
            mark_trial_consumed: true,
            ..Default::default()
        }
        .is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_pg_customer_ref_is_write_once() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = stockroom_shared::create_pool(&url, 2)
            .await
            .expect("Failed to create pool");
        stockroom_shared::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        let store = PgUserStore::new(pool.clone());
        let user_id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2)")
            .bind(user_id)
            .bind(format!("{}@example.com", user_id))
            .execute(&pool)
            .await
            .expect("insert user");

        let first = store
            .set_customer_ref_if_absent(user_id, "cus_first")
            .await
            .expect("first write");
        let second = store
            .set_customer_ref_if_absent(user_id, "cus_second")
            .await
            .expect("second write");

        assert_eq!(first, "cus_first");
        assert_eq!(second, "cus_first");
    }
}
