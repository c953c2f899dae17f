//! Stripe customer management

use stockroom_shared::UserRecord;

use crate::error::BillingResult;
use crate::provider::BillingProvider;
use crate::store::UserStore;

/// Return the user's customer ID, creating and storing one if needed.
///
/// The ref is stored right after creation through a write-once update, so a
/// concurrent checkout for the same user converges on whichever ref landed first.
pub async fn get_or_create_customer(
    store: &dyn UserStore,
    provider: &dyn BillingProvider,
    user: &UserRecord,
) -> BillingResult<String> {
    if let Some(existing) = &user.subscription.billing_customer_ref {
        return Ok(existing.clone());
    }

    let created = provider.create_customer(user.id, &user.email).await?;
    let stored = store.set_customer_ref_if_absent(user.id, &created).await?;

    if stored != created {
        tracing::warn!(
            user_id = %user.id,
            created_customer_id = %created,
            stored_customer_id = %stored,
            "Customer ref already stored by a concurrent request; using stored ref"
        );
    } else {
        tracing::info!(
            user_id = %user.id,
            customer_id = %stored,
            "Stored Stripe customer for user"
        );
    }

    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, MemoryUserStore};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_existing_customer_is_reused_without_provider_call() {
        let store = MemoryUserStore::new();
        let provider = FakeProvider::new();
        let mut user = UserRecord::new(Uuid::new_v4(), "a@example.com");
        user.subscription.billing_customer_ref = Some("cus_existing".to_string());
        store.insert(user.clone()).await;

        let id = get_or_create_customer(&store, &provider, &user).await.ok();
        assert_eq!(id.as_deref(), Some("cus_existing"));
        assert!(provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_new_customer_is_persisted() {
        let store = MemoryUserStore::new();
        let provider = FakeProvider::new();
        let user = UserRecord::new(Uuid::new_v4(), "b@example.com");
        store.insert(user.clone()).await;

        let id = get_or_create_customer(&store, &provider, &user).await.ok();
        let stored = store
            .get(user.id)
            .await
            .and_then(|u| u.subscription.billing_customer_ref);
        assert!(id.is_some());
        assert_eq!(id, stored);
    }

    #[tokio::test]
    async fn test_concurrent_winner_is_kept() {
        let store = MemoryUserStore::new();
        let provider = FakeProvider::new();
        let user = UserRecord::new(Uuid::new_v4(), "c@example.com");
        store.insert(user.clone()).await;

        // Another request stored a ref after `user` was loaded
        store
            .set_customer_ref_if_absent(user.id, "cus_winner")
            .await
            .ok();

        let id = get_or_create_customer(&store, &provider, &user).await.ok();
        assert_eq!(id.as_deref(), Some("cus_winner"));
    }
}
