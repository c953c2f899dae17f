//! Stripe webhook verification and reconciliation
//!
//! Events may arrive late, twice, or out of order. Handlers therefore never
//! apply deltas: each one resolves the user, fetches the live subscription from
//! Stripe and overwrites the complete set of fields it owns. Delivering an event
//! twice, or two events in either order, converges on the same stored state.
//!
//! Raw payloads are mapped to [`WebhookEvent`] before any business logic runs;
//! timestamps that are not valid instants are dropped at that point.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use stockroom_shared::{SubscriptionStatus, UserRecord};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, ProviderSubscription};
use crate::resolve::{resolve_plan, resolve_user, PlanHints, PlanStrategy, UserHints, UserStrategy};
use crate::store::{FieldUpdate, SubscriptionUpdate, UserStore};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook, in seconds
pub const SIGNATURE_TOLERANCE_SECS: u64 = 300;

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against the raw body
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    if signatures.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid);
    }
    if now_unix.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            signed_at = timestamp,
            now = now_unix,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes())));

    if matched {
        Ok(())
    } else {
        Err(BillingError::WebhookSignatureInvalid)
    }
}

// =============================================================================
// Event DTOs
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub kind: String,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionChanged(SubscriptionEvent),
    SubscriptionDeleted(SubscriptionEvent),
    InvoicePaid(InvoiceEvent),
    InvoicePaymentFailed(InvoiceEvent),
    CustomerCreated(CustomerEvent),
    /// Kinds the reconciler does not act on
    Unhandled,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub mode: Option<String>,
    pub metadata: HashMap<String, String>,
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub subscription_id: Option<String>,
}

impl CheckoutCompleted {
    pub fn metadata_user_id(&self) -> Option<&str> {
        self.metadata
            .get("userId")
            .or_else(|| self.metadata.get("user_id"))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub subscription_id: String,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceEvent {
    pub invoice_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerEvent {
    pub customer_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: RawData,
}

#[derive(Debug, Deserialize)]
struct RawData {
    object: Value,
}

fn str_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// An ID that may be delivered bare or as an expanded object
fn id_field(obj: &Value, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(expanded) => expanded
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn metadata_field(obj: &Value) -> HashMap<String, String> {
    obj.get("metadata")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn required_id(obj: &Value, kind: &str) -> BillingResult<String> {
    str_field(obj, "id")
        .ok_or_else(|| BillingError::WebhookPayload(format!("{} object has no id", kind)))
}

impl WebhookEvent {
    /// Map a raw event body into a typed event
    pub fn parse(payload: &str) -> BillingResult<Self> {
        let raw: RawEnvelope = serde_json::from_str(payload)
            .map_err(|e| BillingError::WebhookPayload(e.to_string()))?;
        let obj = &raw.data.object;

        let payload = match raw.kind.as_str() {
            "checkout.session.completed" => EventPayload::CheckoutCompleted(CheckoutCompleted {
                session_id: required_id(obj, &raw.kind)?,
                mode: str_field(obj, "mode"),
                metadata: metadata_field(obj),
                customer_id: id_field(obj, "customer"),
                email: obj
                    .get("customer_details")
                    .and_then(|d| str_field(d, "email"))
                    .or_else(|| str_field(obj, "customer_email")),
                subscription_id: id_field(obj, "subscription"),
            }),
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => {
                let event = SubscriptionEvent {
                    subscription_id: required_id(obj, &raw.kind)?,
                    customer_id: id_field(obj, "customer"),
                };
                if raw.kind == "customer.subscription.deleted" {
                    EventPayload::SubscriptionDeleted(event)
                } else {
                    EventPayload::SubscriptionChanged(event)
                }
            }
            "invoice.payment_succeeded" | "invoice.paid" | "invoice.payment_failed" => {
                let event = InvoiceEvent {
                    invoice_id: required_id(obj, &raw.kind)?,
                    customer_id: id_field(obj, "customer"),
                    subscription_id: id_field(obj, "subscription"),
                };
                if raw.kind == "invoice.payment_failed" {
                    EventPayload::InvoicePaymentFailed(event)
                } else {
                    EventPayload::InvoicePaid(event)
                }
            }
            "customer.created" => EventPayload::CustomerCreated(CustomerEvent {
                customer_id: required_id(obj, &raw.kind)?,
                email: str_field(obj, "email"),
            }),
            _ => EventPayload::Unhandled,
        };

        Ok(Self {
            id: raw.id,
            kind: raw.kind,
            payload,
        })
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnhandledKind,
    NotSubscriptionMode,
    UserNotFound,
    MissingSubscription,
    /// Event concerns a subscription the user has since replaced
    StaleSubscription,
    CustomerAlreadyLinked,
    MissingEmail,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::UnhandledKind => "unhandled_kind",
            IgnoreReason::NotSubscriptionMode => "not_subscription_mode",
            IgnoreReason::UserNotFound => "user_not_found",
            IgnoreReason::MissingSubscription => "missing_subscription",
            IgnoreReason::StaleSubscription => "stale_subscription",
            IgnoreReason::CustomerAlreadyLinked => "customer_already_linked",
            IgnoreReason::MissingEmail => "missing_email",
        }
    }
}

/// What a delivery did. Both variants are acknowledged to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied { user_id: Uuid },
    Ignored(IgnoreReason),
}

/// Status and trial fields derived from a live subscription.
///
/// A cancellation signal (scheduled or effective) while the trial end is still
/// ahead revokes the trial at once: the status is forced to canceled and both
/// the trial end and the period end are cleared, whatever status Stripe sent.
fn lifecycle_update(live: &ProviderSubscription, now: OffsetDateTime) -> SubscriptionUpdate {
    let trial_in_future = live.trial_end.is_some_and(|end| end > now);
    let revoked_trial = live.has_cancellation_signal()
        && trial_in_future
        && matches!(
            live.status,
            SubscriptionStatus::Trialing | SubscriptionStatus::Canceled
        );

    if revoked_trial {
        SubscriptionUpdate {
            status: FieldUpdate::Set(SubscriptionStatus::Canceled),
            trial_ends_at: FieldUpdate::Clear,
            current_period_end: FieldUpdate::Clear,
            mark_trial_consumed: true,
            ..Default::default()
        }
    } else {
        SubscriptionUpdate {
            status: FieldUpdate::Set(live.status),
            trial_ends_at: FieldUpdate::set_if_some(live.trial_end),
            current_period_end: FieldUpdate::set_if_some(live.current_period_end),
            mark_trial_consumed: live.trial_end.is_some(),
            ..Default::default()
        }
    }
}

/// A terminal update for anything but the user's current subscription.
///
/// After a deletion the ref is cleared, so late events for the deleted
/// subscription land here too.
fn is_stale(user: &UserRecord, subscription_id: &str, status: SubscriptionStatus) -> bool {
    status.is_terminal()
        && user.subscription.billing_subscription_ref.as_deref() != Some(subscription_id)
}

#[derive(Clone)]
pub struct WebhookHandler {
    config: Arc<StripeConfig>,
    store: Arc<dyn UserStore>,
    provider: Arc<dyn BillingProvider>,
}

impl WebhookHandler {
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

    /// Verify the signature and map the body. Nothing is written on failure.
    pub fn verify_event(&self, payload: &str, signature_header: &str) -> BillingResult<WebhookEvent> {
        let secret = self
            .config
            .webhook_secret
            .as_deref()
            .ok_or(BillingError::WebhookSecretMissing)?;

        verify_signature(
            payload,
            signature_header,
            secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        WebhookEvent::parse(payload)
    }

    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let outcome = match &event.payload {
            EventPayload::CheckoutCompleted(session) => self.checkout_completed(session).await?,
            EventPayload::SubscriptionChanged(sub) => self.subscription_changed(sub).await?,
            EventPayload::SubscriptionDeleted(sub) => self.subscription_deleted(sub).await?,
            EventPayload::InvoicePaid(invoice) => self.invoice_paid(invoice).await?,
            EventPayload::InvoicePaymentFailed(invoice) => self.invoice_failed(invoice).await?,
            EventPayload::CustomerCreated(customer) => self.customer_created(customer).await?,
            EventPayload::Unhandled => WebhookOutcome::Ignored(IgnoreReason::UnhandledKind),
        };

        match outcome {
            WebhookOutcome::Applied { user_id } => tracing::info!(
                event_id = %event.id,
                event_type = %event.kind,
                user_id = %user_id,
                "Webhook applied"
            ),
            WebhookOutcome::Ignored(IgnoreReason::UnhandledKind) => tracing::debug!(
                event_id = %event.id,
                event_type = %event.kind,
                "Unhandled webhook event type"
            ),
            WebhookOutcome::Ignored(reason) => tracing::warn!(
                event_id = %event.id,
                event_type = %event.kind,
                reason = reason.as_str(),
                "Webhook acknowledged without changes"
            ),
        }

        Ok(outcome)
    }

    async fn backfill_customer(&self, user: &UserRecord, customer_id: Option<&str>) -> BillingResult<()> {
        if user.subscription.billing_customer_ref.is_some() {
            return Ok(());
        }
        if let Some(customer_id) = customer_id {
            let stored = self
                .store
                .set_customer_ref_if_absent(user.id, customer_id)
                .await?;
            tracing::info!(
                user_id = %user.id,
                customer_id = %stored,
                "Backfilled customer ref from webhook"
            );
        }
        Ok(())
    }

    async fn checkout_completed(&self, session: &CheckoutCompleted) -> BillingResult<WebhookOutcome> {
        if session.mode.as_deref() != Some("subscription") {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::NotSubscriptionMode));
        }

        let hints = UserHints {
            metadata_user_id: session.metadata_user_id(),
            customer_id: session.customer_id.as_deref(),
            email: session.email.as_deref(),
        };
        let Some(resolved) = resolve_user(
            &[UserStrategy::Metadata, UserStrategy::Email],
            &hints,
            self.store.as_ref(),
            self.provider.as_ref(),
        )
        .await?
        else {
            tracing::warn!(
                session_id = %session.session_id,
                email = ?session.email,
                "Checkout completed for unknown user"
            );
            return Ok(WebhookOutcome::Ignored(IgnoreReason::UserNotFound));
        };
        let user = resolved.user;

        let Some(subscription_id) = session.subscription_id.as_deref() else {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::MissingSubscription));
        };

        let live = self.provider.retrieve_subscription(subscription_id).await?;

        let metadata = if session.metadata.contains_key("plan") {
            &session.metadata
        } else {
            &live.metadata
        };
        let plan = resolve_plan(
            &[
                PlanStrategy::Metadata,
                PlanStrategy::ExactPrice,
                PlanStrategy::AmountThreshold,
            ],
            &PlanHints {
                metadata: Some(metadata),
                price_id: live.price_id.as_deref(),
                unit_amount: live.unit_amount,
            },
            &self.config,
        );

        let update = SubscriptionUpdate {
            subscription_ref: FieldUpdate::Set(live.id.clone()),
            price_ref: FieldUpdate::set_if_some(live.price_id.clone()),
            plan: FieldUpdate::set_if_some(plan.map(|(p, _)| p)),
            ..lifecycle_update(&live, OffsetDateTime::now_utc())
        };

        self.store.apply_update(user.id, &update).await?;
        self.backfill_customer(&user, session.customer_id.as_deref().or(live.customer_id.as_deref()))
            .await?;

        tracing::info!(
            user_id = %user.id,
            subscription_id = %live.id,
            status = %live.status,
            plan = ?plan.map(|(p, _)| p),
            "Checkout reconciled"
        );

        Ok(WebhookOutcome::Applied { user_id: user.id })
    }

    async fn subscription_changed(&self, event: &SubscriptionEvent) -> BillingResult<WebhookOutcome> {
        let hints = UserHints {
            customer_id: event.customer_id.as_deref(),
            ..Default::default()
        };
        let Some(resolved) = resolve_user(
            &[UserStrategy::CustomerRef, UserStrategy::ProviderCustomerEmail],
            &hints,
            self.store.as_ref(),
            self.provider.as_ref(),
        )
        .await?
        else {
            tracing::warn!(
                subscription_id = %event.subscription_id,
                customer_id = ?event.customer_id,
                "Subscription event for unknown customer"
            );
            return Ok(WebhookOutcome::Ignored(IgnoreReason::UserNotFound));
        };
        let backfill = resolved.needs_customer_backfill(&hints);
        let user = resolved.user;

        let live = self
            .provider
            .retrieve_subscription(&event.subscription_id)
            .await?;

        if is_stale(&user, &live.id, live.status) {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::StaleSubscription));
        }

        let plan = resolve_plan(
            &[PlanStrategy::ExactPrice, PlanStrategy::AmountThreshold],
            &PlanHints {
                metadata: None,
                price_id: live.price_id.as_deref(),
                unit_amount: live.unit_amount,
            },
            &self.config,
        );

        let lifecycle = lifecycle_update(&live, OffsetDateTime::now_utc());
        if lifecycle.trial_ends_at == FieldUpdate::Clear {
            tracing::info!(
                user_id = %user.id,
                subscription_id = %live.id,
                provider_status = %live.status,
                cancel_at_period_end = live.cancel_at_period_end,
                "Trial canceled; revoking access immediately"
            );
        }

        let update = SubscriptionUpdate {
            subscription_ref: FieldUpdate::Set(live.id.clone()),
            price_ref: FieldUpdate::set_if_some(live.price_id.clone()),
            plan: FieldUpdate::set_if_some(plan.map(|(p, _)| p)),
            ..lifecycle
        };

        self.store.apply_update(user.id, &update).await?;
        self.backfill_customer(&user, backfill).await?;

        Ok(WebhookOutcome::Applied { user_id: user.id })
    }

    async fn subscription_deleted(&self, event: &SubscriptionEvent) -> BillingResult<WebhookOutcome> {
        let Some(customer_id) = event.customer_id.as_deref() else {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::UserNotFound));
        };
        let Some(user) = self.store.find_by_customer_ref(customer_id).await? else {
            tracing::warn!(
                subscription_id = %event.subscription_id,
                customer_id = %customer_id,
                "Subscription deleted for unknown customer"
            );
            return Ok(WebhookOutcome::Ignored(IgnoreReason::UserNotFound));
        };

        if is_stale(&user, &event.subscription_id, SubscriptionStatus::Canceled) {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::StaleSubscription));
        }

        let update = SubscriptionUpdate {
            status: FieldUpdate::Set(SubscriptionStatus::Canceled),
            plan: FieldUpdate::Clear,
            subscription_ref: FieldUpdate::Clear,
            price_ref: FieldUpdate::Clear,
            ..Default::default()
        };
        self.store.apply_update(user.id, &update).await?;

        Ok(WebhookOutcome::Applied { user_id: user.id })
    }

    async fn invoice_user(&self, invoice: &InvoiceEvent) -> BillingResult<Option<UserRecord>> {
        match invoice.customer_id.as_deref() {
            Some(customer_id) => self.store.find_by_customer_ref(customer_id).await,
            None => Ok(None),
        }
    }

    async fn invoice_paid(&self, invoice: &InvoiceEvent) -> BillingResult<WebhookOutcome> {
        let Some(user) = self.invoice_user(invoice).await? else {
            tracing::warn!(invoice_id = %invoice.invoice_id, "Invoice paid for unknown customer");
            return Ok(WebhookOutcome::Ignored(IgnoreReason::UserNotFound));
        };

        let Some(subscription_id) = invoice
            .subscription_id
            .as_deref()
            .or(user.subscription.billing_subscription_ref.as_deref())
        else {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::MissingSubscription));
        };

        let live = self.provider.retrieve_subscription(subscription_id).await?;
        if is_stale(&user, &live.id, live.status) {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::StaleSubscription));
        }

        let lifecycle = lifecycle_update(&live, OffsetDateTime::now_utc());
        let update = SubscriptionUpdate {
            status: lifecycle.status,
            current_period_end: lifecycle.current_period_end,
            // Only a revoked trial touches the trial end here
            trial_ends_at: match lifecycle.trial_ends_at {
                FieldUpdate::Clear => FieldUpdate::Clear,
                _ => FieldUpdate::Keep,
            },
            mark_trial_consumed: lifecycle.mark_trial_consumed,
            ..Default::default()
        };
        self.store.apply_update(user.id, &update).await?;

        Ok(WebhookOutcome::Applied { user_id: user.id })
    }

    async fn invoice_failed(&self, invoice: &InvoiceEvent) -> BillingResult<WebhookOutcome> {
        let Some(user) = self.invoice_user(invoice).await? else {
            tracing::warn!(invoice_id = %invoice.invoice_id, "Invoice failed for unknown customer");
            return Ok(WebhookOutcome::Ignored(IgnoreReason::UserNotFound));
        };

        if let Some(subscription_id) = invoice.subscription_id.as_deref() {
            if user.subscription.billing_subscription_ref.as_deref() != Some(subscription_id) {
                tracing::info!(
                    user_id = %user.id,
                    invoice_id = %invoice.invoice_id,
                    subscription_id = %subscription_id,
                    "Ignoring failed invoice for a replaced subscription"
                );
                return Ok(WebhookOutcome::Ignored(IgnoreReason::StaleSubscription));
            }
        }

        let update = SubscriptionUpdate {
            status: FieldUpdate::Set(SubscriptionStatus::PastDue),
            ..Default::default()
        };
        self.store.apply_update(user.id, &update).await?;

        tracing::warn!(
            user_id = %user.id,
            invoice_id = %invoice.invoice_id,
            "Invoice payment failed; subscription marked past_due"
        );

        Ok(WebhookOutcome::Applied { user_id: user.id })
    }

    async fn customer_created(&self, customer: &CustomerEvent) -> BillingResult<WebhookOutcome> {
        let Some(email) = customer.email.as_deref() else {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::MissingEmail));
        };
        let Some(user) = self.store.find_by_email(email).await? else {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::UserNotFound));
        };
        if user.subscription.billing_customer_ref.is_some() {
            return Ok(WebhookOutcome::Ignored(IgnoreReason::CustomerAlreadyLinked));
        }

        self.backfill_customer(&user, Some(&customer.customer_id))
            .await?;
        Ok(WebhookOutcome::Applied { user_id: user.id })
    }
}
