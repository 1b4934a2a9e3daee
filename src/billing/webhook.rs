//! Payment provider webhook reconciliation.
//!
//! Verifies signed provider events, parses them into a closed set of kinds
//! and applies each as a subscription transition exactly once.
//!
//! Idempotency is claim-before-apply: the event id is inserted into the
//! store before any effect runs. A redelivery finds the claim and is
//! acknowledged without effect. If applying fails because the store is
//! unavailable, the claim is released so the provider's retry can apply it.
//! Business failures (unknown customer, missing metadata, unknown plan) keep
//! the claim and are reported as [`WebhookOutcome::Skipped`].

use std::sync::Arc;

use chrono::Duration;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::error::{BillingError, Result};
use super::period::{BillingPeriodManager, DEFAULT_PERIOD_DAYS};
use super::plans::{PlanCatalog, PlanId};
use super::provider::NullBillingProvider;
use super::storage::AccountStore;
use super::subscription::{SubscriptionManager, TransitionOutcome};
use super::types::{Account, SubscriptionStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::BillingConfig;
use crate::error::TollgateError;

/// Default maximum age of a signed webhook.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Default retention for processed event ids.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// A verified provider event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub id: String,
    pub kind: ProviderEventKind,
    /// Unix timestamp the provider created the event at.
    pub created: i64,
}

/// The provider events this engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEventKind {
    /// `checkout.session.completed`
    CheckoutCompleted {
        customer_ref: Option<String>,
        subscription_ref: Option<String>,
        user_id: Option<String>,
        plan: Option<String>,
    },
    /// `customer.subscription.created`
    SubscriptionCreated {
        subscription_ref: String,
        customer_ref: Option<String>,
    },
    /// `customer.subscription.updated`
    SubscriptionUpdated {
        subscription_ref: String,
        customer_ref: Option<String>,
        status: String,
    },
    /// `customer.subscription.deleted`
    SubscriptionDeleted {
        subscription_ref: String,
        customer_ref: Option<String>,
    },
    /// `invoice.payment_succeeded` or `invoice.paid`
    PaymentSucceeded {
        customer_ref: Option<String>,
        subscription_ref: Option<String>,
        invoice_ref: Option<String>,
    },
    /// `invoice.payment_failed`
    PaymentFailed {
        customer_ref: Option<String>,
        invoice_ref: Option<String>,
    },
    /// Any other event type.
    Unhandled { event_type: String },
}

impl ProviderEventKind {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::CheckoutCompleted { .. } => "checkout.session.completed",
            Self::SubscriptionCreated { .. } => "customer.subscription.created",
            Self::SubscriptionUpdated { .. } => "customer.subscription.updated",
            Self::SubscriptionDeleted { .. } => "customer.subscription.deleted",
            Self::PaymentSucceeded { .. } => "invoice.payment_succeeded",
            Self::PaymentFailed { .. } => "invoice.payment_failed",
            Self::Unhandled { event_type } => event_type,
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
    #[serde(default)]
    created: i64,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

#[derive(Deserialize)]
struct CheckoutObject {
    customer: Option<String>,
    subscription: Option<String>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

#[derive(Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Option<String>,
    status: Option<String>,
}

#[derive(Deserialize)]
struct InvoiceObject {
    id: Option<String>,
    customer: Option<String>,
    subscription: Option<String>,
}

fn object<T: serde::de::DeserializeOwned>(event_type: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| BillingError::bad_payload(format!("{} object: {}", event_type, e)))
}

impl ProviderEvent {
    pub fn new(id: impl Into<String>, kind: ProviderEventKind) -> Self {
        Self {
            id: id.into(),
            kind,
            created: 0,
        }
    }

    /// Parse a provider event from its JSON body.
    ///
    /// Fails with `BadPayload` on malformed JSON or when a field the event
    /// kind needs (such as the subscription id) is missing.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        let raw: RawEvent = serde_json::from_slice(payload)?;
        if raw.id.is_empty() {
            return Err(BillingError::bad_payload("event id is empty"));
        }

        let event_type = raw.event_type.as_str();
        let kind = match event_type {
            "checkout.session.completed" => {
                let mut session: CheckoutObject = object(event_type, raw.data.object)?;
                ProviderEventKind::CheckoutCompleted {
                    customer_ref: session.customer,
                    subscription_ref: session.subscription,
                    user_id: session.metadata.remove("user_id"),
                    plan: session.metadata.remove("plan"),
                }
            }
            "customer.subscription.created" => {
                let sub: SubscriptionObject = object(event_type, raw.data.object)?;
                ProviderEventKind::SubscriptionCreated {
                    subscription_ref: sub.id,
                    customer_ref: sub.customer,
                }
            }
            "customer.subscription.updated" => {
                let sub: SubscriptionObject = object(event_type, raw.data.object)?;
                let status = sub
                    .status
                    .ok_or_else(|| BillingError::bad_payload("subscription status is missing"))?;
                ProviderEventKind::SubscriptionUpdated {
                    subscription_ref: sub.id,
                    customer_ref: sub.customer,
                    status,
                }
            }
            "customer.subscription.deleted" => {
                let sub: SubscriptionObject = object(event_type, raw.data.object)?;
                ProviderEventKind::SubscriptionDeleted {
                    subscription_ref: sub.id,
                    customer_ref: sub.customer,
                }
            }
            "invoice.payment_succeeded" | "invoice.paid" => {
                let invoice: InvoiceObject = object(event_type, raw.data.object)?;
                ProviderEventKind::PaymentSucceeded {
                    customer_ref: invoice.customer,
                    subscription_ref: invoice.subscription,
                    invoice_ref: invoice.id,
                }
            }
            "invoice.payment_failed" => {
                let invoice: InvoiceObject = object(event_type, raw.data.object)?;
                ProviderEventKind::PaymentFailed {
                    customer_ref: invoice.customer,
                    invoice_ref: invoice.id,
                }
            }
            other => ProviderEventKind::Unhandled {
                event_type: other.to_string(),
            },
        };

        Ok(Self {
            id: raw.id,
            kind,
            created: raw.created,
        })
    }
}

/// Why an event was acknowledged without effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No account is linked to the event's customer.
    UnknownCustomer,
    /// The account named in the event does not exist.
    UnknownUser,
    /// Checkout metadata lacks `user_id` or `plan`.
    MissingMetadata,
    /// The plan named in the event is not sold.
    UnknownPlan,
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event was applied.
    Processed,
    /// Event type is not handled. Nothing was recorded.
    Ignored,
    /// Event was already processed (idempotency).
    AlreadyProcessed,
    /// Event was recorded but had no effect.
    Skipped(SkipReason),
}

/// Webhook reconciler for provider events.
///
/// The webhook secret is stored using [`SecretString`] to prevent accidental
/// exposure in logs or debug output.
pub struct WebhookReconciler<S: AccountStore + Clone> {
    store: S,
    catalog: Arc<PlanCatalog>,
    webhook_secret: SecretString,
    tolerance: Duration,
    clock: Arc<dyn Clock>,
    period_days: u32,
    retention_days: u32,
}

impl<S: AccountStore + Clone> WebhookReconciler<S> {
    pub fn new(
        store: S,
        webhook_secret: impl Into<String>,
        catalog: impl Into<Arc<PlanCatalog>>,
    ) -> Self {
        Self {
            store,
            catalog: catalog.into(),
            webhook_secret: SecretString::from(webhook_secret.into()),
            tolerance: Duration::seconds(DEFAULT_TOLERANCE_SECS),
            clock: Arc::new(SystemClock),
            period_days: DEFAULT_PERIOD_DAYS,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    /// Build a reconciler from billing settings.
    ///
    /// Fails if no webhook secret is configured.
    pub fn from_config(
        store: S,
        config: &BillingConfig,
        catalog: impl Into<Arc<PlanCatalog>>,
    ) -> crate::error::Result<Self> {
        let secret = config
            .webhook_secret
            .as_ref()
            .ok_or_else(|| TollgateError::config("webhook secret is not configured"))?;

        Ok(Self::new(store, secret.expose_secret(), catalog)
            .with_tolerance_secs(config.webhook_tolerance_secs)
            .with_period_days(config.period_days)
            .with_retention_days(config.processed_event_retention_days))
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_tolerance_secs(mut self, secs: i64) -> Self {
        self.tolerance = Duration::seconds(secs);
        self
    }

    #[must_use]
    pub fn with_period_days(mut self, days: u32) -> Self {
        self.period_days = days;
        self
    }

    /// How long processed event ids are kept by [`cleanup_expired`](Self::cleanup_expired).
    #[must_use]
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Verify the signature header and parse the event.
    ///
    /// `signature` is the provider's `t=<unix>,v1=<hex>` header. Nothing is
    /// written to the store.
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<ProviderEvent> {
        let parts = parse_signature_header(signature)?;

        let age = self.clock.now().timestamp() - parts.timestamp;
        if age.abs() > self.tolerance.num_seconds() {
            return Err(BillingError::invalid_signature(format!(
                "timestamp outside tolerance ({} seconds)",
                age
            )));
        }

        let mut signed_payload = format!("{}.", parts.timestamp).into_bytes();
        signed_payload.extend_from_slice(payload);
        let expected = hex::decode(compute_signature(
            self.webhook_secret.expose_secret(),
            &signed_payload,
        )?)
        .map_err(|_| BillingError::invalid_signature("hex decode error"))?;
        let provided = hex::decode(&parts.signature)
            .map_err(|_| BillingError::invalid_signature("signature is not hex"))?;

        if expected.ct_eq(&provided).unwrap_u8() != 1 {
            return Err(BillingError::invalid_signature("signature mismatch"));
        }

        ProviderEvent::from_json(payload).inspect_err(|e| {
            tracing::warn!(
                target: "tollgate::billing::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
        })
    }

    /// Verify and apply a webhook delivery.
    pub async fn process(&self, payload: &[u8], signature: &str) -> Result<WebhookOutcome> {
        let event = self.verify(payload, signature)?;
        self.handle(event).await
    }

    /// Apply a verified event exactly once.
    ///
    /// Only store failures that happen before the transition is written are
    /// returned as errors. The claim is released for those, and the caller
    /// should answer with a retryable status so the provider redelivers.
    pub async fn handle(&self, event: ProviderEvent) -> Result<WebhookOutcome> {
        if let ProviderEventKind::Unhandled { event_type } = &event.kind {
            tracing::debug!(
                target: "tollgate::billing::webhook",
                event_id = %event.id,
                event_type = %event_type,
                "Ignoring unhandled webhook event"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        if !self.store.claim_event(&event.id, self.clock.now()).await? {
            tracing::debug!(
                target: "tollgate::billing::webhook",
                event_id = %event.id,
                "Webhook event already processed"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        match self.apply(&event).await {
            Ok(outcome) => {
                tracing::info!(
                    target: "tollgate::billing::webhook",
                    event_id = %event.id,
                    event_type = event.kind.name(),
                    outcome = ?outcome,
                    "Webhook event reconciled"
                );
                Ok(outcome)
            }
            Err(e) if e.is_retryable() => {
                if let Err(release_err) = self.store.release_event(&event.id).await {
                    tracing::error!(
                        target: "tollgate::billing::webhook",
                        event_id = %event.id,
                        error = %release_err,
                        "Failed to release webhook claim; redelivery will be ignored"
                    );
                }
                tracing::warn!(
                    target: "tollgate::billing::webhook",
                    event_id = %event.id,
                    error = %e,
                    "Webhook event failed, claim released for retry"
                );
                Err(e)
            }
            Err(e) => {
                tracing::warn!(
                    target: "tollgate::billing::webhook",
                    event_id = %event.id,
                    error = %e,
                    "Webhook event could not be applied"
                );
                Ok(WebhookOutcome::Skipped(match e {
                    BillingError::PlanNotFound { .. } => SkipReason::UnknownPlan,
                    BillingError::NotFound { .. } => SkipReason::UnknownUser,
                    _ => SkipReason::MissingMetadata,
                }))
            }
        }
    }

    /// Remove processed event ids older than `older_than_days`.
    pub async fn cleanup_processed(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = self.clock.now() - Duration::days(i64::from(older_than_days));
        let removed = self.store.cleanup_processed_events(cutoff).await?;
        if removed > 0 {
            tracing::info!(
                target: "tollgate::billing::webhook",
                removed,
                older_than_days,
                "Pruned processed webhook events"
            );
        }
        Ok(removed)
    }

    /// Remove processed event ids past the configured retention.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_processed(self.retention_days).await
    }

    async fn apply(&self, event: &ProviderEvent) -> Result<WebhookOutcome> {
        let subscriptions = self.subscriptions();

        let (user_id, outcome) = match &event.kind {
            ProviderEventKind::CheckoutCompleted {
                subscription_ref,
                user_id,
                plan,
                ..
            } => {
                let (Some(user_id), Some(plan)) = (user_id, plan) else {
                    return Ok(WebhookOutcome::Skipped(SkipReason::MissingMetadata));
                };
                let Ok(plan) = plan.parse::<PlanId>() else {
                    return Ok(WebhookOutcome::Skipped(SkipReason::UnknownPlan));
                };
                let outcome = subscriptions
                    .upgrade(user_id, plan, subscription_ref.as_deref())
                    .await?;
                (user_id.clone(), outcome)
            }
            ProviderEventKind::SubscriptionCreated {
                subscription_ref,
                customer_ref,
            } => {
                let Some(account) = self.account_for_customer(customer_ref.as_deref()).await? else {
                    return Ok(WebhookOutcome::Skipped(SkipReason::UnknownCustomer));
                };
                let outcome = subscriptions
                    .attach_subscription_ref(&account.user_id, subscription_ref)
                    .await?;
                (account.user_id, outcome)
            }
            ProviderEventKind::SubscriptionUpdated {
                subscription_ref,
                customer_ref,
                status,
            } => {
                let Some(account) = self.account_for_customer(customer_ref.as_deref()).await? else {
                    return Ok(WebhookOutcome::Skipped(SkipReason::UnknownCustomer));
                };
                let outcome = subscriptions
                    .apply_provider_status(
                        &account.user_id,
                        SubscriptionStatus::from_provider(status),
                        Some(subscription_ref),
                    )
                    .await?;
                (account.user_id, outcome)
            }
            ProviderEventKind::SubscriptionDeleted { customer_ref, .. } => {
                let Some(account) = self.account_for_customer(customer_ref.as_deref()).await? else {
                    return Ok(WebhookOutcome::Skipped(SkipReason::UnknownCustomer));
                };
                let outcome = subscriptions.upgrade(&account.user_id, PlanId::Free, None).await?;
                (account.user_id, outcome)
            }
            ProviderEventKind::PaymentSucceeded {
                customer_ref,
                subscription_ref,
                ..
            } => {
                let Some(account) = self.account_for_customer(customer_ref.as_deref()).await? else {
                    return Ok(WebhookOutcome::Skipped(SkipReason::UnknownCustomer));
                };
                let outcome = subscriptions
                    .apply_provider_status(
                        &account.user_id,
                        SubscriptionStatus::Active,
                        subscription_ref.as_deref(),
                    )
                    .await?;
                (account.user_id, outcome)
            }
            ProviderEventKind::PaymentFailed { customer_ref, .. } => {
                let Some(account) = self.account_for_customer(customer_ref.as_deref()).await? else {
                    return Ok(WebhookOutcome::Skipped(SkipReason::UnknownCustomer));
                };
                let outcome = subscriptions
                    .apply_provider_status(&account.user_id, SubscriptionStatus::PastDue, None)
                    .await?;
                (account.user_id, outcome)
            }
            ProviderEventKind::Unhandled { .. } => return Ok(WebhookOutcome::Ignored),
        };

        if let TransitionOutcome::UnknownUser = outcome {
            return Ok(WebhookOutcome::Skipped(SkipReason::UnknownUser));
        }

        // Committed: the claim stays even if the period check fails
        if let Err(e) = self.periods().maybe_roll(&user_id).await {
            tracing::warn!(
                target: "tollgate::billing::webhook",
                event_id = %event.id,
                user_id = %user_id,
                error = %e,
                "Period check after webhook transition failed"
            );
        }
        Ok(WebhookOutcome::Processed)
    }

    async fn account_for_customer(&self, customer_ref: Option<&str>) -> Result<Option<Account>> {
        match customer_ref {
            Some(customer_ref) => Ok(self.store.find_account_by_customer(customer_ref).await?),
            None => Ok(None),
        }
    }

    fn subscriptions(&self) -> SubscriptionManager<S, NullBillingProvider> {
        SubscriptionManager::new(self.store.clone(), NullBillingProvider, self.catalog.clone())
            .with_clock(self.clock.clone())
            .with_period_days(self.period_days)
    }

    fn periods(&self) -> BillingPeriodManager<S> {
        BillingPeriodManager::new(self.store.clone(), self.catalog.clone())
            .with_clock(self.clock.clone())
            .with_period_days(self.period_days)
    }
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signature: String,
}

/// Parse the `t=<unix>,v1=<hex>` signature header.
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| BillingError::invalid_signature("invalid signature header format"))?;

        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signature = Some(value.trim().to_string()),
            _ => {} // Ignore other versions
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp
            .ok_or_else(|| BillingError::invalid_signature("missing timestamp in signature"))?,
        signature: signature
            .ok_or_else(|| BillingError::invalid_signature("missing v1 signature"))?,
    })
}

/// Compute the hex HMAC-SHA256 of `payload`.
pub(crate) fn compute_signature(secret: &str, payload: &[u8]) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::invalid_signature("unusable webhook secret"))?;

    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
