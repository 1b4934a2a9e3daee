//! Subscription state transitions.
//!
//! Owns an account's plan, status and provider references. Plan changes
//! and cancellations are appended to the subscription history; mirrored
//! provider statuses are not.

use std::sync::Arc;

use super::error::Result;
use super::period::BillingPeriodManager;
use super::plans::{PlanCatalog, PlanId};
use super::provider::BillingProvider;
use super::storage::AccountStore;
use super::types::{
    Account, AccountUpdate, SubscriptionAction, SubscriptionEvent, SubscriptionStatus,
};
use crate::clock::{Clock, SystemClock};
use crate::config::BillingConfig;

/// Default number of history entries returned.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Result of a subscription transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The transition was written; holds the updated account.
    Applied(Account),
    /// No account exists for the user. Nothing was written.
    UnknownUser,
}

impl TransitionOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    #[must_use]
    pub fn account(&self) -> Option<&Account> {
        match self {
            Self::Applied(account) => Some(account),
            Self::UnknownUser => None,
        }
    }
}

/// Subscription manager.
pub struct SubscriptionManager<S: AccountStore + Clone, P: BillingProvider> {
    store: S,
    provider: P,
    catalog: Arc<PlanCatalog>,
    periods: BillingPeriodManager<S>,
    clock: Arc<dyn Clock>,
    history_limit: usize,
}

impl<S: AccountStore + Clone, P: BillingProvider> SubscriptionManager<S, P> {
    pub fn new(store: S, provider: P, catalog: impl Into<Arc<PlanCatalog>>) -> Self {
        let catalog = catalog.into();
        Self {
            periods: BillingPeriodManager::new(store.clone(), catalog.clone()),
            store,
            provider,
            catalog,
            clock: Arc::new(SystemClock),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Build a manager with the period length and history limit from `config`.
    pub fn from_config(
        store: S,
        provider: P,
        catalog: impl Into<Arc<PlanCatalog>>,
        config: &BillingConfig,
    ) -> Self {
        Self::new(store, provider, catalog)
            .with_period_days(config.period_days)
            .with_history_limit(config.history_limit)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.periods = self.periods.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_period_days(mut self, days: u32) -> Self {
        self.periods = self.periods.with_period_days(days);
        self
    }

    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Move the user to `plan`, mark them active and start a fresh period.
    ///
    /// The history entry is `upgraded`, `downgraded` when the new plan is
    /// cheaper, or `renewed` when the plan does not change.
    pub async fn upgrade(
        &self,
        user_id: &str,
        plan: PlanId,
        subscription_ref: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let definition = self.catalog.require(plan)?;

        let Some(current) = self.store.get_account(user_id).await? else {
            return Ok(self.unknown_user(user_id, "upgrade"));
        };
        let action = self.plan_change_action(current.plan, plan);

        let update = AccountUpdate::new()
            .plan(plan)
            .status(SubscriptionStatus::Active)
            .subscription_ref(subscription_ref.map(str::to_string))
            .new_period(self.periods.next_period());
        let now = self.clock.now();
        let Some(account) = self.store.update_account(user_id, &update, now).await? else {
            return Ok(self.unknown_user(user_id, "upgrade"));
        };

        // The account write is the commit point. Failures past it are logged
        // so a retry never applies the transition twice.
        if let Err(e) = self.periods.write_projection(user_id).await {
            tracing::warn!(
                target: "tollgate::billing::subscription",
                user_id,
                error = %e,
                "Quota projection not refreshed after plan change"
            );
        }

        let event = SubscriptionEvent::new(user_id, plan, action, now)
            .with_amount(definition.price_cents, definition.currency.clone())
            .with_subscription_ref(account.subscription_ref.clone())
            .with_metadata("previous_plan", current.plan.as_str());
        self.record_event(&event).await;

        tracing::info!(
            target: "tollgate::billing::subscription",
            user_id,
            from = %current.plan,
            to = %plan,
            action = %action,
            "Subscription plan changed"
        );

        Ok(TransitionOutcome::Applied(account))
    }

    /// Cancel the user's subscription.
    ///
    /// If the provider holds a subscription it is told to stop renewing
    /// first; a provider failure leaves local state untouched. The plan is
    /// kept until the provider reports the subscription deleted.
    pub async fn cancel(&self, user_id: &str) -> Result<TransitionOutcome> {
        let Some(current) = self.store.get_account(user_id).await? else {
            return Ok(self.unknown_user(user_id, "cancel"));
        };

        if let Some(subscription_ref) = current.subscription_ref.as_deref() {
            if let Err(e) = self.provider.cancel_at_period_end(subscription_ref).await {
                tracing::warn!(
                    target: "tollgate::billing::subscription",
                    user_id,
                    subscription_ref,
                    error = %e,
                    "Provider refused cancellation"
                );
                return Err(e);
            }
        }

        let now = self.clock.now();
        let update = AccountUpdate::new().status(SubscriptionStatus::Canceled);
        let Some(account) = self.store.update_account(user_id, &update, now).await? else {
            return Ok(self.unknown_user(user_id, "cancel"));
        };

        let currency = self
            .catalog
            .get(account.plan)
            .map(|p| p.currency.clone())
            .unwrap_or_else(|| "usd".to_string());
        let event = SubscriptionEvent::new(user_id, account.plan, SubscriptionAction::Canceled, now)
            .with_amount(0, currency)
            .with_subscription_ref(account.subscription_ref.clone());
        self.record_event(&event).await;

        tracing::info!(
            target: "tollgate::billing::subscription",
            user_id,
            plan = %account.plan,
            "Subscription canceled"
        );

        Ok(TransitionOutcome::Applied(account))
    }

    /// Mirror a status reported by the provider. No history is written.
    pub async fn apply_provider_status(
        &self,
        user_id: &str,
        status: SubscriptionStatus,
        subscription_ref: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let update = AccountUpdate::new()
            .status(status)
            .subscription_ref(subscription_ref.map(str::to_string));

        match self.store.update_account(user_id, &update, self.clock.now()).await? {
            Some(account) => {
                tracing::info!(
                    target: "tollgate::billing::subscription",
                    user_id,
                    status = %status,
                    "Subscription status updated from provider"
                );
                Ok(TransitionOutcome::Applied(account))
            }
            None => Ok(self.unknown_user(user_id, "apply_provider_status")),
        }
    }

    /// Record the provider's subscription reference on the account.
    pub async fn attach_subscription_ref(
        &self,
        user_id: &str,
        subscription_ref: &str,
    ) -> Result<TransitionOutcome> {
        let update = AccountUpdate::new().subscription_ref(Some(subscription_ref.to_string()));

        match self.store.update_account(user_id, &update, self.clock.now()).await? {
            Some(account) => {
                tracing::debug!(
                    target: "tollgate::billing::subscription",
                    user_id,
                    subscription_ref,
                    "Subscription reference attached"
                );
                Ok(TransitionOutcome::Applied(account))
            }
            None => Ok(self.unknown_user(user_id, "attach_subscription_ref")),
        }
    }

    /// Subscription history, newest first.
    pub async fn history(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SubscriptionEvent>> {
        let limit = limit.unwrap_or(self.history_limit);
        Ok(self.store.list_subscription_events(user_id, limit).await?)
    }

    async fn record_event(&self, event: &SubscriptionEvent) {
        if let Err(e) = self.store.append_subscription_event(event).await {
            tracing::error!(
                target: "tollgate::billing::subscription",
                user_id = %event.user_id,
                action = %event.action,
                error = %e,
                "Subscription history entry lost after committed transition"
            );
        }
    }

    fn plan_change_action(&self, from: PlanId, to: PlanId) -> SubscriptionAction {
        if from == to {
            return SubscriptionAction::Renewed;
        }
        match (self.catalog.get(from), self.catalog.get(to)) {
            (Some(old), Some(new)) if new.price_cents < old.price_cents => {
                SubscriptionAction::Downgraded
            }
            _ => SubscriptionAction::Upgraded,
        }
    }

    fn unknown_user(&self, user_id: &str, operation: &'static str) -> TransitionOutcome {
        tracing::warn!(
            target: "tollgate::billing::subscription",
            user_id,
            operation,
            "Subscription transition for unknown user ignored"
        );
        TransitionOutcome::UnknownUser
    }
}
