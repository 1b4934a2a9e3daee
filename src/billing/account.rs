//! Account registration and the subscription overview.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::{BillingError, Result};
use super::period::DEFAULT_PERIOD_DAYS;
use super::plans::{PlanCatalog, PlanId};
use super::storage::{AccountStore, StoreError};
use super::types::{
    Account, RequestQuota, SubscriptionAction, SubscriptionEvent, SubscriptionStatus,
};
use crate::clock::{Clock, SystemClock};

/// Details for a new account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
}

impl NewAccount {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            name: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// What a user sees about their subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionOverview {
    pub user_id: String,
    pub plan: PlanId,
    pub plan_name: String,
    pub status: SubscriptionStatus,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub requests_used: u64,
    pub request_limit: u64,
    pub requests_remaining: u64,
}

/// Creates accounts and reads them back.
#[derive(Clone)]
pub struct AccountManager<S: AccountStore> {
    store: S,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
    period_days: u32,
}

impl<S: AccountStore> AccountManager<S> {
    pub fn new(store: S, catalog: impl Into<Arc<PlanCatalog>>) -> Self {
        Self {
            store,
            catalog: catalog.into(),
            clock: Arc::new(SystemClock),
            period_days: DEFAULT_PERIOD_DAYS,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_period_days(mut self, days: u32) -> Self {
        self.period_days = days;
        self
    }

    /// Create a free, active account whose first period starts now.
    ///
    /// Writes the quota projection and a `created` history entry.
    pub async fn register(&self, new_account: NewAccount) -> Result<Account> {
        if new_account.user_id.trim().is_empty() {
            return Err(BillingError::invalid_state("user id is empty"));
        }
        if !new_account.email.contains('@') {
            return Err(BillingError::invalid_state("email address is invalid"));
        }

        let free = self.catalog.require(PlanId::Free)?;
        let now = self.clock.now();

        let mut account =
            Account::new(new_account.user_id, new_account.email, now, self.period_days);
        account.name = new_account.name;

        match self.store.insert_account(&account).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                return Err(BillingError::invalid_state(format!(
                    "account {} already exists",
                    account.user_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        // The insert is the commit point; a retry would only see a duplicate
        let quota = RequestQuota::project(&account, free.request_limit, now);
        if let Err(e) = self.store.save_quota(&quota).await {
            tracing::warn!(
                target: "tollgate::billing::account",
                user_id = %account.user_id,
                error = %e,
                "Quota projection not written for new account"
            );
        }

        let event =
            SubscriptionEvent::new(&account.user_id, PlanId::Free, SubscriptionAction::Created, now)
                .with_amount(0, free.currency.clone());
        if let Err(e) = self.store.append_subscription_event(&event).await {
            tracing::error!(
                target: "tollgate::billing::account",
                user_id = %account.user_id,
                error = %e,
                "Registration history entry lost"
            );
        }

        tracing::info!(
            target: "tollgate::billing::account",
            user_id = %account.user_id,
            "Account registered"
        );

        Ok(account)
    }

    /// Look up an account.
    pub async fn get(&self, user_id: &str) -> Result<Account> {
        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| BillingError::not_found(user_id))
    }

    /// The user's plan, status, provider references and usage.
    pub async fn overview(&self, user_id: &str) -> Result<SubscriptionOverview> {
        let account = self.get(user_id).await?;
        let plan = self.catalog.require(account.plan)?;

        Ok(SubscriptionOverview {
            plan_name: plan.name(),
            request_limit: plan.request_limit,
            requests_remaining: plan.request_limit.saturating_sub(account.requests_used),
            user_id: account.user_id,
            plan: account.plan,
            status: account.status,
            customer_ref: account.customer_ref,
            subscription_ref: account.subscription_ref,
            period_start: account.period.start,
            period_end: account.period.end,
            requests_used: account.requests_used,
        })
    }
}
