//! Test fixtures and builders for account data.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::billing::plans::PlanId;
use crate::billing::types::{Account, SubscriptionStatus};

/// Helper functions for generating fake test data
pub mod fake {
    use super::*;

    /// Generate a fake email address
    pub fn email() -> String {
        format!("test-{}@example.com", Uuid::new_v4().simple())
    }

    /// Generate a fake user id
    pub fn user_id() -> String {
        format!("user_{}", &Uuid::new_v4().simple().to_string()[..12])
    }

    /// Generate a fake name
    pub fn name() -> String {
        format!("Test User {}", &Uuid::new_v4().simple().to_string()[..8])
    }

    /// Generate a fake provider event id
    pub fn event_id() -> String {
        format!("evt_{}", Uuid::new_v4().simple())
    }
}

/// Builder for accounts in a known state.
#[derive(Debug, Clone, Default)]
pub struct TestAccount {
    user_id: Option<String>,
    email: Option<String>,
    plan: Option<PlanId>,
    status: Option<SubscriptionStatus>,
    customer_ref: Option<String>,
    subscription_ref: Option<String>,
    requests_used: u64,
}

impl TestAccount {
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn on_plan(mut self, plan: PlanId) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_status(mut self, status: SubscriptionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_customer(mut self, customer_ref: impl Into<String>) -> Self {
        self.customer_ref = Some(customer_ref.into());
        self
    }

    pub fn with_subscription(mut self, subscription_ref: impl Into<String>) -> Self {
        self.subscription_ref = Some(subscription_ref.into());
        self
    }

    pub fn with_requests_used(mut self, used: u64) -> Self {
        self.requests_used = used;
        self
    }

    /// Build an account whose period starts at `now`.
    pub fn build(self, now: DateTime<Utc>, period_days: u32) -> Account {
        let mut account = Account::new(
            self.user_id.unwrap_or_else(fake::user_id),
            self.email.unwrap_or_else(fake::email),
            now,
            period_days,
        );
        account.plan = self.plan.unwrap_or(PlanId::Free);
        account.status = self.status.unwrap_or(SubscriptionStatus::Active);
        account.customer_ref = self.customer_ref;
        account.subscription_ref = self.subscription_ref;
        account.requests_used = self.requests_used;
        account
    }
}
