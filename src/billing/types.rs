//! Records persisted by the account store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plans::PlanId;

/// Local subscription status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription is active and paid (or free).
    Active,
    /// Subscription has been canceled.
    Canceled,
    /// Payment failed; access continues until the provider gives up.
    PastDue,
    /// Awaiting the first payment.
    Incomplete,
}

impl SubscriptionStatus {
    /// Map a provider subscription status onto the local status set.
    ///
    /// `trialing` counts as active and `unpaid` as past due. Anything
    /// unrecognised (`incomplete_expired`, `paused`, ...) is treated as canceled.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" | "trialing" => Self::Active,
            "past_due" | "unpaid" => Self::PastDue,
            "incomplete" => Self::Incomplete,
            "canceled" => Self::Canceled,
            _ => Self::Canceled,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::PastDue => "past_due",
            Self::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A half-open billing window `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>, days: u32) -> Self {
        Self {
            start,
            end: start + Duration::days(i64::from(days)),
        }
    }

    /// The period is over once `now` is strictly past its end.
    #[must_use]
    pub fn has_elapsed(&self, now: DateTime<Utc>) -> bool {
        now > self.end
    }

    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// A user account with its subscription and quota counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub plan: PlanId,
    pub status: SubscriptionStatus,
    /// Provider customer reference.
    pub customer_ref: Option<String>,
    /// Provider subscription reference.
    pub subscription_ref: Option<String>,
    pub period: BillingPeriod,
    /// Requests admitted in the current period.
    pub requests_used: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A fresh free-plan account whose first period starts at `now`.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        email: impl Into<String>,
        now: DateTime<Utc>,
        period_days: u32,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            name: None,
            plan: PlanId::Free,
            status: SubscriptionStatus::Active,
            customer_ref: None,
            subscription_ref: None,
            period: BillingPeriod::starting_at(now, period_days),
            requests_used: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A partial update applied to one account in a single store write.
///
/// Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountUpdate {
    pub plan: Option<PlanId>,
    pub status: Option<SubscriptionStatus>,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub period: Option<BillingPeriod>,
    /// Set `requests_used` back to zero.
    pub reset_requests: bool,
}

impl AccountUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn plan(mut self, plan: PlanId) -> Self {
        self.plan = Some(plan);
        self
    }

    #[must_use]
    pub fn status(mut self, status: SubscriptionStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn customer_ref(mut self, customer_ref: impl Into<String>) -> Self {
        self.customer_ref = Some(customer_ref.into());
        self
    }

    #[must_use]
    pub fn subscription_ref(mut self, subscription_ref: Option<String>) -> Self {
        if subscription_ref.is_some() {
            self.subscription_ref = subscription_ref;
        }
        self
    }

    /// Start a new period and zero the counter.
    #[must_use]
    pub fn new_period(mut self, period: BillingPeriod) -> Self {
        self.period = Some(period);
        self.reset_requests = true;
        self
    }

    /// Apply this update to an account in place.
    pub fn apply(&self, account: &mut Account, now: DateTime<Utc>) {
        if let Some(plan) = self.plan {
            account.plan = plan;
        }
        if let Some(status) = self.status {
            account.status = status;
        }
        if let Some(customer_ref) = &self.customer_ref {
            account.customer_ref = Some(customer_ref.clone());
        }
        if let Some(subscription_ref) = &self.subscription_ref {
            account.subscription_ref = Some(subscription_ref.clone());
        }
        if let Some(period) = self.period {
            account.period = period;
        }
        if self.reset_requests {
            account.requests_used = 0;
        }
        account.updated_at = now;
    }
}

/// Read model of a user's quota, rebuilt on every reset and increment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestQuota {
    pub user_id: String,
    pub plan: PlanId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub next_reset_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Quota as seen by callers of the ledger.
pub type QuotaSnapshot = RequestQuota;

impl RequestQuota {
    /// Project an account onto its quota view.
    #[must_use]
    pub fn project(account: &Account, limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            user_id: account.user_id.clone(),
            plan: account.plan,
            period_start: account.period.start,
            period_end: account.period.end,
            limit,
            used: account.requests_used,
            remaining: limit.saturating_sub(account.requests_used),
            next_reset_at: account.period.end,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

/// Kind of subscription change recorded in the history log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionAction {
    Created,
    Upgraded,
    Downgraded,
    Canceled,
    Renewed,
}

impl SubscriptionAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Upgraded => "upgraded",
            Self::Downgraded => "downgraded",
            Self::Canceled => "canceled",
            Self::Renewed => "renewed",
        }
    }
}

impl std::fmt::Display for SubscriptionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionEvent {
    pub id: Uuid,
    pub user_id: String,
    pub plan: PlanId,
    pub action: SubscriptionAction,
    pub subscription_ref: Option<String>,
    pub invoice_ref: Option<String>,
    pub payment_ref: Option<String>,
    /// Amount in the smallest currency unit.
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl SubscriptionEvent {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        plan: PlanId,
        action: SubscriptionAction,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            plan,
            action,
            subscription_ref: None,
            invoice_ref: None,
            payment_ref: None,
            amount_cents: 0,
            currency: "usd".to_string(),
            created_at: now,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn with_amount(mut self, amount_cents: i64, currency: impl Into<String>) -> Self {
        self.amount_cents = amount_cents;
        self.currency = currency.into();
        self
    }

    #[must_use]
    pub fn with_subscription_ref(mut self, subscription_ref: Option<String>) -> Self {
        self.subscription_ref = subscription_ref;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

/// Immutable record of one metered model call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: String,
    pub api_key: Option<String>,
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
    pub model_name: String,
    pub model_provider: String,
    pub base_cost: f64,
    pub markup_percent: f64,
    pub final_cost: f64,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub conversation_id: Option<String>,
    pub agent_id: Option<String>,
    pub request_type: String,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.generated_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_provider() {
        assert_eq!(SubscriptionStatus::from_provider("active"), SubscriptionStatus::Active);
        assert_eq!(SubscriptionStatus::from_provider("trialing"), SubscriptionStatus::Active);
        assert_eq!(SubscriptionStatus::from_provider("past_due"), SubscriptionStatus::PastDue);
        assert_eq!(SubscriptionStatus::from_provider("unpaid"), SubscriptionStatus::PastDue);
        assert_eq!(SubscriptionStatus::from_provider("incomplete"), SubscriptionStatus::Incomplete);
        assert_eq!(SubscriptionStatus::from_provider("canceled"), SubscriptionStatus::Canceled);
        assert_eq!(SubscriptionStatus::from_provider("paused"), SubscriptionStatus::Canceled);
        assert_eq!(SubscriptionStatus::from_provider("???"), SubscriptionStatus::Canceled);
    }

    #[test]
    fn test_period_boundaries() {
        let start = Utc::now();
        let period = BillingPeriod::starting_at(start, 30);

        assert_eq!(period.end - period.start, Duration::days(30));
        assert!(period.contains(start));
        assert!(!period.contains(period.end));
        // Elapsed only once strictly past the end
        assert!(!period.has_elapsed(period.end));
        assert!(period.has_elapsed(period.end + Duration::seconds(1)));
    }

    #[test]
    fn test_new_account_defaults() {
        let now = Utc::now();
        let account = Account::new("user_1", "a@example.com", now, 30).with_name("Ada");

        assert_eq!(account.plan, PlanId::Free);
        assert_eq!(account.status, SubscriptionStatus::Active);
        assert_eq!(account.requests_used, 0);
        assert_eq!(account.period.start, now);
        assert_eq!(account.name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_update_applies_only_set_fields() {
        let now = Utc::now();
        let mut account = Account::new("user_1", "a@example.com", now, 30);
        account.requests_used = 7;
        account.customer_ref = Some("cus_1".to_string());

        let later = now + Duration::days(2);
        AccountUpdate::new()
            .plan(PlanId::Pro)
            .subscription_ref(None)
            .apply(&mut account, later);

        assert_eq!(account.plan, PlanId::Pro);
        assert_eq!(account.requests_used, 7);
        assert_eq!(account.customer_ref.as_deref(), Some("cus_1"));
        assert_eq!(account.updated_at, later);

        AccountUpdate::new()
            .new_period(BillingPeriod::starting_at(later, 30))
            .apply(&mut account, later);
        assert_eq!(account.requests_used, 0);
        assert_eq!(account.period.start, later);
    }

    #[test]
    fn test_quota_projection() {
        let now = Utc::now();
        let mut account = Account::new("user_1", "a@example.com", now, 30);
        account.requests_used = 25;

        let quota = RequestQuota::project(&account, 20, now);
        assert_eq!(quota.remaining, 0);
        assert!(quota.is_exhausted());
        assert_eq!(quota.next_reset_at, account.period.end);
    }

    #[test]
    fn test_event_metadata() {
        let event =
            SubscriptionEvent::new("user_1", PlanId::Pro, SubscriptionAction::Upgraded, Utc::now())
                .with_amount(1500, "usd")
            .with_metadata("source", "webhook");

        assert_eq!(event.metadata["source"], "webhook");
        assert_eq!(serde_json::to_value(event.action).unwrap(), "upgraded");
    }
}
