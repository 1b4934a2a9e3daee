//! Billing period rollover.
//!
//! Periods roll lazily: the first request or webhook that observes an elapsed
//! period performs the reset. The reset is a compare-and-set on the period
//! end, so concurrent observers reset the counter exactly once.

use std::sync::Arc;

use super::error::{BillingError, Result};
use super::plans::PlanCatalog;
use super::storage::AccountStore;
use super::types::{Account, AccountUpdate, BillingPeriod, RequestQuota};
use crate::clock::{Clock, SystemClock};

/// Default billing period length in days.
pub const DEFAULT_PERIOD_DAYS: u32 = 30;

/// Decides when a period has elapsed and performs the reset.
#[derive(Clone)]
pub struct BillingPeriodManager<S: AccountStore> {
    store: S,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
    period_days: u32,
}

impl<S: AccountStore> BillingPeriodManager<S> {
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

    #[must_use]
    pub fn period_days(&self) -> u32 {
        self.period_days
    }

    /// The period that would start now.
    #[must_use]
    pub fn next_period(&self) -> BillingPeriod {
        BillingPeriod::starting_at(self.clock.now(), self.period_days)
    }

    /// Reset the user's period if it has elapsed.
    ///
    /// Returns `true` only for the caller that performed the reset. Calling
    /// this any number of times, concurrently or not, leaves the same state.
    pub async fn maybe_roll(&self, user_id: &str) -> Result<bool> {
        let account = self.load(user_id).await?;
        let now = self.clock.now();

        if !account.period.has_elapsed(now) {
            return Ok(false);
        }

        let next = BillingPeriod::starting_at(now, self.period_days);
        let rolled = self
            .store
            .roll_period(user_id, account.period.end, next, now)
            .await?;

        if rolled {
            tracing::info!(
                target: "tollgate::billing::period",
                user_id,
                previous_end = %account.period.end,
                period_start = %next.start,
                period_end = %next.end,
                "Billing period rolled over"
            );
            self.write_projection(user_id).await?;
        } else {
            tracing::debug!(
                target: "tollgate::billing::period",
                user_id,
                "Period already rolled by another worker"
            );
        }

        Ok(rolled)
    }

    /// Start a new period now, whether or not the current one has elapsed.
    ///
    /// Used when a plan change takes effect immediately.
    pub async fn start_new_period(&self, user_id: &str) -> Result<Account> {
        let update = AccountUpdate::new().new_period(self.next_period());
        let account = self
            .store
            .update_account(user_id, &update, self.clock.now())
            .await?
            .ok_or_else(|| BillingError::not_found(user_id))?;

        self.save_projection(&account).await?;
        Ok(account)
    }

    /// Rebuild the quota projection from the account's current plan.
    pub async fn write_projection(&self, user_id: &str) -> Result<RequestQuota> {
        let account = self.load(user_id).await?;
        self.save_projection(&account).await
    }

    async fn save_projection(&self, account: &Account) -> Result<RequestQuota> {
        let limit = self.catalog.require(account.plan)?.request_limit;
        let quota = RequestQuota::project(account, limit, self.clock.now());
        self.store.save_quota(&quota).await?;
        Ok(quota)
    }

    async fn load(&self, user_id: &str) -> Result<Account> {
        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| BillingError::not_found(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::plans::PlanId;
    use crate::billing::storage::memory::InMemoryAccountStore;
    use crate::clock::ManualClock;
    use chrono::Duration;

    async fn setup() -> (
        BillingPeriodManager<InMemoryAccountStore>,
        InMemoryAccountStore,
        ManualClock,
    ) {
        let clock = ManualClock::starting_now();
        let store = InMemoryAccountStore::new();
        let mut account = Account::new("user_1", "a@example.com", clock.now(), 30);
        account.requests_used = 12;
        store.insert_account(&account).await.unwrap();

        let manager = BillingPeriodManager::new(store.clone(), PlanCatalog::standard())
            .with_clock(Arc::new(clock.clone()));
        (manager, store, clock)
    }

    #[tokio::test]
    async fn test_no_roll_inside_period() {
        let (manager, store, clock) = setup().await;
        clock.advance(Duration::days(29));

        assert!(!manager.maybe_roll("user_1").await.unwrap());
        assert_eq!(store.get_account("user_1").await.unwrap().unwrap().requests_used, 12);
    }

    #[tokio::test]
    async fn test_no_roll_exactly_at_end() {
        let (manager, _store, clock) = setup().await;
        clock.advance(Duration::days(30));

        assert!(!manager.maybe_roll("user_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_roll_after_end() {
        let (manager, store, clock) = setup().await;
        clock.advance(Duration::days(31));

        assert!(manager.maybe_roll("user_1").await.unwrap());
        // Second call sees the fresh period
        assert!(!manager.maybe_roll("user_1").await.unwrap());

        let account = store.get_account("user_1").await.unwrap().unwrap();
        assert_eq!(account.requests_used, 0);
        assert_eq!(account.period.start, clock.now());
        assert_eq!(account.period.end, clock.now() + Duration::days(30));

        let quota = store.get_quota("user_1").await.unwrap().unwrap();
        assert_eq!(quota.used, 0);
        assert_eq!(quota.limit, 20);
        assert_eq!(quota.next_reset_at, account.period.end);
    }

    #[tokio::test]
    async fn test_projection_uses_current_plan() {
        let (manager, store, clock) = setup().await;
        store
            .update_account("user_1", &AccountUpdate::new().plan(PlanId::Pro), clock.now())
            .await
            .unwrap();
        clock.advance(Duration::days(45));

        manager.maybe_roll("user_1").await.unwrap();
        let quota = store.get_quota("user_1").await.unwrap().unwrap();
        assert_eq!(quota.limit, 10_000);
        assert_eq!(quota.plan, PlanId::Pro);
    }

    #[tokio::test]
    async fn test_start_new_period_is_unconditional() {
        let (manager, _store, clock) = setup().await;
        clock.advance(Duration::days(3));

        let account = manager.start_new_period("user_1").await.unwrap();
        assert_eq!(account.requests_used, 0);
        assert_eq!(account.period.start, clock.now());
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (manager, _store, _clock) = setup().await;
        assert!(matches!(
            manager.maybe_roll("nobody").await,
            Err(BillingError::NotFound { .. })
        ));
        assert!(matches!(
            manager.start_new_period("nobody").await,
            Err(BillingError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_custom_period_length() {
        let (manager, store, clock) = setup().await;
        let manager = manager.with_period_days(7);
        clock.advance(Duration::days(31));

        manager.maybe_roll("user_1").await.unwrap();
        let account = store.get_account("user_1").await.unwrap().unwrap();
        assert_eq!(account.period.end - account.period.start, Duration::days(7));
    }
}
