//! Storage traits for billing data.
//!
//! Implement [`AccountStore`] to persist accounts, quota projections, history
//! and usage to your database. Every mutation the engine relies on for
//! correctness under concurrency is a single atomic operation on one record:
//! counter increments, the conditional increment, the period compare-and-set
//! and the webhook event claim.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{
    Account, AccountUpdate, BillingPeriod, RequestQuota, SubscriptionEvent, UsageRecord,
};

/// Infrastructure failure of the store.
///
/// A missing record is never an error; lookups return `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("duplicate key: {0}")]
    Duplicate(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of an atomic "increment if below limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalIncrement {
    /// The counter was below the limit and now holds `used`.
    Applied { used: u64 },
    /// The counter was already at or past the limit and was left unchanged.
    LimitReached { used: u64 },
}

/// Trait for storing billing data.
///
/// An in-memory implementation is provided in [`memory`].
#[async_trait]
pub trait AccountStore: Send + Sync {
    // Accounts

    /// Get an account by user id.
    async fn get_account(&self, user_id: &str) -> StoreResult<Option<Account>>;

    /// Find the account linked to a provider customer.
    async fn find_account_by_customer(&self, customer_ref: &str) -> StoreResult<Option<Account>>;

    /// Insert a new account. Fails with [`StoreError::Duplicate`] if the id exists.
    async fn insert_account(&self, account: &Account) -> StoreResult<()>;

    /// Apply a partial update to one account atomically and return the result.
    ///
    /// Returns `Ok(None)` if the account does not exist.
    async fn update_account(
        &self,
        user_id: &str,
        update: &AccountUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>>;

    /// Atomically add `delta` to `requests_used` and return the new value.
    ///
    /// No limit is checked. Returns `Ok(None)` if the account does not exist.
    async fn add_requests(&self, user_id: &str, delta: u64) -> StoreResult<Option<u64>>;

    /// Atomically increment `requests_used` only if it is below `limit`.
    ///
    /// Must be a single conditional write (`UPDATE ... WHERE requests_used < $limit`,
    /// `findOneAndUpdate` with a `$lt` filter, ...). Returns `Ok(None)` if the
    /// account does not exist.
    async fn increment_requests_below(
        &self,
        user_id: &str,
        limit: u64,
    ) -> StoreResult<Option<ConditionalIncrement>>;

    /// Replace the period and zero the counter, but only if the stored period
    /// still ends at `expected_end`.
    ///
    /// Returns `Ok(true)` if this call performed the reset. Concurrent callers
    /// observing the same stale period see exactly one `true`.
    async fn roll_period(
        &self,
        user_id: &str,
        expected_end: DateTime<Utc>,
        next: BillingPeriod,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // Quota projection

    async fn get_quota(&self, user_id: &str) -> StoreResult<Option<RequestQuota>>;

    /// Upsert the quota projection.
    async fn save_quota(&self, quota: &RequestQuota) -> StoreResult<()>;

    // History

    async fn append_subscription_event(&self, event: &SubscriptionEvent) -> StoreResult<()>;

    /// List a user's history, newest first.
    async fn list_subscription_events(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<SubscriptionEvent>>;

    // Usage

    async fn insert_usage_record(&self, record: &UsageRecord) -> StoreResult<()>;

    /// List a user's usage recorded in `[from, to)`, oldest first.
    async fn list_usage_records(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageRecord>>;

    // Webhook idempotency

    /// Record a provider event id if it has not been seen before.
    ///
    /// Returns `Ok(true)` for the first claim and `Ok(false)` afterwards.
    /// Must be an insert-if-absent on a unique key.
    async fn claim_event(&self, event_id: &str, at: DateTime<Utc>) -> StoreResult<bool>;

    /// Forget a claim so a redelivery can be applied.
    async fn release_event(&self, event_id: &str) -> StoreResult<()>;

    async fn is_event_processed(&self, event_id: &str) -> StoreResult<bool>;

    /// Clean up claims made before `older_than` (default: no-op).
    async fn cleanup_processed_events(&self, _older_than: DateTime<Utc>) -> StoreResult<usize> {
        Ok(0)
    }
}

/// In-memory account store for tests and local development.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

    /// In-memory account store.
    ///
    /// Wraps data in Arc for cheap cloning; clones share state. Outages can be
    /// simulated for every operation ([`set_unavailable`](Self::set_unavailable))
    /// or for named operations only ([`fail_operation`](Self::fail_operation)).
    #[derive(Default, Clone)]
    pub struct InMemoryAccountStore {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        accounts: RwLock<HashMap<String, Account>>,
        quotas: RwLock<HashMap<String, RequestQuota>>,
        events: RwLock<Vec<SubscriptionEvent>>,
        usage: RwLock<Vec<UsageRecord>>,
        processed_events: RwLock<HashMap<String, DateTime<Utc>>>,
        unavailable: AtomicBool,
        /// Operation name to the number of calls that still succeed.
        failing: RwLock<HashMap<&'static str, usize>>,
    }

    fn read<T>(lock: &RwLock<T>) -> StoreResult<RwLockReadGuard<'_, T>> {
        lock.read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write<T>(lock: &RwLock<T>) -> StoreResult<RwLockWriteGuard<'_, T>> {
        lock.write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    impl InMemoryAccountStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every operation fail with [`StoreError::Unavailable`].
        pub fn set_unavailable(&self, unavailable: bool) {
            self.inner.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Make one operation (by trait method name) fail until cleared.
        pub fn fail_operation(&self, operation: &'static str) {
            self.fail_operation_after(operation, 0);
        }

        /// Let `operation` succeed `successes` more times, then fail until cleared.
        pub fn fail_operation_after(&self, operation: &'static str, successes: usize) {
            if let Ok(mut failing) = self.inner.failing.write() {
                failing.insert(operation, successes);
            }
        }

        pub fn clear_faults(&self) {
            self.inner.unavailable.store(false, Ordering::SeqCst);
            if let Ok(mut failing) = self.inner.failing.write() {
                failing.clear();
            }
        }

        fn check(&self, operation: &'static str) -> StoreResult<()> {
            if self.inner.unavailable.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("simulated outage".to_string()));
            }
            let mut failing = write(&self.inner.failing)?;
            match failing.get_mut(operation) {
                Some(0) => Err(StoreError::Unavailable(format!(
                    "simulated failure in {}",
                    operation
                ))),
                Some(remaining) => {
                    *remaining -= 1;
                    Ok(())
                }
                None => Ok(()),
            }
        }

        /// All history entries, in insertion order (for testing).
        pub fn all_subscription_events(&self) -> Vec<SubscriptionEvent> {
            self.inner
                .events
                .read()
                .map(|events| events.clone())
                .unwrap_or_default()
        }

        /// Ids of claimed webhook events (for testing).
        pub fn processed_event_ids(&self) -> Vec<String> {
            self.inner
                .processed_events
                .read()
                .map(|events| events.keys().cloned().collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl AccountStore for InMemoryAccountStore {
        async fn get_account(&self, user_id: &str) -> StoreResult<Option<Account>> {
            self.check("get_account")?;
            Ok(read(&self.inner.accounts)?.get(user_id).cloned())
        }

        async fn find_account_by_customer(
            &self,
            customer_ref: &str,
        ) -> StoreResult<Option<Account>> {
            self.check("find_account_by_customer")?;
            Ok(read(&self.inner.accounts)?
                .values()
                .find(|a| a.customer_ref.as_deref() == Some(customer_ref))
                .cloned())
        }

        async fn insert_account(&self, account: &Account) -> StoreResult<()> {
            self.check("insert_account")?;
            let mut accounts = write(&self.inner.accounts)?;
            if accounts.contains_key(&account.user_id) {
                return Err(StoreError::Duplicate(account.user_id.clone()));
            }
            accounts.insert(account.user_id.clone(), account.clone());
            Ok(())
        }

        async fn update_account(
            &self,
            user_id: &str,
            update: &AccountUpdate,
            now: DateTime<Utc>,
        ) -> StoreResult<Option<Account>> {
            self.check("update_account")?;
            let mut accounts = write(&self.inner.accounts)?;
            Ok(accounts.get_mut(user_id).map(|account| {
                update.apply(account, now);
                account.clone()
            }))
        }

        async fn add_requests(&self, user_id: &str, delta: u64) -> StoreResult<Option<u64>> {
            self.check("add_requests")?;
            let mut accounts = write(&self.inner.accounts)?;
            Ok(accounts.get_mut(user_id).map(|account| {
                account.requests_used = account.requests_used.saturating_add(delta);
                account.requests_used
            }))
        }

        async fn increment_requests_below(
            &self,
            user_id: &str,
            limit: u64,
        ) -> StoreResult<Option<ConditionalIncrement>> {
            self.check("increment_requests_below")?;
            let mut accounts = write(&self.inner.accounts)?;
            Ok(accounts.get_mut(user_id).map(|account| {
                if account.requests_used < limit {
                    account.requests_used += 1;
                    ConditionalIncrement::Applied {
                        used: account.requests_used,
                    }
                } else {
                    ConditionalIncrement::LimitReached {
                        used: account.requests_used,
                    }
                }
            }))
        }

        async fn roll_period(
            &self,
            user_id: &str,
            expected_end: DateTime<Utc>,
            next: BillingPeriod,
            now: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.check("roll_period")?;
            let mut accounts = write(&self.inner.accounts)?;
            match accounts.get_mut(user_id) {
                Some(account) if account.period.end == expected_end => {
                    account.period = next;
                    account.requests_used = 0;
                    account.updated_at = now;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn get_quota(&self, user_id: &str) -> StoreResult<Option<RequestQuota>> {
            self.check("get_quota")?;
            Ok(read(&self.inner.quotas)?.get(user_id).cloned())
        }

        async fn save_quota(&self, quota: &RequestQuota) -> StoreResult<()> {
            self.check("save_quota")?;
            write(&self.inner.quotas)?.insert(quota.user_id.clone(), quota.clone());
            Ok(())
        }

        async fn append_subscription_event(&self, event: &SubscriptionEvent) -> StoreResult<()> {
            self.check("append_subscription_event")?;
            write(&self.inner.events)?.push(event.clone());
            Ok(())
        }

        async fn list_subscription_events(
            &self,
            user_id: &str,
            limit: usize,
        ) -> StoreResult<Vec<SubscriptionEvent>> {
            self.check("list_subscription_events")?;
            let events = read(&self.inner.events)?;
            // Reverse insertion order first so equal timestamps stay newest-first
            let mut matching: Vec<SubscriptionEvent> = events
                .iter()
                .rev()
                .filter(|e| e.user_id == user_id)
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            matching.truncate(limit);
            Ok(matching)
        }

        async fn insert_usage_record(&self, record: &UsageRecord) -> StoreResult<()> {
            self.check("insert_usage_record")?;
            write(&self.inner.usage)?.push(record.clone());
            Ok(())
        }

        async fn list_usage_records(
            &self,
            user_id: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> StoreResult<Vec<UsageRecord>> {
            self.check("list_usage_records")?;
            let usage = read(&self.inner.usage)?;
            let mut records: Vec<UsageRecord> = usage
                .iter()
                .filter(|r| r.user_id == user_id && r.recorded_at >= from && r.recorded_at < to)
                .cloned()
                .collect();
            records.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
            Ok(records)
        }

        async fn claim_event(&self, event_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
            self.check("claim_event")?;
            let mut events = write(&self.inner.processed_events)?;
            if events.contains_key(event_id) {
                return Ok(false);
            }
            events.insert(event_id.to_string(), at);
            Ok(true)
        }

        async fn release_event(&self, event_id: &str) -> StoreResult<()> {
            self.check("release_event")?;
            write(&self.inner.processed_events)?.remove(event_id);
            Ok(())
        }

        async fn is_event_processed(&self, event_id: &str) -> StoreResult<bool> {
            self.check("is_event_processed")?;
            Ok(read(&self.inner.processed_events)?.contains_key(event_id))
        }

        async fn cleanup_processed_events(&self, older_than: DateTime<Utc>) -> StoreResult<usize> {
            self.check("cleanup_processed_events")?;
            let mut events = write(&self.inner.processed_events)?;
            let initial_len = events.len();
            events.retain(|_, claimed_at| *claimed_at >= older_than);
            Ok(initial_len - events.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryAccountStore;
    use super::*;
    use crate::billing::plans::PlanId;
    use crate::billing::types::SubscriptionAction;
    use chrono::Duration as ChronoDuration;

    fn account(user_id: &str) -> Account {
        Account::new(user_id, format!("{}@example.com", user_id), Utc::now(), 30)
    }

    #[tokio::test]
    async fn test_insert_and_get_account() {
        let store = InMemoryAccountStore::new();
        store.insert_account(&account("user_1")).await.unwrap();

        let found = store.get_account("user_1").await.unwrap().unwrap();
        assert_eq!(found.email, "user_1@example.com");
        assert!(store.get_account("missing").await.unwrap().is_none());

        let err = store.insert_account(&account("user_1")).await.unwrap_err();
        assert_eq!(err, StoreError::Duplicate("user_1".to_string()));
    }

    #[tokio::test]
    async fn test_find_by_customer() {
        let store = InMemoryAccountStore::new();
        let mut acct = account("user_1");
        acct.customer_ref = Some("cus_1".to_string());
        store.insert_account(&acct).await.unwrap();

        let found = store.find_account_by_customer("cus_1").await.unwrap();
        assert_eq!(found.map(|a| a.user_id), Some("user_1".to_string()));
        assert!(store.find_account_by_customer("cus_2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_increment_stops_at_limit() {
        let store = InMemoryAccountStore::new();
        store.insert_account(&account("user_1")).await.unwrap();

        for expected in 1..=3 {
            assert_eq!(
                store.increment_requests_below("user_1", 3).await.unwrap(),
                Some(ConditionalIncrement::Applied { used: expected })
            );
        }
        assert_eq!(
            store.increment_requests_below("user_1", 3).await.unwrap(),
            Some(ConditionalIncrement::LimitReached { used: 3 })
        );
        assert_eq!(store.increment_requests_below("nobody", 3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_requests_ignores_limit() {
        let store = InMemoryAccountStore::new();
        store.insert_account(&account("user_1")).await.unwrap();

        assert_eq!(store.add_requests("user_1", 5).await.unwrap(), Some(5));
        assert_eq!(store.add_requests("user_1", 1).await.unwrap(), Some(6));
        assert_eq!(store.add_requests("nobody", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_roll_period_compare_and_set() {
        let store = InMemoryAccountStore::new();
        let acct = account("user_1");
        let stale_end = acct.period.end;
        store.insert_account(&acct).await.unwrap();
        store.add_requests("user_1", 9).await.unwrap();

        let now = stale_end + ChronoDuration::days(1);
        let next = BillingPeriod::starting_at(now, 30);

        assert!(store.roll_period("user_1", stale_end, next, now).await.unwrap());
        // Second roller saw the same stale end and loses
        assert!(!store.roll_period("user_1", stale_end, next, now).await.unwrap());

        let rolled = store.get_account("user_1").await.unwrap().unwrap();
        assert_eq!(rolled.period, next);
        assert_eq!(rolled.requests_used, 0);
    }

    #[tokio::test]
    async fn test_event_history_newest_first() {
        let store = InMemoryAccountStore::new();
        let t0 = Utc::now();
        for (offset, action) in [
            (0, SubscriptionAction::Created),
            (1, SubscriptionAction::Upgraded),
            (2, SubscriptionAction::Canceled),
        ] {
            let event = SubscriptionEvent::new(
                "user_1",
                PlanId::Pro,
                action,
                t0 + ChronoDuration::minutes(offset),
            );
            store.append_subscription_event(&event).await.unwrap();
        }

        let history = store.list_subscription_events("user_1", 2).await.unwrap();
        let actions: Vec<_> = history.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![SubscriptionAction::Canceled, SubscriptionAction::Upgraded]);
        assert!(store.list_subscription_events("user_2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_release_and_cleanup() {
        let store = InMemoryAccountStore::new();
        let now = Utc::now();

        assert!(store.claim_event("evt_1", now).await.unwrap());
        assert!(!store.claim_event("evt_1", now).await.unwrap());
        assert!(store.is_event_processed("evt_1").await.unwrap());

        store.release_event("evt_1").await.unwrap();
        assert!(!store.is_event_processed("evt_1").await.unwrap());

        store.claim_event("old", now - ChronoDuration::days(40)).await.unwrap();
        store.claim_event("new", now).await.unwrap();
        let removed = store
            .cleanup_processed_events(now - ChronoDuration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.processed_event_ids(), vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_simulated_outages() {
        let store = InMemoryAccountStore::new();
        store.insert_account(&account("user_1")).await.unwrap();

        store.set_unavailable(true);
        assert!(matches!(
            store.get_account("user_1").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);

        store.fail_operation("update_account");
        assert!(store.get_account("user_1").await.unwrap().is_some());
        assert!(
            store
                .update_account("user_1", &AccountUpdate::new().plan(PlanId::Pro), Utc::now())
                .await
                .is_err()
        );

        store.clear_faults();
        let updated = store
            .update_account("user_1", &AccountUpdate::new().plan(PlanId::Pro), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.plan, PlanId::Pro);
    }

    #[tokio::test]
    async fn test_fail_operation_after_successes() {
        let store = InMemoryAccountStore::new();
        store.insert_account(&account("user_1")).await.unwrap();

        store.fail_operation_after("get_account", 2);
        assert!(store.get_account("user_1").await.is_ok());
        assert!(store.get_account("user_1").await.is_ok());
        assert!(store.get_account("user_1").await.is_err());
        assert!(store.get_account("user_1").await.is_err());

        store.clear_faults();
        assert!(store.get_account("user_1").await.is_ok());
    }
}
