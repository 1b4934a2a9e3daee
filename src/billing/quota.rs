//! Per-period request quota.
//!
//! The counter lives on the account record and is only ever changed through
//! atomic store operations, so any number of workers can share one ledger.
//!
//! Two admission paths exist:
//!
//! - [`QuotaLedger::check_admission`] followed by [`QuotaLedger::increment`].
//!   The check and the add are separate store calls, so N callers that pass
//!   the check concurrently can push the counter up to N past the limit.
//! - [`QuotaLedger::consume`], a single conditional increment. The counter
//!   never exceeds the limit.

use std::sync::Arc;

use serde::Serialize;

use super::error::{BillingError, Result};
use super::plans::PlanCatalog;
use super::storage::{AccountStore, ConditionalIncrement};
use super::types::{Account, QuotaSnapshot, RequestQuota};
use crate::clock::{Clock, SystemClock};

/// Result of an admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub admitted: bool,
    pub quota: QuotaSnapshot,
}

/// Owns the per-user, per-period request counter.
#[derive(Clone)]
pub struct QuotaLedger<S: AccountStore> {
    store: S,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
}

impl<S: AccountStore> QuotaLedger<S> {
    pub fn new(store: S, catalog: impl Into<Arc<PlanCatalog>>) -> Self {
        Self {
            store,
            catalog: catalog.into(),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Decide whether the user may make another request, without counting it.
    pub async fn check_admission(&self, user_id: &str) -> Result<Admission> {
        let account = self.load(user_id).await?;
        let limit = self.limit_for(&account)?;
        let quota = RequestQuota::project(&account, limit, self.clock.now());

        Ok(Admission {
            admitted: account.requests_used < limit,
            quota,
        })
    }

    /// Count one request. The limit is not re-checked.
    ///
    /// The add is the last fallible store call, so an error always means
    /// nothing was counted and the call can be retried.
    pub async fn increment(&self, user_id: &str) -> Result<QuotaSnapshot> {
        let mut account = self.load(user_id).await?;
        let limit = self.limit_for(&account)?;

        let used = self
            .store
            .add_requests(user_id, 1)
            .await?
            .ok_or_else(|| BillingError::not_found(user_id))?;

        account.requests_used = used;
        let quota = RequestQuota::project(&account, limit, self.clock.now());
        self.save_projection(&quota).await;

        if used > limit {
            tracing::warn!(
                target: "tollgate::billing::quota",
                user_id,
                used,
                limit,
                "Request counter past plan limit"
            );
        }

        Ok(quota)
    }

    /// Atomically count one request if the user is below their limit.
    pub async fn consume(&self, user_id: &str) -> Result<Admission> {
        let mut account = self.load(user_id).await?;
        let limit = self.limit_for(&account)?;

        let outcome = self
            .store
            .increment_requests_below(user_id, limit)
            .await?
            .ok_or_else(|| BillingError::not_found(user_id))?;

        let admitted = match outcome {
            ConditionalIncrement::Applied { used } => {
                account.requests_used = used;
                true
            }
            ConditionalIncrement::LimitReached { used } => {
                account.requests_used = used;
                false
            }
        };

        let quota = RequestQuota::project(&account, limit, self.clock.now());
        if admitted {
            self.save_projection(&quota).await;
        } else {
            tracing::debug!(
                target: "tollgate::billing::quota",
                user_id,
                used = quota.used,
                limit,
                "Request refused, quota exhausted"
            );
        }

        Ok(Admission { admitted, quota })
    }

    /// Current quota for a user, computed from the account record.
    pub async fn quota(&self, user_id: &str) -> Result<QuotaSnapshot> {
        let account = self.load(user_id).await?;
        let limit = self.limit_for(&account)?;
        Ok(RequestQuota::project(&account, limit, self.clock.now()))
    }

    /// Rebuild and store the projection from the account record.
    pub async fn refresh_projection(&self, user_id: &str) -> Result<QuotaSnapshot> {
        let quota = self.quota(user_id).await?;
        self.store.save_quota(&quota).await?;
        Ok(quota)
    }

    async fn load(&self, user_id: &str) -> Result<Account> {
        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| BillingError::not_found(user_id))
    }

    fn limit_for(&self, account: &Account) -> Result<u64> {
        Ok(self.catalog.require(account.plan)?.request_limit)
    }

    // The counter on the account is authoritative; a failed projection write
    // is repaired by the next increment or reset.
    async fn save_projection(&self, quota: &RequestQuota) {
        if let Err(e) = self.store.save_quota(quota).await {
            tracing::warn!(
                target: "tollgate::billing::quota",
                user_id = %quota.user_id,
                error = %e,
                "Failed to refresh quota projection"
            );
        }
    }
}
