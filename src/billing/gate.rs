//! Request-path quota enforcement.
//!
//! Rolls an elapsed period, then consumes one request atomically.

use std::sync::Arc;

use super::error::{BillingError, Result};
use super::period::BillingPeriodManager;
use super::plans::PlanCatalog;
use super::quota::{Admission, QuotaLedger};
use super::storage::AccountStore;
use super::types::QuotaSnapshot;
use crate::clock::Clock;

/// Admission for one inbound request.
#[derive(Clone)]
pub struct RequestGate<S: AccountStore + Clone> {
    periods: BillingPeriodManager<S>,
    ledger: QuotaLedger<S>,
}

impl<S: AccountStore + Clone> RequestGate<S> {
    pub fn new(store: S, catalog: impl Into<Arc<PlanCatalog>>) -> Self {
        let catalog = catalog.into();
        Self {
            periods: BillingPeriodManager::new(store.clone(), catalog.clone()),
            ledger: QuotaLedger::new(store, catalog),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.periods = self.periods.with_clock(clock.clone());
        self.ledger = self.ledger.with_clock(clock);
        self
    }

    #[must_use]
    pub fn with_period_days(mut self, days: u32) -> Self {
        self.periods = self.periods.with_period_days(days);
        self
    }

    /// Roll the period if it has elapsed, then count the request if the
    /// user is below their limit.
    pub async fn admit(&self, user_id: &str) -> Result<Admission> {
        self.periods.maybe_roll(user_id).await?;
        self.ledger.consume(user_id).await
    }

    /// Like [`admit`](Self::admit), but a refusal is `QuotaExceeded`.
    pub async fn require(&self, user_id: &str) -> Result<QuotaSnapshot> {
        let admission = self.admit(user_id).await?;
        if admission.admitted {
            Ok(admission.quota)
        } else {
            Err(BillingError::QuotaExceeded {
                user_id: user_id.to_string(),
                used: admission.quota.used,
                limit: admission.quota.limit,
            })
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &QuotaLedger<S> {
        &self.ledger
    }

    #[must_use]
    pub fn periods(&self) -> &BillingPeriodManager<S> {
        &self.periods
    }
}
