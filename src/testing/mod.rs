//! Testing utilities for tollgate.
//!
//! This module provides:
//! - Fixtures for accounts and fake identifiers
//! - A recording [`MockBillingProvider`]
//! - [`TestBilling`], which wires every component to one in-memory store
//!   and a manual clock
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::testing::TestBilling;
//!
//! #[tokio::test]
//! async fn test_free_quota() {
//!     let billing = TestBilling::new();
//!     let user = billing.register().await;
//!
//!     for _ in 0..20 {
//!         billing.gate().require(&user.user_id).await.unwrap();
//!     }
//!     assert!(billing.gate().require(&user.user_id).await.is_err());
//! }
//! ```

mod fixtures;
mod mock_provider;

use std::sync::Arc;

use crate::billing::account::{AccountManager, NewAccount};
use crate::billing::checkout::CheckoutManager;
use crate::billing::gate::RequestGate;
use crate::billing::period::{BillingPeriodManager, DEFAULT_PERIOD_DAYS};
use crate::billing::plans::PlanCatalog;
use crate::billing::quota::QuotaLedger;
use crate::billing::storage::memory::InMemoryAccountStore;
use crate::billing::subscription::SubscriptionManager;
use crate::billing::types::Account;
use crate::billing::usage::UsageRecorder;
use crate::billing::webhook::{WebhookReconciler, compute_signature};
use crate::clock::{Clock, ManualClock};

pub use fixtures::{TestAccount, fake};
pub use mock_provider::MockBillingProvider;

/// Webhook secret used by [`TestBilling::webhooks`].
pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Build a `t=<timestamp>,v1=<hex>` signature header for `payload`.
pub fn sign_webhook(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let mut signed_payload = format!("{}.", timestamp).into_bytes();
    signed_payload.extend_from_slice(payload);
    let signature = compute_signature(secret, &signed_payload).unwrap_or_default();
    format!("t={},v1={}", timestamp, signature)
}

/// Every billing component sharing one in-memory store and clock.
#[derive(Clone)]
pub struct TestBilling {
    pub store: InMemoryAccountStore,
    pub clock: ManualClock,
    pub catalog: Arc<PlanCatalog>,
    pub provider: MockBillingProvider,
}

impl Default for TestBilling {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBilling {
    /// Standard catalog, clock starting now.
    pub fn new() -> Self {
        Self::with_catalog(PlanCatalog::standard())
    }

    pub fn with_catalog(catalog: PlanCatalog) -> Self {
        Self {
            store: InMemoryAccountStore::new(),
            clock: ManualClock::starting_now(),
            catalog: Arc::new(catalog),
            provider: MockBillingProvider::new(),
        }
    }

    fn shared_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    pub fn accounts(&self) -> AccountManager<InMemoryAccountStore> {
        AccountManager::new(self.store.clone(), self.catalog.clone())
            .with_clock(self.shared_clock())
    }

    pub fn ledger(&self) -> QuotaLedger<InMemoryAccountStore> {
        QuotaLedger::new(self.store.clone(), self.catalog.clone()).with_clock(self.shared_clock())
    }

    pub fn periods(&self) -> BillingPeriodManager<InMemoryAccountStore> {
        BillingPeriodManager::new(self.store.clone(), self.catalog.clone())
            .with_clock(self.shared_clock())
    }

    pub fn subscriptions(&self) -> SubscriptionManager<InMemoryAccountStore, MockBillingProvider> {
        SubscriptionManager::new(self.store.clone(), self.provider.clone(), self.catalog.clone())
            .with_clock(self.shared_clock())
    }

    pub fn checkout(&self) -> CheckoutManager<InMemoryAccountStore, MockBillingProvider> {
        CheckoutManager::new(self.store.clone(), self.provider.clone(), self.catalog.clone())
            .with_clock(self.shared_clock())
    }

    pub fn webhooks(&self) -> WebhookReconciler<InMemoryAccountStore> {
        WebhookReconciler::new(self.store.clone(), TEST_WEBHOOK_SECRET, self.catalog.clone())
            .with_clock(self.shared_clock())
    }

    pub fn usage(&self) -> UsageRecorder<InMemoryAccountStore> {
        UsageRecorder::new(self.store.clone()).with_clock(self.shared_clock())
    }

    pub fn gate(&self) -> RequestGate<InMemoryAccountStore> {
        RequestGate::new(self.store.clone(), self.catalog.clone()).with_clock(self.shared_clock())
    }

    /// Register a fresh free account.
    pub async fn register(&self) -> Account {
        self.register_as(&fake::user_id()).await
    }

    /// Register a free account with a known id.
    ///
    /// # Panics
    ///
    /// Panics if the id is already registered.
    pub async fn register_as(&self, user_id: &str) -> Account {
        self.accounts()
            .register(NewAccount::new(user_id, fake::email()))
            .await
            .expect("test account registration failed")
    }

    /// Sign `payload` with [`TEST_WEBHOOK_SECRET`] at the clock's current time.
    pub fn sign(&self, payload: &[u8]) -> String {
        sign_webhook(TEST_WEBHOOK_SECRET, payload, self.clock.now().timestamp())
    }

    /// Store a prepared account directly.
    ///
    /// # Panics
    ///
    /// Panics if the id is already registered.
    pub async fn insert(&self, account: TestAccount) -> Account {
        use crate::billing::storage::AccountStore;

        let account = account.build(self.clock.now(), DEFAULT_PERIOD_DAYS);
        self.store
            .insert_account(&account)
            .await
            .expect("test account insert failed");
        account
    }
}
