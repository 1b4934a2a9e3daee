//! Quota, billing period and subscription consistency.
//!
//! Every component is generic over an [`AccountStore`] and mutates shared
//! state only through the store's atomic single-record operations, so any
//! number of workers may run them concurrently against one store.
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::billing::{
//!     AccountManager, NewAccount, PlanCatalog, RequestGate, WebhookReconciler,
//! };
//!
//! let catalog = std::sync::Arc::new(PlanCatalog::standard());
//!
//! // Registration
//! let accounts = AccountManager::new(store.clone(), catalog.clone());
//! accounts.register(NewAccount::new("user_1", "ada@example.com")).await?;
//!
//! // Request path: roll an elapsed period, then consume one request
//! let gate = RequestGate::new(store.clone(), catalog.clone());
//! let quota = gate.require("user_1").await?;
//!
//! // Provider webhooks
//! let webhooks = WebhookReconciler::new(store, webhook_secret, catalog);
//! let outcome = webhooks.process(&body, &signature_header).await?;
//! ```

pub mod account;
pub mod checkout;
pub mod error;
pub mod gate;
pub mod period;
pub mod plans;
pub mod provider;
pub mod quota;
pub mod storage;
pub mod subscription;
pub mod types;
pub mod usage;
pub mod webhook;

// Plan exports
pub use plans::{PlanBuilder, PlanCatalog, PlanCatalogBuilder, PlanDefinition, PlanId};

// Record exports
pub use types::{
    Account, AccountUpdate, BillingPeriod, QuotaSnapshot, RequestQuota, SubscriptionAction,
    SubscriptionEvent, SubscriptionStatus, UsageRecord,
};

// Storage exports
pub use storage::memory::InMemoryAccountStore;
pub use storage::{AccountStore, ConditionalIncrement, StoreError, StoreResult};

// Provider exports
pub use provider::{
    BillingProvider, CheckoutRequest, CheckoutSession, CreateCustomerRequest, NullBillingProvider,
};

// Component exports
pub use account::{AccountManager, NewAccount, SubscriptionOverview};
pub use checkout::CheckoutManager;
pub use gate::RequestGate;
pub use period::{BillingPeriodManager, DEFAULT_PERIOD_DAYS};
pub use quota::{Admission, QuotaLedger};
pub use subscription::{DEFAULT_HISTORY_LIMIT, SubscriptionManager, TransitionOutcome};
pub use usage::{
    ModelPricing, ModelUsage, PriceTable, UsageRecorder, UsageRequest, UsageSummary,
};
pub use webhook::{
    ProviderEvent, ProviderEventKind, SkipReason, WebhookOutcome, WebhookReconciler,
};

// Error exports
pub use error::BillingError;
