//! In-memory billing provider that records every call.

use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::billing::error::{BillingError, Result};
use crate::billing::provider::{
    BillingProvider, CheckoutRequest, CheckoutSession, CreateCustomerRequest,
};

#[derive(Default)]
struct MockState {
    customers: Vec<CreateCustomerRequest>,
    checkouts: Vec<CheckoutRequest>,
    canceled: Vec<String>,
    fail_customers: bool,
    fail_checkouts: bool,
    fail_cancellations: bool,
}

/// A [`BillingProvider`] for tests and local development.
///
/// Clones share state, so a test can keep a handle after moving the
/// provider into a manager.
#[derive(Clone, Default)]
pub struct MockBillingProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject `create_customer` calls.
    pub fn fail_customer_creation(&self, fail: bool) {
        self.state().fail_customers = fail;
    }

    /// Reject `create_checkout_session` calls.
    pub fn fail_checkouts(&self, fail: bool) {
        self.state().fail_checkouts = fail;
    }

    /// Reject `cancel_at_period_end` calls.
    pub fn fail_cancellations(&self, fail: bool) {
        self.state().fail_cancellations = fail;
    }

    pub fn customers_created(&self) -> usize {
        self.state().customers.len()
    }

    pub fn checkout_requests(&self) -> Vec<CheckoutRequest> {
        self.state().checkouts.clone()
    }

    pub fn canceled_subscriptions(&self) -> Vec<String> {
        self.state().canceled.clone()
    }

    fn rejected(operation: &str) -> BillingError {
        BillingError::ProviderRejected {
            operation: operation.to_string(),
            message: "rejected by mock provider".to_string(),
            http_status: Some(402),
        }
    }
}

impl BillingProvider for MockBillingProvider {
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<String> {
        let mut state = self.state();
        if state.fail_customers {
            return Err(Self::rejected("create_customer"));
        }
        state.customers.push(request);
        Ok(format!("cus_{}", Uuid::new_v4().simple()))
    }

    async fn create_checkout_session(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        let mut state = self.state();
        if state.fail_checkouts {
            return Err(Self::rejected("create_checkout_session"));
        }
        state.checkouts.push(request);
        let id = format!("cs_test_{}", Uuid::new_v4().simple());
        Ok(CheckoutSession {
            url: format!("https://checkout.example.com/pay/{}", id),
            id,
        })
    }

    async fn cancel_at_period_end(&self, subscription_ref: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_cancellations {
            return Err(Self::rejected("cancel_at_period_end"));
        }
        state.canceled.push(subscription_ref.to_string());
        Ok(())
    }
}
