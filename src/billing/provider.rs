//! Payment provider abstraction.
//!
//! The engine talks to the provider for three things only: creating a
//! customer, opening a checkout session and scheduling a cancellation.
//! Everything else arrives asynchronously through webhooks.

use std::collections::HashMap;

use super::error::Result;

/// Request to create a provider customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCustomerRequest {
    pub email: String,
    pub name: Option<String>,
    /// Stored on the customer so support can find the account.
    pub user_id: String,
}

/// Request to open a hosted checkout session for a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub customer_ref: String,
    pub price_ref: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Echoed back on `checkout.session.completed`.
    pub metadata: HashMap<String, String>,
}

/// A created checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    /// URL to redirect the customer to.
    pub url: String,
}

/// Trait for payment provider operations.
///
/// Failures are reported as
/// [`BillingError::ProviderRejected`](super::BillingError::ProviderRejected)
/// with the provider's HTTP status when one is known.
#[allow(async_fn_in_trait)]
pub trait BillingProvider: Send + Sync {
    /// Create a customer and return its reference.
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<String>;

    async fn create_checkout_session(&self, request: CheckoutRequest) -> Result<CheckoutSession>;

    /// Stop renewing a subscription; it stays active until the period ends.
    async fn cancel_at_period_end(&self, subscription_ref: &str) -> Result<()>;
}

/// A provider for components that never make outbound calls.
///
/// Webhook reconciliation only applies state the provider already decided,
/// so it wires its subscription manager with this.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBillingProvider;

impl NullBillingProvider {
    fn unsupported(operation: &str) -> super::BillingError {
        super::BillingError::ProviderRejected {
            operation: operation.to_string(),
            message: "no billing provider configured".to_string(),
            http_status: None,
        }
    }
}

impl BillingProvider for NullBillingProvider {
    async fn create_customer(&self, _request: CreateCustomerRequest) -> Result<String> {
        Err(Self::unsupported("create_customer"))
    }

    async fn create_checkout_session(&self, _request: CheckoutRequest) -> Result<CheckoutSession> {
        Err(Self::unsupported("create_checkout_session"))
    }

    async fn cancel_at_period_end(&self, _subscription_ref: &str) -> Result<()> {
        Err(Self::unsupported("cancel_at_period_end"))
    }
}
