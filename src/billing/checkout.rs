//! Hosted checkout for paid plans.
//!
//! Opens a provider checkout session for a subscription purchase. The plan
//! change itself is applied later, when the provider reports
//! `checkout.session.completed` through the webhook.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::{BillingError, Result};
use super::plans::{PlanCatalog, PlanId};
use super::provider::{BillingProvider, CheckoutRequest, CheckoutSession, CreateCustomerRequest};
use super::storage::AccountStore;
use super::types::{Account, AccountUpdate};
use crate::clock::{Clock, SystemClock};

/// Checkout session management.
pub struct CheckoutManager<S: AccountStore, P: BillingProvider> {
    store: S,
    provider: P,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
}

impl<S: AccountStore, P: BillingProvider> CheckoutManager<S, P> {
    #[must_use]
    pub fn new(store: S, provider: P, catalog: impl Into<Arc<PlanCatalog>>) -> Self {
        Self {
            store,
            provider,
            catalog: catalog.into(),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create a checkout session for a paid plan.
    ///
    /// Creates the provider customer first if the account has none. The
    /// session carries `user_id` and `plan` metadata so the completion
    /// webhook can find the account.
    pub async fn create_checkout_session(
        &self,
        user_id: &str,
        plan: PlanId,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession> {
        let account = self
            .store
            .get_account(user_id)
            .await?
            .ok_or_else(|| BillingError::not_found(user_id))?;

        let definition = self.catalog.require(plan)?;
        if plan == PlanId::Free || definition.is_free() {
            return Err(BillingError::invalid_state("free plan does not require checkout"));
        }
        let price_ref = definition
            .external_price_ref
            .clone()
            .ok_or_else(|| BillingError::PlanNotFound {
                plan_id: plan.to_string(),
            })?;

        let customer_ref = self.get_or_create_customer(&account).await?;

        let metadata = HashMap::from([
            ("user_id".to_string(), user_id.to_string()),
            ("plan".to_string(), plan.to_string()),
        ]);
        let session = self
            .provider
            .create_checkout_session(CheckoutRequest {
                customer_ref,
                price_ref,
                success_url: success_url.to_string(),
                cancel_url: cancel_url.to_string(),
                metadata,
            })
            .await?;

        tracing::info!(
            target: "tollgate::billing::checkout",
            user_id,
            plan = %plan,
            session_id = %session.id,
            "Checkout session created"
        );

        Ok(session)
    }

    /// The account's provider customer, creating and linking one if needed.
    pub async fn get_or_create_customer(&self, account: &Account) -> Result<String> {
        if let Some(customer_ref) = &account.customer_ref {
            return Ok(customer_ref.clone());
        }

        let customer_ref = self
            .provider
            .create_customer(CreateCustomerRequest {
                email: account.email.clone(),
                name: account.name.clone(),
                user_id: account.user_id.clone(),
            })
            .await?;

        let update = AccountUpdate::new().customer_ref(customer_ref.clone());
        self.store
            .update_account(&account.user_id, &update, self.clock.now())
            .await?
            .ok_or_else(|| BillingError::not_found(&account.user_id))?;

        tracing::debug!(
            target: "tollgate::billing::checkout",
            user_id = %account.user_id,
            customer_ref = %customer_ref,
            "Provider customer linked"
        );

        Ok(customer_ref)
    }
}
