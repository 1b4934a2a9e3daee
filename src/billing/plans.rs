//! Plan catalog.
//!
//! Maps each subscription tier to its request limit, price and the provider
//! price reference used at checkout.
//!
//! ```rust
//! use tollgate::billing::{PlanCatalog, PlanId};
//!
//! let catalog = PlanCatalog::builder()
//!     .plan(PlanId::Free)
//!         .request_limit(20)
//!         .done()
//!     .plan(PlanId::Pro)
//!         .request_limit(10_000)
//!         .price_cents(1500)
//!         .external_price("price_pro_monthly")
//!         .features(["priority_support"])
//!         .done()
//!     .build();
//!
//! assert_eq!(catalog.limit(PlanId::Pro), Some(10_000));
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{BillingError, Result};
use crate::config::BillingConfig;

/// Subscription tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    Free,
    Pro,
    Enterprise,
}

impl PlanId {
    pub const ALL: [PlanId; 3] = [PlanId::Free, PlanId::Pro, PlanId::Enterprise];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanId {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(BillingError::PlanNotFound {
                plan_id: s.to_string(),
            }),
        }
    }
}

/// Definition of a single plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanDefinition {
    pub id: PlanId,
    /// Requests allowed per billing period.
    pub request_limit: u64,
    /// Price per billing period in the smallest currency unit.
    pub price_cents: i64,
    /// Currency code (e.g., "usd").
    pub currency: String,
    /// Provider price reference used for checkout. Free plans have none.
    pub external_price_ref: Option<String>,
    pub features: HashSet<String>,
    pub display_name: Option<String>,
}

impl PlanDefinition {
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.price_cents == 0
    }

    /// Display name, falling back to the capitalized plan id.
    #[must_use]
    pub fn name(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => {
                let id = self.id.as_str();
                let mut chars = id.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
        }
    }

    /// Price formatted for display, e.g. `$15.00`.
    #[must_use]
    pub fn formatted_price(&self) -> String {
        let symbol = match self.currency.as_str() {
            "usd" => "$",
            "eur" => "€",
            "gbp" => "£",
            _ => "",
        };
        let amount = format!("{}.{:02}", self.price_cents / 100, self.price_cents % 100);
        if symbol.is_empty() {
            format!("{} {}", amount, self.currency.to_uppercase())
        } else {
            format!("{}{}", symbol, amount)
        }
    }
}

/// The set of plans a deployment sells.
#[derive(Clone, Debug, Default)]
pub struct PlanCatalog {
    plans: HashMap<PlanId, PlanDefinition>,
}

impl PlanCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> PlanCatalogBuilder {
        PlanCatalogBuilder::new()
    }

    /// The default catalog: free (20 requests), pro (10 000 requests, $15)
    /// and enterprise (100 000 requests, $30).
    #[must_use]
    pub fn standard() -> Self {
        Self::standard_in("usd")
    }

    /// The default catalog priced in `currency`.
    #[must_use]
    pub fn standard_in(currency: &str) -> Self {
        Self::standard_with(currency, "price_pro", "price_enterprise")
    }

    /// The default catalog with the configured currency and provider price ids.
    #[must_use]
    pub fn from_config(config: &BillingConfig) -> Self {
        Self::standard_with(
            &config.currency,
            &config.pro_price_id,
            &config.enterprise_price_id,
        )
    }

    fn standard_with(currency: &str, pro_price: &str, enterprise_price: &str) -> Self {
        Self::builder()
            .currency(currency)
            .plan(PlanId::Free)
            .request_limit(20)
            .features(["basic_models"])
            .display_name("Free")
            .done()
            .plan(PlanId::Pro)
            .request_limit(10_000)
            .price_cents(1500)
            .external_price(pro_price)
            .features(["basic_models", "advanced_models", "priority_support"])
            .display_name("Pro")
            .done()
            .plan(PlanId::Enterprise)
            .request_limit(100_000)
            .price_cents(3000)
            .external_price(enterprise_price)
            .features(["basic_models", "advanced_models", "priority_support", "custom_agents"])
            .display_name("Enterprise")
            .done()
            .build()
    }

    /// Add or replace a plan.
    pub fn add(&mut self, plan: PlanDefinition) {
        self.plans.insert(plan.id, plan);
    }

    #[must_use]
    pub fn get(&self, plan: PlanId) -> Option<&PlanDefinition> {
        self.plans.get(&plan)
    }

    /// Get a plan, failing with `PlanNotFound` when it is not sold.
    pub fn require(&self, plan: PlanId) -> Result<&PlanDefinition> {
        self.plans.get(&plan).ok_or_else(|| BillingError::PlanNotFound {
            plan_id: plan.to_string(),
        })
    }

    /// Request limit for a plan.
    #[must_use]
    pub fn limit(&self, plan: PlanId) -> Option<u64> {
        self.plans.get(&plan).map(|p| p.request_limit)
    }

    #[must_use]
    pub fn contains(&self, plan: PlanId) -> bool {
        self.plans.contains_key(&plan)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Iterate over plans, cheapest first.
    pub fn iter(&self) -> impl Iterator<Item = &PlanDefinition> {
        let mut plans: Vec<&PlanDefinition> = self.plans.values().collect();
        plans.sort_by_key(|p| (p.price_cents, p.id));
        plans.into_iter()
    }

    /// Find plan by provider price reference.
    #[must_use]
    pub fn find_by_external_price(&self, price_ref: &str) -> Option<&PlanDefinition> {
        self.plans
            .values()
            .find(|p| p.external_price_ref.as_deref() == Some(price_ref))
    }
}

/// Builder for constructing a catalog.
#[derive(Debug, Default)]
pub struct PlanCatalogBuilder {
    plans: HashMap<PlanId, PlanDefinition>,
    currency: Option<String>,
}

impl PlanCatalogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default currency for plans that do not set one.
    #[must_use]
    pub fn currency(mut self, currency: &str) -> Self {
        self.currency = Some(currency.to_lowercase());
        self
    }

    /// Start defining a plan.
    #[must_use]
    pub fn plan(self, id: PlanId) -> PlanBuilder {
        PlanBuilder {
            parent: self,
            id,
            request_limit: 0,
            price_cents: 0,
            currency: None,
            external_price_ref: None,
            features: HashSet::new(),
            display_name: None,
        }
    }

    #[must_use]
    pub fn build(self) -> PlanCatalog {
        PlanCatalog { plans: self.plans }
    }

    fn add_plan(mut self, plan: PlanDefinition) -> Self {
        self.plans.insert(plan.id, plan);
        self
    }
}

/// Builder for a single plan.
#[derive(Debug)]
pub struct PlanBuilder {
    parent: PlanCatalogBuilder,
    id: PlanId,
    request_limit: u64,
    price_cents: i64,
    currency: Option<String>,
    external_price_ref: Option<String>,
    features: HashSet<String>,
    display_name: Option<String>,
}

impl PlanBuilder {
    /// Requests allowed per billing period.
    #[must_use]
    pub fn request_limit(mut self, limit: u64) -> Self {
        self.request_limit = limit;
        self
    }

    #[must_use]
    pub fn price_cents(mut self, cents: i64) -> Self {
        self.price_cents = cents;
        self
    }

    #[must_use]
    pub fn currency(mut self, currency: &str) -> Self {
        self.currency = Some(currency.to_lowercase());
        self
    }

    /// Provider price reference used when creating checkout sessions.
    #[must_use]
    pub fn external_price(mut self, price_ref: &str) -> Self {
        self.external_price_ref = Some(price_ref.to_string());
        self
    }

    #[must_use]
    pub fn features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    /// Finish defining this plan and return to the parent builder.
    #[must_use]
    pub fn done(self) -> PlanCatalogBuilder {
        let currency = self
            .currency
            .or_else(|| self.parent.currency.clone())
            .unwrap_or_else(|| "usd".to_string());
        let plan = PlanDefinition {
            id: self.id,
            request_limit: self.request_limit,
            price_cents: self.price_cents,
            currency,
            external_price_ref: self.external_price_ref,
            features: self.features,
            display_name: self.display_name,
        };
        self.parent.add_plan(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_from_config() {
        let config = BillingConfig {
            currency: "eur".to_string(),
            pro_price_id: "price_live_pro".to_string(),
            ..BillingConfig::default()
        };
        let catalog = PlanCatalog::from_config(&config);

        let pro = catalog.get(PlanId::Pro).unwrap();
        assert_eq!(pro.external_price_ref.as_deref(), Some("price_live_pro"));
        assert_eq!(pro.currency, "eur");
        let enterprise = catalog.get(PlanId::Enterprise).unwrap();
        assert_eq!(enterprise.external_price_ref.as_deref(), Some("price_enterprise"));
    }

    #[test]
    fn test_standard_catalog() {
        let catalog = PlanCatalog::standard();

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.limit(PlanId::Free), Some(20));
        assert_eq!(catalog.limit(PlanId::Pro), Some(10_000));
        assert_eq!(catalog.limit(PlanId::Enterprise), Some(100_000));

        let free = catalog.get(PlanId::Free).unwrap();
        assert!(free.is_free());
        assert!(free.external_price_ref.is_none());

        let pro = catalog.get(PlanId::Pro).unwrap();
        assert_eq!(pro.price_cents, 1500);
        assert_eq!(pro.currency, "usd");
        assert_eq!(pro.formatted_price(), "$15.00");
        assert!(pro.has_feature("priority_support"));
        assert!(!free.has_feature("priority_support"));
    }

    #[test]
    fn test_builder_currency_and_lookup() {
        let catalog = PlanCatalog::builder()
            .currency("GBP")
            .plan(PlanId::Free)
            .request_limit(5)
            .done()
            .plan(PlanId::Pro)
            .request_limit(50)
            .price_cents(999)
            .external_price("price_pro_gbp")
            .done()
            .build();

        let pro = catalog.find_by_external_price("price_pro_gbp").unwrap();
        assert_eq!(pro.id, PlanId::Pro);
        assert_eq!(pro.currency, "gbp");
        assert_eq!(pro.formatted_price(), "£9.99");
        assert_eq!(pro.name(), "Pro");
        assert!(catalog.find_by_external_price("price_unknown").is_none());
    }

    #[test]
    fn test_missing_plan() {
        let catalog = PlanCatalog::builder()
            .plan(PlanId::Free)
            .request_limit(20)
            .done()
            .build();

        assert_eq!(catalog.limit(PlanId::Enterprise), None);
        assert!(matches!(
            catalog.require(PlanId::Enterprise),
            Err(BillingError::PlanNotFound { plan_id }) if plan_id == "enterprise"
        ));
    }

    #[test]
    fn test_iter_cheapest_first() {
        let ids: Vec<PlanId> = PlanCatalog::standard().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PlanId::Free, PlanId::Pro, PlanId::Enterprise]);
    }

    #[test]
    fn test_plan_id_parse() {
        assert_eq!("pro".parse::<PlanId>().unwrap(), PlanId::Pro);
        assert_eq!(" Enterprise ".parse::<PlanId>().unwrap(), PlanId::Enterprise);
        assert!(matches!(
            "platinum".parse::<PlanId>(),
            Err(BillingError::PlanNotFound { .. })
        ));
        assert_eq!(PlanId::Free.to_string(), "free");
        assert_eq!(serde_json::to_string(&PlanId::Enterprise).unwrap(), "\"enterprise\"");
    }
}
