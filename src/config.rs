use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::billing::ModelPricing;
use crate::error::TollgateError;
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};

/// Main configuration for a Tollgate deployment
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// Billing period, usage pricing and webhook settings.
#[derive(Debug, Deserialize, Serialize)]
pub struct BillingConfig {
    /// Length of a billing period in days.
    #[serde(default = "default_period_days")]
    pub period_days: u32,
    /// Percentage added on top of the provider cost of each usage record.
    #[serde(default = "default_markup_percent")]
    pub markup_percent: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Shared secret for provider webhook signatures. Never serialized.
    #[serde(skip)]
    pub webhook_secret: Option<SecretString>,
    /// Maximum accepted age of a signed webhook, in seconds.
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: i64,
    /// Processed webhook ids older than this are pruned.
    #[serde(default = "default_retention_days")]
    pub processed_event_retention_days: u32,
    /// Default number of entries returned by subscription history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Provider price reference for the pro plan.
    #[serde(default = "default_pro_price_id")]
    pub pro_price_id: String,
    #[serde(default = "default_enterprise_price_id")]
    pub enterprise_price_id: String,
    /// Per-model prices layered over the built-in table.
    #[serde(default)]
    pub model_pricing: HashMap<String, ModelPricing>,
}

/// Bearer token settings.
#[derive(Debug, Deserialize, Serialize)]
pub struct IdentityConfig {
    #[serde(skip)]
    pub jwt_secret: Option<SecretString>,
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: i64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: i64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            period_days: default_period_days(),
            markup_percent: default_markup_percent(),
            currency: default_currency(),
            webhook_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            processed_event_retention_days: default_retention_days(),
            history_limit: default_history_limit(),
            pro_price_id: default_pro_price_id(),
            enterprise_price_id: default_enterprise_price_id(),
            model_pricing: HashMap::new(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_period_days() -> u32 {
    30
}

fn default_markup_percent() -> f64 {
    5.0
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_webhook_tolerance_secs() -> i64 {
    300
}

fn default_retention_days() -> u32 {
    30
}

fn default_history_limit() -> usize {
    10
}

fn default_pro_price_id() -> String {
    "price_pro".to_string()
}

fn default_enterprise_price_id() -> String {
    "price_enterprise".to_string()
}

fn default_access_ttl() -> i64 {
    3600
}

fn default_refresh_ttl() -> i64 {
    30 * 24 * 3600
}

impl BillingConfig {
    /// Load billing settings from `TOLLGATE_*` variables.
    ///
    /// The webhook secret is also read from `STRIPE_WEBHOOK_SECRET`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(days) = parse_env_with_prefix("BILLING_PERIOD_DAYS") {
            config.period_days = days;
        }
        if let Some(markup) = parse_env_with_prefix("USAGE_MARKUP_PERCENT") {
            config.markup_percent = markup;
        }
        if let Some(currency) = get_env_with_prefix("BILLING_CURRENCY") {
            config.currency = currency.to_lowercase();
        }
        config.webhook_secret = get_env_with_prefix("WEBHOOK_SECRET")
            .or_else(|| get_env_with_prefix("STRIPE_WEBHOOK_SECRET"))
            .map(SecretString::from);
        if let Some(tolerance) = parse_env_with_prefix("WEBHOOK_TOLERANCE_SECS") {
            config.webhook_tolerance_secs = tolerance;
        }
        if let Some(days) = parse_env_with_prefix("PROCESSED_EVENT_RETENTION_DAYS") {
            config.processed_event_retention_days = days;
        }
        if let Some(limit) = parse_env_with_prefix("HISTORY_LIMIT") {
            config.history_limit = limit;
        }
        if let Some(price) = get_env_with_prefix("PRO_PRICE_ID") {
            config.pro_price_id = price;
        }
        if let Some(price) = get_env_with_prefix("ENTERPRISE_PRICE_ID") {
            config.enterprise_price_id = price;
        }
        // JSON object: {"model": {"prompt_per_1k": 0.001, "completion_per_1k": 0.002}}
        if let Some(raw) = get_env_with_prefix("MODEL_PRICING") {
            match serde_json::from_str(&raw) {
                Ok(pricing) => config.model_pricing = pricing,
                Err(e) => tracing::warn!(
                    target: "tollgate::config",
                    error = %e,
                    "Ignoring unparseable MODEL_PRICING"
                ),
            }
        }
        config
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.period_days == 0 {
            return Err(TollgateError::config("Billing period_days must be greater than 0"));
        }
        if !self.markup_percent.is_finite() || self.markup_percent < 0.0 {
            return Err(TollgateError::config(format!(
                "Usage markup must be a non-negative number, got: {}",
                self.markup_percent
            )));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(TollgateError::config(format!(
                "Currency must be a three-letter ISO code, got: {}",
                self.currency
            )));
        }
        if self.webhook_tolerance_secs <= 0 {
            return Err(TollgateError::config(
                "Webhook tolerance must be greater than 0 seconds",
            ));
        }
        if self.history_limit == 0 {
            return Err(TollgateError::config("History limit must be greater than 0"));
        }
        if let Some(secret) = &self.webhook_secret {
            if secret.expose_secret().is_empty() {
                return Err(TollgateError::config("Webhook secret must not be empty"));
            }
        }
        if self.pro_price_id.is_empty() || self.enterprise_price_id.is_empty() {
            return Err(TollgateError::config("Plan price ids must not be empty"));
        }
        for (model, pricing) in &self.model_pricing {
            let valid = |price: f64| price.is_finite() && price >= 0.0;
            if !valid(pricing.prompt_per_1k) || !valid(pricing.completion_per_1k) {
                return Err(TollgateError::config(format!(
                    "Model prices must be non-negative numbers, got invalid prices for {}",
                    model
                )));
            }
        }
        Ok(())
    }
}

impl IdentityConfig {
    /// Load token settings from `TOLLGATE_*` variables (`JWT_SECRET` also accepted).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.jwt_secret = get_env_with_prefix("JWT_SECRET").map(SecretString::from);
        if let Some(ttl) = parse_env_with_prefix("ACCESS_TOKEN_TTL_SECS") {
            config.access_token_ttl_secs = ttl;
        }
        if let Some(ttl) = parse_env_with_prefix("REFRESH_TOKEN_TTL_SECS") {
            config.refresh_token_ttl_secs = ttl;
        }
        config
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.access_token_ttl_secs <= 0 {
            return Err(TollgateError::config("Access token TTL must be greater than 0"));
        }
        if self.refresh_token_ttl_secs < self.access_token_ttl_secs {
            return Err(TollgateError::config(
                "Refresh token TTL must not be shorter than the access token TTL",
            ));
        }
        if let Some(secret) = &self.jwt_secret {
            // HS256 keys shorter than the digest are trivially brute-forced
            if secret.expose_secret().len() < 32 {
                return Err(TollgateError::config(
                    "JWT secret must be at least 32 bytes long",
                ));
            }
        }
        Ok(())
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_billing(mut self, billing: BillingConfig) -> Self {
        self.config.billing = billing;
        self
    }

    pub fn with_period_days(mut self, days: u32) -> Self {
        self.config.billing.period_days = days;
        self
    }

    pub fn with_markup_percent(mut self, markup: f64) -> Self {
        self.config.billing.markup_percent = markup;
        self
    }

    pub fn with_model_pricing(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.config.billing.model_pricing.insert(model.into(), pricing);
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.billing.webhook_secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_identity(mut self, identity: IdentityConfig) -> Self {
        self.config.identity = identity;
        self
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.identity.jwt_secret = Some(SecretString::from(secret.into()));
        self
    }

    /// Load configuration from environment variables with TOLLGATE_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        self.config.billing = BillingConfig::from_env();
        self.config.identity = IdentityConfig::from_env();

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::Config`] for an unknown log level, a zero
    /// billing period, a negative markup, a malformed currency, a short JWT
    /// secret, or inconsistent token lifetimes.
    pub fn build(self) -> crate::error::Result<Config> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(TollgateError::config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        self.config.billing.validate()?;
        self.config.identity.validate()?;

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.billing.period_days, 30);
        assert_eq!(config.billing.markup_percent, 5.0);
        assert_eq!(config.billing.currency, "usd");
        assert_eq!(config.billing.webhook_tolerance_secs, 300);
        assert_eq!(config.billing.processed_event_retention_days, 30);
        assert_eq!(config.billing.history_limit, 10);
        assert!(config.billing.webhook_secret.is_none());
        assert_eq!(config.billing.pro_price_id, "price_pro");
        assert_eq!(config.billing.enterprise_price_id, "price_enterprise");
        assert!(config.billing.model_pricing.is_empty());
        assert_eq!(config.identity.access_token_ttl_secs, 3600);
        assert_eq!(config.identity.refresh_token_ttl_secs, 2_592_000);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(ConfigBuilder::new().with_log_level("loud").build().is_err());
        assert!(ConfigBuilder::new().with_period_days(0).build().is_err());
        assert!(ConfigBuilder::new().with_markup_percent(-1.0).build().is_err());
        assert!(ConfigBuilder::new().with_markup_percent(f64::NAN).build().is_err());
        assert!(ConfigBuilder::new().with_jwt_secret("short").build().is_err());
        assert!(ConfigBuilder::new().with_webhook_secret("").build().is_err());
        assert!(
            ConfigBuilder::new()
                .with_model_pricing("gpt-4o", ModelPricing::new(-0.1, 0.01))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_secrets_are_not_serialized() {
        let config = ConfigBuilder::new()
            .with_webhook_secret("whsec_test")
            .with_jwt_secret("0123456789abcdef0123456789abcdef")
            .build()
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("whsec_test"));
        assert!(!json.contains("0123456789abcdef"));
        assert!(!format!("{:?}", config).contains("whsec_test"));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config =
            serde_json::from_str(r#"{"billing": {"period_days": 7}}"#).unwrap();
        assert_eq!(config.billing.period_days, 7);
        assert_eq!(config.billing.markup_percent, 5.0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_env() {
        unsafe {
            std::env::set_var("TOLLGATE_BILLING_PERIOD_DAYS", "14");
            std::env::set_var("TOLLGATE_USAGE_MARKUP_PERCENT", "12.5");
            std::env::set_var("TOLLGATE_WEBHOOK_SECRET", "whsec_from_env");
        }

        let config = ConfigBuilder::new().from_env().build().unwrap();
        assert_eq!(config.billing.period_days, 14);
        assert_eq!(config.billing.markup_percent, 12.5);
        assert_eq!(
            config
                .billing
                .webhook_secret
                .as_ref()
                .map(|s| s.expose_secret().to_string()),
            Some("whsec_from_env".to_string())
        );

        unsafe {
            std::env::remove_var("TOLLGATE_BILLING_PERIOD_DAYS");
            std::env::remove_var("TOLLGATE_USAGE_MARKUP_PERCENT");
            std::env::remove_var("TOLLGATE_WEBHOOK_SECRET");
        }
    }

    #[test]
    fn test_prices_from_env() {
        unsafe {
            std::env::set_var("TOLLGATE_PRO_PRICE_ID", "price_live_pro");
            std::env::set_var(
                "TOLLGATE_MODEL_PRICING",
                r#"{"house-model": {"prompt_per_1k": 0.004, "completion_per_1k": 0.008}}"#,
            );
        }

        let billing = BillingConfig::from_env();
        assert_eq!(billing.pro_price_id, "price_live_pro");
        assert_eq!(billing.enterprise_price_id, "price_enterprise");
        assert_eq!(
            billing.model_pricing.get("house-model"),
            Some(&ModelPricing::new(0.004, 0.008))
        );

        unsafe {
            std::env::remove_var("TOLLGATE_PRO_PRICE_ID");
            std::env::remove_var("TOLLGATE_MODEL_PRICING");
        }
    }
}
