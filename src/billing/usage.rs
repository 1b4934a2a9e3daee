//! Token usage and cost recording.
//!
//! Every metered model call produces one immutable [`UsageRecord`] stamped
//! with the user's current billing period. Recording is independent of
//! request admission.
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::billing::{UsageRecorder, UsageRequest};
//!
//! let recorder = UsageRecorder::new(store).with_markup_percent(5.0);
//!
//! let record = recorder
//!     .record(UsageRequest::new("user_1", "gpt-4o", "openai", 1200, 300))
//!     .await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{BillingError, Result};
use super::storage::AccountStore;
use super::types::UsageRecord;
use crate::clock::{Clock, SystemClock};
use crate::config::BillingConfig;

/// Default markup applied on top of the model's base cost.
pub const DEFAULT_MARKUP_PERCENT: f64 = 5.0;

/// Default request type for recorded usage.
pub const DEFAULT_REQUEST_TYPE: &str = "answer";

/// Price of a model per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl ModelPricing {
    /// Used for models missing from the price table.
    pub const FALLBACK: Self = Self {
        prompt_per_1k: 0.001,
        completion_per_1k: 0.002,
    };

    #[must_use]
    pub fn new(prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        Self {
            prompt_per_1k,
            completion_per_1k,
        }
    }

    /// Base cost of a call before markup.
    #[must_use]
    pub fn cost(&self, prompt_tokens: u64, generated_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.prompt_per_1k
            + (generated_tokens as f64 / 1000.0) * self.completion_per_1k
    }
}

/// Per-model price table.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    models: HashMap<String, ModelPricing>,
}

impl PriceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// List prices per 1K tokens for commonly metered models.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with_model("gpt-4o", ModelPricing::new(0.0025, 0.01))
            .with_model("gpt-4o-mini", ModelPricing::new(0.000_15, 0.0006))
            .with_model("gpt-4-turbo", ModelPricing::new(0.01, 0.03))
            .with_model("gpt-4", ModelPricing::new(0.03, 0.06))
            .with_model("gpt-3.5-turbo", ModelPricing::new(0.0005, 0.0015))
            .with_model("claude-3-5-sonnet", ModelPricing::new(0.003, 0.015))
            .with_model("claude-3-haiku", ModelPricing::new(0.000_25, 0.001_25))
            .with_model("claude-3-opus", ModelPricing::new(0.015, 0.075))
    }

    #[must_use]
    pub fn with_model(mut self, model_name: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model_name.into(), pricing);
        self
    }

    /// Add or replace several models at once.
    #[must_use]
    pub fn with_models<I, K>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = (K, ModelPricing)>,
        K: Into<String>,
    {
        self.models
            .extend(models.into_iter().map(|(name, pricing)| (name.into(), pricing)));
        self
    }

    /// Pricing for a model, falling back to [`ModelPricing::FALLBACK`].
    #[must_use]
    pub fn pricing(&self, model_name: &str) -> ModelPricing {
        self.models
            .get(model_name)
            .copied()
            .unwrap_or(ModelPricing::FALLBACK)
    }
}

/// A model call to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRequest {
    pub user_id: String,
    pub model_name: String,
    pub model_provider: String,
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
    pub api_key: Option<String>,
    pub conversation_id: Option<String>,
    pub agent_id: Option<String>,
    pub request_type: Option<String>,
}

impl UsageRequest {
    pub fn new(
        user_id: impl Into<String>,
        model_name: impl Into<String>,
        model_provider: impl Into<String>,
        prompt_tokens: u64,
        generated_tokens: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            model_name: model_name.into(),
            model_provider: model_provider.into(),
            prompt_tokens,
            generated_tokens,
            api_key: None,
            conversation_id: None,
            agent_id: None,
            request_type: None,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    #[must_use]
    pub fn with_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = Some(request_type.into());
        self
    }
}

/// Usage for one model within a summary window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
    pub cost: f64,
}

/// Aggregated usage over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
    pub total_tokens: u64,
    /// Sum of final costs, rounded to 4 decimal places.
    pub total_cost: f64,
    pub by_model: BTreeMap<String, ModelUsage>,
}

/// Write path for usage records.
#[derive(Clone)]
pub struct UsageRecorder<S: AccountStore> {
    store: S,
    pricing: Arc<PriceTable>,
    markup_percent: f64,
    clock: Arc<dyn Clock>,
}

impl<S: AccountStore> UsageRecorder<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            pricing: Arc::new(PriceTable::standard()),
            markup_percent: DEFAULT_MARKUP_PERCENT,
            clock: Arc::new(SystemClock),
        }
    }

    /// A recorder using the configured markup, with configured model prices
    /// layered over [`PriceTable::standard`].
    pub fn from_config(store: S, config: &BillingConfig) -> Self {
        let pricing = PriceTable::standard().with_models(
            config
                .model_pricing
                .iter()
                .map(|(model, pricing)| (model.clone(), *pricing)),
        );
        Self::new(store)
            .with_pricing(pricing)
            .with_markup_percent(config.markup_percent)
    }

    #[must_use]
    pub fn with_pricing(mut self, pricing: PriceTable) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    #[must_use]
    pub fn with_markup_percent(mut self, markup_percent: f64) -> Self {
        self.markup_percent = markup_percent;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Base and final cost of a call.
    #[must_use]
    pub fn calculate_cost(
        &self,
        model_name: &str,
        prompt_tokens: u64,
        generated_tokens: u64,
    ) -> (f64, f64) {
        let base_cost = self.pricing.pricing(model_name).cost(prompt_tokens, generated_tokens);
        (base_cost, base_cost * (1.0 + self.markup_percent / 100.0))
    }

    /// Record one model call against the user's current billing period.
    pub async fn record(&self, request: UsageRequest) -> Result<UsageRecord> {
        let account = self
            .store
            .get_account(&request.user_id)
            .await?
            .ok_or_else(|| BillingError::not_found(&request.user_id))?;

        let (base_cost, final_cost) = self.calculate_cost(
            &request.model_name,
            request.prompt_tokens,
            request.generated_tokens,
        );

        let record = UsageRecord {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            api_key: request.api_key,
            prompt_tokens: request.prompt_tokens,
            generated_tokens: request.generated_tokens,
            model_name: request.model_name,
            model_provider: request.model_provider,
            base_cost,
            markup_percent: self.markup_percent,
            final_cost,
            billing_period_start: account.period.start,
            billing_period_end: account.period.end,
            conversation_id: request.conversation_id,
            agent_id: request.agent_id,
            request_type: request
                .request_type
                .unwrap_or_else(|| DEFAULT_REQUEST_TYPE.to_string()),
            recorded_at: self.clock.now(),
        };

        self.store.insert_usage_record(&record).await?;

        tracing::debug!(
            target: "tollgate::billing::usage",
            user_id = %record.user_id,
            model = %record.model_name,
            tokens = record.total_tokens(),
            final_cost = record.final_cost,
            "Usage recorded"
        );

        Ok(record)
    }

    /// Summarize usage between `from` and `to`, both inclusive.
    ///
    /// The window defaults to the 30 days ending now.
    pub async fn summary(
        &self,
        user_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary> {
        let to = to.unwrap_or_else(|| self.clock.now());
        let from = from.unwrap_or(to - Duration::days(30));
        if from > to {
            return Err(BillingError::invalid_state("summary window starts after it ends"));
        }

        let records = self
            .store
            .list_usage_records(user_id, from, to + Duration::nanoseconds(1))
            .await?;

        let mut summary = UsageSummary {
            from,
            to,
            requests: 0,
            prompt_tokens: 0,
            generated_tokens: 0,
            total_tokens: 0,
            total_cost: 0.0,
            by_model: BTreeMap::new(),
        };

        for record in &records {
            summary.requests += 1;
            summary.prompt_tokens += record.prompt_tokens;
            summary.generated_tokens += record.generated_tokens;
            summary.total_cost += record.final_cost;

            let model = summary.by_model.entry(record.model_name.clone()).or_default();
            model.requests += 1;
            model.prompt_tokens += record.prompt_tokens;
            model.generated_tokens += record.generated_tokens;
            model.cost += record.final_cost;
        }
        summary.total_tokens = summary.prompt_tokens + summary.generated_tokens;
        summary.total_cost = (summary.total_cost * 10_000.0).round() / 10_000.0;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::types::Account;
    use crate::clock::ManualClock;
    use crate::billing::storage::memory::InMemoryAccountStore;

    async fn setup() -> (UsageRecorder<InMemoryAccountStore>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = InMemoryAccountStore::new();
        store
            .insert_account(&Account::new("user_1", "a@example.com", clock.now(), 30))
            .await
            .unwrap();

        let pricing = PriceTable::new().with_model("gpt-4o", ModelPricing::new(0.005, 0.015));
        let recorder = UsageRecorder::new(store)
            .with_pricing(pricing)
            .with_clock(Arc::new(clock.clone()));
        (recorder, clock)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_fallback_pricing() {
        let cost = PriceTable::new().pricing("unknown-model").cost(1000, 1000);
        assert!(approx(cost, 0.003));
    }

    #[test]
    fn test_standard_table_prices_known_models() {
        let table = PriceTable::standard();
        assert_eq!(table.pricing("gpt-4o"), ModelPricing::new(0.0025, 0.01));
        assert_eq!(table.pricing("local-llm"), ModelPricing::FALLBACK);
    }

    #[test]
    fn test_from_config_prices_known_models() {
        let mut config = BillingConfig::default();
        config.markup_percent = 10.0;
        config
            .model_pricing
            .insert("house-model".to_string(), ModelPricing::new(0.004, 0.008));
        let recorder = UsageRecorder::from_config(InMemoryAccountStore::new(), &config);

        // Built-in price, above the fallback rate
        let (base, total) = recorder.calculate_cost("gpt-4o", 1000, 1000);
        assert!(approx(base, 0.0125));
        assert!(base > ModelPricing::FALLBACK.cost(1000, 1000));
        assert!(approx(total, 0.0125 * 1.1));

        let (base, _) = recorder.calculate_cost("house-model", 1000, 1000);
        assert!(approx(base, 0.012));
        let (base, _) = recorder.calculate_cost("local-llm", 1000, 1000);
        assert!(approx(base, 0.003));
    }

    #[tokio::test]
    async fn test_record_applies_markup_and_period() {
        let (recorder, clock) = setup().await;

        let record = recorder
            .record(
                UsageRequest::new("user_1", "gpt-4o", "openai", 2000, 1000)
                    .with_conversation("conv_1"),
            )
            .await
            .unwrap();

        assert!(approx(record.base_cost, 0.025));
        assert!(approx(record.final_cost, 0.025 * 1.05));
        assert!(approx(record.markup_percent, 5.0));
        assert_eq!(record.request_type, "answer");
        assert_eq!(record.billing_period_start, clock.now());
        assert_eq!(record.billing_period_end, clock.now() + Duration::days(30));
        assert_eq!(record.conversation_id.as_deref(), Some("conv_1"));
        assert_eq!(record.total_tokens(), 3000);
    }

    #[tokio::test]
    async fn test_record_unknown_user() {
        let (recorder, _clock) = setup().await;
        let result = recorder
            .record(UsageRequest::new("nobody", "gpt-4o", "openai", 1, 1))
            .await;
        assert!(matches!(result, Err(BillingError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_custom_markup() {
        let (recorder, _clock) = setup().await;
        let recorder = recorder.with_markup_percent(0.0);
        let (base, total) = recorder.calculate_cost("mystery", 1000, 0);
        assert!(approx(base, 0.001));
        assert!(approx(total, 0.001));
    }

    #[tokio::test]
    async fn test_summary_groups_by_model() {
        let (recorder, clock) = setup().await;

        recorder
            .record(UsageRequest::new("user_1", "gpt-4o", "openai", 1000, 0))
            .await
            .unwrap();
        clock.advance(Duration::hours(1));
        recorder
            .record(UsageRequest::new("user_1", "gpt-4o", "openai", 1000, 0))
            .await
            .unwrap();
        recorder
            .record(UsageRequest::new("user_1", "claude", "anthropic", 0, 500))
            .await
            .unwrap();

        let summary = recorder.summary("user_1", None, None).await.unwrap();
        assert_eq!(summary.requests, 3);
        assert_eq!(summary.prompt_tokens, 2000);
        assert_eq!(summary.generated_tokens, 500);
        assert_eq!(summary.total_tokens, 2500);
        assert_eq!(summary.by_model.len(), 2);
        assert_eq!(summary.by_model["gpt-4o"].requests, 2);
        assert_eq!(summary.by_model["claude"].generated_tokens, 500);

        // Window excluding the first record
        let later = recorder
            .summary("user_1", Some(clock.now() - Duration::minutes(1)), None)
            .await
            .unwrap();
        assert_eq!(later.requests, 2);
    }

    #[tokio::test]
    async fn test_summary_rejects_inverted_window() {
        let (recorder, clock) = setup().await;
        let result = recorder
            .summary("user_1", Some(clock.now()), Some(clock.now() - Duration::days(1)))
            .await;
        assert!(matches!(result, Err(BillingError::InvalidState { .. })));
    }
}
