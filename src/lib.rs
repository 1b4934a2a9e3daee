//! Tollgate - quota and subscription consistency for hosted SaaS products
//!
//! Tollgate decides whether a user's request fits their plan's quota, rolls
//! billing periods over exactly once, and reconciles local subscription
//! state with the payment provider's webhook stream.
//!
//! # Features
//!
//! - **Quota**: atomic per-period request counting with strict admission
//! - **Billing periods**: lazy, compare-and-set rollover
//! - **Subscriptions**: upgrades, cancellations and an append-only history
//! - **Webhooks**: signature verification with exactly-once application
//! - **Usage**: per-call token cost records with markup
//! - **Identity**: HS256 bearer tokens
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tollgate::billing::{InMemoryAccountStore, PlanCatalog, RequestGate};
//! use tollgate::ConfigBuilder;
//!
//! #[tokio::main]
//! async fn main() -> tollgate::Result<()> {
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     tollgate::init_tracing_with_config(&config);
//!
//!     let store = InMemoryAccountStore::new();
//!     let gate = RequestGate::new(store, PlanCatalog::from_config(&config.billing))
//!         .with_period_days(config.billing.period_days);
//!
//!     let quota = gate.require("user_1").await?;
//!     println!("{} requests left", quota.remaining);
//!     Ok(())
//! }
//! ```

pub mod billing;
pub mod clock;
mod config;
mod error;
pub mod identity;
pub mod testing;
mod utils;

// Re-exports for public API
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BillingConfig, Config, ConfigBuilder, IdentityConfig, LoggingConfig};
pub use error::{ErrorResponse, Result, TollgateError};
pub use identity::{Identity, IdentityError, IdentityProvider, JwtIdentityProvider, TokenType};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "tollgate=debug")
/// - `TOLLGATE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("TOLLGATE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
