//! Billing-specific error types.
//!
//! Every operation of the quota and subscription engine reports failures as a
//! [`BillingError`]. Absence of a record is a value (`Ok(None)` at the store
//! layer); infrastructure faults are always [`BillingError::StoreUnavailable`],
//! never confused with "not found".

use std::fmt;

use super::storage::StoreError;

/// Billing-specific errors.
///
/// These errors can be converted to `TollgateError` for HTTP responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Lookup errors
    /// No account exists for the user.
    NotFound { user_id: String },
    /// The plan is not part of the catalog.
    PlanNotFound { plan_id: String },

    // Quota errors
    /// The user has used every request in the current billing period.
    QuotaExceeded { user_id: String, used: u64, limit: u64 },

    // State errors
    /// The requested operation does not apply to the current state.
    InvalidState { message: String },

    // Provider errors
    /// The billing provider refused or failed the call.
    ProviderRejected {
        operation: String,
        message: String,
        http_status: Option<u16>,
    },

    // Webhook errors
    /// Webhook signature is missing, malformed, stale, or wrong.
    InvalidSignature { reason: String },
    /// Webhook event data is malformed.
    BadPayload { message: String },

    // Infrastructure
    /// The account store failed or timed out.
    StoreUnavailable { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { user_id } => {
                write!(f, "Account not found: {}", user_id)
            }
            Self::PlanNotFound { plan_id } => {
                write!(f, "Plan not found: {}", plan_id)
            }
            Self::QuotaExceeded { user_id, used, limit } => {
                write!(f, "Request quota exhausted for '{}' ({}/{})", user_id, used, limit)
            }
            Self::InvalidState { message } => {
                write!(f, "Invalid state: {}", message)
            }
            Self::ProviderRejected { operation, message, http_status } => {
                write!(f, "Billing provider error during '{}': {}", operation, message)?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::InvalidSignature { reason } => {
                write!(f, "Invalid webhook signature: {}", reason)
            }
            Self::BadPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::StoreUnavailable { message } => {
                write!(f, "Account store unavailable: {}", message)
            }
        }
    }
}

impl std::error::Error for BillingError {}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(key) => Self::InvalidState {
                message: format!("record already exists: {}", key),
            },
            other => Self::StoreUnavailable {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadPayload {
            message: err.to_string(),
        }
    }
}

impl BillingError {
    pub(crate) fn not_found(user_id: &str) -> Self {
        Self::NotFound {
            user_id: user_id.to_string(),
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub(crate) fn bad_payload(message: impl Into<String>) -> Self {
        Self::BadPayload {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_signature(reason: impl Into<String>) -> Self {
        Self::InvalidSignature {
            reason: reason.into(),
        }
    }

    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::NotFound { .. }
            | Self::PlanNotFound { .. }
            | Self::QuotaExceeded { .. }
            | Self::InvalidState { .. }
            | Self::InvalidSignature { .. }
            | Self::BadPayload { .. } => true,
            Self::ProviderRejected { http_status, .. } => {
                matches!(http_status, Some(400..=499))
            }
            Self::StoreUnavailable { .. } => false,
        }
    }

    /// Check if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. } => true,
            Self::ProviderRejected { http_status, .. } => {
                matches!(http_status, Some(500..=599) | None)
            }
            _ => false,
        }
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. } => true,
            Self::ProviderRejected { http_status, .. } => {
                // Rate limit (429) and server errors (5xx) are retryable
                matches!(http_status, Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }

    /// Whether the error is a missing account or plan.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::PlanNotFound { .. })
    }
}

/// Result type for billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BillingError::PlanNotFound {
            plan_id: "platinum".to_string(),
        };
        assert_eq!(err.to_string(), "Plan not found: platinum");

        let err = BillingError::QuotaExceeded {
            user_id: "user_1".to_string(),
            used: 20,
            limit: 20,
        };
        assert_eq!(err.to_string(), "Request quota exhausted for 'user_1' (20/20)");

        let err = BillingError::ProviderRejected {
            operation: "cancel_at_period_end".to_string(),
            message: "no such subscription".to_string(),
            http_status: Some(404),
        };
        assert_eq!(
            err.to_string(),
            "Billing provider error during 'cancel_at_period_end': no such subscription [HTTP 404]"
        );
    }

    #[test]
    fn test_error_classification() {
        let err = BillingError::not_found("user_1");
        assert!(err.is_client_error());
        assert!(!err.is_server_error());
        assert!(!err.is_retryable());
        assert!(err.is_not_found());

        let err = BillingError::StoreUnavailable {
            message: "connection reset".to_string(),
        };
        assert!(!err.is_client_error());
        assert!(err.is_server_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_provider_rejection_classification() {
        let rejected = |status| BillingError::ProviderRejected {
            operation: "create_customer".to_string(),
            message: "boom".to_string(),
            http_status: status,
        };

        assert!(rejected(Some(400)).is_client_error());
        assert!(!rejected(Some(400)).is_retryable());
        assert!(rejected(Some(429)).is_retryable());
        assert!(rejected(Some(503)).is_server_error());
        assert!(rejected(Some(503)).is_retryable());
        // Transport failures have no status and are not retried blindly
        assert!(rejected(None).is_server_error());
        assert!(!rejected(None).is_retryable());
    }

    #[test]
    fn test_from_store_error() {
        let err: BillingError = StoreError::Unavailable("primary down".to_string()).into();
        assert!(matches!(err, BillingError::StoreUnavailable { .. }));

        let err: BillingError = StoreError::Timeout(std::time::Duration::from_secs(2)).into();
        assert!(err.is_retryable());

        let err: BillingError = StoreError::Duplicate("user_1".to_string()).into();
        assert!(matches!(err, BillingError::InvalidState { .. }));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: BillingError = json_err.into();
        assert!(matches!(err, BillingError::BadPayload { .. }));
    }
}
