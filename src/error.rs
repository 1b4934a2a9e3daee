use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::billing::BillingError;
use crate::identity::IdentityError;

/// The main error type for Tollgate
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Error body returned to API clients.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: String,
    code: &'static str,
    retryable: bool,
    error_id: String,
}

impl TollgateError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// HTTP status for this error.
    ///
    /// `StoreUnavailable` maps to 503 so a webhook sender retries delivery.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Billing(err) => match err {
                BillingError::NotFound { .. } | BillingError::PlanNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                BillingError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                BillingError::InvalidState { .. } => StatusCode::CONFLICT,
                BillingError::InvalidSignature { .. } | BillingError::BadPayload { .. } => {
                    StatusCode::BAD_REQUEST
                }
                BillingError::ProviderRejected { http_status, .. } => match http_status {
                    Some(400..=499) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::BAD_GATEWAY,
                },
                BillingError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Identity(_) => StatusCode::UNAUTHORIZED,
            Self::Config(_) | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Billing(err) => match err {
                BillingError::NotFound { .. } => "not_found",
                BillingError::PlanNotFound { .. } => "plan_not_found",
                BillingError::QuotaExceeded { .. } => "quota_exceeded",
                BillingError::InvalidState { .. } => "invalid_state",
                BillingError::ProviderRejected { .. } => "provider_rejected",
                BillingError::InvalidSignature { .. } => "invalid_signature",
                BillingError::BadPayload { .. } => "bad_payload",
                BillingError::StoreUnavailable { .. } => "store_unavailable",
            },
            Self::Identity(_) => "unauthorized",
            Self::Config(_) => "config",
            Self::Anyhow(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Billing(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns a safe error message suitable for client responses.
    ///
    /// Client errors (4xx) carry their message. Server errors (5xx) return a
    /// generic message; the details are logged server-side only.
    fn safe_message(&self) -> String {
        if self.status_code().is_client_error() {
            self.to_string()
        } else {
            match self.status_code() {
                StatusCode::SERVICE_UNAVAILABLE => "Service unavailable".to_string(),
                StatusCode::BAD_GATEWAY => "Upstream billing provider error".to_string(),
                _ => "Internal server error".to_string(),
            }
        }
    }
}

impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request rejected"
            );
        }

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            code: self.code(),
            retryable: self.is_retryable(),
            error_id,
        });

        (status, body).into_response()
    }
}

/// Result type alias for Tollgate operations
pub type Result<T> = std::result::Result<T, TollgateError>;
