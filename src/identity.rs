//! Bearer credential validation.
//!
//! The engine only needs to know *who* is calling. [`IdentityProvider`] turns
//! an opaque bearer token into an [`Identity`]; [`JwtIdentityProvider`] is the
//! HS256 implementation used by the hosted service.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::IdentityConfig;

const ISSUER: &str = "tollgate";

/// Errors raised while authenticating a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Missing bearer token")]
    MissingToken,
    #[error("Token has expired")]
    Expired,
    #[error("Token signature is invalid")]
    InvalidSignature,
    #[error("Expected an access token")]
    WrongTokenType,
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("Could not issue token: {0}")]
    Issuance(String),
    #[error("No signing secret configured")]
    NotConfigured,
}

impl From<jsonwebtoken::errors::Error> for IdentityError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            _ => Self::Malformed(err.to_string()),
        }
    }
}

/// Token type for distinguishing access vs refresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Short-lived token used for API access.
    Access,
    /// Long-lived token used to obtain new access tokens.
    Refresh,
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_user_id: String,
    pub expires_at: DateTime<Utc>,
    pub token_type: TokenType,
}

/// Trait for identity providers.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Validate a bearer token and return the caller's identity.
    async fn authenticate(&self, token: &str) -> Result<Identity, IdentityError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iss: String,
    exp: i64,
    iat: i64,
    jti: String,
    token_type: TokenType,
}

/// An issued token and its expiry.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub token_type: TokenType,
    pub expires_at: DateTime<Utc>,
}

/// HS256 token issuer and verifier.
#[derive(Clone)]
pub struct JwtIdentityProvider {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl std::fmt::Debug for JwtIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentityProvider")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl JwtIdentityProvider {
    /// Create a provider from a shared secret with default lifetimes.
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_issuer(&[ISSUER]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            access_ttl: Duration::seconds(3600),
            refresh_ttl: Duration::days(30),
        }
    }

    /// Create a provider from the identity section of the configuration.
    pub fn from_config(config: &IdentityConfig) -> Result<Self, IdentityError> {
        let secret: &SecretString = config.jwt_secret.as_ref().ok_or(IdentityError::NotConfigured)?;
        Ok(Self::from_secret(secret.expose_secret().as_bytes())
            .with_ttls(
                Duration::seconds(config.access_token_ttl_secs),
                Duration::seconds(config.refresh_token_ttl_secs),
            ))
    }

    #[must_use]
    pub fn with_ttls(mut self, access: Duration, refresh: Duration) -> Self {
        self.access_ttl = access;
        self.refresh_ttl = refresh;
        self
    }

    /// Issue a token for a user.
    pub fn issue(
        &self,
        user_id: &str,
        token_type: TokenType,
    ) -> Result<IssuedToken, IdentityError> {
        let now = Utc::now();
        let ttl = match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let expires_at = now + ttl;
        let claims = Claims {
            sub: user_id.to_string(),
            iss: ISSUER.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            token_type,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| IdentityError::Issuance(e.to_string()))?;

        Ok(IssuedToken {
            token,
            token_type,
            expires_at,
        })
    }

    /// Decode and verify any token this provider issued.
    pub fn verify(&self, token: &str) -> Result<Identity, IdentityError> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        if token.is_empty() {
            return Err(IdentityError::MissingToken);
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        let expires_at = DateTime::from_timestamp(data.claims.exp, 0)
            .ok_or_else(|| IdentityError::Malformed("exp out of range".to_string()))?;

        Ok(Identity {
            subject_user_id: data.claims.sub,
            expires_at,
            token_type: data.claims.token_type,
        })
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn authenticate(&self, token: &str) -> Result<Identity, IdentityError> {
        let identity = self.verify(token)?;
        // Refresh tokens are only good for minting new access tokens
        if identity.token_type != TokenType::Access {
            tracing::debug!(
                target: "tollgate::identity",
                user_id = %identity.subject_user_id,
                "Rejected refresh token used for authentication"
            );
            return Err(IdentityError::WrongTokenType);
        }
        Ok(identity)
    }
}
