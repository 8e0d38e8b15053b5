//! Identity-service interfaces: token claims, the claims verifier, and
//! the ownership cache with its device (de)registration feed.
//!
//! Token validation mechanics (signatures, JWKS rotation) live behind
//! [`ClaimsVerifier`]; the session engine only consumes verified claims.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::SecretString;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::CallContext;
use crate::error::ServiceError;

// ── Claims ───────────────────────────────────────────────────────────

/// Verified claims extracted from an access token.
#[derive(Debug, Clone, Default)]
pub struct Claims(serde_json::Map<String, Value>);

impl Claims {
    pub fn new(claims: serde_json::Map<String, Value>) -> Self {
        Self(claims)
    }

    /// Token expiry from the standard `exp` claim (seconds since epoch).
    /// `None` means the token never expires.
    pub fn expires_at(&self) -> Result<Option<DateTime<Utc>>, ServiceError> {
        let Some(exp) = self.0.get("exp") else {
            return Ok(None);
        };
        let seconds = exp
            .as_i64()
            .ok_or_else(|| ServiceError::TokenValidation("non-numeric exp claim".into()))?;
        match Utc.timestamp_opt(seconds, 0).single() {
            Some(at) => Ok(Some(at)),
            None => Err(ServiceError::TokenValidation(format!(
                "exp claim out of range: {seconds}"
            ))),
        }
    }

    /// Device id carried in the named claim, if any.
    pub fn device_id(&self, claim: &str) -> Option<String> {
        self.0.get(claim)?.as_str().map(str::to_owned)
    }

    /// Check that the named owner claim matches `expected`. The claim may
    /// be a single string or an array of strings.
    pub fn validate_owner(&self, claim: &str, expected: &str) -> Result<(), ServiceError> {
        let value = self
            .0
            .get(claim)
            .ok_or_else(|| ServiceError::OwnerClaim(format!("missing claim '{claim}'")))?;
        let matches = match value {
            Value::String(owner) => owner == expected,
            Value::Array(owners) => owners.iter().any(|v| v.as_str() == Some(expected)),
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(ServiceError::OwnerClaim(format!(
                "claim '{claim}' does not match user id '{expected}'"
            )))
        }
    }
}

/// Validates an access token and returns its claims.
#[async_trait]
pub trait ClaimsVerifier: Send + Sync {
    async fn validate(&self, token: &SecretString) -> Result<Claims, ServiceError>;
}

// ── Token grants ─────────────────────────────────────────────────────

/// Result of an OAuth token exchange or refresh, cached per session so
/// concurrent identical calls collapse into one in-flight exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_in: i64,
}

// ── Ownership ────────────────────────────────────────────────────────

/// Device (de)registration event delivered through the ownership feed.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Registered {
        owner: String,
        device_ids: Vec<String>,
    },
    Unregistered {
        owner: String,
        device_ids: Vec<String>,
    },
}

pub type DeviceEventHandler = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Handle releasing a device-event subscription.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Shared ownership cache backed by the identity service.
#[async_trait]
pub trait OwnerCache: Send + Sync {
    /// Whether the calling user (identified by the token in `ctx`) owns
    /// the given device.
    async fn owns_device(&self, ctx: &CallContext, device_id: &str) -> Result<bool, ServiceError>;

    /// Subscribe to device (de)registration events for `owner`.
    ///
    /// Sessions subscribe *before* checking ownership so a
    /// deregistration racing the check is never missed.
    async fn subscribe(
        &self,
        owner: &str,
        handler: DeviceEventHandler,
    ) -> Result<Unsubscribe, ServiceError>;
}

// ── Tests ────────────────────────────────────────────────────────────
