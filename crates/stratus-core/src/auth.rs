//! Per-session authorization context.
//!
//! An immutable snapshot of the signed-in identity, swapped wholesale on
//! every sign-in/out under the session's state lock. Validity checking
//! is pure; the caller decides whether an invalid context closes the
//! connection.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::error::ServiceError;
use crate::identity::Claims;

/// Snapshot of a signed-in identity. Never mutated; replaced atomically.
#[derive(Debug, Clone)]
pub struct AuthorizationContext {
    pub device_id: String,
    pub user_id: String,
    access_token: SecretString,
    /// `None` means the token never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub claims: Claims,
}

impl AuthorizationContext {
    pub fn new(
        device_id: impl Into<String>,
        user_id: impl Into<String>,
        access_token: SecretString,
        expires_at: Option<DateTime<Utc>>,
        claims: Claims,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            access_token,
            expires_at,
            claims,
        }
    }

    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    /// Pure validity check: token present and not expired.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.access_token.expose_secret().is_empty() {
            return Err(ServiceError::Unauthenticated("empty access token".into()));
        }
        if let Some(expires_at) = self.expires_at {
            if Utc::now() > expires_at {
                return Err(ServiceError::Unauthenticated("token is expired".into()));
            }
        }
        Ok(())
    }

    /// Seconds until the token expires; 0 when it never does.
    pub fn expires_in(&self) -> i64 {
        match self.expires_at {
            Some(at) => (at - Utc::now()).num_seconds().max(0),
            None => 0,
        }
    }

    /// Attach the access token to a backend call context.
    pub fn call_context(&self) -> CallContext {
        CallContext::new(self.access_token.clone())
    }
}

// ── CallContext ──────────────────────────────────────────────────────

/// Token-bearing context for downstream backend RPCs.
#[derive(Debug, Clone)]
pub struct CallContext {
    access_token: SecretString,
}

impl CallContext {
    pub fn new(access_token: SecretString) -> Self {
        Self { access_token }
    }

    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }
}

// ── Tests ────────────────────────────────────────────────────────────
