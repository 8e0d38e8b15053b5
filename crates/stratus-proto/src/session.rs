// ── Sign-in / sign-out payloads ──
//
// Field names follow the vendor session schema the devices implement
// ("di" / "uid" / "accesstoken" / "login"), so payloads decode directly
// from what constrained clients send.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Sign-in (login=true) or sign-out (login=false) request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SignInRequest {
    #[serde(rename = "di", default)]
    pub device_id: String,

    #[serde(rename = "uid", default)]
    pub user_id: String,

    #[serde(rename = "accesstoken", default)]
    pub access_token: SecretString,

    #[serde(default)]
    pub login: bool,
}

impl SignInRequest {
    /// Check that all required fields are present.
    ///
    /// Sign-in requires every field; sign-out runs the same check after
    /// [`or_current`](Self::or_current) has filled the gaps.
    pub fn check_fields(&self) -> Result<(), ProtoError> {
        if self.device_id.is_empty() {
            return Err(ProtoError::InvalidRequest("invalid device id".into()));
        }
        if self.user_id.is_empty() {
            return Err(ProtoError::InvalidRequest("invalid user id".into()));
        }
        if self.access_token.expose_secret().is_empty() {
            return Err(ProtoError::InvalidRequest("invalid access token".into()));
        }
        Ok(())
    }

    /// Fill any empty field from the currently signed-in identity.
    /// A sign-out may omit fields and reuse the session's context.
    pub fn or_current(mut self, device_id: &str, user_id: &str, access_token: &SecretString) -> Self {
        if self.device_id.is_empty() {
            self.device_id = device_id.to_owned();
        }
        if self.user_id.is_empty() {
            self.user_id = user_id.to_owned();
        }
        if self.access_token.expose_secret().is_empty() {
            self.access_token = access_token.clone();
        }
        self
    }

    pub fn has_empty_fields(&self) -> bool {
        self.device_id.is_empty()
            || self.user_id.is_empty()
            || self.access_token.expose_secret().is_empty()
    }
}

/// Sign-in response body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignInResponse {
    /// Seconds until the access token expires; 0 means it never does.
    #[serde(rename = "expiresin")]
    pub expires_in: i64,
}

// ── Tests ────────────────────────────────────────────────────────────
