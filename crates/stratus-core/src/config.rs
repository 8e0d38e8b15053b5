// ── Gateway configuration ──
//
// Plain serde structs; layered loading (files, env) is the embedding
// binary's concern.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Serde helper: durations as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Top-level configuration for the session engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Keep-alive timeout of the device transport. Also bounds every
    /// device-facing request and every best-effort backend call issued
    /// during teardown.
    #[serde(default = "default_keep_alive", with = "duration_secs")]
    pub keep_alive_timeout: Duration,

    #[serde(default)]
    pub authorization: AuthorizationConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub task_queue: TaskQueueConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout: default_keep_alive(),
            authorization: AuthorizationConfig::default(),
            tls: TlsConfig::default(),
            task_queue: TaskQueueConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ServiceError> {
        let invalid = |field: &str, reason: &str| {
            Err(ServiceError::Internal(format!(
                "invalid config {field}: {reason}"
            )))
        };
        if self.keep_alive_timeout.is_zero() {
            return invalid("keep_alive_timeout", "must be positive");
        }
        if self.authorization.owner_claim.is_empty() {
            return invalid("authorization.owner_claim", "must not be empty");
        }
        if self.task_queue.workers == 0 {
            return invalid("task_queue.workers", "must be positive");
        }
        if self.task_queue.capacity == 0 {
            return invalid("task_queue.capacity", "must be positive");
        }
        Ok(())
    }
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(20)
}

// ── Authorization ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Token claim asserting the device owner. Compared against the
    /// user id presented at sign-in.
    #[serde(default = "default_owner_claim")]
    pub owner_claim: String,

    /// Optional token claim carrying the device id. When set, it takes
    /// precedence over both the transport-bound identity and the
    /// request-supplied device id.
    #[serde(default)]
    pub device_id_claim: Option<String>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            owner_claim: default_owner_claim(),
            device_id_claim: None,
        }
    }
}

fn default_owner_claim() -> String {
    "sub".to_owned()
}

// ── TLS policy ───────────────────────────────────────────────────────

/// Policy knobs for the (externally terminated) TLS layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Require a client-certificate-derived device identity and bind the
    /// token's device id claim to it.
    #[serde(default)]
    pub client_certificate_required: bool,

    /// Cap the session lifetime at the client certificate's expiry.
    #[serde(default)]
    pub disconnect_on_expired_certificate: bool,
}

// ── Task queue ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// Number of workers; also the number of per-key ordering partitions.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Queue capacity per worker. Submissions beyond it fail instead of
    /// blocking the protocol read path.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            capacity: default_capacity(),
        }
    }
}

fn default_workers() -> usize {
    8
}

fn default_capacity() -> usize {
    1024
}

// ── Reconnect backoff ────────────────────────────────────────────────

/// Exponential backoff configuration for the device subscriber's
/// reconnection to the backend feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    #[serde(default = "default_initial_delay", with = "duration_secs")]
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    #[serde(default = "default_max_delay", with = "duration_secs")]
    pub max_delay: Duration,

    /// Maximum reconnection attempts before the session is closed.
    /// `None` means retry forever.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_retries: None,
        }
    }
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

// ── Tests ────────────────────────────────────────────────────────────
