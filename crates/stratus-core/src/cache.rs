//! Per-session de-duplication caches and the shared expiration cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::identity::TokenGrant;

// ── DedupCache ───────────────────────────────────────────────────────

/// Collapses concurrent calls for the same logical key into one
/// in-flight operation whose result every caller shares.
///
/// The first caller for a key runs the operation while holding that
/// key's slot lock; concurrent callers block on the lock and then read
/// the cached result. Failures are not cached, so the next caller
/// retries. [`clear`](Self::clear) drops every cached result
/// unconditionally.
pub struct DedupCache<T: Clone> {
    slots: DashMap<String, Arc<Mutex<Option<T>>>>,
}

impl<T: Clone> DedupCache<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Return the cached value for `key`, or run `operation` once and
    /// cache its success.
    pub async fn get_or_run<F, Fut>(&self, key: &str, operation: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let slot = Arc::clone(
            &self
                .slots
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        );
        let mut guard = slot.lock().await;
        if let Some(value) = guard.as_ref() {
            return Ok(value.clone());
        }
        let value = operation().await?;
        *guard = Some(value.clone());
        Ok(value)
    }

    /// Drop every cached result. In-flight operations keep their slot
    /// alive and complete normally, but their results are not visible to
    /// keys looked up after the clear.
    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<T: Clone> Default for DedupCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// De-duplicates OAuth authorization-code exchanges.
pub type ExchangeCache = DedupCache<TokenGrant>;

/// De-duplicates token refreshes.
pub type RefreshCache = DedupCache<TokenGrant>;

// ── ExpirationCache ──────────────────────────────────────────────────

/// Shared registry of token deadlines, keyed by device id. When a
/// deadline elapses the registered session's cancellation token fires,
/// which closes the connection. Entries are replaced on every sign-in
/// and removed on sign-out, on close, and when the new token never
/// expires.
pub struct ExpirationCache {
    timers: DashMap<String, CancellationToken>,
}

impl ExpirationCache {
    pub fn new() -> Self {
        Self {
            timers: DashMap::new(),
        }
    }

    /// Register (or replace) the deadline for `device_id`. At the
    /// deadline, `session_cancel` is cancelled.
    pub fn set(&self, device_id: &str, deadline: DateTime<Utc>, session_cancel: CancellationToken) {
        let timer = CancellationToken::new();
        if let Some(previous) = self.timers.insert(device_id.to_owned(), timer.clone()) {
            previous.cancel();
        }

        let delay = (deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let device_id = device_id.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = timer.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    tracing::info!(device_id = %device_id, "token lifetime elapsed, closing connection");
                    session_cancel.cancel();
                }
            }
        });
    }

    /// Drop the deadline for `device_id`, if any.
    pub fn remove(&self, device_id: &str) {
        if let Some((_, timer)) = self.timers.remove(device_id) {
            timer.cancel();
        }
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.timers.contains_key(device_id)
    }
}

impl Default for ExpirationCache {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
