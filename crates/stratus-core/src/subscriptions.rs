//! Per-connection registry of device-initiated resource subscriptions.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

/// A device-initiated subscription tracked for the lifetime of the
/// connection. Cancelling is idempotent.
#[async_trait]
pub trait ResourceSubscription: Send + Sync {
    /// Cancel the subscription. With `wait` set, returns only after the
    /// teardown completed; otherwise teardown may finish in the
    /// background.
    async fn cancel(&self, wait: bool);
}

/// Token-keyed subscription map. Removal is atomic take-and-remove so a
/// cancellation racing a disconnect teardown settles on exactly one
/// owner for the final cancel.
pub struct SubscriptionRegistry {
    entries: DashMap<String, Arc<dyn ResourceSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register `subscription` under `token`, returning whatever entry
    /// it displaced.
    pub fn insert(
        &self,
        token: &str,
        subscription: Arc<dyn ResourceSubscription>,
    ) -> Option<Arc<dyn ResourceSubscription>> {
        self.entries.insert(token.to_owned(), subscription)
    }

    /// Atomically take the entry for `token`. `None` when another path
    /// (an explicit cancel, a concurrent teardown) already claimed it.
    pub fn pull_out(&self, token: &str) -> Option<Arc<dyn ResourceSubscription>> {
        self.entries.remove(token).map(|(_, sub)| sub)
    }

    /// Drain every entry for disconnect teardown.
    pub fn pull_out_all(&self) -> Vec<Arc<dyn ResourceSubscription>> {
        let tokens: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        tokens
            .into_iter()
            .filter_map(|token| self.pull_out(&token))
            .collect()
    }

    /// Cancel every registered subscription.
    pub async fn cancel_all(&self, wait: bool) {
        for subscription in self.pull_out_all() {
            subscription.cancel(wait).await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
