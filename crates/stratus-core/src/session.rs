//! Per-connection session aggregate.
//!
//! A `Session` owns everything scoped to one device connection: the
//! authorization context, the device observer placeholder, the backend
//! device-feed subscriber, the device-event subscription, the
//! resource-subscription registry, and the per-session token caches.
//! Mutable pieces live behind one state lock and are swapped, never
//! mutated in place; the lock is never held across an await.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use stratus_proto::DeviceTransport;

use crate::auth::{AuthorizationContext, CallContext};
use crate::backend::{
    CommandMetadata, ConnectionStatus, ShadowSynchronization, UpdateDeviceMetadataRequest,
};
use crate::cache::{ExchangeCache, RefreshCache};
use crate::cell::FutureCell;
use crate::error::ServiceError;
use crate::gateway::{Gateway, TlsIdentity};
use crate::observer::{DeviceObserver, ObservationStrategy, ObserverContext, ObserverHooks};
use crate::subscriber::DeviceSubscriber;
use crate::subscriptions::SubscriptionRegistry;

pub(crate) struct SessionState {
    pub(crate) auth: Option<AuthorizationContext>,
    /// Placeholder for the (asynchronously created) device observer.
    /// Installed synchronously under this lock so concurrent readers
    /// always find either the live observer or the cell that will
    /// resolve to it.
    pub(crate) observer: Option<FutureCell<DeviceObserver>>,
    pub(crate) subscriber: Option<Arc<DeviceSubscriber>>,
    pub(crate) unsubscribe: Option<crate::identity::Unsubscribe>,
}

/// One device connection.
pub struct Session {
    /// Self-handle for tasks that outlive the borrow (observer
    /// replacement, subscriber callbacks).
    weak: std::sync::Weak<Session>,
    pub(crate) gateway: Arc<Gateway>,
    pub(crate) transport: Arc<dyn DeviceTransport>,
    pub(crate) tls_identity: Option<TlsIdentity>,
    pub(crate) cancel: CancellationToken,
    closed: AtomicBool,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) exchange_cache: ExchangeCache,
    pub(crate) refresh_cache: RefreshCache,
    pub(crate) state: StdMutex<SessionState>,
}

impl Session {
    pub(crate) fn new(
        gateway: Arc<Gateway>,
        transport: Arc<dyn DeviceTransport>,
        tls_identity: Option<TlsIdentity>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            gateway,
            transport,
            tls_identity,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            subscriptions: SubscriptionRegistry::new(),
            exchange_cache: ExchangeCache::new(),
            refresh_cache: RefreshCache::new(),
            state: StdMutex::new(SessionState {
                auth: None,
                observer: None,
                subscriber: None,
                unsubscribe: None,
            }),
        })
    }

    pub(crate) fn arc(&self) -> Result<Arc<Session>, ServiceError> {
        self.weak
            .upgrade()
            .ok_or_else(|| ServiceError::Internal("session already dropped".into()))
    }

    /// Cancellation token of this connection. The transport implementor
    /// cancels it when the connection drops; anything session-scoped
    /// selects on it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registry of device-initiated resource subscriptions.
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Per-session cache collapsing concurrent authorization-code
    /// exchanges. Cleared on every successful sign-in.
    pub fn exchange_cache(&self) -> &ExchangeCache {
        &self.exchange_cache
    }

    /// Per-session cache collapsing concurrent token refreshes.
    /// Cleared on every successful sign-in.
    pub fn refresh_cache(&self) -> &RefreshCache {
        &self.refresh_cache
    }

    /// Close the connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn close_on(&self, error: &ServiceError) {
        tracing::warn!(
            remote = %self.transport.remote_addr(),
            device_id = self.device_id().as_deref().unwrap_or(""),
            error = %error,
            "closing device connection"
        );
        self.close();
    }

    /// Bound device identity: the transport-provided (TLS) identity
    /// wins over the signed-in one.
    pub fn device_id(&self) -> Option<String> {
        if let Some(tls) = &self.tls_identity {
            return Some(tls.device_id.clone());
        }
        let state = self.lock_state();
        state.auth.as_ref().map(|auth| auth.device_id.clone())
    }

    /// Validated authorization context; errors close-worthy per the
    /// failure policy.
    pub(crate) fn auth_context(&self) -> Result<AuthorizationContext, ServiceError> {
        let auth = {
            let state = self.lock_state();
            state
                .auth
                .clone()
                .ok_or_else(|| ServiceError::Unauthenticated("not signed in".into()))?
        };
        auth.validate()?;
        Ok(auth)
    }

    /// Token-bearing context of the current identity, if signed in.
    pub(crate) fn current_call_context(&self) -> Option<CallContext> {
        let state = self.lock_state();
        state.auth.as_ref().map(AuthorizationContext::call_context)
    }

    pub(crate) fn metadata(&self) -> CommandMetadata {
        CommandMetadata {
            connection_id: self.transport.remote_addr(),
            sequence: self.transport.sequence(),
        }
    }

    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Release everything scoped to the signed-in identity:
    /// subscriptions (waiting for teardown), the device-event
    /// subscription, the device-feed subscriber, and the observer.
    /// Returns the previous authorization context.
    pub(crate) async fn clean_up(&self, reset_auth: bool) -> Option<AuthorizationContext> {
        let (observer, subscriber, unsubscribe, previous) = {
            let mut state = self.lock_state();
            let previous = if reset_auth {
                state.auth.take()
            } else {
                state.auth.clone()
            };
            (
                state.observer.take(),
                state.subscriber.take(),
                state.unsubscribe.take(),
                previous,
            )
        };

        self.subscriptions.cancel_all(true).await;
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
        }
        if let Some(subscriber) = subscriber {
            subscriber.shutdown().await;
        }
        if let Some(cell) = observer {
            match cell.get().await {
                Ok(observer) => observer.clean().await,
                Err(err) => {
                    tracing::debug!(error = %err, "no observer to clean");
                }
            }
        }
        previous
    }

    /// Final teardown, run exactly once when the connection closes.
    /// Reports the device offline (fire-and-forget, bounded) when an
    /// identity was still signed in.
    pub(crate) async fn on_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(remote = %self.transport.remote_addr(), "device connection closed");

        let previous = self.clean_up(true).await;

        let connection_id = self.transport.remote_addr();
        if let Err(err) = self.gateway.liveness.remove(&connection_id).await {
            tracing::warn!(connection_id = %connection_id, error = %err, "liveness removal failed");
        }

        let Some(auth) = previous else {
            return;
        };
        self.gateway.expirations.remove(&auth.device_id);
        self.report_offline(&auth, self.gateway.config.keep_alive_timeout);
    }

    /// Fire-and-forget offline report: logged on failure, never
    /// retried here. The online/offline command loop self-heals when
    /// the device reconnects.
    fn report_offline(&self, auth: &AuthorizationContext, timeout: Duration) {
        let backend = Arc::clone(&self.gateway.backend);
        let ctx = auth.call_context();
        let request = UpdateDeviceMetadataRequest {
            device_id: auth.device_id.clone(),
            status: ConnectionStatus::Offline,
            metadata: self.metadata(),
        };
        tokio::spawn(async move {
            let device_id = request.device_id.clone();
            match tokio::time::timeout(timeout, backend.update_device_metadata(&ctx, request)).await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(device_id = %device_id, error = %err, "offline report failed");
                }
                Err(_) => {
                    tracing::warn!(device_id = %device_id, "offline report timed out");
                }
            }
        });
    }

    // ── Resource links feed ──────────────────────────────────────────

    /// The backend published new resource links for this device; start
    /// observing them (a no-op under batch discovery).
    pub async fn resources_published(
        &self,
        links: &[crate::backend::ResourceLink],
    ) -> Result<(), ServiceError> {
        let Some(cell) = self.current_observer_cell() else {
            return Ok(());
        };
        let observer = cell.get().await?;
        observer.add_resources(links).await
    }

    /// The backend unpublished resource links; stop observing them.
    pub async fn resources_unpublished(&self, hrefs: &[stratus_proto::Href]) {
        let Some(cell) = self.current_observer_cell() else {
            return;
        };
        if let Ok(observer) = cell.get().await {
            observer.remove_resources(hrefs).await;
        }
    }

    pub(crate) fn current_observer_cell(&self) -> Option<FutureCell<DeviceObserver>> {
        let state = self.lock_state();
        state.observer.clone()
    }

    // ── Observer replacement ─────────────────────────────────────────

    /// Swap the device observer. A fresh placeholder is installed
    /// synchronously under the state lock; cleaning the predecessor and
    /// creating the replacement run in a background task that first
    /// awaits the predecessor's own resolution, so replacements for one
    /// session serialize through the cell chain and never interleave.
    ///
    /// With `reset_strategy` the new observer re-detects how to observe
    /// the device; otherwise it inherits the predecessor's strategy.
    /// `shadow_override` skips the backend metadata lookup, used when a
    /// pending metadata update already told us the new state.
    pub(crate) fn replace_observer(
        &self,
        reset_strategy: bool,
        shadow_override: Option<ShadowSynchronization>,
    ) -> Result<FutureCell<DeviceObserver>, ServiceError> {
        let auth = self.auth_context()?;
        let device_id = auth.device_id.clone();
        let session = self.arc()?;

        let (cell, resolver) = FutureCell::new();
        let old = {
            let mut state = self.lock_state();
            state.observer.replace(cell.clone())
        };
        tokio::spawn(async move {
            let previous_strategy = match old {
                Some(old_cell) => match old_cell.get().await {
                    Ok(previous) => {
                        previous.clean().await;
                        Some(previous.strategy())
                    }
                    Err(_) => None,
                },
                None => None,
            };

            let strategy = if reset_strategy {
                ObservationStrategy::Detect
            } else {
                previous_strategy.unwrap_or(ObservationStrategy::Detect)
            };

            let result = build_observer(&session, &device_id, strategy, shadow_override).await;
            if let Err(err) = &result {
                tracing::warn!(device_id = %device_id, error = %err, "device observer creation failed");
            }
            resolver.resolve(result.map(Arc::new));
        });
        Ok(cell)
    }
}

async fn build_observer(
    session: &Arc<Session>,
    device_id: &str,
    strategy: ObservationStrategy,
    shadow_override: Option<ShadowSynchronization>,
) -> Result<DeviceObserver, ServiceError> {
    let shadow = match shadow_override {
        Some(shadow) => shadow,
        None => {
            let Some(ctx) = session.current_call_context() else {
                return Err(ServiceError::Unauthenticated(
                    "signed out before observer creation".into(),
                ));
            };
            session
                .gateway
                .backend
                .get_device_metadata(&ctx, device_id)
                .await?
                .shadow_synchronization
        }
    };

    let context = ObserverContext {
        device_id: device_id.to_owned(),
        request_timeout: session.gateway.config.keep_alive_timeout,
        transport: Arc::clone(&session.transport),
        backend: Arc::clone(&session.gateway.backend),
        queue: Arc::clone(&session.gateway.queue),
        hooks: Arc::clone(session) as Arc<dyn ObserverHooks>,
    };
    DeviceObserver::create(context, strategy, shadow).await
}

// ── Observer hooks ───────────────────────────────────────────────────

impl ObserverHooks for Session {
    fn call_context(&self) -> Option<CallContext> {
        self.current_call_context()
    }

    fn metadata(&self) -> CommandMetadata {
        Session::metadata(self)
    }

    fn on_desynchronized(&self, error: &ServiceError) {
        self.close_on(error);
    }
}
