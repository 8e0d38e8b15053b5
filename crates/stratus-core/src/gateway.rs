//! Gateway service aggregate.
//!
//! One `Gateway` per process: the shared task queue, the backend and
//! identity-service handles, policy configuration, and the shared
//! expiration cache. Connections attach to it through
//! [`Gateway::accept`], which yields a per-connection [`Session`].

use std::sync::Arc;

use chrono::{DateTime, Utc};

use stratus_proto::DeviceTransport;

use crate::backend::{CommandService, LivenessTracker};
use crate::cache::ExpirationCache;
use crate::config::GatewayConfig;
use crate::error::ServiceError;
use crate::identity::{ClaimsVerifier, OwnerCache};
use crate::queue::TaskQueue;
use crate::session::Session;

/// Identity asserted by the transport layer (client certificate).
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub device_id: String,
    /// Certificate expiry. With
    /// [`disconnect_on_expired_certificate`](crate::config::TlsConfig::disconnect_on_expired_certificate)
    /// set, it caps the session lifetime.
    pub valid_until: Option<DateTime<Utc>>,
}

pub struct Gateway {
    pub(crate) config: GatewayConfig,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) backend: Arc<dyn CommandService>,
    pub(crate) verifier: Arc<dyn ClaimsVerifier>,
    pub(crate) owners: Arc<dyn OwnerCache>,
    pub(crate) liveness: Arc<dyn LivenessTracker>,
    pub(crate) expirations: ExpirationCache,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        backend: Arc<dyn CommandService>,
        verifier: Arc<dyn ClaimsVerifier>,
        owners: Arc<dyn OwnerCache>,
        liveness: Arc<dyn LivenessTracker>,
    ) -> Result<Arc<Self>, ServiceError> {
        config.validate()?;
        let queue = Arc::new(TaskQueue::new(&config.task_queue));
        Ok(Arc::new(Self {
            config,
            queue,
            backend,
            verifier,
            owners,
            liveness,
            expirations: ExpirationCache::new(),
        }))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Attach a new device connection.
    ///
    /// `tls_identity` must be present when the configured TLS policy
    /// requires client certificates; sign-in then binds the token's
    /// device identity against it. The returned session's cancellation
    /// token closes the transport and runs the final teardown when it
    /// fires, whichever side triggered it.
    pub fn accept(
        self: &Arc<Self>,
        transport: Arc<dyn DeviceTransport>,
        tls_identity: Option<TlsIdentity>,
    ) -> Arc<Session> {
        let session = Session::new(Arc::clone(self), transport, tls_identity);

        let watcher = Arc::clone(&session);
        tokio::spawn(async move {
            watcher.cancel_token().cancelled().await;
            watcher.transport.close();
            watcher.on_close().await;
        });

        tracing::debug!(remote = %session.transport.remote_addr(), "device connection accepted");
        session
    }

    /// Stop the task queue, letting queued work drain.
    pub async fn shutdown(&self) {
        self.queue.shutdown();
        self.queue.join().await;
    }
}
