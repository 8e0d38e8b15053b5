//! Backend device-feed subscriber.
//!
//! One per signed-in session. Subscribes to the backend's feed for the
//! session's device — pending commands plus resource-directory changes —
//! and hands every event through the task queue, keyed by resource so
//! commands for the same resource execute in delivery order. The
//! subscription is re-established with exponential backoff when it
//! breaks; exhausting the retry budget hands the failure to the
//! session, which closes the connection.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stratus_proto::Href;

use crate::auth::CallContext;
use crate::backend::{
    CommandService, DeviceFeedEvent, DeviceFeedSubscriptionRequest, PendingCommand, ResourceLink,
};
use crate::config::ReconnectConfig;
use crate::error::ServiceError;
use crate::queue::TaskQueue;

// ── Handler ──────────────────────────────────────────────────────────

/// Session-side callbacks for the subscriber loop. The async methods
/// run on task-queue workers, never on the loop itself.
#[async_trait::async_trait]
pub trait SubscriberHandler: Send + Sync {
    /// Token-bearing context for the subscription call. `None` once the
    /// session signed out, which ends the loop quietly.
    fn call_context(&self) -> Option<CallContext>;

    /// Execute one pending command.
    async fn handle_command(&self, command: PendingCommand);

    /// The backend published new resource links for the device.
    async fn handle_links_published(&self, links: Vec<ResourceLink>);

    /// The backend unpublished resource links.
    async fn handle_links_unpublished(&self, hrefs: Vec<Href>);

    /// The retry budget is spent. The session closes the connection so
    /// the device reconnects against a healthy instance.
    fn on_reconnect_exhausted(&self, error: &ServiceError);
}

// ── Backoff ──────────────────────────────────────────────────────────

/// Exponential backoff with deterministic jitter.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exp = config.initial_delay.as_secs_f64() * 2_f64.powi(attempt.min(16) as i32);
    let jitter = 1.0 + 0.25 * ((f64::from(attempt) * 7.3).sin());
    Duration::from_secs_f64((exp * jitter).min(config.max_delay.as_secs_f64()))
}

// ── Subscriber ───────────────────────────────────────────────────────

/// Handle to the running subscription loop.
pub struct DeviceSubscriber {
    cancel: CancellationToken,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl DeviceSubscriber {
    /// Start the subscription loop for `device_id`.
    pub fn start(
        device_id: &str,
        backend: Arc<dyn CommandService>,
        queue: Arc<TaskQueue>,
        handler: Arc<dyn SubscriberHandler>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(subscription_loop(
            device_id.to_owned(),
            backend,
            queue,
            handler,
            reconnect,
            cancel.clone(),
        ));
        Self {
            cancel,
            handle: StdMutex::new(Some(handle)),
        }
    }

    /// Stop the loop. Idempotent; commands already handed to the task
    /// queue still run.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.close();
        let handle = {
            let mut guard = self
                .handle
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for DeviceSubscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn subscription_loop(
    device_id: String,
    backend: Arc<dyn CommandService>,
    queue: Arc<TaskQueue>,
    handler: Arc<dyn SubscriberHandler>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let Some(ctx) = handler.call_context() else {
            tracing::debug!(device_id = %device_id, "no authorization context, subscriber exiting");
            return;
        };

        let request = DeviceFeedSubscriptionRequest {
            subscription_id: Uuid::new_v4(),
            device_id: device_id.clone(),
        };
        let error = match backend.subscribe_device_feed(&ctx, request).await {
            Ok(stream) => {
                attempt = 0;
                match pump(&device_id, stream, &queue, &handler, &cancel).await {
                    PumpExit::Cancelled | PumpExit::Completed => return,
                    PumpExit::Broken(err) => err,
                }
            }
            Err(err) => err,
        };

        if let Some(max) = reconnect.max_retries {
            if attempt >= max {
                tracing::error!(
                    device_id = %device_id,
                    attempts = attempt,
                    error = %error,
                    "device feed subscription retries exhausted"
                );
                handler.on_reconnect_exhausted(&error);
                return;
            }
        }

        let delay = calculate_backoff(attempt, &reconnect);
        attempt = attempt.saturating_add(1);
        tracing::warn!(
            device_id = %device_id,
            attempt,
            delay_ms = delay.as_millis(),
            error = %error,
            "device feed subscription broken, reconnecting"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

enum PumpExit {
    Cancelled,
    /// Backend closed the stream cleanly; nothing left to deliver.
    Completed,
    Broken(ServiceError),
}

async fn pump(
    device_id: &str,
    mut stream: Box<dyn crate::backend::DeviceFeedStream>,
    queue: &Arc<TaskQueue>,
    handler: &Arc<dyn SubscriberHandler>,
    cancel: &CancellationToken,
) -> PumpExit {
    type Deferred = std::pin::Pin<Box<dyn Future<Output = ()> + Send>>;
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                stream.close().await;
                return PumpExit::Cancelled;
            }
            event = stream.recv() => event,
        };

        let event = match event {
            Ok(Some(event)) => event,
            Ok(None) => return PumpExit::Completed,
            Err(err) => return PumpExit::Broken(err),
        };

        // Commands order per resource; link changes order per device.
        let (key, task): (String, Deferred) = match event {
            DeviceFeedEvent::PendingCommand(command) => {
                let handler = Arc::clone(handler);
                (
                    command.ordering_key(),
                    Box::pin(async move { handler.handle_command(command).await }),
                )
            }
            DeviceFeedEvent::ResourceLinksPublished(links) => {
                let handler = Arc::clone(handler);
                (
                    device_id.to_owned(),
                    Box::pin(async move { handler.handle_links_published(links).await }),
                )
            }
            DeviceFeedEvent::ResourceLinksUnpublished(hrefs) => {
                let handler = Arc::clone(handler);
                (
                    device_id.to_owned(),
                    Box::pin(async move { handler.handle_links_unpublished(hrefs).await }),
                )
            }
        };
        if let Err(err) = queue.spawn_for_key(&key, task) {
            tracing::error!(
                device_id = %device_id,
                error = %err,
                "cannot defer device feed event"
            );
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
