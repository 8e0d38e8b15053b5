//! Device observer: keeps the backend's view of a device's resources in
//! sync by observing them over the device connection.
//!
//! One observer instance exists per signed-in identity. It is created
//! asynchronously after sign-in (through the task queue, never on the
//! protocol read path) and torn down whenever the identity changes, the
//! backend disables shadow synchronization, or the connection closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use stratus_proto::{
    Code, ContentFormat, DISCOVERY_HREF, DeviceRequest, DeviceTransport, Href, Message, Method,
    Observation, ProtoError,
};

use crate::auth::CallContext;
use crate::backend::{
    CommandMetadata, CommandService, Content, NotifyResourceChangedRequest, ResourceId,
    ResourceLink, ShadowSynchronization, UnpublishResourceLinksRequest,
};
use crate::error::ServiceError;
use crate::queue::TaskQueue;

// ── Strategy ─────────────────────────────────────────────────────────

/// How a device's resources are observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ObservationStrategy {
    /// Not yet known; attempt a discovery observation on creation.
    Detect,
    /// One observation per published resource, with a one-shot get for
    /// resources that reject the observe option.
    PerResource,
    /// A single observation of the discovery resource whose batch
    /// notifications carry every resource change.
    BatchDiscovery,
}

// ── Hooks ────────────────────────────────────────────────────────────

/// Session-side callbacks the observer needs. Methods are synchronous
/// because they may be called from notification handlers on the
/// transport's read path.
pub trait ObserverHooks: Send + Sync {
    /// Token-bearing context of the current identity. `None` once the
    /// session signed out; notifications arriving after that are dropped.
    fn call_context(&self) -> Option<CallContext>;

    /// Command metadata stamped onto every backend write.
    fn metadata(&self) -> CommandMetadata;

    /// The backend refused a change notification, so the cloud's view
    /// of the device can no longer be trusted. The session closes the
    /// connection to force a resync.
    fn on_desynchronized(&self, error: &ServiceError);
}

// ── Observer ─────────────────────────────────────────────────────────

/// Everything an observer needs from its session and gateway.
pub struct ObserverContext {
    pub device_id: String,
    pub request_timeout: Duration,
    pub transport: Arc<dyn DeviceTransport>,
    pub backend: Arc<dyn CommandService>,
    pub queue: Arc<TaskQueue>,
    pub hooks: Arc<dyn ObserverHooks>,
}

struct ObserverState {
    discovery: Option<Box<dyn Observation>>,
    /// Observed hrefs. `None` marks a resource that rejected the
    /// observe option and was polled once instead.
    resources: HashMap<Href, Option<Box<dyn Observation>>>,
}

/// Live observation of one device's resources.
pub struct DeviceObserver {
    device_id: String,
    strategy: ObservationStrategy,
    shadow_synchronization: ShadowSynchronization,
    request_timeout: Duration,
    transport: Arc<dyn DeviceTransport>,
    backend: Arc<dyn CommandService>,
    queue: Arc<TaskQueue>,
    hooks: Arc<dyn ObserverHooks>,
    state: Mutex<ObserverState>,
}

impl DeviceObserver {
    /// Create an observer using `strategy`, detecting the right one
    /// against the device when it is [`ObservationStrategy::Detect`].
    ///
    /// With shadow synchronization disabled nothing is observed; the
    /// observer exists only to remember the strategy until the backend
    /// re-enables synchronization.
    pub async fn create(
        context: ObserverContext,
        strategy: ObservationStrategy,
        shadow_synchronization: ShadowSynchronization,
    ) -> Result<Self, ServiceError> {
        let observer = Self {
            device_id: context.device_id,
            strategy,
            shadow_synchronization,
            request_timeout: context.request_timeout,
            transport: context.transport,
            backend: context.backend,
            queue: context.queue,
            hooks: context.hooks,
            state: Mutex::new(ObserverState {
                discovery: None,
                resources: HashMap::new(),
            }),
        };

        if shadow_synchronization == ShadowSynchronization::Disabled {
            tracing::debug!(device_id = %observer.device_id, "shadow synchronization disabled, not observing");
            return Ok(observer);
        }

        let observer = observer.start(strategy).await?;
        tracing::info!(
            device_id = %observer.device_id,
            strategy = %observer.strategy,
            "device observation started"
        );
        Ok(observer)
    }

    async fn start(mut self, strategy: ObservationStrategy) -> Result<Self, ServiceError> {
        match strategy {
            ObservationStrategy::Detect => match self.observe_discovery().await {
                Ok(()) => self.strategy = ObservationStrategy::BatchDiscovery,
                Err(ProtoError::NotObservable(_)) => {
                    self.strategy = ObservationStrategy::PerResource;
                    self.observe_published_resources().await?;
                }
                Err(err) => return Err(err.into()),
            },
            ObservationStrategy::BatchDiscovery => self.observe_discovery().await?,
            ObservationStrategy::PerResource => self.observe_published_resources().await?,
        }
        Ok(self)
    }

    pub fn strategy(&self) -> ObservationStrategy {
        self.strategy
    }

    pub fn shadow_synchronization(&self) -> ShadowSynchronization {
        self.shadow_synchronization
    }

    /// Start observing newly published resources. Ignored under
    /// [`ObservationStrategy::BatchDiscovery`], where the discovery
    /// observation already covers them.
    pub async fn add_resources(&self, links: &[ResourceLink]) -> Result<(), ServiceError> {
        if self.strategy != ObservationStrategy::PerResource
            || self.shadow_synchronization == ShadowSynchronization::Disabled
        {
            return Ok(());
        }
        for link in links {
            self.observe_resource(link).await?;
        }
        Ok(())
    }

    /// Stop observing unpublished resources.
    pub async fn remove_resources(&self, hrefs: &[Href]) {
        let mut state = self.state.lock().await;
        for href in hrefs {
            if let Some(Some(observation)) = state.resources.remove(href) {
                if let Err(err) = observation.cancel().await {
                    tracing::warn!(
                        device_id = %self.device_id,
                        href = %href,
                        error = %err,
                        "cancelling observation failed"
                    );
                }
            }
        }
    }

    /// Cancel every observation. Idempotent.
    pub async fn clean(&self) {
        let (discovery, resources) = {
            let mut state = self.state.lock().await;
            (
                state.discovery.take(),
                std::mem::take(&mut state.resources),
            )
        };
        if let Some(observation) = discovery {
            if let Err(err) = observation.cancel().await {
                tracing::warn!(device_id = %self.device_id, error = %err, "cancelling discovery observation failed");
            }
        }
        for (href, observation) in resources {
            if let Some(observation) = observation {
                if let Err(err) = observation.cancel().await {
                    tracing::warn!(
                        device_id = %self.device_id,
                        href = %href,
                        error = %err,
                        "cancelling observation failed"
                    );
                }
            }
        }
    }

    // ── Observation setup ────────────────────────────────────────────

    async fn observe_discovery(&self) -> Result<(), ProtoError> {
        let handler = batch_notification_handler(
            self.device_id.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.queue),
            Arc::clone(&self.hooks),
        );
        let observation = self.transport.observe(&DISCOVERY_HREF.to_owned(), handler).await?;
        self.state.lock().await.discovery = Some(observation);
        Ok(())
    }

    async fn observe_published_resources(&self) -> Result<(), ServiceError> {
        let Some(ctx) = self.hooks.call_context() else {
            return Err(ServiceError::Unauthenticated(
                "no authorization context for resource discovery".into(),
            ));
        };
        let links = self.backend.get_resource_links(&ctx, &self.device_id).await?;
        for link in &links {
            self.observe_resource(link).await?;
        }
        Ok(())
    }

    /// Observe one resource, falling back to a one-shot get when the
    /// device rejects the observe option for it.
    async fn observe_resource(&self, link: &ResourceLink) -> Result<(), ServiceError> {
        {
            let state = self.state.lock().await;
            if state.resources.contains_key(&link.href) {
                return Ok(());
            }
        }

        let handler = resource_notification_handler(
            ResourceId::new(&self.device_id, &link.href),
            Arc::clone(&self.backend),
            Arc::clone(&self.queue),
            Arc::clone(&self.hooks),
        );

        let attempt = if link.observable {
            self.transport.observe(&link.href, handler.clone()).await
        } else {
            Err(ProtoError::NotObservable(link.href.clone()))
        };

        match attempt {
            Ok(observation) => {
                self.state
                    .lock()
                    .await
                    .resources
                    .insert(link.href.clone(), Some(observation));
                Ok(())
            }
            Err(ProtoError::NotObservable(_)) => {
                let response = self
                    .transport
                    .request(DeviceRequest::new(
                        Method::Get,
                        link.href.clone(),
                        self.request_timeout,
                    ))
                    .await?;
                handler(response);
                self.state.lock().await.resources.insert(link.href.clone(), None);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

// ── Notification forwarding ──────────────────────────────────────────

/// One entry of a batch discovery notification.
#[derive(Debug, Deserialize)]
struct BatchRecord {
    href: Href,
    /// Resource representation. Absent or `null` means the resource was
    /// removed from the device.
    #[serde(default)]
    rep: Option<Value>,
}

fn decode_batch(message: &Message) -> Result<Vec<BatchRecord>, ProtoError> {
    message.decode()
}

/// Handler for batch discovery notifications: splits the batch into
/// per-resource changes and funnels each through the per-resource
/// ordering key. A batch that fails to decode is dropped with a log
/// line; it fails only itself.
fn batch_notification_handler(
    device_id: String,
    backend: Arc<dyn CommandService>,
    queue: Arc<TaskQueue>,
    hooks: Arc<dyn ObserverHooks>,
) -> stratus_proto::NotificationHandler {
    Arc::new(move |message: Message| {
        let records = match decode_batch(&message) {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(
                    device_id = %device_id,
                    error = %err,
                    "dropping undecodable batch notification"
                );
                return;
            }
        };
        for record in records {
            let resource_id = ResourceId::new(&device_id, &record.href);
            let change = match record.rep {
                Some(rep) => match serde_json::to_vec(&rep) {
                    Ok(data) => Message {
                        code: Code::Content,
                        content_format: Some(ContentFormat::Json),
                        payload: data.into(),
                        observe: message.observe,
                    },
                    Err(err) => {
                        tracing::warn!(
                            resource = %resource_id,
                            error = %err,
                            "dropping unencodable batch record"
                        );
                        continue;
                    }
                },
                None => Message::new(Code::NotFound),
            };
            enqueue_forward(
                &queue,
                resource_id,
                change,
                Arc::clone(&backend),
                Arc::clone(&hooks),
            );
        }
    })
}

/// Handler for a single resource's notifications.
fn resource_notification_handler(
    resource_id: ResourceId,
    backend: Arc<dyn CommandService>,
    queue: Arc<TaskQueue>,
    hooks: Arc<dyn ObserverHooks>,
) -> stratus_proto::NotificationHandler {
    Arc::new(move |message: Message| {
        enqueue_forward(
            &queue,
            resource_id.clone(),
            message,
            Arc::clone(&backend),
            Arc::clone(&hooks),
        );
    })
}

/// Defer forwarding off the read path, keyed by resource so changes to
/// one resource reach the backend in notification order.
fn enqueue_forward(
    queue: &TaskQueue,
    resource_id: ResourceId,
    message: Message,
    backend: Arc<dyn CommandService>,
    hooks: Arc<dyn ObserverHooks>,
) {
    let key = resource_id.to_string();
    let result = queue.spawn_for_key(&key, async move {
        forward_change(resource_id, message, backend.as_ref(), hooks.as_ref()).await;
    });
    if let Err(err) = result {
        tracing::error!(error = %err, "cannot defer notification forwarding");
    }
}

/// Push one resource change to the backend. A resource the device
/// reports as gone is unpublished before the change notification, so
/// the backend never observes a change to a link it still publishes.
/// A refused notification desynchronizes the session.
async fn forward_change(
    resource_id: ResourceId,
    message: Message,
    backend: &dyn CommandService,
    hooks: &dyn ObserverHooks,
) {
    let Some(ctx) = hooks.call_context() else {
        tracing::debug!(resource = %resource_id, "dropping notification without authorization context");
        return;
    };

    if message.code == Code::NotFound {
        let request = UnpublishResourceLinksRequest {
            device_id: resource_id.device_id.clone(),
            hrefs: vec![resource_id.href.clone()],
            metadata: hooks.metadata(),
        };
        if let Err(err) = backend.unpublish_resource_links(&ctx, request).await {
            tracing::warn!(resource = %resource_id, error = %err, "unpublishing vanished resource failed");
        }
    }

    let request = NotifyResourceChangedRequest {
        resource_id: resource_id.clone(),
        code: message.code,
        content: Content::from(&message),
        metadata: hooks.metadata(),
    };
    if let Err(err) = backend.notify_resource_changed(&ctx, request).await {
        tracing::error!(resource = %resource_id, error = %err, "backend refused resource change");
        hooks.on_desynchronized(&err);
    }
}

// ── Tests ────────────────────────────────────────────────────────────
