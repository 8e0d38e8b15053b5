//! Backend command-service interface.
//!
//! Everything the gateway tells the backend (resource change
//! notifications, command confirmations, metadata updates) and
//! everything it receives from it (pending commands, resource links)
//! crosses this boundary. All calls carry a token-bearing
//! [`CallContext`]; transport and retries belong to the implementor.

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use stratus_proto::{Code, ContentFormat, Href, Message};

use crate::auth::CallContext;
use crate::error::ServiceError;

// ── Resource identity and content ────────────────────────────────────

/// Backend-side identity of one device resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub device_id: String,
    pub href: Href,
}

impl ResourceId {
    pub fn new(device_id: impl Into<String>, href: impl Into<Href>) -> Self {
        Self {
            device_id: device_id.into(),
            href: href.into(),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.device_id, self.href)
    }
}

/// Opaque payload forwarded between device and backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Content {
    pub content_format: Option<ContentFormat>,
    pub data: Bytes,
}

impl Content {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<&Message> for Content {
    fn from(message: &Message) -> Self {
        Self {
            content_format: message.content_format,
            data: message.payload.clone(),
        }
    }
}

/// Provenance attached to every backend write: which connection issued
/// it and where it sits in that connection's event order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMetadata {
    pub connection_id: String,
    pub sequence: u64,
}

// ── Requests ─────────────────────────────────────────────────────────

/// Resource representation change pushed to the backend.
#[derive(Debug, Clone)]
pub struct NotifyResourceChangedRequest {
    pub resource_id: ResourceId,
    pub code: Code,
    pub content: Content,
    pub metadata: CommandMetadata,
}

/// Which pending command a confirmation settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConfirmKind {
    Create,
    Retrieve,
    Update,
    Delete,
}

/// Settles one pending resource command, successful or not. Exactly one
/// confirmation is sent per pending event, carrying its correlation id.
#[derive(Debug, Clone)]
pub struct ConfirmResourceRequest {
    pub kind: ConfirmKind,
    pub resource_id: ResourceId,
    pub correlation_id: String,
    pub code: Code,
    pub content: Content,
    pub metadata: CommandMetadata,
}

/// Device connection status as reported to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// Whether the backend keeps a synchronized twin of the device's
/// resources. Toggled by the backend through a pending metadata update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ShadowSynchronization {
    Enabled,
    Disabled,
}

/// Gateway-initiated metadata update (online on sign-in, offline on
/// sign-out and close).
#[derive(Debug, Clone)]
pub struct UpdateDeviceMetadataRequest {
    pub device_id: String,
    pub status: ConnectionStatus,
    pub metadata: CommandMetadata,
}

/// Settles a pending shadow-synchronization toggle.
#[derive(Debug, Clone)]
pub struct ConfirmDeviceMetadataUpdateRequest {
    pub device_id: String,
    pub correlation_id: String,
    pub shadow_synchronization: ShadowSynchronization,
    pub metadata: CommandMetadata,
}

/// Remove published resource links. An empty `hrefs` unpublishes every
/// link of the device.
#[derive(Debug, Clone)]
pub struct UnpublishResourceLinksRequest {
    pub device_id: String,
    pub hrefs: Vec<Href>,
    pub metadata: CommandMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct UnpublishResourceLinksResponse {
    pub unpublished_hrefs: Vec<Href>,
}

/// A resource link as published to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLink {
    pub href: Href,
    pub resource_types: Vec<String>,
    pub observable: bool,
}

/// Backend-held device metadata snapshot.
#[derive(Debug, Clone)]
pub struct DeviceMetadata {
    pub device_id: String,
    pub status: ConnectionStatus,
    pub shadow_synchronization: ShadowSynchronization,
}

// ── Pending commands ─────────────────────────────────────────────────

/// A resource command awaiting execution on the device.
#[derive(Debug, Clone)]
pub struct ResourceCommand {
    pub resource_id: ResourceId,
    pub correlation_id: String,
    pub content: Option<Content>,
    pub resource_interface: Option<String>,
}

/// A pending shadow-synchronization toggle.
#[derive(Debug, Clone)]
pub struct DeviceMetadataUpdate {
    pub device_id: String,
    pub correlation_id: String,
    pub shadow_synchronization: ShadowSynchronization,
}

/// A backend command awaiting execution on the device.
#[derive(Debug, Clone)]
pub enum PendingCommand {
    ResourceCreatePending(ResourceCommand),
    ResourceRetrievePending(ResourceCommand),
    ResourceUpdatePending(ResourceCommand),
    ResourceDeletePending(ResourceCommand),
    DeviceMetadataUpdatePending(DeviceMetadataUpdate),
}

impl PendingCommand {
    pub fn device_id(&self) -> &str {
        match self {
            Self::ResourceCreatePending(cmd)
            | Self::ResourceRetrievePending(cmd)
            | Self::ResourceUpdatePending(cmd)
            | Self::ResourceDeletePending(cmd) => &cmd.resource_id.device_id,
            Self::DeviceMetadataUpdatePending(update) => &update.device_id,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::ResourceCreatePending(cmd)
            | Self::ResourceRetrievePending(cmd)
            | Self::ResourceUpdatePending(cmd)
            | Self::ResourceDeletePending(cmd) => &cmd.correlation_id,
            Self::DeviceMetadataUpdatePending(update) => &update.correlation_id,
        }
    }

    /// Ordering key: commands for the same resource must execute in
    /// delivery order, so they funnel onto the same queue partition.
    pub fn ordering_key(&self) -> String {
        match self {
            Self::ResourceCreatePending(cmd)
            | Self::ResourceRetrievePending(cmd)
            | Self::ResourceUpdatePending(cmd)
            | Self::ResourceDeletePending(cmd) => cmd.resource_id.to_string(),
            Self::DeviceMetadataUpdatePending(update) => update.device_id.clone(),
        }
    }
}

/// One event from the per-device backend feed: a command awaiting
/// execution, or a resource-directory change the observer must follow.
#[derive(Debug, Clone)]
pub enum DeviceFeedEvent {
    PendingCommand(PendingCommand),
    ResourceLinksPublished(Vec<ResourceLink>),
    ResourceLinksUnpublished(Vec<Href>),
}

#[derive(Debug, Clone)]
pub struct DeviceFeedSubscriptionRequest {
    pub subscription_id: Uuid,
    pub device_id: String,
}

/// Live event feed for one device.
///
/// `recv` returning `Ok(None)` means the backend closed the stream
/// cleanly; an `Err` means it broke and the subscriber should
/// re-establish it.
#[async_trait]
pub trait DeviceFeedStream: Send + Sync {
    async fn recv(&mut self) -> Result<Option<DeviceFeedEvent>, ServiceError>;

    async fn close(&mut self);
}

// ── Service traits ───────────────────────────────────────────────────

/// The backend command service the gateway bridges devices to.
#[async_trait]
pub trait CommandService: Send + Sync {
    async fn notify_resource_changed(
        &self,
        ctx: &CallContext,
        request: NotifyResourceChangedRequest,
    ) -> Result<(), ServiceError>;

    async fn confirm_resource(
        &self,
        ctx: &CallContext,
        request: ConfirmResourceRequest,
    ) -> Result<(), ServiceError>;

    async fn update_device_metadata(
        &self,
        ctx: &CallContext,
        request: UpdateDeviceMetadataRequest,
    ) -> Result<(), ServiceError>;

    async fn confirm_device_metadata_update(
        &self,
        ctx: &CallContext,
        request: ConfirmDeviceMetadataUpdateRequest,
    ) -> Result<(), ServiceError>;

    async fn unpublish_resource_links(
        &self,
        ctx: &CallContext,
        request: UnpublishResourceLinksRequest,
    ) -> Result<UnpublishResourceLinksResponse, ServiceError>;

    async fn get_resource_links(
        &self,
        ctx: &CallContext,
        device_id: &str,
    ) -> Result<Vec<ResourceLink>, ServiceError>;

    async fn get_device_metadata(
        &self,
        ctx: &CallContext,
        device_id: &str,
    ) -> Result<DeviceMetadata, ServiceError>;

    async fn subscribe_device_feed(
        &self,
        ctx: &CallContext,
        request: DeviceFeedSubscriptionRequest,
    ) -> Result<Box<dyn DeviceFeedStream>, ServiceError>;
}

/// Records which gateway instance holds the live connection for a
/// device, so stale instances can be told to drop theirs.
#[async_trait]
pub trait LivenessTracker: Send + Sync {
    async fn add(&self, device_id: &str, connection_id: &str) -> Result<(), ServiceError>;

    async fn remove(&self, connection_id: &str) -> Result<(), ServiceError>;
}

// ── Tests ────────────────────────────────────────────────────────────
