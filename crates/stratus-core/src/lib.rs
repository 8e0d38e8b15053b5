//! Session engine of the stratus gateway.
//!
//! Terminates long-lived device connections on the cloud side and
//! bridges them to the backend command service:
//!
//! - **[`Gateway`]** — process-wide aggregate: configuration, the
//!   bounded task queue, and handles to the backend, identity service,
//!   and liveness tracker. [`Gateway::accept`] attaches a connection.
//!
//! - **[`Session`]** — per-connection state: the authorization context
//!   installed by sign-in, the device observer, the device-feed
//!   subscriber, resource subscriptions, and the token caches.
//!
//! - **[`DeviceObserver`]** — keeps the backend's resource twin fresh by
//!   observing the device, either per resource or through its discovery
//!   resource's batch notifications.
//!
//! - **External interfaces** — [`CommandService`], [`ClaimsVerifier`],
//!   [`OwnerCache`], and [`LivenessTracker`] are traits; the embedding
//!   binary wires in the concrete clients.
//!
//! Protocol-library callbacks run on a connection's read path, so
//! nothing here calls back into a transport from one: all such work is
//! deferred through the [`queue::TaskQueue`], which also provides the
//! per-resource ordering the backend relies on.

pub mod auth;
pub mod backend;
pub mod cache;
pub mod cell;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod observer;
pub mod queue;
pub mod session;
pub mod signin;
pub mod subscriber;
pub mod subscriptions;

pub use auth::{AuthorizationContext, CallContext};
pub use backend::{
    CommandMetadata, CommandService, ConfirmDeviceMetadataUpdateRequest, ConfirmKind,
    ConfirmResourceRequest, ConnectionStatus, Content, DeviceFeedEvent, DeviceFeedStream,
    DeviceFeedSubscriptionRequest, DeviceMetadata, DeviceMetadataUpdate, LivenessTracker,
    NotifyResourceChangedRequest, PendingCommand, ResourceCommand, ResourceId, ResourceLink,
    ShadowSynchronization, UnpublishResourceLinksRequest, UnpublishResourceLinksResponse,
    UpdateDeviceMetadataRequest,
};
pub use cache::{DedupCache, ExchangeCache, ExpirationCache, RefreshCache};
pub use cell::{FutureCell, Resolver};
pub use config::{
    AuthorizationConfig, GatewayConfig, ReconnectConfig, TaskQueueConfig, TlsConfig,
};
pub use error::ServiceError;
pub use gateway::{Gateway, TlsIdentity};
pub use identity::{
    Claims, ClaimsVerifier, DeviceEvent, DeviceEventHandler, OwnerCache, TokenGrant, Unsubscribe,
};
pub use observer::{DeviceObserver, ObservationStrategy, ObserverContext, ObserverHooks};
pub use queue::{QueueError, TaskQueue};
pub use session::Session;
pub use subscriber::{DeviceSubscriber, SubscriberHandler};
pub use subscriptions::{ResourceSubscription, SubscriptionRegistry};
