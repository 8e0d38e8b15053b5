// ── Device transport abstraction ──
//
// One implementor per physical device connection. Framing, TLS, and
// keep-alive are the implementor's concern; the gateway core only sees
// requests, observations, and written responses.
//
// Contract: notification handlers run on the transport's read path.
// Re-entering the transport from a handler (issuing a request, writing
// a response) deadlocks the read loop, so handlers must only hand work
// off to an executor.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProtoError;
use crate::message::{DeviceRequest, Href, Message};

/// Callback invoked for every observe notification of one resource.
pub type NotificationHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// An established observation of a single resource (or of the
/// device-wide discovery resource). Cancelling stops the stream;
/// notifications already in flight may still be delivered.
#[async_trait]
pub trait Observation: Send + Sync {
    async fn cancel(&self) -> Result<(), ProtoError>;
}

/// A long-lived connection to one device.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Issue a unary request and await the device's response.
    ///
    /// The request's timeout bounds the exchange; closing the connection
    /// must fail in-flight requests promptly with
    /// [`ProtoError::ConnectionClosed`].
    async fn request(&self, request: DeviceRequest) -> Result<Message, ProtoError>;

    /// Register a persistent observation of `href`. Fails with
    /// [`ProtoError::NotObservable`] when the device rejects the observe
    /// option for this resource.
    async fn observe(
        &self,
        href: &Href,
        handler: NotificationHandler,
    ) -> Result<Box<dyn Observation>, ProtoError>;

    /// Write a response message to the device (sign-in/out replies,
    /// error responses). Failures are logged by the implementor; the
    /// caller has no recovery path beyond closing the connection.
    fn write_message(&self, message: Message);

    /// Stable identifier of the peer, used as the connection id in
    /// backend command metadata.
    fn remote_addr(&self) -> String;

    /// Monotonic per-connection sequence number for backend command
    /// metadata ordering.
    fn sequence(&self) -> u64;

    /// Close the connection. Idempotent; in-flight requests fail fast.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
