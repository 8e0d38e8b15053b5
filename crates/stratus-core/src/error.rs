//! Service error taxonomy.
//!
//! Variants map onto the gateway's failure policy: protocol and
//! authentication failures close the connection with a specific response
//! code, device-unreachable failures are confirmed back to the backend
//! with an error body, and desynchronization closes the connection to
//! force the device to reconnect and resynchronize.

use std::sync::Arc;

use stratus_proto::{Code, ProtoError};
use thiserror::Error;

use crate::queue::QueueError;

/// Errors produced by the session engine.
///
/// Cloneable so a single failure can be shared between a resolved
/// observer placeholder and every waiter observing it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Malformed or incomplete request from the device.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No valid authorization context on the session.
    #[error("invalid authorization context: {0}")]
    Unauthenticated(String),

    /// Access token failed validation against the identity service.
    #[error("cannot validate access token: {0}")]
    TokenValidation(String),

    /// Token-embedded device identity does not match the transport-bound one.
    #[error("device id binding rejected: {0}")]
    DeviceBinding(String),

    /// Owner claim in the token does not match the asserted user.
    #[error("owner claim validation failed: {0}")]
    OwnerClaim(String),

    /// The user does not own the device it signs in for.
    #[error("access to device '{0}' denied")]
    AccessDenied(String),

    /// The device request could not be delivered (timeout, closed
    /// connection, transport failure). The connection stays open; the
    /// failure is confirmed back to the backend instead.
    #[error("cannot reach device: {0}")]
    DeviceUnreachable(String),

    /// The cloud's view of the device diverged and cannot be repaired
    /// in place. The connection is closed to force a resync.
    #[error("cloud state desynchronized from device: {0}")]
    Desynchronized(String),

    /// A backend RPC failed.
    #[error("backend call failed: {0}")]
    Backend(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Payload or message-model failure from the protocol layer.
    #[error("protocol error: {0}")]
    Proto(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Response code reported to the device when this error aborts a
    /// sign-in/out exchange.
    pub fn response_code(&self) -> Code {
        match self {
            Self::InvalidRequest(_) | Self::Proto(_) => Code::BadRequest,
            Self::DeviceBinding(_) | Self::AccessDenied(_) => Code::Unauthorized,
            Self::DeviceUnreachable(_) | Self::Backend(_) => Code::ServiceUnavailable,
            Self::Unauthenticated(_)
            | Self::TokenValidation(_)
            | Self::OwnerClaim(_)
            | Self::Desynchronized(_)
            | Self::Queue(_)
            | Self::Internal(_) => Code::InternalServerError,
        }
    }

    /// Unwrap a shared error out of an `Arc` (used by observer waiters).
    pub(crate) fn from_shared(err: &Arc<ServiceError>) -> Self {
        err.as_ref().clone()
    }
}

impl From<ProtoError> for ServiceError {
    fn from(err: ProtoError) -> Self {
        if err.is_unreachable() {
            Self::DeviceUnreachable(err.to_string())
        } else {
            Self::Proto(err.to_string())
        }
    }
}
