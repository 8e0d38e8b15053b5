//! Device-facing protocol surface for the stratus gateway.
//!
//! This crate owns everything the session engine needs to talk to a
//! constrained smart-device client without knowing how its transport is
//! framed or encrypted:
//!
//! - **[`Message`] / [`Code`] / [`ContentFormat`]** — the request/response
//!   and observe message model, with numeric response codes and
//!   encoding-negotiated payload bodies.
//!
//! - **[`SignInRequest`] / [`SignInResponse`]** — sign-in/out session
//!   payloads, including the field fill-in rules for sign-out.
//!
//! - **[`DeviceTransport`]** — the abstract long-lived connection to one
//!   device. Wire framing, TLS, and keep-alive probing are the concrete
//!   transport's concern; the gateway core only issues requests,
//!   registers observations, and writes responses.
//!
//! The concrete encoding negotiated with real devices is CBOR; this crate
//! keeps the negotiation as a numeric [`ContentFormat`] and encodes payload
//! bodies with serde, so the framing layer can transcode as needed.

pub mod error;
pub mod message;
pub mod session;
pub mod transport;

pub use error::ProtoError;
pub use message::{Code, ContentFormat, DeviceRequest, Href, Message, Method};
pub use session::{SignInRequest, SignInResponse};
pub use transport::{DeviceTransport, NotificationHandler, Observation};

/// The device-wide discovery resource. Observing it yields batched
/// change records for every published resource on the device.
pub const DISCOVERY_HREF: &str = "/oic/res";

/// Virtual resource exposing the cloud session status. Commands against
/// it are answered locally by the gateway, never forwarded to the device.
pub const STATUS_HREF: &str = "/oic/cloud/s";
