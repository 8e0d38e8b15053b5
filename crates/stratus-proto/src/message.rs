// ── Message model ──
//
// Numeric codes and encoding-negotiated payloads, kept deliberately
// wire-agnostic: the framing layer maps these onto the concrete
// transport encoding.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ProtoError;

/// Resource path on a device, e.g. `/light/1`.
pub type Href = String;

// ── Code ─────────────────────────────────────────────────────────────

/// Response code for device requests, notifications, and gateway
/// responses. The numeric values follow the CoAP `class.detail`
/// convention (`c*32 + d`) so the framing layer can map them 1:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    // Success 2.xx
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    // Client error 4.xx
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    // Server error 5.xx
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
}

impl Code {
    /// Numeric wire value (`class * 32 + detail`).
    pub fn value(self) -> u8 {
        match self {
            Self::Created => 2 * 32 + 1,
            Self::Deleted => 2 * 32 + 2,
            Self::Valid => 2 * 32 + 3,
            Self::Changed => 2 * 32 + 4,
            Self::Content => 2 * 32 + 5,
            Self::BadRequest => 4 * 32,
            Self::Unauthorized => 4 * 32 + 1,
            Self::Forbidden => 4 * 32 + 3,
            Self::NotFound => 4 * 32 + 4,
            Self::MethodNotAllowed => 4 * 32 + 5,
            Self::InternalServerError => 5 * 32,
            Self::NotImplemented => 5 * 32 + 1,
            Self::ServiceUnavailable => 5 * 32 + 3,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Deleted | Self::Valid | Self::Changed | Self::Content
        )
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.value();
        write!(f, "{}.{:02}", v >> 5, v & 0x1f)
    }
}

// ── Method ───────────────────────────────────────────────────────────

/// Request method for device-facing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

// ── ContentFormat ────────────────────────────────────────────────────

/// Numeric payload encoding negotiated per message.
///
/// Real devices speak CBOR; the gateway core encodes bodies with serde
/// and leaves transcoding to the framing layer, so only the formats the
/// core itself produces are enumerated here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentFormat {
    /// `text/plain` — used for synthesized error bodies.
    Text,
    /// `application/json`.
    #[default]
    Json,
    /// Vendor CBOR format, carried opaquely.
    Cbor,
}

impl ContentFormat {
    pub fn value(self) -> u16 {
        match self {
            Self::Text => 0,
            Self::Json => 50,
            Self::Cbor => 10_000,
        }
    }

    pub fn from_value(value: u16) -> Result<Self, ProtoError> {
        match value {
            0 => Ok(Self::Text),
            50 => Ok(Self::Json),
            10_000 => Ok(Self::Cbor),
            other => Err(ProtoError::UnsupportedContentFormat(other)),
        }
    }
}

// ── Message ──────────────────────────────────────────────────────────

/// A response or notification received from (or written to) the device.
#[derive(Debug, Clone)]
pub struct Message {
    pub code: Code,
    pub content_format: Option<ContentFormat>,
    pub payload: Bytes,
    /// Sequence number of an observe notification. `None` for plain
    /// responses; one-shot get responses forwarded through the observer
    /// therefore stay distinguishable from real notifications.
    pub observe: Option<u32>,
}

impl Message {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            content_format: None,
            payload: Bytes::new(),
            observe: None,
        }
    }

    /// Build a message with a serde-encoded body.
    pub fn with_body<T: Serialize>(code: Code, format: ContentFormat, body: &T) -> Result<Self, ProtoError> {
        let payload = match format {
            ContentFormat::Text => {
                return Err(ProtoError::UnsupportedContentFormat(format.value()));
            }
            // CBOR transcoding happens in the framing layer.
            ContentFormat::Json | ContentFormat::Cbor => {
                serde_json::to_vec(body).map_err(ProtoError::Encode)?
            }
        };
        Ok(Self {
            code,
            content_format: Some(format),
            payload: Bytes::from(payload),
            observe: None,
        })
    }

    /// Build a `text/plain` message, used for synthesized error bodies.
    pub fn with_text(code: Code, text: &str) -> Self {
        Self {
            code,
            content_format: Some(ContentFormat::Text),
            payload: Bytes::copy_from_slice(text.as_bytes()),
            observe: None,
        }
    }

    /// Decode the payload body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        serde_json::from_slice(&self.payload).map_err(ProtoError::Decode)
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ── DeviceRequest ────────────────────────────────────────────────────

/// A request the gateway sends to the device, with a bounded timeout.
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    pub method: Method,
    pub href: Href,
    pub content_format: Option<ContentFormat>,
    pub payload: Bytes,
    pub timeout: Duration,
}

impl DeviceRequest {
    pub fn new(method: Method, href: impl Into<Href>, timeout: Duration) -> Self {
        Self {
            method,
            href: href.into(),
            content_format: None,
            payload: Bytes::new(),
            timeout,
        }
    }

    pub fn with_payload(mut self, format: ContentFormat, payload: Bytes) -> Self {
        self.content_format = Some(format);
        self.payload = payload;
        self
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn code_values_follow_class_detail_convention() {
        assert_eq!(Code::Content.value(), 69);
        assert_eq!(Code::Changed.value(), 68);
        assert_eq!(Code::BadRequest.value(), 128);
        assert_eq!(Code::NotFound.value(), 132);
        assert_eq!(Code::ServiceUnavailable.value(), 163);
    }

    #[test]
    fn code_display_uses_dotted_form() {
        assert_eq!(Code::Content.to_string(), "2.05");
        assert_eq!(Code::NotFound.to_string(), "4.04");
        assert_eq!(Code::InternalServerError.to_string(), "5.00");
    }

    #[test]
    fn success_classification() {
        assert!(Code::Changed.is_success());
        assert!(Code::Content.is_success());
        assert!(!Code::NotFound.is_success());
        assert!(!Code::ServiceUnavailable.is_success());
    }

    #[test]
    fn content_format_round_trip() {
        for format in [ContentFormat::Text, ContentFormat::Json, ContentFormat::Cbor] {
            assert_eq!(ContentFormat::from_value(format.value()).unwrap(), format);
        }
        assert!(matches!(
            ContentFormat::from_value(60),
            Err(ProtoError::UnsupportedContentFormat(60))
        ));
    }

    #[test]
    fn message_body_encode_decode() {
        #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Body {
            state: bool,
        }

        let msg = Message::with_body(Code::Content, ContentFormat::Json, &Body { state: true }).unwrap();
        assert_eq!(msg.content_format, Some(ContentFormat::Json));
        assert_eq!(msg.decode::<Body>().unwrap(), Body { state: true });
    }

    #[test]
    fn text_message_carries_error_body() {
        let msg = Message::with_text(Code::ServiceUnavailable, "device unreachable");
        assert_eq!(msg.payload.as_ref(), b"device unreachable");
        assert_eq!(msg.content_format, Some(ContentFormat::Text));
    }
}
