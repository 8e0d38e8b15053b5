use thiserror::Error;

/// Errors produced by the protocol layer.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("cannot decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cannot encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unsupported content format {0}")]
    UnsupportedContentFormat(u16),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request to the device timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("resource '{0}' is not observable")]
    NotObservable(String),
}

impl ProtoError {
    /// Whether the failure means the device could not be reached at all,
    /// as opposed to a malformed request or payload.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ConnectionClosed | Self::Transport(_)
        )
    }
}
