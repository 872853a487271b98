use beamdrop_core::CoreError;
use thiserror::Error;

/// The data channel closed under an operation that needed it open.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("data channel closed")]
pub struct ChannelClosed;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Codec(#[from] CoreError),
}

#[derive(Debug, Error)]
pub enum TransferError {
    /// The message stream broke the metadata-then-chunks protocol. Fatal to
    /// the current session; the lifecycle manager resets.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error(transparent)]
    Metadata(CoreError),
    #[error("data channel closed mid-transfer")]
    ChannelClosed,
    #[error("transfer i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ChannelClosed> for TransferError {
    fn from(_: ChannelClosed) -> Self {
        TransferError::ChannelClosed
    }
}

/// A fresh transfer session was requested while the previous one had not
/// reached a terminal state.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("previous transfer session is still active")]
pub struct SessionActive;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("relay websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Codec(#[from] CoreError),
}

#[derive(Debug, Error)]
pub enum RoomApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signaling server returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl RoomApiError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, RoomApiError::Api { status: 404, .. })
    }
}

/// Umbrella error for the session lifecycle drivers, which cross the
/// negotiation, transfer, and signaling layers in one flow.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    SessionActive(#[from] SessionActive),
    #[error("signaling relay connection closed")]
    RelayClosed,
    #[error("peer connection closed before the transfer could run")]
    ConnectionClosed,
}
