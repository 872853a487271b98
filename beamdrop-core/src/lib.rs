use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of each binary payload chunk pushed onto the data channel.
pub const CHUNK_SIZE: usize = 262_144;
/// Sending pauses once the transport reports more than this many queued bytes.
pub const BUFFER_HIGH_WATER: usize = 10 * 1024 * 1024;
/// Sending resumes once the transport send queue drains to this level.
pub const BUFFER_LOW_WATER: usize = BUFFER_HIGH_WATER / 2;
/// Poll interval while waiting for the transport send queue to drain.
pub const DRAIN_POLL_INTERVAL_MS: u64 = 100;
/// Label the offering side assigns to the file-transfer data channel.
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";
/// Seconds a signaling room stays alive in the room store.
pub const ROOM_TTL_SECONDS: u64 = 300;
/// Attempts at drawing an unused 6-digit room code before giving up.
pub const MAX_CODE_ATTEMPTS: u32 = 10;

pub type RoomCode = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A local or remote session description as produced by the peer transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// One discovered connectivity candidate, in the shape the peer transport
/// hands it out (candidate string plus optional media-line association).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// The out-of-band signaling blob one peer hands the other: a session
/// description plus every candidate gathered so far. Candidates are empty
/// when trickle delivery is in use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalingPayload {
    #[serde(rename = "sdp")]
    pub description: SessionDescription,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
}

/// Announced by the sender before the first chunk. The receiver treats
/// `size` as the sole completion authority: the transfer is done exactly
/// when that many payload bytes have arrived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Record stored under a room code: the offer, later joined by the answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub offer: SignalingPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SignalingPayload>,
}

/// Event carried over the live signaling relay between exactly two parties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalEvent {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    PeerLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Completed,
    Aborted,
}

/// Per-transfer accounting owned by exactly one side of the channel.
///
/// A new session may only be created once the previous one reached a
/// terminal state; the lifecycle manager enforces that invariant.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub role: TransferRole,
    pub state: SessionState,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl TransferSession {
    #[must_use]
    pub fn new(role: TransferRole, total_bytes: u64) -> Self {
        Self {
            role,
            state: SessionState::Pending,
            bytes_transferred: 0,
            total_bytes,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.bytes_transferred += bytes;
        if self.state == SessionState::Pending {
            self.state = SessionState::Active;
        }
    }

    pub fn complete(&mut self) {
        self.state = SessionState::Completed;
    }

    pub fn abort(&mut self) {
        self.state = SessionState::Aborted;
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Completed | SessionState::Aborted)
    }

    #[must_use]
    pub fn progress(&self) -> f64 {
        progress(self.bytes_transferred, self.total_bytes)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed signaling payload: {0}")]
    MalformedPayload(String),
    #[error("malformed file metadata: {0}")]
    MalformedMetadata(String),
}

pub fn encode_payload(payload: &SignalingPayload) -> Result<String, CoreError> {
    serde_json::to_string(payload).map_err(|err| CoreError::MalformedPayload(err.to_string()))
}

pub fn decode_payload(text: &str) -> Result<SignalingPayload, CoreError> {
    serde_json::from_str(text).map_err(|err| CoreError::MalformedPayload(err.to_string()))
}

pub fn encode_metadata(metadata: &FileMetadata) -> Result<String, CoreError> {
    serde_json::to_string(metadata).map_err(|err| CoreError::MalformedMetadata(err.to_string()))
}

pub fn decode_metadata(text: &str) -> Result<FileMetadata, CoreError> {
    serde_json::from_str(text).map_err(|err| CoreError::MalformedMetadata(err.to_string()))
}

pub fn encode_event(event: &SignalEvent) -> Result<String, CoreError> {
    serde_json::to_string(event).map_err(|err| CoreError::MalformedPayload(err.to_string()))
}

pub fn decode_event(text: &str) -> Result<SignalEvent, CoreError> {
    serde_json::from_str(text).map_err(|err| CoreError::MalformedPayload(err.to_string()))
}

/// Number of fixed-size chunks a file of `total_size` bytes splits into.
/// Zero for an empty file, which still gets a metadata message.
#[must_use]
pub fn chunk_count(total_size: u64) -> u64 {
    total_size.div_ceil(CHUNK_SIZE as u64)
}

/// Transfer progress in `[0.0, 1.0]`. An empty transfer is complete the
/// moment its metadata is exchanged, so `total == 0` reports 1.0.
#[must_use]
pub fn progress(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (transferred as f64 / total as f64).min(1.0)
}
