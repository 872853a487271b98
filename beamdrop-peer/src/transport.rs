use beamdrop_core::{IceCandidate, SessionDescription};
use bytes::Bytes;

use crate::error::{ChannelClosed, NegotiationError};

/// A message delivered over the data channel: the transfer protocol sends
/// metadata as text and payload chunks as binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An ordered, reliable application-data channel riding on a peer
/// connection. Mirrors the transport primitive's channel surface: send,
/// buffered-amount introspection, open/close state, and an inbound
/// message stream.
#[allow(async_fn_in_trait)]
pub trait DataChannel {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Bytes queued locally by the transport, waiting to be transmitted.
    fn buffered_amount(&self) -> usize;
    fn close(&self);
    async fn send_text(&self, text: &str) -> Result<(), ChannelClosed>;
    async fn send_binary(&self, data: Bytes) -> Result<(), ChannelClosed>;
    /// Next inbound message; `None` once the channel has closed.
    ///
    /// Must be cancel-safe: dropping the future must not lose a message.
    async fn recv(&mut self) -> Option<ChannelMessage>;
    /// Resolves once the channel is open, or fails if it closed first.
    async fn wait_open(&mut self) -> Result<(), ChannelClosed>;
}

/// A connection-level event reported by the transport while a session
/// is being established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A locally gathered connectivity candidate.
    Candidate(IceCandidate),
    /// Local candidate gathering finished; no further candidates follow.
    GatheringComplete,
    /// The remote side announced a data channel. Claim it with
    /// [`PeerConnection::take_incoming_channel`].
    ChannelAnnounced,
}

/// The negotiated peer transport, treated as an external collaborator.
/// The session lifecycle manager is the only owner; everything else
/// borrows it.
#[allow(async_fn_in_trait)]
pub trait PeerConnection {
    type Channel: DataChannel;

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate)
    -> Result<(), NegotiationError>;
    /// Next connection event; `None` once the connection has closed and
    /// every pending event has been delivered. Pends between events, so
    /// it can be raced against other work.
    ///
    /// Must be cancel-safe: dropping the future must not lose an event.
    async fn next_transport_event(&mut self) -> Option<TransportEvent>;
    /// Opens a channel on the offering side, before the offer is created.
    async fn create_data_channel(&mut self, label: &str)
    -> Result<Self::Channel, NegotiationError>;
    /// Claims a channel announced by the remote side, if one is waiting.
    fn take_incoming_channel(&mut self) -> Option<Self::Channel>;
    /// Closing invalidates every in-flight operation on the connection.
    fn close(&mut self);
}
