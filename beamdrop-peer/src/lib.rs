//! Peer-side machinery for beamdrop file transfers: offer/answer
//! negotiation over a pluggable transport, chunked sending with
//! backpressure, streaming receiving with exact-completion detection,
//! and the session lifecycle tying them to the signaling server's
//! room-code and websocket-relay flows.

pub mod error;
pub mod loopback;
pub mod negotiate;
pub mod receive;
pub mod relay;
pub mod rooms;
pub mod send;
pub mod session;
pub mod transport;

pub use error::{
    ChannelClosed, NegotiationError, PeerError, RelayError, RoomApiError, SessionActive,
    TransferError,
};
pub use negotiate::{Negotiator, NegotiatorState, SignalingMode};
pub use receive::{
    ByteSink, FsSinkFactory, MemorySinkFactory, ReceiveEvent, Receiver, SinkFactory,
};
pub use relay::RelayClient;
pub use rooms::RoomClient;
pub use send::{ChunkSource, FileSource, MemorySource, send_file};
pub use session::SessionManager;
pub use transport::{ChannelMessage, DataChannel, PeerConnection, TransportEvent};
