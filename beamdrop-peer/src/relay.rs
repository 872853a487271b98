//! Client side of the websocket signaling relay.

use beamdrop_core::{SignalEvent, decode_event, encode_event};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};
use tracing::{debug, warn};
use url::Url;

use crate::error::RelayError;

/// A connection to one room on the signaling relay. Events sent here reach
/// the other party in the room; [`next_event`](RelayClient::next_event)
/// yields theirs.
pub struct RelayClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelayClient {
    /// Connects to `base_url` (a `ws://` or `wss://` origin) and joins the
    /// room identified by `code`.
    pub async fn connect(base_url: &str, code: &str) -> Result<Self, RelayError> {
        let base = Url::parse(base_url)?;
        let url = base.join(&format!("ws/{code}"))?;
        debug!(%url, "connecting to signaling relay");
        let (stream, _) = connect_async(url.as_str()).await?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, event: &SignalEvent) -> Result<(), RelayError> {
        let frame = encode_event(event)?;
        self.stream.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    /// Next signaling event from the other party. Non-text frames and
    /// frames that fail to decode are skipped; `None` means the relay
    /// connection is gone.
    pub async fn next_event(&mut self) -> Option<SignalEvent> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match decode_event(text.as_str()) {
                    Ok(event) => return Some(event),
                    Err(err) => warn!("skipping undecodable relay frame: {err}"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => {
                    warn!("relay socket error: {err}");
                    return None;
                }
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
