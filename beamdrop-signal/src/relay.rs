use std::collections::HashMap;

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use beamdrop_core::{RoomCode, SignalEvent, decode_event, encode_event};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;

/// Live signaling relay state: for each room namespace, the parties that
/// are currently connected. A namespace holds at most two parties.
#[derive(Debug, Default)]
pub struct RelayState {
    rooms: HashMap<RoomCode, Vec<Party>>,
}

#[derive(Debug)]
struct Party {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(code): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_socket(state, code, socket).await {
            warn!("relay session ended with error: {}", err);
        }
    })
}

async fn handle_socket(state: AppState, code: String, socket: WebSocket) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let party_id = register_party(&state, &code, outbound_tx).await?;
    info!("party {} joined relay room {}", party_id, code);

    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("relay websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                // Validate before forwarding so a malformed frame never
                // reaches the other party.
                match decode_event(text.as_str()) {
                    Ok(event) => {
                        debug!("party {} relaying {:?}", party_id, kind_of(&event));
                        forward_to_peer(&state, &code, party_id, Message::Text(text)).await;
                    }
                    Err(err) => {
                        warn!("dropping malformed relay frame from {}: {}", party_id, err);
                    }
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                warn!("dropping unexpected binary frame from party {}", party_id);
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    unregister_party(&state, &code, party_id).await;
    send_task.abort();
    info!("party {} left relay room {}", party_id, code);
    Ok(())
}

fn kind_of(event: &SignalEvent) -> &'static str {
    match event {
        SignalEvent::Offer(_) => "offer",
        SignalEvent::Answer(_) => "answer",
        SignalEvent::Candidate(_) => "candidate",
        SignalEvent::PeerLeft => "peer-left",
    }
}

async fn register_party(
    state: &AppState,
    code: &str,
    tx: mpsc::UnboundedSender<Message>,
) -> Result<u64, String> {
    let mut relay = state.relay.write().await;
    let parties = relay.rooms.entry(code.to_owned()).or_default();
    if parties.len() >= 2 {
        return Err(format!("relay room {} already has two parties", code));
    }
    let id = state.next_party_id();
    parties.push(Party { id, tx });
    Ok(id)
}

async fn unregister_party(state: &AppState, code: &str, party_id: u64) {
    let mut relay = state.relay.write().await;
    let survivor = match relay.rooms.get_mut(code) {
        Some(parties) => {
            parties.retain(|party| party.id != party_id);
            if parties.is_empty() {
                relay.rooms.remove(code);
                None
            } else {
                parties.first().map(|party| party.tx.clone())
            }
        }
        None => None,
    };
    drop(relay);

    if let Some(tx) = survivor
        && let Ok(frame) = encode_event(&SignalEvent::PeerLeft)
    {
        let _ = tx.send(Message::Text(frame.into()));
    }
}

async fn forward_to_peer(state: &AppState, code: &str, sender_id: u64, message: Message) {
    let recipients = {
        let relay = state.relay.read().await;
        relay
            .rooms
            .get(code)
            .map(|parties| {
                parties
                    .iter()
                    .filter(|party| party.id != sender_id)
                    .map(|party| party.tx.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    for tx in recipients {
        let _ = tx.send(message.clone());
    }
}
