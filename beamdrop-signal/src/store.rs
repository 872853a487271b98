use std::{collections::HashMap, sync::Arc};

use beamdrop_core::{MAX_CODE_ATTEMPTS, ROOM_TTL_SECONDS, Room, RoomCode, SignalingPayload};
use rand::Rng;
use tokio::{
    sync::RwLock,
    time::{Duration, Instant},
};
use tracing::debug;

use crate::SignalError;

/// In-memory key-value room store with per-entry TTL.
///
/// Entries expire lazily on read; [`RoomStore::sweep`] additionally removes
/// dead entries so abandoned rooms do not accumulate.
#[derive(Debug, Clone, Default)]
pub struct RoomStore {
    entries: Arc<RwLock<HashMap<RoomCode, StoredRoom>>>,
}

#[derive(Debug)]
struct StoredRoom {
    room: Room,
    expires_at: Instant,
}

impl RoomStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, code: &str, room: Room, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            code.to_owned(),
            StoredRoom {
                room,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn get(&self, code: &str) -> Option<Room> {
        let mut entries = self.entries.write().await;
        match entries.get(code) {
            Some(stored) if stored.expires_at > Instant::now() => Some(stored.room.clone()),
            Some(_) => {
                entries.remove(code);
                None
            }
            None => None,
        }
    }

    /// Publishes `offer` under a freshly drawn 6-digit code.
    ///
    /// Codes are drawn uniformly and redrawn on collision with a live room,
    /// up to [`MAX_CODE_ATTEMPTS`] times.
    pub async fn create_room<R: Rng>(
        &self,
        rng: &mut R,
        offer: SignalingPayload,
    ) -> Result<RoomCode, SignalError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = rng.random_range(100_000..=999_999).to_string();
            if let Some(existing) = entries.get(&code)
                && existing.expires_at > now
            {
                debug!("room code {} already taken, redrawing", code);
                continue;
            }
            entries.insert(
                code.clone(),
                StoredRoom {
                    room: Room {
                        offer,
                        answer: None,
                    },
                    expires_at: now + Duration::from_secs(ROOM_TTL_SECONDS),
                },
            );
            return Ok(code);
        }
        Err(SignalError::CodeGenerationExhausted(MAX_CODE_ATTEMPTS))
    }

    /// Attaches the receiver's answer to an existing room and re-stamps its
    /// TTL, so the offering side has the full window to poll it back out.
    pub async fn attach_answer(
        &self,
        code: &str,
        answer: SignalingPayload,
    ) -> Result<(), SignalError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        match entries.get_mut(code) {
            Some(stored) if stored.expires_at > now => {
                stored.room.answer = Some(answer);
                stored.expires_at = now + Duration::from_secs(ROOM_TTL_SECONDS);
                Ok(())
            }
            Some(_) => {
                entries.remove(code);
                Err(SignalError::RoomNotFound)
            }
            None => Err(SignalError::RoomNotFound),
        }
    }

    /// Drops every expired entry.
    pub async fn sweep(&self) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, stored| stored.expires_at > now);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use beamdrop_core::{SdpKind, SessionDescription};
    use rand::{SeedableRng, rngs::StdRng};
    use tokio::time::advance;

    use super::*;

    fn offer_payload() -> SignalingPayload {
        SignalingPayload {
            description: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0 offer".to_owned(),
            },
            candidates: Vec::new(),
        }
    }

    fn answer_payload() -> SignalingPayload {
        SignalingPayload {
            description: SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0 answer".to_owned(),
            },
            candidates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn created_room_is_fetched_with_its_offer() {
        let store = RoomStore::new();
        let mut rng = StdRng::seed_from_u64(1);
        let code = store.create_room(&mut rng, offer_payload()).await.unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        let room = store.get(&code).await.unwrap();
        assert_eq!(room.offer, offer_payload());
        assert_eq!(room.answer, None);
    }

    #[tokio::test]
    async fn attached_answer_is_returned_alongside_offer() {
        let store = RoomStore::new();
        let mut rng = StdRng::seed_from_u64(2);
        let code = store.create_room(&mut rng, offer_payload()).await.unwrap();

        store.attach_answer(&code, answer_payload()).await.unwrap();
        let room = store.get(&code).await.unwrap();
        assert_eq!(room.offer, offer_payload());
        assert_eq!(room.answer, Some(answer_payload()));
    }

    #[tokio::test]
    async fn attach_answer_to_unknown_room_fails() {
        let store = RoomStore::new();
        let err = store
            .attach_answer("999999", answer_payload())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::RoomNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn room_expires_after_ttl() {
        let store = RoomStore::new();
        let mut rng = StdRng::seed_from_u64(3);
        let code = store.create_room(&mut rng, offer_payload()).await.unwrap();

        advance(Duration::from_secs(ROOM_TTL_SECONDS - 1)).await;
        assert!(store.get(&code).await.is_some());

        advance(Duration::from_secs(2)).await;
        assert!(store.get(&code).await.is_none());
        assert!(matches!(
            store.attach_answer(&code, answer_payload()).await,
            Err(SignalError::RoomNotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn answer_restamps_ttl() {
        let store = RoomStore::new();
        let mut rng = StdRng::seed_from_u64(4);
        let code = store.create_room(&mut rng, offer_payload()).await.unwrap();

        advance(Duration::from_secs(ROOM_TTL_SECONDS - 10)).await;
        store.attach_answer(&code, answer_payload()).await.unwrap();

        // Without the re-stamp the original TTL would have passed by now.
        advance(Duration::from_secs(60)).await;
        assert!(store.get(&code).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_expired_entries() {
        let store = RoomStore::new();
        let mut rng = StdRng::seed_from_u64(5);
        store.create_room(&mut rng, offer_payload()).await.unwrap();
        assert_eq!(store.len().await, 1);

        advance(Duration::from_secs(ROOM_TTL_SECONDS + 1)).await;
        store.sweep().await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn code_generation_gives_up_after_bounded_retries() {
        let store = RoomStore::new();

        // Pre-occupy every code a deterministic rng will draw, so each of
        // the bounded attempts collides.
        let mut preview = StdRng::seed_from_u64(6);
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = preview.random_range(100_000..=999_999).to_string();
            store
                .set(
                    &code,
                    Room {
                        offer: offer_payload(),
                        answer: None,
                    },
                    Duration::from_secs(ROOM_TTL_SECONDS),
                )
                .await;
        }

        let mut rng = StdRng::seed_from_u64(6);
        let err = store.create_room(&mut rng, offer_payload()).await.unwrap_err();
        assert!(matches!(
            err,
            SignalError::CodeGenerationExhausted(MAX_CODE_ATTEMPTS)
        ));
    }

    #[tokio::test]
    async fn collision_redraws_until_free_code_found() {
        let store = RoomStore::new();

        // Occupy only the first code the rng will draw; creation must then
        // succeed on a later attempt with a different code.
        let first = StdRng::seed_from_u64(7).random_range(100_000..=999_999).to_string();
        store
            .set(
                &first,
                Room {
                    offer: offer_payload(),
                    answer: None,
                },
                Duration::from_secs(ROOM_TTL_SECONDS),
            )
            .await;

        let mut rng = StdRng::seed_from_u64(7);
        let code = store.create_room(&mut rng, offer_payload()).await.unwrap();
        assert_ne!(code, first);
    }
}
