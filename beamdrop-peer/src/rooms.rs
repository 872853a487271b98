//! Client for the HTTP room-code signaling API: the offerer parks its
//! offer under a short numeric code, the answerer fetches it by code and
//! posts the answer back, and the offerer polls until the answer lands.

use std::time::Duration;

use beamdrop_core::{Room, SignalingPayload};
use serde::Deserialize;
use tracing::debug;

use crate::error::RoomApiError;

pub struct RoomClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CreatedRoom {
    code: String,
}

impl RoomClient {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Parks `offer` on the server; returns the room code to hand to the
    /// other party.
    pub async fn create_room(&self, offer: &SignalingPayload) -> Result<String, RoomApiError> {
        let response = self
            .http
            .post(format!("{}/rooms", self.base_url))
            .json(&serde_json::json!({ "offer": offer }))
            .send()
            .await?;
        let created: CreatedRoom = Self::check(response).await?.json().await?;
        debug!(code = %created.code, "created signaling room");
        Ok(created.code)
    }

    /// Fetches the room for `code`; fails with a not-found API error once
    /// the room has expired.
    pub async fn fetch_room(&self, code: &str) -> Result<Room, RoomApiError> {
        let response = self
            .http
            .get(format!("{}/rooms/{code}", self.base_url))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn post_answer(
        &self,
        code: &str,
        answer: &SignalingPayload,
    ) -> Result<(), RoomApiError> {
        let response = self
            .http
            .post(format!("{}/rooms/{code}", self.base_url))
            .json(&serde_json::json!({ "answer": answer }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Polls the room until the answer arrives. Expiry surfaces as the
    /// not-found API error from [`fetch_room`](RoomClient::fetch_room).
    pub async fn poll_answer(
        &self,
        code: &str,
        interval: Duration,
    ) -> Result<SignalingPayload, RoomApiError> {
        loop {
            if let Some(answer) = self.fetch_room(code).await?.answer {
                return Ok(answer);
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RoomApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| body.get("error")?.as_str().map(str::to_owned))
            .unwrap_or_else(|| status.to_string());
        Err(RoomApiError::Api {
            status: status.as_u16(),
            message,
        })
    }
}
