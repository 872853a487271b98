//! Offer/answer negotiation driven over a caller-supplied transport.
//!
//! The negotiator is a pure state machine: each operation borrows the
//! peer connection for its duration, applies descriptions and candidates
//! through it, and either bundles the outcome into a single
//! [`SignalingPayload`] (non-trickle) or emits the bare description into
//! an outbox (trickled). In trickled mode the caller keeps forwarding
//! candidates from the transport's event stream while it waits for the
//! channel; the negotiator never blocks on gathering.

use beamdrop_core::{IceCandidate, SignalEvent, SignalingPayload};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    error::NegotiationError,
    transport::{PeerConnection, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    Idle,
    AwaitingRemoteAnswer,
    LocalAnswerCreated,
    Connected,
    Failed,
}

/// How negotiation output leaves the machine.
#[derive(Debug, Clone)]
pub enum SignalingMode {
    /// Gather every local candidate before returning, then hand back one
    /// complete payload. Used for copy-paste and room-code signaling.
    NonTrickle,
    /// Emit the description into the outbox immediately; the driver
    /// forwards candidates as the transport reports them. Used over the
    /// websocket relay.
    Trickled(mpsc::UnboundedSender<SignalEvent>),
}

pub struct Negotiator {
    state: NegotiatorState,
    mode: SignalingMode,
    remote_description_set: bool,
}

impl Negotiator {
    #[must_use]
    pub fn new(mode: SignalingMode) -> Self {
        Self {
            state: NegotiatorState::Idle,
            mode,
            remote_description_set: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    /// Creates and applies a local offer. Returns the bundled payload in
    /// non-trickle mode, `None` in trickled mode (the outbox carries it)
    /// or when the machine is not idle, in which case the call is a no-op.
    pub async fn create_offer<P: PeerConnection>(
        &mut self,
        connection: &mut P,
    ) -> Result<Option<SignalingPayload>, NegotiationError> {
        if self.state != NegotiatorState::Idle {
            debug!(state = ?self.state, "ignoring create_offer outside idle state");
            return Ok(None);
        }
        let result = self.offer_inner(connection).await;
        if result.is_err() {
            self.state = NegotiatorState::Failed;
        }
        result
    }

    async fn offer_inner<P: PeerConnection>(
        &mut self,
        connection: &mut P,
    ) -> Result<Option<SignalingPayload>, NegotiationError> {
        let description = connection.create_offer().await?;
        connection.set_local_description(description.clone()).await?;
        let payload = match &self.mode {
            SignalingMode::NonTrickle => {
                let candidates = gather_all(connection).await;
                Some(SignalingPayload {
                    description,
                    candidates,
                })
            }
            SignalingMode::Trickled(outbox) => {
                let _ = outbox.send(SignalEvent::Offer(description));
                None
            }
        };
        self.state = NegotiatorState::AwaitingRemoteAnswer;
        Ok(payload)
    }

    /// Applies a remote offer and produces the local answer. Ignored (with
    /// `Ok(None)`) when an offer was already accepted or we are the
    /// offering side ourselves.
    pub async fn accept_remote_offer<P: PeerConnection>(
        &mut self,
        connection: &mut P,
        payload: SignalingPayload,
    ) -> Result<Option<SignalingPayload>, NegotiationError> {
        if self.state != NegotiatorState::Idle {
            debug!(state = ?self.state, "ignoring duplicate or out-of-order offer");
            return Ok(None);
        }
        let result = self.answer_inner(connection, payload).await;
        if result.is_err() {
            self.state = NegotiatorState::Failed;
        }
        result
    }

    async fn answer_inner<P: PeerConnection>(
        &mut self,
        connection: &mut P,
        payload: SignalingPayload,
    ) -> Result<Option<SignalingPayload>, NegotiationError> {
        connection.set_remote_description(payload.description).await?;
        self.remote_description_set = true;
        apply_candidates(connection, payload.candidates).await;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        let payload = match &self.mode {
            SignalingMode::NonTrickle => {
                let candidates = gather_all(connection).await;
                Some(SignalingPayload {
                    description: answer,
                    candidates,
                })
            }
            SignalingMode::Trickled(outbox) => {
                let _ = outbox.send(SignalEvent::Answer(answer));
                None
            }
        };
        self.state = NegotiatorState::LocalAnswerCreated;
        Ok(payload)
    }

    /// Applies the remote answer to our outstanding offer. A duplicate or
    /// unexpected answer is silently dropped.
    pub async fn accept_remote_answer<P: PeerConnection>(
        &mut self,
        connection: &mut P,
        payload: SignalingPayload,
    ) -> Result<(), NegotiationError> {
        if self.state != NegotiatorState::AwaitingRemoteAnswer {
            debug!(state = ?self.state, "ignoring answer outside awaiting state");
            return Ok(());
        }
        if let Err(err) = connection.set_remote_description(payload.description).await {
            self.state = NegotiatorState::Failed;
            return Err(err);
        }
        self.remote_description_set = true;
        apply_candidates(connection, payload.candidates).await;
        Ok(())
    }

    /// Applies a trickled remote candidate. Candidates arriving before the
    /// remote description are dropped; per-candidate failures are logged
    /// and never fail the negotiation.
    pub async fn add_remote_candidate<P: PeerConnection>(
        &mut self,
        connection: &mut P,
        candidate: IceCandidate,
    ) {
        if !self.remote_description_set {
            debug!("dropping remote candidate received before remote description");
            return;
        }
        if let Err(err) = connection.add_ice_candidate(candidate).await {
            warn!("failed to apply remote candidate: {err}");
        }
    }

    /// Routes a relay event into the appropriate operation. `PeerLeft` is
    /// outside this machine's concern and is ignored.
    pub async fn apply_event<P: PeerConnection>(
        &mut self,
        connection: &mut P,
        event: SignalEvent,
    ) -> Result<Option<SignalingPayload>, NegotiationError> {
        match event {
            SignalEvent::Offer(description) => {
                self.accept_remote_offer(
                    connection,
                    SignalingPayload {
                        description,
                        candidates: Vec::new(),
                    },
                )
                .await
            }
            SignalEvent::Answer(description) => {
                self.accept_remote_answer(
                    connection,
                    SignalingPayload {
                        description,
                        candidates: Vec::new(),
                    },
                )
                .await?;
                Ok(None)
            }
            SignalEvent::Candidate(candidate) => {
                self.add_remote_candidate(connection, candidate).await;
                Ok(None)
            }
            SignalEvent::PeerLeft => Ok(None),
        }
    }

    /// Records that the data channel opened.
    pub fn mark_connected(&mut self) {
        if self.state != NegotiatorState::Failed {
            self.state = NegotiatorState::Connected;
        }
    }

    pub fn fail(&mut self) {
        self.state = NegotiatorState::Failed;
    }
}

async fn gather_all<P: PeerConnection>(connection: &mut P) -> Vec<IceCandidate> {
    let mut candidates = Vec::new();
    while let Some(event) = connection.next_transport_event().await {
        match event {
            TransportEvent::Candidate(candidate) => candidates.push(candidate),
            TransportEvent::GatheringComplete => break,
            // A channel can be announced mid-gather; the session driver
            // claims it later.
            TransportEvent::ChannelAnnounced => {}
        }
    }
    candidates
}

async fn apply_candidates<P: PeerConnection>(connection: &mut P, candidates: Vec<IceCandidate>) {
    for candidate in candidates {
        if let Err(err) = connection.add_ice_candidate(candidate).await {
            warn!("failed to apply remote candidate: {err}");
        }
    }
}
