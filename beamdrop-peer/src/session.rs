//! Session lifecycle: owns the peer connection, the negotiator, and the
//! current transfer session, and refuses to start a new transfer while
//! one is still live. The relayed drivers additionally pump signaling
//! events between the negotiator and the websocket relay.

use beamdrop_core::{
    DATA_CHANNEL_LABEL, SignalEvent, SignalingPayload, TransferRole, TransferSession,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::{PeerError, SessionActive},
    negotiate::{Negotiator, SignalingMode},
    receive::{ReceiveEvent, Receiver, SinkFactory},
    relay::RelayClient,
    send::{ChunkSource, send_file},
    transport::{ChannelMessage, DataChannel, PeerConnection, TransportEvent},
};

pub struct SessionManager<P: PeerConnection> {
    connection: Option<P>,
    negotiator: Negotiator,
    session: Option<TransferSession>,
}

impl<P: PeerConnection> Default for SessionManager<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PeerConnection> SessionManager<P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection: None,
            negotiator: Negotiator::new(SignalingMode::NonTrickle),
            session: None,
        }
    }

    #[must_use]
    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    /// Starts a transfer session. Refused while the previous session has
    /// not reached a terminal state.
    pub fn begin(&mut self, role: TransferRole, total_bytes: u64) -> Result<(), SessionActive> {
        if let Some(session) = &self.session
            && !session.is_terminal()
        {
            return Err(SessionActive);
        }
        self.session = Some(TransferSession::new(role, total_bytes));
        Ok(())
    }

    /// Tears everything down: closes the connection, drops the session,
    /// and re-arms the negotiator. Safe to call at any point.
    pub fn reset(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.negotiator = Negotiator::new(SignalingMode::NonTrickle);
        self.session = None;
    }

    fn install(&mut self, connection: P, mode: SignalingMode) {
        self.reset();
        self.negotiator = Negotiator::new(mode);
        self.connection = Some(connection);
    }

    /// Offering side of the non-trickle flows (copy-paste and room-code):
    /// opens the data channel, creates the offer, and returns the bundled
    /// payload once candidate gathering has finished.
    pub async fn start_offer(
        &mut self,
        connection: P,
    ) -> Result<(SignalingPayload, P::Channel), PeerError> {
        self.install(connection, SignalingMode::NonTrickle);
        let conn = self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
        let channel = conn.create_data_channel(DATA_CHANNEL_LABEL).await?;
        let payload = self
            .negotiator
            .create_offer(conn)
            .await?
            .ok_or(PeerError::ConnectionClosed)?;
        Ok((payload, channel))
    }

    /// Answering side of the non-trickle flows: applies the remote offer
    /// and returns the bundled answer payload.
    pub async fn start_answer(
        &mut self,
        connection: P,
        offer: SignalingPayload,
    ) -> Result<SignalingPayload, PeerError> {
        self.install(connection, SignalingMode::NonTrickle);
        let conn = self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
        let answer = self
            .negotiator
            .accept_remote_offer(conn, offer)
            .await?
            .ok_or(PeerError::ConnectionClosed)?;
        Ok(answer)
    }

    /// Applies the remote answer to our outstanding offer.
    pub async fn accept_answer(&mut self, answer: SignalingPayload) -> Result<(), PeerError> {
        let connection = self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
        self.negotiator
            .accept_remote_answer(connection, answer)
            .await?;
        Ok(())
    }

    /// Waits for the remote side's data channel on the answering side.
    pub async fn await_incoming_channel(&mut self) -> Result<P::Channel, PeerError> {
        let connection = self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
        loop {
            if let Some(channel) = connection.take_incoming_channel() {
                return Ok(channel);
            }
            if connection.next_transport_event().await.is_none() {
                return Err(PeerError::ConnectionClosed);
            }
        }
    }

    /// Waits for `channel` to open and records the connection as live.
    pub async fn wait_channel_open(
        &mut self,
        channel: &mut P::Channel,
    ) -> Result<(), PeerError> {
        if channel.wait_open().await.is_err() {
            self.negotiator.fail();
            return Err(PeerError::ConnectionClosed);
        }
        self.negotiator.mark_connected();
        Ok(())
    }

    /// Sends one file over an open channel, tracking it as the current
    /// session.
    pub async fn send_over<S: ChunkSource>(
        &mut self,
        channel: &P::Channel,
        source: &mut S,
        metadata: &beamdrop_core::FileMetadata,
        mut on_progress: impl FnMut(f64),
    ) -> Result<(), PeerError> {
        self.begin(TransferRole::Sender, metadata.size)?;
        let result = if let Some(session) = self.session.as_mut() {
            send_file(source, metadata, channel, |sent, fraction| {
                session.record(sent.saturating_sub(session.bytes_transferred));
                on_progress(fraction);
            })
            .await
        } else {
            return Err(PeerError::ConnectionClosed);
        };
        match result {
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    session.complete();
                }
                info!(name = %metadata.name, size = metadata.size, "send completed");
                Ok(())
            }
            Err(err) => {
                if let Some(session) = self.session.as_mut() {
                    session.abort();
                }
                Err(err.into())
            }
        }
    }

    /// Receives transfers from an open channel until it closes, tracking
    /// each as a session. Returns `Ok` on orderly close between transfers.
    pub async fn receive_over<F: SinkFactory>(
        &mut self,
        channel: &mut P::Channel,
        factory: F,
        mut on_event: impl FnMut(&ReceiveEvent),
    ) -> Result<(), PeerError> {
        let mut receiver = Receiver::new(factory);
        while let Some(message) = channel.recv().await {
            match receiver.accept(message).await {
                Ok(event) => {
                    self.note_receive_event(&event)?;
                    on_event(&event);
                }
                Err(err) => {
                    receiver.abort();
                    if let Some(session) = self.session.as_mut() {
                        session.abort();
                    }
                    return Err(err.into());
                }
            }
        }
        if receiver.in_progress() {
            receiver.abort();
            if let Some(session) = self.session.as_mut() {
                session.abort();
            }
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }

    fn note_receive_event(&mut self, event: &ReceiveEvent) -> Result<(), SessionActive> {
        match event {
            ReceiveEvent::Started(metadata) => {
                self.begin(TransferRole::Receiver, metadata.size)?;
            }
            ReceiveEvent::Progress { received, .. } => {
                if let Some(session) = self.session.as_mut() {
                    session.record(received.saturating_sub(session.bytes_transferred));
                }
            }
            ReceiveEvent::Completed(metadata) => {
                // A zero-byte file completes without a Started event.
                if self
                    .session
                    .as_ref()
                    .is_none_or(TransferSession::is_terminal)
                {
                    self.begin(TransferRole::Receiver, metadata.size)?;
                }
                if let Some(session) = self.session.as_mut() {
                    session.record(metadata.size.saturating_sub(session.bytes_transferred));
                    session.complete();
                }
                info!(name = %metadata.name, "receive completed");
            }
        }
        Ok(())
    }

    /// Sending side of the relayed flow: connects a fresh peer connection,
    /// trickles the offer through the relay, waits for the channel to
    /// open, and sends the file. Returns the open channel so further
    /// files can follow via [`send_over`](SessionManager::send_over).
    pub async fn send_relayed<S: ChunkSource>(
        &mut self,
        relay: &mut RelayClient,
        connection: P,
        source: &mut S,
        metadata: &beamdrop_core::FileMetadata,
        on_progress: impl FnMut(f64),
    ) -> Result<P::Channel, PeerError> {
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel();
        self.install(connection, SignalingMode::Trickled(outbox));

        let conn = self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
        let mut channel = conn.create_data_channel(DATA_CHANNEL_LABEL).await?;
        self.negotiator.create_offer(conn).await?;
        // The offer reaches the relay before gathering produces anything;
        // candidates follow one by one from the select loop below.
        flush_outbox(&mut outbox_rx, relay).await?;

        loop {
            enum Wake {
                Conn(Option<TransportEvent>),
                Relay(Option<SignalEvent>),
                Opened(bool),
            }
            let wake = {
                let conn = self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
                tokio::select! {
                    event = conn.next_transport_event() => Wake::Conn(event),
                    event = relay.next_event() => Wake::Relay(event),
                    opened = channel.wait_open() => Wake::Opened(opened.is_ok()),
                }
            };
            match wake {
                Wake::Conn(Some(TransportEvent::Candidate(candidate))) => {
                    relay.send(&SignalEvent::Candidate(candidate)).await?;
                }
                Wake::Conn(Some(_)) => {}
                Wake::Conn(None) => {
                    self.reset();
                    return Err(PeerError::ConnectionClosed);
                }
                Wake::Relay(Some(SignalEvent::PeerLeft)) => {
                    self.reset();
                    return Err(PeerError::ConnectionClosed);
                }
                Wake::Relay(Some(event)) => {
                    let conn = self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
                    self.negotiator.apply_event(conn, event).await?;
                    flush_outbox(&mut outbox_rx, relay).await?;
                }
                Wake::Relay(None) => {
                    self.reset();
                    return Err(PeerError::RelayClosed);
                }
                Wake::Opened(true) => break,
                Wake::Opened(false) => {
                    self.reset();
                    return Err(PeerError::ConnectionClosed);
                }
            }
        }
        self.negotiator.mark_connected();
        debug!("relayed data channel open, starting send");

        self.send_over(&channel, source, metadata, on_progress)
            .await?;
        Ok(channel)
    }

    /// Receiving side of the relayed flow: accepts offers from the relay,
    /// answers them over a fresh connection from `new_connection`, and
    /// streams every transfer into sinks from `factory`. When the sending
    /// peer leaves or a transfer fails, the driver re-arms and waits for
    /// the next offer. Returns `Ok` once the relay connection closes.
    pub async fn run_relayed_receiver<F, M>(
        &mut self,
        relay: &mut RelayClient,
        mut new_connection: M,
        factory: F,
        mut on_event: impl FnMut(&ReceiveEvent),
    ) -> Result<(), PeerError>
    where
        F: SinkFactory + Clone,
        M: FnMut() -> P,
    {
        'sessions: loop {
            // Wait for the next offer before spending a connection on it.
            let offer = loop {
                match relay.next_event().await {
                    Some(SignalEvent::Offer(description)) => {
                        break SignalingPayload {
                            description,
                            candidates: Vec::new(),
                        };
                    }
                    Some(other) => {
                        debug!(?other, "ignoring signaling event while idle");
                    }
                    None => {
                        self.reset();
                        return Ok(());
                    }
                }
            };

            let (outbox, mut outbox_rx) = mpsc::unbounded_channel();
            self.install(new_connection(), SignalingMode::Trickled(outbox));
            let conn = self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
            if let Err(err) = self.negotiator.accept_remote_offer(conn, offer).await {
                warn!("failed to answer offer: {err}");
                continue 'sessions;
            }
            // The answer is on the wire before gathering is drained; local
            // candidates go out from the select loop below.
            flush_outbox(&mut outbox_rx, relay).await?;

            // Candidates trickle both ways while we wait for the channel.
            let mut channel = loop {
                if let Some(channel) = self
                    .connection
                    .as_mut()
                    .ok_or(PeerError::ConnectionClosed)?
                    .take_incoming_channel()
                {
                    break channel;
                }
                enum Wake {
                    Conn(Option<TransportEvent>),
                    Relay(Option<SignalEvent>),
                }
                let wake = {
                    let conn = self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
                    tokio::select! {
                        event = conn.next_transport_event() => Wake::Conn(event),
                        event = relay.next_event() => Wake::Relay(event),
                    }
                };
                match wake {
                    Wake::Conn(Some(TransportEvent::Candidate(candidate))) => {
                        relay.send(&SignalEvent::Candidate(candidate)).await?;
                    }
                    Wake::Conn(Some(_)) => {}
                    Wake::Conn(None) => continue 'sessions,
                    Wake::Relay(Some(SignalEvent::Candidate(candidate))) => {
                        let conn =
                            self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
                        self.negotiator.add_remote_candidate(conn, candidate).await;
                    }
                    Wake::Relay(Some(SignalEvent::PeerLeft)) => continue 'sessions,
                    Wake::Relay(Some(_)) => {}
                    Wake::Relay(None) => {
                        self.reset();
                        return Ok(());
                    }
                }
            };
            if channel.wait_open().await.is_err() {
                continue 'sessions;
            }
            self.negotiator.mark_connected();
            debug!("relayed data channel open, receiving");

            let mut receiver = Receiver::new(factory.clone());
            let mut conn_done = false;
            loop {
                enum Wake {
                    Message(Option<ChannelMessage>),
                    Relay(Option<SignalEvent>),
                    Conn(Option<TransportEvent>),
                }
                let wake = {
                    let conn = self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
                    tokio::select! {
                        message = channel.recv() => Wake::Message(message),
                        event = relay.next_event() => Wake::Relay(event),
                        event = conn.next_transport_event(), if !conn_done => Wake::Conn(event),
                    }
                };
                match wake {
                    Wake::Message(Some(message)) => match receiver.accept(message).await {
                        Ok(event) => {
                            if let Err(err) = self.note_receive_event(&event) {
                                warn!("transfer overlaps a live session: {err}");
                                receiver.abort();
                                continue 'sessions;
                            }
                            on_event(&event);
                        }
                        Err(err) => {
                            warn!("transfer failed: {err}");
                            receiver.abort();
                            if let Some(session) = self.session.as_mut() {
                                session.abort();
                            }
                            continue 'sessions;
                        }
                    },
                    Wake::Message(None) => {
                        receiver.abort();
                        if let Some(session) = self.session.as_mut() {
                            session.abort();
                        }
                        continue 'sessions;
                    }
                    Wake::Relay(Some(SignalEvent::Candidate(candidate))) => {
                        let conn =
                            self.connection.as_mut().ok_or(PeerError::ConnectionClosed)?;
                        self.negotiator.add_remote_candidate(conn, candidate).await;
                    }
                    Wake::Relay(Some(SignalEvent::PeerLeft)) => {
                        receiver.abort();
                        if let Some(session) = self.session.as_mut()
                            && !session.is_terminal()
                        {
                            session.abort();
                        }
                        continue 'sessions;
                    }
                    Wake::Relay(Some(_)) => {}
                    Wake::Relay(None) => {
                        receiver.abort();
                        self.reset();
                        return Ok(());
                    }
                    Wake::Conn(Some(TransportEvent::Candidate(candidate))) => {
                        relay.send(&SignalEvent::Candidate(candidate)).await?;
                    }
                    Wake::Conn(Some(_)) => {}
                    Wake::Conn(None) => conn_done = true,
                }
            }
        }
    }
}

async fn flush_outbox(
    outbox: &mut mpsc::UnboundedReceiver<SignalEvent>,
    relay: &mut RelayClient,
) -> Result<(), PeerError> {
    while let Ok(event) = outbox.try_recv() {
        relay.send(&event).await.map_err(PeerError::Relay)?;
    }
    Ok(())
}
