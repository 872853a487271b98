//! In-process peer transport: a pair of wired-together connections whose
//! data channel delivers messages over local queues. Stands in for the
//! platform peer-connection primitive in tests and same-process demos.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use beamdrop_core::{IceCandidate, SdpKind, SessionDescription};
use bytes::Bytes;
use tokio::sync::{Notify, mpsc, watch};

use crate::{
    error::{ChannelClosed, NegotiationError},
    transport::{ChannelMessage, DataChannel, PeerConnection, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
struct Link {
    state_tx: watch::Sender<LinkState>,
    // Channel ends waiting to be claimed, one inbox per side. A channel
    // created on side N lands in inbox 1 - N.
    inboxes: [Mutex<Option<LoopbackChannel>>; 2],
    notifies: [Notify; 2],
    remote_descriptions: AtomicUsize,
}

impl Link {
    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn notify_all(&self) {
        for notify in &self.notifies {
            notify.notify_waiters();
        }
    }
}

pub struct LoopbackConnection {
    link: Arc<Link>,
    state_rx: watch::Receiver<LinkState>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_local: VecDeque<IceCandidate>,
    applied_remote: Vec<IceCandidate>,
    reject_next_remote: bool,
    stalled_gathering: bool,
    gathering_complete_sent: bool,
    announced: bool,
    index: usize,
    side: &'static str,
}

/// Builds two connected transport endpoints. Each side gathers two
/// synthetic host candidates; the channel opens once both sides have
/// applied a remote description.
#[must_use]
pub fn pair() -> (LoopbackConnection, LoopbackConnection) {
    let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
    let link = Arc::new(Link {
        state_tx,
        inboxes: [Mutex::new(None), Mutex::new(None)],
        notifies: [Notify::new(), Notify::new()],
        remote_descriptions: AtomicUsize::new(0),
    });
    let a = LoopbackConnection::new(Arc::clone(&link), state_rx.clone(), 0, "a");
    let b = LoopbackConnection::new(link, state_rx, 1, "b");
    (a, b)
}

impl LoopbackConnection {
    fn new(
        link: Arc<Link>,
        state_rx: watch::Receiver<LinkState>,
        index: usize,
        side: &'static str,
    ) -> Self {
        let pending_local = (1..=2u16)
            .map(|index| IceCandidate {
                candidate: format!(
                    "candidate:{index} 1 udp 2122260223 198.18.0.{index} 54400 typ host"
                ),
                sdp_mid: Some("0".to_owned()),
                sdp_mline_index: Some(0),
            })
            .collect();
        Self {
            link,
            state_rx,
            local_description: None,
            remote_description: None,
            pending_local,
            applied_remote: Vec::new(),
            reject_next_remote: false,
            stalled_gathering: false,
            gathering_complete_sent: false,
            announced: false,
            index,
            side,
        }
    }

    /// Makes the next `set_remote_description` fail, to exercise the
    /// negotiator's failure path.
    pub fn reject_next_remote_description(&mut self) {
        self.reject_next_remote = true;
    }

    /// Keeps gathering open indefinitely: the queued candidates are still
    /// reported, but `GatheringComplete` never arrives.
    pub fn stall_gathering(&mut self) {
        self.stalled_gathering = true;
    }

    fn inbox_occupied(&self) -> bool {
        self.link.inboxes[self.index]
            .lock()
            .map(|inbox| inbox.is_some())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn applied_remote_candidates(&self) -> &[IceCandidate] {
        &self.applied_remote
    }

    #[must_use]
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let role = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        SessionDescription {
            kind,
            sdp: format!("v=0\r\no=- loopback-{} 1 IN IP4 127.0.0.1\r\ns={role}\r\n", self.side),
        }
    }
}

impl PeerConnection for LoopbackConnection {
    type Channel = LoopbackChannel;

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        Ok(self.describe(SdpKind::Answer))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.local_description = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.reject_next_remote {
            self.reject_next_remote = false;
            return Err(NegotiationError::Transport(
                "remote description rejected".to_owned(),
            ));
        }
        if self.remote_description.is_none() {
            let seen = self.link.remote_descriptions.fetch_add(1, Ordering::SeqCst) + 1;
            if seen == 2 && self.link.state() == LinkState::Connecting {
                let _ = self.link.state_tx.send(LinkState::Open);
            }
        }
        self.remote_description = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        self.applied_remote.push(candidate);
        Ok(())
    }

    async fn next_transport_event(&mut self) -> Option<TransportEvent> {
        loop {
            if !self.announced && self.inbox_occupied() {
                self.announced = true;
                return Some(TransportEvent::ChannelAnnounced);
            }
            if let Some(candidate) = self.pending_local.pop_front() {
                return Some(TransportEvent::Candidate(candidate));
            }
            if !self.gathering_complete_sent && !self.stalled_gathering {
                self.gathering_complete_sent = true;
                return Some(TransportEvent::GatheringComplete);
            }
            if self.link.state() == LinkState::Closed {
                return None;
            }
            tokio::select! {
                _ = self.link.notifies[self.index].notified() => {}
                _ = self.state_rx.changed() => {}
            }
        }
    }

    async fn create_data_channel(
        &mut self,
        label: &str,
    ) -> Result<Self::Channel, NegotiationError> {
        let (near, far) = channel_pair(label, &self.link);
        let peer = 1 - self.index;
        {
            let mut inbox = self.link.inboxes[peer]
                .lock()
                .map_err(|_| NegotiationError::Transport("loopback link poisoned".to_owned()))?;
            *inbox = Some(far);
        }
        self.link.notifies[peer].notify_waiters();
        Ok(near)
    }

    fn take_incoming_channel(&mut self) -> Option<Self::Channel> {
        let channel = self.link.inboxes[self.index].lock().ok()?.take();
        if channel.is_some() {
            // Re-arm the announcement for a later channel.
            self.announced = false;
        }
        channel
    }

    fn close(&mut self) {
        let _ = self.link.state_tx.send(LinkState::Closed);
        self.link.notify_all();
    }
}

#[derive(Debug)]
pub struct LoopbackChannel {
    label: String,
    link: Arc<Link>,
    state_rx: watch::Receiver<LinkState>,
    tx: mpsc::UnboundedSender<ChannelMessage>,
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
    outbound: Arc<AtomicUsize>,
    peer_outbound: Arc<AtomicUsize>,
}

fn channel_pair(label: &str, link: &Arc<Link>) -> (LoopbackChannel, LoopbackChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a_outbound = Arc::new(AtomicUsize::new(0));
    let b_outbound = Arc::new(AtomicUsize::new(0));
    let a = LoopbackChannel {
        label: label.to_owned(),
        link: Arc::clone(link),
        state_rx: link.state_tx.subscribe(),
        tx: a_tx,
        rx: a_rx,
        outbound: Arc::clone(&a_outbound),
        peer_outbound: Arc::clone(&b_outbound),
    };
    let b = LoopbackChannel {
        label: label.to_owned(),
        link: Arc::clone(link),
        state_rx: link.state_tx.subscribe(),
        tx: b_tx,
        rx: b_rx,
        outbound: b_outbound,
        peer_outbound: a_outbound,
    };
    (a, b)
}

impl LoopbackChannel {
    fn queue(&self, message: ChannelMessage) -> Result<(), ChannelClosed> {
        if self.link.state() == LinkState::Closed {
            return Err(ChannelClosed);
        }
        self.outbound.fetch_add(message.len(), Ordering::SeqCst);
        self.tx.send(message).map_err(|_| ChannelClosed)
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.link.state() == LinkState::Open
    }

    fn buffered_amount(&self) -> usize {
        self.outbound.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let _ = self.link.state_tx.send(LinkState::Closed);
        self.link.notify_all();
    }

    async fn send_text(&self, text: &str) -> Result<(), ChannelClosed> {
        self.queue(ChannelMessage::Text(text.to_owned()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), ChannelClosed> {
        self.queue(ChannelMessage::Binary(data))
    }

    async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            if *self.state_rx.borrow() == LinkState::Closed {
                // Deliver anything already queued before reporting closure.
                return match self.rx.try_recv() {
                    Ok(message) => {
                        self.peer_outbound.fetch_sub(message.len(), Ordering::SeqCst);
                        Some(message)
                    }
                    Err(_) => None,
                };
            }
            tokio::select! {
                message = self.rx.recv() => {
                    return message.inspect(|m| {
                        self.peer_outbound.fetch_sub(m.len(), Ordering::SeqCst);
                    });
                }
                _ = self.state_rx.changed() => {}
            }
        }
    }

    async fn wait_open(&mut self) -> Result<(), ChannelClosed> {
        loop {
            match *self.state_rx.borrow() {
                LinkState::Open => return Ok(()),
                LinkState::Closed => return Err(ChannelClosed),
                LinkState::Connecting => {}
            }
            if self.state_rx.changed().await.is_err() {
                return Err(ChannelClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(
        a: &mut LoopbackConnection,
        b: &mut LoopbackConnection,
    ) -> (LoopbackChannel, LoopbackChannel) {
        let near = a.create_data_channel("test").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        let far = b.take_incoming_channel().unwrap();
        (near, far)
    }

    #[tokio::test]
    async fn channel_opens_once_both_descriptions_applied() {
        let (mut a, mut b) = pair();
        let (mut near, mut far) = connect(&mut a, &mut b).await;
        near.wait_open().await.unwrap();
        far.wait_open().await.unwrap();
        assert!(near.is_open());
    }

    #[tokio::test]
    async fn messages_arrive_in_order_and_drain_buffered_amount() {
        let (mut a, mut b) = pair();
        let (mut near, mut far) = connect(&mut a, &mut b).await;
        near.wait_open().await.unwrap();

        near.send_text("hello").await.unwrap();
        near.send_binary(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(near.buffered_amount(), 8);

        assert_eq!(
            far.recv().await,
            Some(ChannelMessage::Text("hello".to_owned()))
        );
        assert_eq!(
            far.recv().await,
            Some(ChannelMessage::Binary(Bytes::from_static(b"abc")))
        );
        assert_eq!(near.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn close_fails_sends_and_ends_recv() {
        let (mut a, mut b) = pair();
        let (mut near, mut far) = connect(&mut a, &mut b).await;
        near.wait_open().await.unwrap();

        near.send_text("last").await.unwrap();
        near.close();
        assert_eq!(near.send_text("late").await, Err(ChannelClosed));

        // The queued message is still delivered, then the stream ends.
        assert_eq!(
            far.recv().await,
            Some(ChannelMessage::Text("last".to_owned()))
        );
        assert_eq!(far.recv().await, None);
    }

    #[tokio::test]
    async fn gathering_yields_two_candidates_then_completes() {
        let (mut a, _b) = pair();
        assert!(matches!(
            a.next_transport_event().await,
            Some(TransportEvent::Candidate(_))
        ));
        assert!(matches!(
            a.next_transport_event().await,
            Some(TransportEvent::Candidate(_))
        ));
        assert!(matches!(
            a.next_transport_event().await,
            Some(TransportEvent::GatheringComplete)
        ));
    }

    #[tokio::test]
    async fn stalled_gathering_never_reports_completion() {
        let (mut a, _b) = pair();
        a.stall_gathering();
        assert!(matches!(
            a.next_transport_event().await,
            Some(TransportEvent::Candidate(_))
        ));
        assert!(matches!(
            a.next_transport_event().await,
            Some(TransportEvent::Candidate(_))
        ));
        // No completion event; the stream stays pending until closed.
        a.close();
        assert_eq!(a.next_transport_event().await, None);
    }

    #[tokio::test]
    async fn channel_is_announced_to_the_peer_only() {
        let (mut a, mut b) = pair();
        let _near = a.create_data_channel("test").await.unwrap();
        assert!(a.take_incoming_channel().is_none());
        assert!(matches!(
            b.next_transport_event().await,
            Some(TransportEvent::ChannelAnnounced)
        ));
        assert!(b.take_incoming_channel().is_some());
    }
}
