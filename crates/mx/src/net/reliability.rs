//! Reliable, ordered delivery of arbitrarily large messages.
//!
//! [`Reliability`] owns a [`Client`] in reliable mode. Outbound messages are cut
//! into fragments of at most [`SAFE_FRAGMENT_SIZE`] bytes; each fragment rides in
//! its own datagram and is resent whenever the client reports it lost. Only the
//! message at the head of the queue is in flight, and the next one starts once
//! every fragment of the current one has been acknowledged.
//!
//! Inbound fragments are reassembled into one message at a time. Fragments that
//! overtake their header are parked until it arrives.
//!
//! [`SAFE_FRAGMENT_SIZE`]: super::fragment::SAFE_FRAGMENT_SIZE

use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use super::client::{Client, ClientEvent, ClientMode, ClientObserver};
use super::config::{ClientConfig, ReliabilityConfig};
use super::error::MxError;
use super::flow::FlowMode;
use super::fragment::{self, FragmentFrame};
use super::protocol::Message;
use super::socket::Transmit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    WaitingOnSend,
    WaitingOnAcknowledgement,
    Acknowledged,
    WaitingOnReceive,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub data: Option<Bytes>,
    pub status: FragmentStatus,
}

impl Fragment {
    fn outbound(data: Bytes) -> Self {
        Self {
            data: Some(data),
            status: FragmentStatus::WaitingOnSend,
        }
    }

    fn pending_receive() -> Self {
        Self {
            data: None,
            status: FragmentStatus::WaitingOnReceive,
        }
    }
}

#[derive(Debug)]
pub struct SendState {
    pub message_id: u8,
    pub original_message: Bytes,
    pub fragments: Vec<Fragment>,
}

impl SendState {
    fn acknowledged(&self) -> usize {
        self.fragments
            .iter()
            .filter(|f| f.status == FragmentStatus::Acknowledged)
            .count()
    }

    fn is_complete(&self) -> bool {
        self.acknowledged() == self.fragments.len()
    }

    fn progress(&self) -> Progress {
        Progress {
            current: self.acknowledged(),
            total: self.fragments.len(),
            total_bytes: self.original_message.len(),
        }
    }
}

/// Fragment counts for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    /// Message size when sending, bytes reassembled so far when receiving.
    pub total_bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReliabilityEvent {
    MessageReceived(Bytes),
    MessageAcknowledged(Bytes),
    SendProgress(Progress),
    ReceiveProgress(Progress),
    DisconnectWarning { accumulator: i32, disconnected: bool },
    FlowControlChanged { mode: FlowMode, penalty: Duration },
}

#[derive(Debug)]
struct UnorderedFragment {
    index: i32,
    message_id: u8,
    chunk: Bytes,
}

/// Fragment bookkeeping for both directions, fed by the client as an observer.
#[derive(Debug)]
struct FragmentState {
    config: ReliabilityConfig,
    queued_messages: VecDeque<Bytes>,
    active_sends: Vec<SendState>,
    receive_fragments: Option<Vec<Fragment>>,
    unordered_receive_fragments: Vec<UnorderedFragment>,
    receiving_message_id: u8,
    send_message_id_counter: u8,
    last_completed_id: Option<u8>,
    events: Vec<ReliabilityEvent>,
}

impl FragmentState {
    fn new(config: ReliabilityConfig) -> Self {
        Self {
            config,
            queued_messages: VecDeque::new(),
            active_sends: Vec::new(),
            receive_fragments: None,
            unordered_receive_fragments: Vec::new(),
            receiving_message_id: 0,
            send_message_id_counter: 0,
            last_completed_id: None,
            events: Vec::new(),
        }
    }

    fn admit_next(&mut self) {
        if !self.active_sends.is_empty() {
            return;
        }
        let Some(message) = self.queued_messages.pop_front() else {
            return;
        };

        let message_id = self.send_message_id_counter;
        self.send_message_id_counter = self.send_message_id_counter.wrapping_add(1);

        let fragments: Vec<Fragment> = fragment::split(&message, message_id, self.config.fragment_size)
            .into_iter()
            .map(Fragment::outbound)
            .collect();

        debug!(
            "sending message {} ({} bytes, {} fragments)",
            message_id,
            message.len(),
            fragments.len()
        );

        let state = SendState {
            message_id,
            original_message: message,
            fragments,
        };
        self.events.push(ReliabilityEvent::SendProgress(state.progress()));
        self.active_sends.push(state);
    }

    fn schedule(&mut self, client: &mut Client) {
        let Some(active) = self.active_sends.first_mut() else {
            return;
        };
        for fragment in &mut active.fragments {
            if fragment.status != FragmentStatus::WaitingOnSend {
                continue;
            }
            if let Some(data) = &fragment.data {
                client.enqueue_send(data.clone());
                fragment.status = FragmentStatus::WaitingOnAcknowledgement;
            }
        }
    }

    fn fragment_acknowledged(&mut self, data: &Bytes) {
        let Some(position) = self.active_sends.iter().position(|state| {
            state.fragments.iter().any(|f| {
                f.status == FragmentStatus::WaitingOnAcknowledgement && f.data.as_ref() == Some(data)
            })
        }) else {
            trace!("acknowledgement for a fragment no longer in flight");
            return;
        };

        let state = &mut self.active_sends[position];
        if let Some(fragment) = state.fragments.iter_mut().find(|f| {
            f.status == FragmentStatus::WaitingOnAcknowledgement && f.data.as_ref() == Some(data)
        }) {
            fragment.status = FragmentStatus::Acknowledged;
        }
        self.events.push(ReliabilityEvent::SendProgress(state.progress()));

        if state.is_complete() {
            let state = self.active_sends.remove(position);
            debug!("message {} acknowledged", state.message_id);
            self.events
                .push(ReliabilityEvent::MessageAcknowledged(state.original_message));
        }
    }

    fn fragment_lost(&mut self, data: &Bytes) {
        let fragment = self
            .active_sends
            .iter_mut()
            .flat_map(|state| state.fragments.iter_mut())
            .find(|f| f.status == FragmentStatus::WaitingOnAcknowledgement && f.data.as_ref() == Some(data));

        if let Some(fragment) = fragment {
            fragment.status = FragmentStatus::WaitingOnSend;
        }
    }

    /// Returns whether the datagram carrying `data` may be acknowledged.
    fn receive_fragment(&mut self, data: &Bytes) -> bool {
        let frame = match FragmentFrame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("refusing malformed fragment: {}", e);
                return false;
            }
        };

        if self.last_completed_id == Some(frame.message_id()) {
            trace!("duplicate fragment of delivered message {}", frame.message_id());
            return true;
        }

        match frame {
            FragmentFrame::Single { message_id, data } => {
                self.last_completed_id = Some(message_id);
                self.events.push(ReliabilityEvent::ReceiveProgress(Progress {
                    current: 1,
                    total: 1,
                    total_bytes: data.len(),
                }));
                self.events.push(ReliabilityEvent::MessageReceived(data));
                true
            }
            FragmentFrame::Header { count, message_id } => self.receive_header(count, message_id),
            FragmentFrame::Content {
                index,
                message_id,
                chunk,
            } => self.receive_content(index, message_id, chunk),
        }
    }

    fn receive_header(&mut self, count: i32, message_id: u8) -> bool {
        if self.receive_fragments.is_some() {
            if message_id == self.receiving_message_id {
                return true;
            }
            warn!(
                "header for message {} while message {} is being reassembled",
                message_id, self.receiving_message_id
            );
            return false;
        }

        let mut fragments = vec![Fragment::pending_receive(); count as usize];
        for early in mem::take(&mut self.unordered_receive_fragments) {
            match fragments.get_mut(early.index as usize) {
                Some(slot) if early.message_id == message_id => {
                    slot.data = Some(early.chunk);
                    slot.status = FragmentStatus::Received;
                }
                _ => debug!(
                    "discarding early fragment {} of message {}",
                    early.index, early.message_id
                ),
            }
        }

        self.receiving_message_id = message_id;
        self.receive_fragments = Some(fragments);
        self.report_receive_progress();
        self.try_complete();
        true
    }

    fn receive_content(&mut self, index: i32, message_id: u8, chunk: Bytes) -> bool {
        let Some(fragments) = self.receive_fragments.as_mut() else {
            if self.unordered_receive_fragments.len() >= self.config.max_unordered_fragments {
                debug!("early fragment buffer full, refusing fragment {}", index);
                return false;
            }
            let duplicate = self
                .unordered_receive_fragments
                .iter()
                .any(|f| f.index == index && f.message_id == message_id);
            if !duplicate {
                self.unordered_receive_fragments.push(UnorderedFragment {
                    index,
                    message_id,
                    chunk,
                });
            }
            return true;
        };

        if message_id != self.receiving_message_id {
            warn!(
                "fragment of message {} while message {} is being reassembled",
                message_id, self.receiving_message_id
            );
            return false;
        }

        let count = fragments.len();
        let Some(slot) = fragments.get_mut(index as usize) else {
            warn!(
                "fragment index {} out of range for message {} ({} fragments)",
                index, message_id, count
            );
            return false;
        };

        if slot.status != FragmentStatus::Received {
            slot.data = Some(chunk);
            slot.status = FragmentStatus::Received;
            self.report_receive_progress();
            self.try_complete();
        }
        true
    }

    fn report_receive_progress(&mut self) {
        if let Some(fragments) = &self.receive_fragments {
            let received = fragments.iter().filter(|f| f.status == FragmentStatus::Received);
            let progress = Progress {
                current: received.clone().count(),
                total: fragments.len(),
                total_bytes: received.filter_map(|f| f.data.as_ref()).map(Bytes::len).sum(),
            };
            self.events.push(ReliabilityEvent::ReceiveProgress(progress));
        }
    }

    fn try_complete(&mut self) {
        let complete = self
            .receive_fragments
            .as_ref()
            .is_some_and(|fragments| fragments.iter().all(|f| f.status == FragmentStatus::Received));
        if !complete {
            return;
        }

        let fragments = self.receive_fragments.take().unwrap_or_default();
        let len = fragments.iter().filter_map(|f| f.data.as_ref()).map(Bytes::len).sum();
        let mut message = BytesMut::with_capacity(len);
        for fragment in fragments {
            if let Some(data) = fragment.data {
                message.extend_from_slice(&data);
            }
        }

        debug!("message {} reassembled ({} bytes)", self.receiving_message_id, len);
        self.last_completed_id = Some(self.receiving_message_id);
        self.events.push(ReliabilityEvent::MessageReceived(message.freeze()));
    }
}

impl ClientObserver for FragmentState {
    fn received(&mut self, data: &Bytes) -> bool {
        self.receive_fragment(data)
    }

    fn notify(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::MessageAcknowledged(data) => self.fragment_acknowledged(&data),
            ClientEvent::MessageLost(data) => self.fragment_lost(&data),
            ClientEvent::DisconnectWarning {
                accumulator,
                disconnected,
            } => self.events.push(ReliabilityEvent::DisconnectWarning {
                accumulator,
                disconnected,
            }),
            ClientEvent::FlowControlChanged { mode, penalty } => self
                .events
                .push(ReliabilityEvent::FlowControlChanged { mode, penalty }),
            ClientEvent::MessageSent(_) | ClientEvent::MessageReceived(_) => {}
        }
    }
}

#[derive(Debug)]
pub struct Reliability {
    client: Client,
    state: FragmentState,
}

impl Reliability {
    pub fn new(
        remote: SocketAddr,
        protocol_id: u32,
        client_config: &ClientConfig,
        config: &ReliabilityConfig,
        now: Instant,
    ) -> Self {
        Self {
            client: Client::new(remote, ClientMode::Reliable, protocol_id, client_config, now),
            state: FragmentState::new(config.clone()),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn remote(&self) -> SocketAddr {
        self.client.remote()
    }

    /// Queues `data` for ordered, exactly-once delivery.
    ///
    /// Messages longer than [`fragment::max_message_len`] are refused.
    pub fn send(&mut self, data: impl Into<Bytes>) -> Result<(), MxError> {
        let data = data.into();
        let max = fragment::max_message_len(self.state.config.fragment_size);
        if data.len() > max {
            return Err(MxError::MessageTooLarge {
                len: data.len(),
                max,
            });
        }
        self.state.queued_messages.push_back(data);
        Ok(())
    }

    pub fn enqueue_receive(&mut self, data: Bytes) {
        self.client.enqueue_receive(data);
    }

    pub fn enqueue_message(&mut self, message: Message) {
        self.client.enqueue_message(message);
    }

    /// Messages waiting behind the one in flight.
    pub fn queued_messages(&self) -> usize {
        self.state.queued_messages.len()
    }

    pub fn active_send(&self) -> Option<&SendState> {
        self.state.active_sends.first()
    }

    pub fn is_receiving(&self) -> bool {
        self.state.receive_fragments.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.state.active_sends.is_empty() && self.state.queued_messages.is_empty()
    }

    pub fn is_disconnected(&self) -> bool {
        self.client.is_disconnected()
    }

    pub fn update<T>(&mut self, now: Instant, out: &mut T) -> Vec<ReliabilityEvent>
    where
        T: Transmit + ?Sized,
    {
        self.state.admit_next();
        self.state.schedule(&mut self.client);
        self.client.update(now, out, &mut self.state);
        mem::take(&mut self.state.events)
    }
}
