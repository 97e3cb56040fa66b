//! Per-peer unreliable channel.
//!
//! A [`Client`] batches queued payloads into sequenced datagrams at the rate its
//! flow control allows, tracks which of its datagrams the peer acknowledged, and
//! counts ticks without inbound traffic to detect a vanished peer. Everything
//! happens inside [`Client::update`], which the owner calls once per tick.

use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace};

use super::config::ClientConfig;
use super::flow::{FlowControl, FlowMode};
use super::protocol::{Message, NO_SEQUENCE, sequence_distance};
use super::socket::Transmit;
use super::tracking::{ReceiveWindow, RttSamples, SendWindow, SentDatagram};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    /// Every queued payload rides in the next datagram.
    Realtime,
    /// One queued payload per datagram.
    Reliable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    MessageSent(Bytes),
    MessageReceived(Bytes),
    MessageAcknowledged(Bytes),
    MessageLost(Bytes),
    DisconnectWarning { accumulator: i32, disconnected: bool },
    FlowControlChanged { mode: FlowMode, penalty: Duration },
}

/// Receives what a client observes during [`Client::update`].
pub trait ClientObserver {
    /// Called for each payload of an accepted datagram. Returning `false` leaves
    /// the datagram unacknowledged so the sender will treat it as lost.
    fn received(&mut self, data: &Bytes) -> bool;

    fn notify(&mut self, event: ClientEvent);
}

impl ClientObserver for Vec<ClientEvent> {
    fn received(&mut self, data: &Bytes) -> bool {
        self.push(ClientEvent::MessageReceived(data.clone()));
        true
    }

    fn notify(&mut self, event: ClientEvent) {
        self.push(event);
    }
}

#[derive(Debug)]
pub struct Client {
    remote: SocketAddr,
    mode: ClientMode,
    protocol_id: u32,
    config: ClientConfig,
    local_sequence: u32,
    remote_sequence: u32,
    received_any: bool,
    receive_window: ReceiveWindow,
    send_window: SendWindow,
    rtt: RttSamples,
    flow: FlowControl,
    send_queue: VecDeque<Bytes>,
    receive_queue: Vec<Message>,
    send_accumulator: f64,
    last_update: Instant,
    disconnect_accumulator: i32,
    disconnected: bool,
}

impl Client {
    pub fn new(
        remote: SocketAddr,
        mode: ClientMode,
        protocol_id: u32,
        config: &ClientConfig,
        now: Instant,
    ) -> Self {
        Self {
            remote,
            mode,
            protocol_id,
            config: config.clone(),
            local_sequence: 0,
            remote_sequence: NO_SEQUENCE,
            received_any: false,
            receive_window: ReceiveWindow::new(),
            send_window: SendWindow::new(),
            rtt: RttSamples::new(),
            flow: FlowControl::new(config.flow.clone()),
            send_queue: VecDeque::new(),
            receive_queue: Vec::new(),
            send_accumulator: 0.0,
            last_update: now,
            disconnect_accumulator: 0,
            disconnected: false,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn mode(&self) -> ClientMode {
        self.mode
    }

    pub fn local_sequence(&self) -> u32 {
        self.local_sequence
    }

    /// Highest sequence received from the peer, [`NO_SEQUENCE`] before the first.
    pub fn remote_sequence(&self) -> u32 {
        self.remote_sequence
    }

    pub fn ack_bitfield(&self) -> u32 {
        self.receive_window.bitfield()
    }

    pub fn average_rtt_ms(&self) -> f64 {
        self.rtt.average_ms()
    }

    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn disconnect_accumulator(&self) -> i32 {
        self.disconnect_accumulator
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn queued_sends(&self) -> usize {
        self.send_queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.send_window.len()
    }

    pub fn enqueue_send(&mut self, data: impl Into<Bytes>) {
        self.send_queue.push_back(data.into());
    }

    /// Queues a raw datagram read for this peer. Undecodable input is dropped.
    pub fn enqueue_receive(&mut self, data: Bytes) {
        match Message::decode_for(data, self.protocol_id) {
            Ok(message) => self.receive_queue.push(message),
            Err(e) => debug!("{}: dropping datagram: {}", self.remote, e),
        }
    }

    pub fn enqueue_message(&mut self, message: Message) {
        self.receive_queue.push(message);
    }

    pub fn update<T, O>(&mut self, now: Instant, out: &mut T, observer: &mut O)
    where
        T: Transmit + ?Sized,
        O: ClientObserver + ?Sized,
    {
        if self.disconnected {
            return;
        }

        let delta = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        if let Some(change) = self.flow.update(delta, self.rtt.average_ms()) {
            debug!(
                "{}: flow control {:?}, penalty {:.1}s",
                self.remote,
                change.mode,
                change.penalty.as_secs_f64()
            );
            observer.notify(ClientEvent::FlowControlChanged {
                mode: change.mode,
                penalty: change.penalty,
            });
        }

        for sent in self
            .send_window
            .expire(now, self.config.packet_loss_timeout())
        {
            Self::handle_lost(sent, observer);
        }

        self.perform_send(now, delta, out, observer);
        self.perform_receive(now, observer);
        self.check_disconnect(observer);
    }

    fn perform_send<T, O>(&mut self, now: Instant, delta: f64, out: &mut T, observer: &mut O)
    where
        T: Transmit + ?Sized,
        O: ClientObserver + ?Sized,
    {
        self.send_accumulator += delta;

        loop {
            let interval = self.flow.send_interval();
            if self.send_accumulator < interval {
                break;
            }
            self.send_accumulator -= interval;

            let payloads: Vec<Bytes> = match self.mode {
                ClientMode::Realtime => self.send_queue.drain(..).collect(),
                ClientMode::Reliable => self.send_queue.pop_front().into_iter().collect(),
            };

            let sequence = self.local_sequence;
            self.local_sequence = self.local_sequence.wrapping_add(1);

            let message = Message::new(
                self.protocol_id,
                sequence,
                self.remote_sequence,
                self.receive_window.bitfield(),
            )
            .with_payloads(payloads.iter().cloned());

            self.send_window.track(sequence, now, payloads.clone());

            match out.transmit(&message.encode(), self.remote) {
                Ok(size) => trace!("{}: sent datagram {} ({} bytes)", self.remote, sequence, size),
                Err(e) => debug!("{}: datagram {} not sent: {}", self.remote, sequence, e),
            }

            for payload in payloads {
                observer.notify(ClientEvent::MessageSent(payload));
            }
        }
    }

    fn perform_receive<O>(&mut self, now: Instant, observer: &mut O)
    where
        O: ClientObserver + ?Sized,
    {
        if self.receive_queue.is_empty() {
            self.disconnect_accumulator = self.disconnect_accumulator.saturating_add(1);
            return;
        }
        self.disconnect_accumulator = 0;

        for message in mem::take(&mut self.receive_queue) {
            let difference = if self.received_any {
                sequence_distance(message.sequence, self.remote_sequence)
            } else {
                sequence_distance(message.sequence, self.remote_sequence).max(1)
            };
            if difference <= 0 {
                trace!(
                    "{}: discarding stale datagram {} (latest {})",
                    self.remote, message.sequence, self.remote_sequence
                );
                continue;
            }

            let mut acknowledge = true;
            for payload in &message.payloads {
                if !observer.received(&payload.data) {
                    acknowledge = false;
                }
            }
            self.receive_window.advance(difference as u64, acknowledge);

            let outcome = self.send_window.process_ack(&message);
            for sent in outcome.acked {
                let rtt = now.saturating_duration_since(sent.send_time);
                self.rtt.record(rtt.as_millis() as u64);
                for payload in sent.payloads {
                    observer.notify(ClientEvent::MessageAcknowledged(payload));
                }
            }
            for sent in outcome.lost {
                Self::handle_lost(sent, observer);
            }

            self.remote_sequence = message.sequence;
            self.received_any = true;
        }
    }

    fn check_disconnect<O>(&mut self, observer: &mut O)
    where
        O: ClientObserver + ?Sized,
    {
        if self.disconnect_accumulator < self.config.disconnect_warning_ticks {
            return;
        }

        let disconnected = self.disconnect_accumulator >= self.config.disconnect_ticks;
        observer.notify(ClientEvent::DisconnectWarning {
            accumulator: self.disconnect_accumulator,
            disconnected,
        });

        if disconnected {
            debug!(
                "{}: silent for {} ticks, disconnecting",
                self.remote, self.disconnect_accumulator
            );
            self.disconnected = true;
        }
    }

    fn handle_lost<O>(sent: SentDatagram, observer: &mut O)
    where
        O: ClientObserver + ?Sized,
    {
        trace!("datagram {} lost", sent.sequence);
        for payload in sent.payloads {
            observer.notify(ClientEvent::MessageLost(payload));
        }
    }
}
