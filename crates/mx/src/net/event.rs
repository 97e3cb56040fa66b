use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use log::debug;

use super::client::ClientEvent;
use super::endpoint::{Channel, DualEndpoint};
use super::flow::FlowMode;
use super::peers::PeerId;
use super::reliability::{Progress, ReliabilityEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub peer: PeerId,
    pub endpoint: DualEndpoint,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    ClientConnected,
    ClientDisconnected {
        reason: DisconnectReason,
    },
    ClientDisconnectWarning {
        channel: Channel,
        accumulator: i32,
        disconnected: bool,
    },
    MessageReceived {
        channel: Channel,
        data: Bytes,
    },
    MessageSent {
        channel: Channel,
        data: Bytes,
    },
    MessageAcknowledged {
        channel: Channel,
        data: Bytes,
    },
    MessageLost {
        channel: Channel,
        data: Bytes,
    },
    FlowControlChanged {
        channel: Channel,
        good: bool,
        penalty: Duration,
    },
    ReliableSendProgress(Progress),
    ReliableReceiveProgress(Progress),
}

impl PeerEventKind {
    pub fn from_client(channel: Channel, event: ClientEvent) -> Self {
        match event {
            ClientEvent::MessageSent(data) => PeerEventKind::MessageSent { channel, data },
            ClientEvent::MessageReceived(data) => PeerEventKind::MessageReceived { channel, data },
            ClientEvent::MessageAcknowledged(data) => {
                PeerEventKind::MessageAcknowledged { channel, data }
            }
            ClientEvent::MessageLost(data) => PeerEventKind::MessageLost { channel, data },
            ClientEvent::DisconnectWarning {
                accumulator,
                disconnected,
            } => PeerEventKind::ClientDisconnectWarning {
                channel,
                accumulator,
                disconnected,
            },
            ClientEvent::FlowControlChanged { mode, penalty } => PeerEventKind::FlowControlChanged {
                channel,
                good: mode == FlowMode::Good,
                penalty,
            },
        }
    }

    pub fn from_reliability(event: ReliabilityEvent) -> Self {
        let channel = Channel::Reliable;
        match event {
            ReliabilityEvent::MessageReceived(data) => PeerEventKind::MessageReceived { channel, data },
            ReliabilityEvent::MessageAcknowledged(data) => {
                PeerEventKind::MessageAcknowledged { channel, data }
            }
            ReliabilityEvent::SendProgress(progress) => PeerEventKind::ReliableSendProgress(progress),
            ReliabilityEvent::ReceiveProgress(progress) => {
                PeerEventKind::ReliableReceiveProgress(progress)
            }
            ReliabilityEvent::DisconnectWarning {
                accumulator,
                disconnected,
            } => PeerEventKind::ClientDisconnectWarning {
                channel,
                accumulator,
                disconnected,
            },
            ReliabilityEvent::FlowControlChanged { mode, penalty } => {
                PeerEventKind::FlowControlChanged {
                    channel,
                    good: mode == FlowMode::Good,
                    penalty,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Explicit,
    Timeout,
    Closed,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Explicit => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn FnMut(&PeerEvent) + Send>;

/// Delivers peer events to registered callbacks and keeps a bounded backlog
/// for callers that poll instead.
pub struct EventBus {
    subscribers: Vec<(SubscriptionId, Callback)>,
    pending: VecDeque<PeerEvent>,
    max_pending: usize,
    next_subscription: u64,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            pending: VecDeque::new(),
            max_pending,
            next_subscription: 0,
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&PeerEvent) + Send + 'static,
    {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Returns whether `id` was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(subscription, _)| *subscription != id);
        self.subscribers.len() != before
    }

    pub fn publish(&mut self, event: PeerEvent) {
        for (_, callback) in &mut self.subscribers {
            callback(&event);
        }

        if self.max_pending == 0 {
            return;
        }
        if self.pending.len() >= self.max_pending {
            self.pending.pop_front();
            debug!("event backlog full, dropping oldest event");
        }
        self.pending.push_back(event);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PeerEvent> + '_ {
        self.pending.drain(..)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("pending", &self.pending.len())
            .field("max_pending", &self.max_pending)
            .finish()
    }
}
