mod client;
mod config;
mod dispatcher;
mod endpoint;
mod error;
mod event;
mod flow;
pub mod fragment;
mod peers;
mod protocol;
mod reliability;
mod socket;
mod stats;
mod tracking;

pub use client::{Client, ClientEvent, ClientMode, ClientObserver};
pub use config::{ClientConfig, MxConfig, ReliabilityConfig};
pub use dispatcher::Dispatcher;
pub use endpoint::{Channel, DualEndpoint};
pub use error::{DecodeError, MxError};
pub use event::{DisconnectReason, EventBus, PeerEvent, PeerEventKind, SubscriptionId};
pub use flow::{FlowChange, FlowConfig, FlowControl, FlowMode};
pub use fragment::{
    FRAGMENT_HEADER_SIZE, FragmentFrame, FragmentKind, MAX_FRAGMENTS, SAFE_FRAGMENT_SIZE,
};
pub use peers::{Peer, PeerId, PeerState, PeerTable};
pub use protocol::{
    ACK_WINDOW, DEFAULT_REALTIME_PORT, DEFAULT_RELIABLE_PORT, MAX_DATAGRAM_SIZE, Message,
    NO_SEQUENCE, PROTOCOL_ID, Payload, sequence_distance, sequence_greater_than,
};
pub use reliability::{
    Fragment, FragmentStatus, Progress, Reliability, ReliabilityEvent, SendState,
};
pub use socket::{ChannelSocket, Transmit};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use tracking::{AckOutcome, ReceiveWindow, RttSamples, SendWindow, SentDatagram};
