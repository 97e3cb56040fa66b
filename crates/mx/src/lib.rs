pub mod net;

pub use net::{
    Channel, Client, ClientConfig, ClientEvent, ClientMode, DecodeError, DisconnectReason,
    Dispatcher, DualEndpoint, FlowMode, Message, MxConfig, MxError, NetworkStats,
    PacketLossSimulation, Payload, PeerEvent, PeerEventKind, PeerId, PeerState, Progress,
    Reliability, ReliabilityConfig, ReliabilityEvent, SubscriptionId, DEFAULT_REALTIME_PORT,
    DEFAULT_RELIABLE_PORT, PROTOCOL_ID,
};
