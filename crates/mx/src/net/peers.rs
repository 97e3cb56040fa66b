use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::client::Client;
use super::endpoint::{Channel, DualEndpoint};
use super::reliability::Reliability;

/// Stable handle for a peer, allocated the first time it is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Only one half of the endpoint is known.
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub endpoint: DualEndpoint,
    pub state: PeerState,
    pub realtime: Option<Client>,
    pub reliable: Option<Reliability>,
}

impl Peer {
    fn new(id: PeerId, endpoint: DualEndpoint) -> Self {
        Self {
            id,
            endpoint,
            state: if endpoint.is_complete() {
                PeerState::Connected
            } else {
                PeerState::Connecting
            },
            realtime: None,
            reliable: None,
        }
    }

    /// Whether either half has given up on the remote.
    pub fn is_timed_out(&self) -> bool {
        self.realtime.as_ref().is_some_and(Client::is_disconnected)
            || self.reliable.as_ref().is_some_and(Reliability::is_disconnected)
    }
}

/// Peers keyed by id, with one address index per socket.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<PeerId, Peer>,
    by_realtime: HashMap<SocketAddr, PeerId>,
    by_reliable: HashMap<SocketAddr, PeerId>,
    next_peer_id: u64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, channel: Channel) -> &HashMap<SocketAddr, PeerId> {
        match channel {
            Channel::Realtime => &self.by_realtime,
            Channel::Reliable => &self.by_reliable,
        }
    }

    fn index_mut(&mut self, channel: Channel) -> &mut HashMap<SocketAddr, PeerId> {
        match channel {
            Channel::Realtime => &mut self.by_realtime,
            Channel::Reliable => &mut self.by_reliable,
        }
    }

    /// Adds a peer for `endpoint`. Addresses already indexed keep their owner.
    pub fn insert(&mut self, endpoint: DualEndpoint) -> &mut Peer {
        self.next_peer_id += 1;
        let id = PeerId(self.next_peer_id);

        for channel in [Channel::Realtime, Channel::Reliable] {
            if let Some(addr) = endpoint.get(channel) {
                self.index_mut(channel).entry(addr).or_insert(id);
            }
        }

        self.peers.entry(id).or_insert(Peer::new(id, endpoint))
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn by_address(&self, channel: Channel, addr: SocketAddr) -> Option<PeerId> {
        self.index(channel).get(&addr).copied()
    }

    /// Finds the peer owning any half of `endpoint`.
    pub fn find(&self, endpoint: &DualEndpoint) -> Option<PeerId> {
        [Channel::Realtime, Channel::Reliable]
            .into_iter()
            .filter_map(|channel| endpoint.get(channel).map(|addr| (channel, addr)))
            .find_map(|(channel, addr)| self.by_address(channel, addr))
    }

    /// Oldest peer still missing its `channel` half from the same host as `addr`.
    pub fn pairing_candidate(&self, channel: Channel, addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .values()
            .find(|peer| peer.endpoint.can_pair(channel, addr))
            .map(|peer| peer.id)
    }

    /// Fills in the missing half of a peer and indexes it.
    pub fn backfill(&mut self, id: PeerId, channel: Channel, addr: SocketAddr) -> Option<&mut Peer> {
        let peer = self.peers.get_mut(&id)?;
        peer.endpoint.set(channel, addr);
        if peer.endpoint.is_complete() {
            peer.state = PeerState::Connected;
        }
        match channel {
            Channel::Realtime => self.by_realtime.insert(addr, id),
            Channel::Reliable => self.by_reliable.insert(addr, id),
        };
        Some(peer)
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let mut peer = self.peers.remove(&id)?;
        for channel in [Channel::Realtime, Channel::Reliable] {
            if let Some(addr) = peer.endpoint.get(channel) {
                let index = self.index_mut(channel);
                if index.get(&addr) == Some(&id) {
                    index.remove(&addr);
                }
            }
        }
        peer.state = PeerState::Disconnected;
        Some(peer)
    }

    /// Snapshot of current ids, oldest first.
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
