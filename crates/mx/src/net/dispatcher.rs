//! Socket ownership and peer routing.
//!
//! A [`Dispatcher`] binds one realtime and one reliable UDP socket. Each call to
//! [`Dispatcher::update`] drains both sockets, routes every datagram to the peer
//! that owns its source address (creating or pairing peers as needed), then
//! ticks every peer's realtime [`Client`] and [`Reliability`] channel.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info, trace};

use super::client::{Client, ClientEvent, ClientMode};
use super::config::MxConfig;
use super::endpoint::{Channel, DualEndpoint};
use super::error::MxError;
use super::event::{DisconnectReason, EventBus, PeerEvent, PeerEventKind, SubscriptionId};
use super::peers::{Peer, PeerId, PeerState, PeerTable};
use super::protocol::Message;
use super::reliability::Reliability;
use super::socket::ChannelSocket;
use super::stats::{NetworkStats, PacketLossSimulation};

struct Sockets {
    realtime: ChannelSocket,
    reliable: ChannelSocket,
}

impl Sockets {
    fn get(&self, channel: Channel) -> &ChannelSocket {
        match channel {
            Channel::Realtime => &self.realtime,
            Channel::Reliable => &self.reliable,
        }
    }
}

pub struct Dispatcher {
    config: MxConfig,
    sockets: Option<Sockets>,
    peers: PeerTable,
    events: EventBus,
}

impl Dispatcher {
    pub fn bind(config: MxConfig) -> Result<Self, MxError> {
        config.validate()?;

        let realtime = ChannelSocket::bind(
            SocketAddr::new(config.bind, config.realtime_port),
            Channel::Realtime,
            config.packet_loss.clone(),
        )?;
        let reliable = ChannelSocket::bind(
            SocketAddr::new(config.bind, config.reliable_port),
            Channel::Reliable,
            config.packet_loss.clone(),
        )?;

        info!(
            "bound realtime {} and reliable {}",
            realtime.local_addr(),
            reliable.local_addr()
        );

        Ok(Self {
            events: EventBus::new(config.max_pending_events),
            config,
            sockets: Some(Sockets { realtime, reliable }),
            peers: PeerTable::new(),
        })
    }

    pub fn config(&self) -> &MxConfig {
        &self.config
    }

    fn sockets(&self) -> Result<&Sockets, MxError> {
        self.sockets.as_ref().ok_or(MxError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.sockets.is_none()
    }

    pub fn local_endpoint(&self) -> Result<DualEndpoint, MxError> {
        let sockets = self.sockets()?;
        Ok(DualEndpoint::new(
            sockets.realtime.local_addr(),
            sockets.reliable.local_addr(),
        ))
    }

    /// Registers a peer ahead of any traffic from it. Known halves are filled in.
    pub fn connect(&mut self, endpoint: DualEndpoint) -> Result<PeerId, MxError> {
        self.sockets()?;
        if endpoint.is_empty() {
            return Err(MxError::EmptyEndpoint);
        }

        let now = Instant::now();
        let id = match self.peers.find(&endpoint) {
            Some(id) => {
                for channel in [Channel::Realtime, Channel::Reliable] {
                    let missing = self
                        .peers
                        .get(id)
                        .is_some_and(|peer| peer.endpoint.get(channel).is_none());
                    if let (true, Some(addr)) = (missing, endpoint.get(channel)) {
                        self.pair(id, channel, addr);
                    }
                }
                id
            }
            None => {
                let peer = self.peers.insert(endpoint);
                let id = peer.id;
                attach_channels(peer, &self.config, now);
                info!("connecting to {} as {}", endpoint, id);
                if peer.state == PeerState::Connected {
                    let endpoint = peer.endpoint;
                    self.publish(id, endpoint, PeerEventKind::ClientConnected);
                }
                id
            }
        };

        Ok(id)
    }

    /// Returns whether a peer owning `endpoint` was torn down.
    pub fn disconnect(&mut self, endpoint: &DualEndpoint) -> Result<bool, MxError> {
        self.sockets()?;
        match self.peers.find(endpoint) {
            Some(id) => Ok(self.teardown(id, DisconnectReason::Explicit)),
            None => Ok(false),
        }
    }

    /// Queues `data` for the peer owning `endpoint`. Data for unknown peers, or
    /// for a half that is not paired yet, is dropped.
    pub fn send(
        &mut self,
        endpoint: &DualEndpoint,
        data: impl Into<Bytes>,
        reliable: bool,
    ) -> Result<(), MxError> {
        self.sockets()?;
        let data = data.into();

        let Some(peer) = self.peers.find(endpoint).and_then(|id| self.peers.get_mut(id)) else {
            trace!("dropping {} bytes for unknown peer {}", data.len(), endpoint);
            return Ok(());
        };

        if reliable {
            match peer.reliable.as_mut() {
                Some(reliability) => reliability.send(data)?,
                None => trace!("{}: reliable half not paired yet, dropping send", peer.id),
            }
        } else {
            match peer.realtime.as_mut() {
                Some(client) => client.enqueue_send(data),
                None => trace!("{}: realtime half not paired yet, dropping send", peer.id),
            }
        }
        Ok(())
    }

    pub fn send_to_group(
        &mut self,
        endpoints: &[DualEndpoint],
        data: impl Into<Bytes>,
        reliable: bool,
    ) -> Result<(), MxError> {
        self.sockets()?;
        if endpoints.is_empty() {
            return Err(MxError::EmptyGroup);
        }

        let data = data.into();
        for endpoint in endpoints {
            self.send(endpoint, data.clone(), reliable)?;
        }
        Ok(())
    }

    /// Runs one tick: drain both sockets, route datagrams, then update every peer.
    pub fn update(&mut self) -> Result<(), MxError> {
        let now = Instant::now();
        let protocol_id = self.config.protocol_id;

        let Some(sockets) = self.sockets.as_mut() else {
            return Err(MxError::Closed);
        };
        let realtime = sockets.realtime.receive(protocol_id);
        let reliable = sockets.reliable.receive(protocol_id);

        for (message, addr) in realtime {
            self.route(Channel::Realtime, message, addr, now);
        }
        for (message, addr) in reliable {
            self.route(Channel::Reliable, message, addr, now);
        }

        let mut timed_out = Vec::new();
        let Some(sockets) = self.sockets.as_mut() else {
            return Err(MxError::Closed);
        };

        for id in self.peers.ids() {
            let Some(peer) = self.peers.get_mut(id) else {
                continue;
            };

            let mut kinds = Vec::new();
            if let Some(client) = peer.realtime.as_mut() {
                let mut client_events: Vec<ClientEvent> = Vec::new();
                client.update(now, &mut sockets.realtime, &mut client_events);
                kinds.extend(
                    client_events
                        .into_iter()
                        .map(|event| PeerEventKind::from_client(Channel::Realtime, event)),
                );
            }
            if let Some(reliability) = peer.reliable.as_mut() {
                kinds.extend(
                    reliability
                        .update(now, &mut sockets.reliable)
                        .into_iter()
                        .map(PeerEventKind::from_reliability),
                );
            }

            if peer.is_timed_out() {
                timed_out.push(id);
            }

            let endpoint = peer.endpoint;
            for kind in kinds {
                self.events.publish(PeerEvent {
                    peer: id,
                    endpoint,
                    kind,
                });
            }
        }

        for id in timed_out {
            self.teardown(id, DisconnectReason::Timeout);
        }

        Ok(())
    }

    /// Disconnects every peer and releases both sockets.
    pub fn close(&mut self) -> Result<(), MxError> {
        self.sockets()?;
        for id in self.peers.ids() {
            self.teardown(id, DisconnectReason::Closed);
        }
        self.sockets = None;
        info!("dispatcher closed");
        Ok(())
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peer_state(&self, endpoint: &DualEndpoint) -> Option<PeerState> {
        self.peers
            .find(endpoint)
            .and_then(|id| self.peers.get(id))
            .map(|peer| peer.state)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn stats(&self, channel: Channel) -> Result<&NetworkStats, MxError> {
        Ok(self.sockets()?.get(channel).stats())
    }

    pub fn set_packet_loss(&mut self, loss: PacketLossSimulation) -> Result<(), MxError> {
        let sockets = self.sockets.as_mut().ok_or(MxError::Closed)?;
        sockets.realtime.set_packet_loss(loss.clone());
        sockets.reliable.set_packet_loss(loss.clone());
        self.config.packet_loss = loss;
        Ok(())
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&PeerEvent) + Send + 'static,
    {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = PeerEvent> + '_ {
        self.events.drain()
    }

    fn publish(&mut self, peer: PeerId, endpoint: DualEndpoint, kind: PeerEventKind) {
        self.events.publish(PeerEvent { peer, endpoint, kind });
    }

    fn route(&mut self, channel: Channel, message: Message, addr: SocketAddr, now: Instant) {
        let id = match self.peers.by_address(channel, addr) {
            Some(id) => id,
            None => match self.peers.pairing_candidate(channel, addr) {
                Some(id) => {
                    self.pair(id, channel, addr);
                    id
                }
                None => {
                    let peer = self.peers.insert(DualEndpoint::partial(channel, addr));
                    attach_channels(peer, &self.config, now);
                    info!("new peer {} from {} {}", peer.id, channel.as_str(), addr);
                    peer.id
                }
            },
        };

        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };
        match channel {
            Channel::Realtime => {
                if let Some(client) = peer.realtime.as_mut() {
                    client.enqueue_message(message);
                }
            }
            Channel::Reliable => {
                if let Some(reliability) = peer.reliable.as_mut() {
                    reliability.enqueue_message(message);
                }
            }
        }
    }

    fn pair(&mut self, id: PeerId, channel: Channel, addr: SocketAddr) {
        let now = Instant::now();
        let Some(peer) = self.peers.backfill(id, channel, addr) else {
            return;
        };
        attach_channels(peer, &self.config, now);
        debug!("{} paired {} half {}", id, channel.as_str(), addr);

        if peer.state == PeerState::Connected {
            let endpoint = peer.endpoint;
            info!("{} connected at {}", id, endpoint);
            self.publish(id, endpoint, PeerEventKind::ClientConnected);
        }
    }

    fn teardown(&mut self, id: PeerId, reason: DisconnectReason) -> bool {
        let Some(peer) = self.peers.remove(id) else {
            return false;
        };
        info!("{} at {} {}", id, peer.endpoint, reason.as_str());
        self.publish(id, peer.endpoint, PeerEventKind::ClientDisconnected { reason });
        true
    }
}

/// Creates the channel for every known half of `peer` that lacks one.
fn attach_channels(peer: &mut Peer, config: &MxConfig, now: Instant) {
    if let (Some(addr), true) = (peer.endpoint.realtime, peer.realtime.is_none()) {
        peer.realtime = Some(Client::new(
            addr,
            ClientMode::Realtime,
            config.protocol_id,
            &config.client,
            now,
        ));
    }
    if let (Some(addr), true) = (peer.endpoint.reliable, peer.reliable.is_none()) {
        peer.reliable = Some(Reliability::new(
            addr,
            config.protocol_id,
            &config.client,
            &config.reliability,
            now,
        ));
    }
}
