use std::io;
use std::net::{SocketAddr, UdpSocket};

use bytes::Bytes;
use log::{debug, trace};

use super::endpoint::Channel;
use super::protocol::{MAX_DATAGRAM_SIZE, Message};
use super::stats::{NetworkStats, PacketLossSimulation};

/// Upper bound on datagrams drained from one socket per update.
const MAX_DATAGRAMS_PER_UPDATE: usize = 4096;

/// Anything a client can hand an encoded datagram to.
pub trait Transmit {
    fn transmit(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

/// One of the dispatcher's two non-blocking UDP sockets.
pub struct ChannelSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    channel: Channel,
    stats: NetworkStats,
    loss: PacketLossSimulation,
    recv_buffer: Box<[u8]>,
}

impl ChannelSocket {
    pub fn bind(addr: SocketAddr, channel: Channel, loss: PacketLossSimulation) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            channel,
            stats: NetworkStats::default(),
            loss,
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn set_packet_loss(&mut self, loss: PacketLossSimulation) {
        self.loss = loss;
    }

    /// Drains every datagram currently queued on the socket.
    ///
    /// Undecodable datagrams and datagrams of another protocol are dropped. Socket
    /// errors end the drain for this tick and are never surfaced.
    pub fn receive(&mut self, protocol_id: u32) -> Vec<(Message, SocketAddr)> {
        let mut messages = Vec::new();

        for _ in 0..MAX_DATAGRAMS_PER_UPDATE {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    self.stats.datagrams_received += 1;
                    self.stats.bytes_received += size as u64;

                    let data = Bytes::copy_from_slice(&self.recv_buffer[..size]);
                    match Message::decode_for(data, protocol_id) {
                        Ok(message) => {
                            trace!(
                                "{} datagram {} from {} ({} bytes)",
                                self.channel.as_str(),
                                message.sequence,
                                addr,
                                size
                            );
                            messages.push((message, addr));
                        }
                        Err(e) => {
                            self.stats.datagrams_rejected += 1;
                            debug!("ignoring datagram from {}: {}", addr, e);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable surfaces as a reset on some platforms.
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    debug!("{} socket receive failed: {}", self.channel.as_str(), e);
                    break;
                }
            }
        }

        messages
    }
}

impl Transmit for ChannelSocket {
    fn transmit(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.loss.should_drop() {
            self.stats.datagrams_dropped += 1;
            return Ok(data.len());
        }

        match self.socket.send_to(data, addr) {
            Ok(bytes) => {
                self.stats.datagrams_sent += 1;
                self.stats.bytes_sent += bytes as u64;
                Ok(bytes)
            }
            Err(e) => {
                self.stats.send_errors += 1;
                Err(e)
            }
        }
    }
}
