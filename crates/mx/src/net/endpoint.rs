use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Which of the two sockets a datagram travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Realtime,
    Reliable,
}

impl Channel {
    pub fn opposite(self) -> Self {
        match self {
            Channel::Realtime => Channel::Reliable,
            Channel::Reliable => Channel::Realtime,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Realtime => "realtime",
            Channel::Reliable => "reliable",
        }
    }
}

/// A peer's pair of addresses. One side is `None` only while the dispatcher is
/// still waiting to hear from the other socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DualEndpoint {
    pub realtime: Option<SocketAddr>,
    pub reliable: Option<SocketAddr>,
}

impl DualEndpoint {
    pub fn new(realtime: SocketAddr, reliable: SocketAddr) -> Self {
        Self {
            realtime: Some(realtime),
            reliable: Some(reliable),
        }
    }

    pub fn from_ports(ip: IpAddr, realtime_port: u16, reliable_port: u16) -> Self {
        Self::new(
            SocketAddr::new(ip, realtime_port),
            SocketAddr::new(ip, reliable_port),
        )
    }

    pub fn partial(channel: Channel, addr: SocketAddr) -> Self {
        let mut endpoint = Self::default();
        endpoint.set(channel, addr);
        endpoint
    }

    pub fn get(&self, channel: Channel) -> Option<SocketAddr> {
        match channel {
            Channel::Realtime => self.realtime,
            Channel::Reliable => self.reliable,
        }
    }

    pub fn set(&mut self, channel: Channel, addr: SocketAddr) {
        match channel {
            Channel::Realtime => self.realtime = Some(addr),
            Channel::Reliable => self.reliable = Some(addr),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.realtime.is_some() && self.reliable.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.realtime.is_none() && self.reliable.is_none()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.realtime.or(self.reliable).map(|addr| addr.ip())
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.realtime == Some(addr) || self.reliable == Some(addr)
    }

    /// Whether `addr`, seen on `channel`, could be the missing half of this endpoint.
    pub fn can_pair(&self, channel: Channel, addr: SocketAddr) -> bool {
        self.get(channel).is_none()
            && self
                .get(channel.opposite())
                .is_some_and(|known| known.ip() == addr.ip())
    }
}

impl fmt::Display for DualEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = |addr: Option<SocketAddr>| addr.map_or_else(|| "?".to_string(), |a| a.port().to_string());
        match self.ip() {
            Some(ip) => write!(f, "{}[{}/{}]", ip, port(self.realtime), port(self.reliable)),
            None => f.write_str("<unresolved>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), port)
    }

    #[test]
    fn test_partial_endpoint_pairs_with_same_ip() {
        let endpoint = DualEndpoint::partial(Channel::Realtime, addr(5000));
        assert!(!endpoint.is_complete());
        assert!(endpoint.can_pair(Channel::Reliable, addr(5001)));
        assert!(!endpoint.can_pair(Channel::Realtime, addr(5002)));

        let other_host = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)), 5001);
        assert!(!endpoint.can_pair(Channel::Reliable, other_host));
    }

    #[test]
    fn test_equality_is_structural() {
        let mut endpoint = DualEndpoint::partial(Channel::Reliable, addr(6001));
        endpoint.set(Channel::Realtime, addr(6000));
        assert_eq!(endpoint, DualEndpoint::new(addr(6000), addr(6001)));
        assert!(endpoint.is_complete());
        assert!(endpoint.contains(addr(6001)));
    }

    #[test]
    fn test_display_marks_missing_half() {
        let endpoint = DualEndpoint::partial(Channel::Realtime, addr(7000));
        assert_eq!(endpoint.to_string(), "10.0.0.7[7000/?]");
        assert_eq!(DualEndpoint::default().to_string(), "<unresolved>");
    }
}
