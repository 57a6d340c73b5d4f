//! Multi-segment peer locators.
//!
//! A reachable address is written `/ip4/<host>/udp/<port>/quic-v1/p2p/<peer-id>`
//! (or `/ip6/...`). Without the `/p2p/<peer-id>` suffix it is only a
//! [`TransportAddr`] and cannot be dialed until an identity is attached.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::identity::PeerId;

const QUIC_SEGMENT: &str = "quic-v1";

/// Transport locator: protocol, host and port, without an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddr(pub SocketAddr);

impl TransportAddr {
    /// Attach the identity that owns this locator.
    pub fn with_peer(self, id: PeerId) -> PeerAddr {
        PeerAddr { id, addr: self.0 }
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = match self.0.ip() {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        };
        write!(
            f,
            "/{family}/{}/udp/{}/{QUIC_SEGMENT}",
            self.0.ip(),
            self.0.port()
        )
    }
}

impl FromStr for TransportAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match parse_locator(s)? {
            (addr, None) => Ok(Self(addr)),
            (_, Some(_)) => Err(Error::invalid_address(format!(
                "{s:?} carries a peer id, parse it as a PeerAddr"
            ))),
        }
    }
}

/// A dialable address: transport locator plus the identity expected there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    /// Identity of the node listening at `addr`.
    pub id: PeerId,
    /// UDP socket address of the QUIC listener.
    pub addr: SocketAddr,
}

impl PeerAddr {
    /// Create a new peer address.
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// The transport part of this address.
    pub fn transport(&self) -> TransportAddr {
        TransportAddr(self.addr)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/p2p/{}", self.transport(), self.id)
    }
}

impl FromStr for PeerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match parse_locator(s)? {
            (addr, Some(id)) => Ok(Self { id, addr }),
            (_, None) => Err(Error::invalid_address(format!(
                "{s:?} has no /p2p/<peer-id> suffix"
            ))),
        }
    }
}

impl Serialize for PeerAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// All known addresses of one peer, tried in order when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddrInfo {
    /// Identity the addresses belong to.
    pub id: PeerId,
    /// Candidate socket addresses.
    pub addrs: Vec<SocketAddr>,
}

impl PeerAddrInfo {
    /// Create address info for a peer.
    pub fn new(id: PeerId, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            id,
            addrs: addrs.into_iter().collect(),
        }
    }

    /// Each address as a full [`PeerAddr`].
    pub fn peer_addrs(&self) -> impl Iterator<Item = PeerAddr> + '_ {
        self.addrs.iter().map(|addr| PeerAddr::new(self.id, *addr))
    }
}

impl From<PeerAddr> for PeerAddrInfo {
    fn from(addr: PeerAddr) -> Self {
        Self {
            id: addr.id,
            addrs: vec![addr.addr],
        }
    }
}

fn parse_locator(s: &str) -> Result<(SocketAddr, Option<PeerId>)> {
    let segments: Vec<&str> = s.split('/').collect();
    let (first, rest) = segments
        .split_first()
        .ok_or_else(|| Error::invalid_address("empty address"))?;
    if !first.is_empty() {
        return Err(Error::invalid_address(format!(
            "{s:?} must start with '/'"
        )));
    }

    let (transport, peer) = match rest {
        [family, host, "udp", port, QUIC_SEGMENT] => ((family, host, port), None),
        [family, host, "udp", port, QUIC_SEGMENT, "p2p", id] => ((family, host, port), Some(id)),
        _ => {
            return Err(Error::invalid_address(format!(
                "{s:?} is not /ip4|ip6/<host>/udp/<port>/{QUIC_SEGMENT}[/p2p/<peer-id>]"
            )))
        }
    };

    let (family, host, port) = transport;
    let ip = match *family {
        "ip4" => host
            .parse::<Ipv4Addr>()
            .map(IpAddr::V4)
            .map_err(|e| Error::invalid_address(format!("ip4 host {host:?}: {e}")))?,
        "ip6" => host
            .parse::<Ipv6Addr>()
            .map(IpAddr::V6)
            .map_err(|e| Error::invalid_address(format!("ip6 host {host:?}: {e}")))?,
        other => {
            return Err(Error::invalid_address(format!(
                "unsupported address family {other:?}"
            )))
        }
    };
    let port = port
        .parse::<u16>()
        .map_err(|e| Error::invalid_address(format!("port {port:?}: {e}")))?;
    let peer = peer.map(|id| id.parse::<PeerId>()).transpose()?;

    Ok((SocketAddr::new(ip, port), peer))
}

/// Replace an unspecified bind address by concrete addresses peers can dial.
///
/// For `0.0.0.0` the primary outbound interface comes first (when one can be
/// determined), followed by loopback. For `::` only `::1` is reported.
pub fn expand_wildcard(bound: SocketAddr) -> Vec<SocketAddr> {
    let port = bound.port();
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            let mut addrs = Vec::with_capacity(2);
            if let Some(outbound) = outbound_ipv4().filter(|ip| !ip.is_loopback()) {
                addrs.push(SocketAddr::new(outbound, port));
            }
            addrs.push(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port));
            addrs
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            vec![SocketAddr::new(Ipv6Addr::LOCALHOST.into(), port)]
        }
        _ => vec![bound],
    }
}

/// Address of the interface used for outbound IPv4 traffic.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn outbound_ipv4() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    socket
        .local_addr()
        .ok()
        .map(|addr| addr.ip())
        .filter(|ip| !ip.is_unspecified())
}
