//! Local-network peer discovery.
//!
//! Nodes sharing a rendezvous token multicast [`Announcement`]s with their
//! identity and addresses. Every matching announcement becomes a
//! [`DiscoveredPeer`] on the [`PeerFeed`]; duplicates are not filtered and
//! nothing expires.

use std::net::SocketAddr;
use std::time::Instant;

use crate::addr::{PeerAddr, PeerAddrInfo};
use crate::identity::PeerId;

pub mod announce;
pub mod select;
pub mod service;

pub use announce::Announcement;
pub use select::{select_peer, PeerSelection};
pub use service::{
    Discovery, DiscoveryConfig, PeerFeed, DEFAULT_MULTICAST_GROUP, DEFAULT_MULTICAST_PORT,
    DEFAULT_RENDEZVOUS,
};

/// A peer seen in an announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Announced identity. Unauthenticated until a session proves it.
    pub id: PeerId,
    /// Announced addresses, never empty.
    pub addrs: Vec<SocketAddr>,
    /// Source of the announcement datagram.
    pub observed_from: SocketAddr,
    /// When the announcement was received.
    pub discovered_at: Instant,
}

impl DiscoveredPeer {
    /// Addresses in the form [`Endpoint::connect`](crate::Endpoint::connect) takes.
    pub fn addr_info(&self) -> PeerAddrInfo {
        PeerAddrInfo::new(self.id, self.addrs.iter().copied())
    }

    /// Each address as a full [`PeerAddr`].
    pub fn peer_addrs(&self) -> Vec<PeerAddr> {
        self.addr_info().peer_addrs().collect()
    }
}
