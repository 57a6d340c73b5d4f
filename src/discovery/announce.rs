//! Announcement datagrams.

use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::addr::PeerAddr;
use crate::error::{Error, Result};
use crate::identity::PeerId;

use super::DiscoveredPeer;

/// Current announcement format version.
pub const ANNOUNCEMENT_VERSION: u8 = 1;

/// Largest announcement that fits a single UDP datagram.
pub(crate) const MAX_ANNOUNCEMENT: usize = 65_507;

/// What a node multicasts: `{"v":1,"ns":..,"id":..,"addrs":[..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Format version.
    pub v: u8,
    /// Rendezvous token.
    pub ns: String,
    /// Announcing node.
    pub id: PeerId,
    /// Where the node accepts sessions.
    pub addrs: Vec<PeerAddr>,
}

impl Announcement {
    /// Create a current-version announcement.
    pub fn new(ns: impl Into<String>, id: PeerId, addrs: Vec<PeerAddr>) -> Self {
        Self {
            v: ANNOUNCEMENT_VERSION,
            ns: ns.into(),
            id,
            addrs,
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_ANNOUNCEMENT {
            return Err(Error::decode(format!(
                "announcement of {} bytes does not fit a datagram",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Decode from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Turn a received datagram into a [`DiscoveredPeer`], or `None` when it is
/// malformed, from another namespace or version, our own, or carries no
/// usable address.
pub(crate) fn accept_announcement(
    bytes: &[u8],
    from: SocketAddr,
    namespace: &str,
    local: PeerId,
) -> Option<DiscoveredPeer> {
    let announcement = match Announcement::decode(bytes) {
        Ok(announcement) => announcement,
        Err(e) => {
            trace!(%from, error = %e, "ignoring malformed announcement");
            return None;
        }
    };
    if announcement.v != ANNOUNCEMENT_VERSION || announcement.ns != namespace {
        return None;
    }
    if announcement.id == local {
        return None;
    }

    let id = announcement.id;
    let mut addrs: Vec<SocketAddr> = announcement
        .addrs
        .into_iter()
        .filter(|addr| addr.id == id)
        .map(|addr| addr.addr)
        .collect();
    if addrs.is_empty() {
        trace!(%from, peer = %id.fmt_short(), "announcement without usable addresses");
        return None;
    }
    // The address the datagram came from is the most likely to be reachable.
    addrs.sort_by_key(|addr| addr.ip() != from.ip());

    Some(DiscoveredPeer {
        id,
        addrs,
        observed_from: from,
        discovered_at: Instant::now(),
    })
}
