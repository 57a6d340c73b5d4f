//! Turning a peer feed into a session.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::session::SecureSession;

use super::DiscoveredPeer;

/// Which discovered peer to connect to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PeerSelection {
    /// Connect to the first announced peer; its failure is final.
    #[default]
    First,
    /// Keep trying announced peers until one connects.
    FirstReachable {
        /// Give up after this many failed connection attempts.
        max_attempts: usize,
    },
    /// Wait for this identity and connect to it.
    Id(PeerId),
}

/// Read `feed` until a peer matching `selection` yields a session.
///
/// `wait` bounds the time spent waiting for announcements; connection
/// attempts are bounded by the endpoint's own timeouts.
pub async fn select_peer<S>(
    endpoint: &Endpoint,
    ctx: &CancellationToken,
    feed: &mut S,
    selection: &PeerSelection,
    wait: Duration,
) -> Result<SecureSession>
where
    S: Stream<Item = DiscoveredPeer> + Unpin,
{
    let deadline = Instant::now() + wait;
    let mut attempts = 0usize;
    let mut last_error: Option<Error> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until(deadline) => {
                return Err(last_error.unwrap_or_else(|| {
                    Error::connect(format!("no peer discovered within {wait:?}"))
                }));
            }
            next = feed.next() => next,
        };
        let Some(peer) = next else {
            return Err(last_error
                .unwrap_or_else(|| Error::connect("discovery stopped before a peer was found")));
        };
        if peer.id == endpoint.local_id() {
            continue;
        }
        if let PeerSelection::Id(wanted) = selection {
            if peer.id != *wanted {
                continue;
            }
        }

        info!(peer = %peer.id.fmt_short(), addrs = ?peer.addrs, "selected discovered peer");
        attempts += 1;
        match endpoint.connect(ctx, &peer.addr_info()).await {
            Ok(session) => return Ok(session),
            Err(e) => match selection {
                PeerSelection::FirstReachable { max_attempts }
                    if attempts < *max_attempts
                        && !matches!(e, Error::Cancelled | Error::Closed) =>
                {
                    warn!(peer = %peer.id.fmt_short(), error = %e, attempts, "discovered peer unreachable");
                    last_error = Some(e);
                }
                _ => return Err(e),
            },
        }
    }
}
