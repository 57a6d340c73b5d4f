//! The announce/listen service and its peer feed.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::identity::PeerId;

use super::announce::{accept_announcement, Announcement, MAX_ANNOUNCEMENT};
use super::DiscoveredPeer;

/// Rendezvous token used when none is configured.
pub const DEFAULT_RENDEZVOUS: &str = "p2p-mdns-auto-discovery";
/// Administratively scoped multicast group announcements are sent to.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 70, 77);
/// UDP port of the multicast group.
pub const DEFAULT_MULTICAST_PORT: u16 = 7677;

/// Configuration for [`Discovery`].
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Only announcements carrying this token are accepted.
    pub rendezvous: String,
    /// Multicast group.
    pub group: Ipv4Addr,
    /// Multicast port.
    pub port: u16,
    /// Interface to join the group on; unspecified lets the OS choose.
    pub interface: Ipv4Addr,
    /// How often to re-announce. The first announcement goes out at start.
    pub announce_interval: Duration,
    /// Feed capacity. When full, the oldest unread peers are dropped.
    pub buffer: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rendezvous: DEFAULT_RENDEZVOUS.to_string(),
            group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_MULTICAST_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            announce_interval: Duration::from_secs(2),
            buffer: 64,
        }
    }
}

impl DiscoveryConfig {
    /// Default settings with a custom rendezvous token.
    pub fn new(rendezvous: impl Into<String>) -> Self {
        Self {
            rendezvous: rendezvous.into(),
            ..Self::default()
        }
    }
}

/// Stream of discovered peers.
///
/// Ends once the [`Discovery`] service is cancelled, dropped, or its endpoint
/// is closed. A consumer that falls more than the configured buffer behind
/// skips the oldest entries.
pub struct PeerFeed {
    inner: Pin<Box<dyn Stream<Item = DiscoveredPeer> + Send>>,
}

impl PeerFeed {
    fn new(receiver: broadcast::Receiver<DiscoveredPeer>, token: CancellationToken) -> Self {
        let inner = BroadcastStream::new(receiver)
            .filter_map(|item| async move {
                match item {
                    Ok(peer) => Some(peer),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "discovery feed lagging, oldest peers dropped");
                        None
                    }
                }
            })
            .take_until(token.cancelled_owned())
            .boxed();
        Self { inner }
    }
}

impl Stream for PeerFeed {
    type Item = DiscoveredPeer;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for PeerFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PeerFeed")
    }
}

/// A running discovery service.
///
/// The service keeps announcing and listening as long as this handle lives,
/// whether or not anybody reads a [`PeerFeed`]. Unread peers are bounded by
/// [`DiscoveryConfig::buffer`]; call [`cancel`](Self::cancel) or drop the
/// handle once the feed is no longer consumed.
pub struct Discovery {
    sender: broadcast::Sender<DiscoveredPeer>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("running", &self.is_running())
            .finish()
    }
}

impl Discovery {
    /// Announce `endpoint` and listen for peers using `config.rendezvous`.
    ///
    /// Fails with [`Error::DiscoveryUnavailable`] when the network does not
    /// allow multicast, and with [`Error::InvalidConfig`] for a zero
    /// announce interval.
    pub async fn start(endpoint: &Endpoint, config: DiscoveryConfig) -> Result<(Self, PeerFeed)> {
        endpoint.ensure_open()?;
        if config.announce_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "announce interval must be non-zero".to_string(),
            ));
        }
        let local = endpoint.local_id();
        let packet = Announcement::new(config.rendezvous.clone(), local, endpoint.local_addrs())
            .encode()?;
        let target = SocketAddr::from((config.group, config.port));

        let socket = bind_multicast(&config).map_err(Error::DiscoveryUnavailable)?;
        socket
            .send_to(&packet, target)
            .await
            .map_err(Error::DiscoveryUnavailable)?;

        let (sender, receiver) = broadcast::channel(config.buffer.max(1));
        let token = endpoint.shutdown_token().child_token();
        let task = tokio::spawn(run(
            socket,
            packet,
            target,
            config.clone(),
            local,
            sender.clone(),
            token.clone(),
        ));
        info!(
            rendezvous = %config.rendezvous,
            group = %target,
            "discovery started"
        );

        let feed = PeerFeed::new(receiver, token.clone());
        Ok((
            Self {
                sender,
                token,
                task,
            },
            feed,
        ))
    }

    /// Another independent feed; it sees peers discovered from now on.
    pub fn subscribe(&self) -> PeerFeed {
        PeerFeed::new(self.sender.subscribe(), self.token.clone())
    }

    /// Stop announcing and listening. Every feed ends.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the service task is still running.
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && !self.task.is_finished()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn bind_multicast(config: &DiscoveryConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)).into())?;
    socket.join_multicast_v4(&config.group, &config.interface)?;
    if !config.interface.is_unspecified() {
        socket.set_multicast_if_v4(&config.interface)?;
    }
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn run(
    socket: UdpSocket,
    packet: Vec<u8>,
    target: SocketAddr,
    config: DiscoveryConfig,
    local: PeerId,
    sender: broadcast::Sender<DiscoveredPeer>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.announce_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // first tick fires immediately, start() already announced
    interval.tick().await;

    let mut buf = vec![0u8; MAX_ANNOUNCEMENT];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = socket.send_to(&packet, target).await {
                    warn!(error = %e, "announcement failed");
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    if let Some(peer) = accept_announcement(&buf[..len], from, &config.rendezvous, local) {
                        debug!(peer = %peer.id.fmt_short(), addrs = ?peer.addrs, "discovered peer");
                        // no subscribers is fine, the peer is simply not kept
                        let _ = sender.send(peer);
                    }
                }
                Err(e) => warn!(error = %e, "discovery receive failed"),
            }
        }
    }
    debug!(rendezvous = %config.rendezvous, "discovery stopped");
}
