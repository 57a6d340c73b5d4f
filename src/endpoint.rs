//! The secure transport endpoint.
//!
//! An [`Endpoint`] owns the QUIC sockets, the session table and the protocol
//! handler registry. Inbound connections are negotiated on background tasks;
//! every established session gets a task that accepts its streams and hands
//! each one to the handler registered for its protocol name.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::addr::{expand_wildcard, PeerAddr, PeerAddrInfo};
use crate::error::{Error, Result};
use crate::identity::{NodeIdentity, PeerId};
use crate::protocol::{DynProtocolHandler, ProtocolHandler};
use crate::session::{self, Credentials, Deadlines, SecureSession, SESSION_CLOSED};
use crate::stream::{
    encode_protocol_header, read_protocol_header, InboundStream, OutboundStream, StreamInfo,
    PROTOCOL_REFUSED,
};
use crate::tls;

/// Upper bound on how long [`Endpoint::close`] waits for sockets to drain.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// QUIC transport tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Close a connection after this long without traffic.
    pub idle_timeout: Duration,
    /// Send keep-alives at this interval while a connection is open.
    pub keep_alive: Option<Duration>,
    /// Concurrent bidirectional streams a peer may open per session.
    pub max_concurrent_streams: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            keep_alive: Some(Duration::from_secs(10)),
            max_concurrent_streams: 256,
        }
    }
}

impl TransportConfig {
    fn to_quinn(&self) -> Result<quinn::TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(self.idle_timeout)
            .map_err(|e| Error::InvalidConfig(format!("idle timeout: {e}")))?;
        let mut config = quinn::TransportConfig::default();
        config
            .max_idle_timeout(Some(idle))
            .keep_alive_interval(self.keep_alive)
            .max_concurrent_bidi_streams(quinn::VarInt::from_u32(self.max_concurrent_streams))
            .max_concurrent_uni_streams(quinn::VarInt::from_u32(0));
        Ok(config)
    }
}

/// Session security protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityProtocol {
    /// Noise XX with Ed25519 identity proofs, bound to the QUIC TLS session.
    #[default]
    NoiseXx,
}

/// Everything needed to create an [`Endpoint`].
#[derive(Debug)]
pub struct EndpointConfig {
    /// Identity to use. A fresh one is generated when `None`.
    pub identity: Option<NodeIdentity>,
    /// Addresses to listen on, one QUIC socket each.
    pub listen_addrs: Vec<SocketAddr>,
    /// QUIC tuning.
    pub transport: TransportConfig,
    /// How sessions are authenticated.
    pub security: SecurityProtocol,
    /// Bound on the Noise handshake, both roles.
    pub handshake_timeout: Duration,
    /// Bound on the QUIC connection handshake.
    pub connect_timeout: Duration,
    /// Largest payload an inbound stream may deliver.
    pub max_message_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            identity: None,
            listen_addrs: vec![SocketAddr::from(([0, 0, 0, 0], 0))],
            transport: TransportConfig::default(),
            security: SecurityProtocol::default(),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024,
        }
    }
}

/// Builder for [`Endpoint`].
#[derive(Debug, Default)]
pub struct EndpointBuilder {
    config: EndpointConfig,
}

impl EndpointBuilder {
    /// Use an existing identity instead of generating one.
    pub fn identity(mut self, identity: NodeIdentity) -> Self {
        self.config.identity = Some(identity);
        self
    }

    /// Listen on a single address.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addrs = vec![addr];
        self
    }

    /// Listen on several addresses.
    pub fn listen_addrs(mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.config.listen_addrs = addrs.into_iter().collect();
        self
    }

    /// Set QUIC tuning.
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    /// Set the Noise handshake bound.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the QUIC connection handshake bound.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the largest accepted inbound payload.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Bind the endpoint.
    pub async fn bind(self) -> Result<Endpoint> {
        Endpoint::bind(self.config).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    credentials: Credentials,
    sockets: Mutex<Vec<quinn::Endpoint>>,
    client: quinn::ClientConfig,
    handlers: RwLock<HashMap<String, Arc<dyn DynProtocolHandler>>>,
    sessions: Mutex<HashMap<PeerId, SecureSession>>,
    address_book: Mutex<HashMap<PeerId, PeerAddrInfo>>,
    shutdown: CancellationToken,
    closing: AtomicBool,
    deadlines: Deadlines,
    max_message_size: usize,
}

impl Inner {
    fn local_id(&self) -> PeerId {
        self.credentials.identity.id()
    }

    fn handler(&self, protocol: &str) -> Option<Arc<dyn DynProtocolHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
    }

    fn live_session(&self, peer: &PeerId) -> Option<SecureSession> {
        lock(&self.sessions)
            .get(peer)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    fn register(&self, session: SecureSession) {
        let peer = session.remote_id();
        if lock(&self.sessions).insert(peer, session).is_some() {
            debug!(peer = %peer.fmt_short(), "replaced session");
        }
    }

    fn forget(&self, session: &SecureSession) {
        let mut sessions = lock(&self.sessions);
        if sessions
            .get(&session.remote_id())
            .is_some_and(|s| s.stable_id() == session.stable_id())
        {
            sessions.remove(&session.remote_id());
        }
    }

    fn socket_for(&self, target: &SocketAddr) -> Option<quinn::Endpoint> {
        lock(&self.sockets)
            .iter()
            .find(|socket| {
                socket
                    .local_addr()
                    .is_ok_and(|local| local.is_ipv4() == target.is_ipv4())
            })
            .cloned()
    }
}

/// A bound secure transport endpoint.
///
/// Cloning is cheap. Background tasks stop when [`close`](Self::close) is
/// called or the last clone is dropped.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.local_id())
            .field("sockets", &self.bound_sockets())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Endpoint {
    /// Start building an endpoint.
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::default()
    }

    /// Bind one QUIC socket per listen address and start accepting.
    pub async fn bind(config: EndpointConfig) -> Result<Self> {
        let identity = match config.identity {
            Some(identity) => identity,
            None => NodeIdentity::generate()?,
        };
        let credentials = match config.security {
            SecurityProtocol::NoiseXx => Credentials::new(identity)?,
        };
        let transport = Arc::new(config.transport.to_quinn()?);
        let server = tls::server_config(transport.clone())?;
        let client = tls::client_config(transport)?;

        let listen_addrs = if config.listen_addrs.is_empty() {
            EndpointConfig::default().listen_addrs
        } else {
            config.listen_addrs
        };
        let mut sockets = Vec::with_capacity(listen_addrs.len());
        for addr in listen_addrs {
            let mut socket =
                quinn::Endpoint::server(server.clone(), addr).map_err(Error::Transport)?;
            socket.set_default_client_config(client.clone());
            sockets.push(socket);
        }

        let shutdown = CancellationToken::new();
        let inner = Arc::new(Inner {
            credentials,
            sockets: Mutex::new(sockets.clone()),
            client,
            handlers: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            address_book: Mutex::new(HashMap::new()),
            shutdown: shutdown.clone(),
            closing: AtomicBool::new(false),
            deadlines: Deadlines {
                connect: config.connect_timeout,
                handshake: config.handshake_timeout,
            },
            max_message_size: config.max_message_size,
        });

        for socket in sockets {
            tokio::spawn(accept_loop(inner.clone(), socket));
        }

        let endpoint = Self {
            inner,
            _guard: Arc::new(shutdown.drop_guard()),
        };
        info!(
            id = %endpoint.local_id(),
            sockets = ?endpoint.bound_sockets(),
            "endpoint bound"
        );
        Ok(endpoint)
    }

    /// Identity of this endpoint.
    pub fn local_id(&self) -> PeerId {
        self.inner.local_id()
    }

    /// Dialable addresses, with wildcard binds expanded to concrete ones.
    pub fn local_addrs(&self) -> Vec<PeerAddr> {
        let id = self.local_id();
        self.bound_sockets()
            .into_iter()
            .flat_map(expand_wildcard)
            .map(|addr| PeerAddr::new(id, addr))
            .collect()
    }

    /// Socket addresses as bound, wildcards included.
    pub fn bound_sockets(&self) -> Vec<SocketAddr> {
        lock(&self.inner.sockets)
            .iter()
            .filter_map(|socket| socket.local_addr().ok())
            .collect()
    }

    /// Route inbound streams opened under `protocol` to `handler`.
    ///
    /// Registering a name twice replaces the earlier handler.
    pub fn register_handler(
        &self,
        protocol: impl Into<String>,
        handler: impl ProtocolHandler,
    ) -> Result<()> {
        self.ensure_open()?;
        let protocol = protocol.into();
        if encode_protocol_header(&protocol).is_err() {
            return Err(Error::UnsupportedProtocol(protocol));
        }
        let previous = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.clone(), Arc::new(handler));
        if previous.is_some() {
            warn!(%protocol, "replaced protocol handler");
        } else {
            debug!(%protocol, "registered protocol handler");
        }
        Ok(())
    }

    /// Establish (or reuse) an authenticated session with `peer`.
    ///
    /// Addresses are tried in order. Authentication failures end the attempt
    /// immediately; otherwise the error of the last address is returned.
    pub async fn connect(
        &self,
        ctx: &CancellationToken,
        peer: &PeerAddrInfo,
    ) -> Result<SecureSession> {
        self.ensure_open()?;
        if peer.id == self.local_id() {
            return Err(Error::connect("refusing to dial own identity"));
        }
        if let Some(session) = self.inner.live_session(&peer.id) {
            return Ok(session);
        }
        if peer.addrs.is_empty() {
            return Err(Error::connect(format!(
                "no addresses known for {}",
                peer.id.fmt_short()
            )));
        }
        lock(&self.inner.address_book).insert(peer.id, peer.clone());

        let session = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = self.inner.shutdown.cancelled() => return Err(Error::Closed),
            result = self.dial_any(peer) => result?,
        };
        self.inner.register(session.clone());
        tokio::spawn(serve_session(self.inner.clone(), session.clone()));
        Ok(session)
    }

    async fn dial_any(&self, peer: &PeerAddrInfo) -> Result<SecureSession> {
        let mut last_error = None;
        for addr in &peer.addrs {
            let Some(socket) = self.inner.socket_for(addr) else {
                last_error = Some(Error::connect(format!("no local socket can reach {addr}")));
                continue;
            };
            match session::dial(
                &socket,
                &self.inner.client,
                &self.inner.credentials,
                *addr,
                peer.id,
                self.inner.deadlines,
            )
            .await
            {
                Ok(session) => return Ok(session),
                Err(e) if e.is_final() => return Err(e),
                Err(e) => {
                    debug!(peer = %peer.id.fmt_short(), %addr, error = %e, "dial failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::connect("no addresses to dial")))
    }

    /// Open a stream to `peer` under `protocol`.
    ///
    /// Reuses a live session, otherwise connects with the addresses last
    /// used for that peer, otherwise fails with [`Error::NoSession`].
    pub async fn open_stream(
        &self,
        ctx: &CancellationToken,
        peer: PeerId,
        protocol: &str,
    ) -> Result<OutboundStream> {
        self.ensure_open()?;
        let session = match self.inner.live_session(&peer) {
            Some(session) => session,
            None => {
                let known = lock(&self.inner.address_book).get(&peer).cloned();
                match known {
                    Some(info) => self.connect(ctx, &info).await?,
                    None => return Err(Error::NoSession(peer)),
                }
            }
        };
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            _ = self.inner.shutdown.cancelled() => Err(Error::Closed),
            stream = session.open_stream(protocol) => stream,
        }
    }

    /// Live session with `peer`, if any.
    pub fn session(&self, peer: &PeerId) -> Option<SecureSession> {
        self.inner.live_session(peer)
    }

    /// Peers with a live session.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        lock(&self.inner.sessions)
            .iter()
            .filter(|(_, s)| !s.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    /// QUIC connections still held by the sockets, including half-open ones.
    pub fn open_connections(&self) -> usize {
        lock(&self.inner.sockets)
            .iter()
            .map(|socket| socket.open_connections())
            .sum()
    }

    /// Wait until `ctx` is cancelled or the endpoint is closed.
    pub async fn run(&self, ctx: &CancellationToken) {
        tokio::select! {
            _ = ctx.cancelled() => debug!("run: context cancelled"),
            _ = self.inner.shutdown.cancelled() => debug!("run: endpoint closed"),
        }
    }

    /// Close every session and socket. Safe to call more than once.
    ///
    /// In-flight accepts, handshakes and stream reads unblock with
    /// [`Error::Closed`]; later calls on this endpoint return it too.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let sessions: Vec<SecureSession> = lock(&self.inner.sessions)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in &sessions {
            session.connection().close(SESSION_CLOSED, b"endpoint closed");
        }

        let sockets: Vec<quinn::Endpoint> = std::mem::take(&mut *lock(&self.inner.sockets));
        for socket in &sockets {
            socket.close(SESSION_CLOSED, b"endpoint closed");
        }
        let started = Instant::now();
        for socket in &sockets {
            let remaining = CLOSE_WAIT.saturating_sub(started.elapsed());
            if tokio::time::timeout(remaining, socket.wait_idle()).await.is_err() {
                debug!("socket did not drain before close deadline");
            }
        }
        info!(id = %self.local_id().fmt_short(), sessions = sessions.len(), "endpoint closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() || self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

async fn accept_loop(inner: Arc<Inner>, socket: quinn::Endpoint) {
    loop {
        let incoming = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            incoming = socket.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            let from = incoming.remote_address();
            let negotiated = tokio::select! {
                _ = inner.shutdown.cancelled() => Err(Error::Closed),
                result = session::accept(incoming, &inner.credentials, inner.deadlines) => result,
            };
            match negotiated {
                Ok(session) => {
                    inner.register(session.clone());
                    serve_session(inner, session).await;
                }
                Err(Error::Closed) => {}
                Err(e) => warn!(%from, error = %e, "inbound negotiation failed"),
            }
        });
    }
    debug!("accept loop stopped");
}

async fn serve_session(inner: Arc<Inner>, session: SecureSession) {
    let peer = session.remote_id();
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = session.connection().accept_bi() => accepted,
        };
        match accepted {
            Ok((send, recv)) => {
                tokio::spawn(dispatch(inner.clone(), session.clone(), send, recv));
            }
            Err(e) => {
                debug!(peer = %peer.fmt_short(), reason = %e, "session ended");
                break;
            }
        }
    }
    inner.forget(&session);
}

async fn dispatch(
    inner: Arc<Inner>,
    session: SecureSession,
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
) {
    let peer = session.remote_id();
    let header = tokio::time::timeout(inner.deadlines.handshake, read_protocol_header(&mut recv));
    let protocol = match header.await {
        Ok(Ok(protocol)) => protocol,
        Ok(Err(e)) => {
            debug!(peer = %peer.fmt_short(), error = %e, "unreadable protocol header");
            return;
        }
        Err(_) => {
            debug!(peer = %peer.fmt_short(), "protocol header timed out");
            return;
        }
    };

    let info = StreamInfo {
        peer,
        remote_addr: session.remote_addr(),
        protocol: protocol.clone(),
        opened_at: Instant::now(),
    };
    let stream = InboundStream::new(info, send, recv, inner.max_message_size);
    let Some(handler) = inner.handler(&protocol) else {
        warn!(peer = %peer.fmt_short(), %protocol, "refusing stream for unknown protocol");
        stream.refuse(PROTOCOL_REFUSED);
        return;
    };

    debug!(peer = %peer.fmt_short(), %protocol, "dispatching stream");
    if let Err(e) = handler.accept_boxed(stream).await {
        warn!(peer = %peer.fmt_short(), %protocol, error = %e, "stream handler failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_endpoint() -> Endpoint {
        Endpoint::builder()
            .listen_addr("127.0.0.1:0".parse().unwrap())
            .handshake_timeout(Duration::from_secs(30))
            .bind()
            .await
            .unwrap()
    }

    /// A QUIC server that completes the transport handshake and then never
    /// answers on any stream.
    async fn stalling_server() -> (quinn::Endpoint, SocketAddr) {
        let transport = Arc::new(TransportConfig::default().to_quinn().unwrap());
        let server = tls::server_config(transport).unwrap();
        let socket = quinn::Endpoint::server(server, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        let accepting = socket.clone();
        tokio::spawn(async move {
            while let Some(incoming) = accepting.accept().await {
                tokio::spawn(async move {
                    if let Ok(conn) = incoming.await {
                        conn.closed().await;
                    }
                });
            }
        });
        (socket, addr)
    }

    #[tokio::test]
    async fn cancel_mid_handshake_releases_connection() {
        let endpoint = local_endpoint().await;
        let (_server, addr) = stalling_server().await;
        let target = PeerAddrInfo::new(NodeIdentity::generate().unwrap().id(), [addr]);

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), endpoint.connect(&ctx, &target))
            .await
            .expect("connect must observe cancellation");
        assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(endpoint.session(&target.id).is_none());

        tokio::time::timeout(Duration::from_secs(10), async {
            while endpoint.open_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("abandoned connection must be released");

        endpoint.close().await;
    }

    #[tokio::test]
    async fn silent_responder_hits_handshake_timeout() {
        let endpoint = Endpoint::builder()
            .listen_addr("127.0.0.1:0".parse().unwrap())
            .handshake_timeout(Duration::from_millis(300))
            .bind()
            .await
            .unwrap();
        let (_server, addr) = stalling_server().await;
        let target = PeerAddrInfo::new(NodeIdentity::generate().unwrap().id(), [addr]);

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            endpoint.connect(&CancellationToken::new(), &target),
        )
        .await
        .expect("handshake deadline must fire");
        assert!(matches!(result, Err(Error::Handshake(_))), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(endpoint.session(&target.id).is_none());
        assert!(endpoint.connected_peers().is_empty());

        tokio::time::timeout(Duration::from_secs(10), async {
            while endpoint.open_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("timed out handshake must release its connection");

        endpoint.close().await;
    }

    #[tokio::test]
    async fn dialing_self_is_refused() {
        let endpoint = local_endpoint().await;
        let me = PeerAddrInfo::from(endpoint.local_addrs()[0]);
        let result = endpoint.connect(&CancellationToken::new(), &me).await;
        assert!(matches!(result, Err(Error::Connect(_))));
        endpoint.close().await;
    }

    #[tokio::test]
    async fn unknown_peer_without_addresses_has_no_session() {
        let endpoint = local_endpoint().await;
        let stranger = NodeIdentity::generate().unwrap().id();
        let result = endpoint
            .open_stream(&CancellationToken::new(), stranger, "/json/1.0.0")
            .await;
        assert!(matches!(result, Err(Error::NoSession(id)) if id == stranger));

        let empty = PeerAddrInfo::new(stranger, []);
        let result = endpoint.connect(&CancellationToken::new(), &empty).await;
        assert!(matches!(result, Err(Error::Connect(_))));
        endpoint.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let endpoint = local_endpoint().await;
        assert!(!endpoint.bound_sockets().is_empty());

        endpoint.close().await;
        endpoint.close().await;

        assert!(endpoint.is_closed());
        assert!(endpoint.bound_sockets().is_empty());
        assert!(endpoint.local_addrs().is_empty());
        let ctx = CancellationToken::new();
        let peer = PeerAddrInfo::new(
            NodeIdentity::generate().unwrap().id(),
            ["127.0.0.1:9".parse().unwrap()],
        );
        assert!(matches!(endpoint.connect(&ctx, &peer).await, Err(Error::Closed)));
        assert!(matches!(
            endpoint.register_handler("/x/1", crate::protocol::handler_fn(|_| async { Ok::<(), Error>(()) })),
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn run_returns_on_cancel_and_on_close() {
        let endpoint = local_endpoint().await;
        let ctx = CancellationToken::new();
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), endpoint.run(&ctx))
            .await
            .unwrap();

        let running = endpoint.clone();
        let waiter = tokio::spawn(async move { running.run(&CancellationToken::new()).await });
        endpoint.close().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn out_of_range_idle_timeout_is_a_config_error() {
        let transport = TransportConfig {
            idle_timeout: Duration::MAX,
            ..TransportConfig::default()
        };
        let result = Endpoint::builder()
            .listen_addr("127.0.0.1:0".parse().unwrap())
            .transport(transport)
            .bind()
            .await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))), "{result:?}");
    }

    #[test]
    fn default_config_listens_on_wildcard() {
        let config = EndpointConfig::default();
        assert_eq!(config.listen_addrs, vec!["0.0.0.0:0".parse::<SocketAddr>().unwrap()]);
        assert_eq!(config.security, SecurityProtocol::NoiseXx);
        assert_eq!(config.max_message_size, 1 << 20);
    }
}
