//! Secure sessions and the negotiation that produces them.
//!
//! A session is one QUIC connection whose peer has proven its identity with
//! the Noise handshake in [`noise`]. Both the dialing and the accepting side
//! walk the [`NegotiationState`] machine; a session only exists once the
//! attempt reached `Established`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quinn::VarInt;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identity::{NodeIdentity, PeerId};
use crate::stream::OutboundStream;
use crate::tls::SERVER_NAME;

pub(crate) mod noise;
pub mod state;

pub use state::NegotiationState;

use noise::{HandshakeOutcome, NoiseKeys};
use state::Negotiation;

/// Connection close code for an orderly shutdown.
pub const SESSION_CLOSED: VarInt = VarInt::from_u32(0);
/// Connection close code sent when the responder is not the dialed identity.
pub const IDENTITY_MISMATCH: VarInt = VarInt::from_u32(0x11);
/// Connection close code sent when the handshake fails for any other reason.
pub const HANDSHAKE_FAILED: VarInt = VarInt::from_u32(0x12);

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This node dialed.
    Outbound,
    /// The remote node dialed.
    Inbound,
}

/// An authenticated, encrypted, multiplexed connection to one peer.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct SecureSession {
    conn: quinn::Connection,
    remote: PeerId,
    session_id: Arc<[u8]>,
    established_at: Instant,
    direction: Direction,
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("remote", &self.remote)
            .field("remote_addr", &self.conn.remote_address())
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SecureSession {
    fn new(conn: quinn::Connection, outcome: HandshakeOutcome, direction: Direction) -> Self {
        Self {
            conn,
            remote: outcome.remote,
            session_id: outcome.session_id.into(),
            established_at: Instant::now(),
            direction,
        }
    }

    /// Proven identity of the remote node.
    pub fn remote_id(&self) -> PeerId {
        self.remote
    }

    /// Current remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    /// Noise handshake hash, identical on both ends of the session.
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// When the handshake completed.
    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Which side opened the session.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Open a new stream under `protocol`.
    pub async fn open_stream(&self, protocol: &str) -> Result<OutboundStream> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        OutboundStream::open(&self.conn, self.remote, protocol).await
    }

    /// Close the session. Streams should be finished before this is called.
    pub fn close(&self) {
        self.conn.close(SESSION_CLOSED, b"session closed");
    }

    /// Whether either side has closed the session.
    pub fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    /// Wait until the session is closed and return why.
    pub async fn closed(&self) -> quinn::ConnectionError {
        self.conn.closed().await
    }

    pub(crate) fn connection(&self) -> &quinn::Connection {
        &self.conn
    }

    pub(crate) fn stable_id(&self) -> usize {
        self.conn.stable_id()
    }
}

/// Key material used by both negotiation roles.
#[derive(Debug)]
pub(crate) struct Credentials {
    pub(crate) identity: NodeIdentity,
    pub(crate) keys: NoiseKeys,
}

impl Credentials {
    pub(crate) fn new(identity: NodeIdentity) -> Result<Self> {
        Ok(Self {
            identity,
            keys: NoiseKeys::generate()?,
        })
    }
}

/// Closes a half-negotiated connection when the attempt is abandoned.
struct AbortGuard(Option<quinn::Connection>);

impl AbortGuard {
    fn disarm(mut self) {
        self.0 = None;
    }

    fn abort(mut self, err: &Error) {
        if let Some(conn) = self.0.take() {
            conn.close(close_code(err), err.to_string().as_bytes());
        }
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.0.take() {
            conn.close(HANDSHAKE_FAILED, b"negotiation aborted");
        }
    }
}

fn close_code(err: &Error) -> VarInt {
    match err {
        Error::IdentityMismatch { .. } => IDENTITY_MISMATCH,
        _ => HANDSHAKE_FAILED,
    }
}

/// Bounds for one negotiation attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadlines {
    pub(crate) connect: Duration,
    pub(crate) handshake: Duration,
}

/// Dial `addr` and authenticate it as `expected`.
pub(crate) async fn dial(
    socket: &quinn::Endpoint,
    client: &quinn::ClientConfig,
    credentials: &Credentials,
    addr: SocketAddr,
    expected: PeerId,
    deadlines: Deadlines,
) -> Result<SecureSession> {
    let mut attempt = Negotiation::new(format!("dial {}@{addr}", expected.fmt_short()));
    let result = dial_steps(
        &mut attempt,
        socket,
        client,
        credentials,
        addr,
        expected,
        deadlines,
    )
    .await;
    if let Err(e) = &result {
        attempt.fail(e);
    }
    result
}

async fn dial_steps(
    attempt: &mut Negotiation,
    socket: &quinn::Endpoint,
    client: &quinn::ClientConfig,
    credentials: &Credentials,
    addr: SocketAddr,
    expected: PeerId,
    deadlines: Deadlines,
) -> Result<SecureSession> {
    attempt.advance(NegotiationState::DialingTransport)?;
    let connecting = socket
        .connect_with(client.clone(), addr, SERVER_NAME)
        .map_err(|e| Error::connect(format!("{addr}: {e}")))?;
    let conn = timeout(deadlines.connect, connecting)
        .await
        .map_err(|_| {
            Error::connect(format!(
                "{addr}: no answer within {:?}",
                deadlines.connect
            ))
        })?
        .map_err(|e| Error::connect(format!("{addr}: {e}")))?;
    let guard = AbortGuard(Some(conn.clone()));

    attempt.advance(NegotiationState::Handshaking)?;
    let handshake = noise::initiate(&conn, &credentials.identity, &credentials.keys, expected);
    let outcome = match timeout(deadlines.handshake, handshake).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            guard.abort(&e);
            return Err(e);
        }
        Err(_) => {
            let e = Error::handshake(format!("no handshake within {:?}", deadlines.handshake));
            guard.abort(&e);
            return Err(e);
        }
    };

    attempt.advance(NegotiationState::Authenticated)?;
    guard.disarm();
    let session = SecureSession::new(conn, outcome, Direction::Outbound);
    attempt.advance(NegotiationState::Established)?;
    info!(peer = %session.remote.fmt_short(), %addr, "secure session established");
    Ok(session)
}

/// Complete an inbound connection and authenticate whoever dialed.
pub(crate) async fn accept(
    incoming: quinn::Incoming,
    credentials: &Credentials,
    deadlines: Deadlines,
) -> Result<SecureSession> {
    let from = incoming.remote_address();
    let mut attempt = Negotiation::new(format!("accept {from}"));
    let result = accept_steps(&mut attempt, incoming, credentials, deadlines).await;
    if let Err(e) = &result {
        attempt.fail(e);
    }
    result
}

async fn accept_steps(
    attempt: &mut Negotiation,
    incoming: quinn::Incoming,
    credentials: &Credentials,
    deadlines: Deadlines,
) -> Result<SecureSession> {
    let from = incoming.remote_address();
    attempt.advance(NegotiationState::DialingTransport)?;
    let conn = timeout(deadlines.connect, async move { incoming.await })
        .await
        .map_err(|_| Error::connect(format!("{from}: transport handshake timed out")))?
        .map_err(|e| Error::connect(format!("{from}: {e}")))?;
    let guard = AbortGuard(Some(conn.clone()));

    attempt.advance(NegotiationState::Handshaking)?;
    let handshake = noise::respond(&conn, &credentials.identity, &credentials.keys);
    let outcome = match timeout(deadlines.handshake, handshake).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            guard.abort(&e);
            return Err(e);
        }
        Err(_) => {
            let e = Error::handshake(format!("no handshake within {:?}", deadlines.handshake));
            guard.abort(&e);
            return Err(e);
        }
    };

    attempt.advance(NegotiationState::Authenticated)?;
    guard.disarm();
    let session = SecureSession::new(conn, outcome, Direction::Inbound);
    attempt.advance(NegotiationState::Established)?;
    debug!(peer = %session.remote.fmt_short(), %from, "accepted secure session");
    Ok(session)
}
