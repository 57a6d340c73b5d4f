//! Error types for lanlink.

use std::fmt::Display;

use crate::identity::PeerId;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS randomness source could not produce key material.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Binding or configuring the QUIC socket failed.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// The local network does not allow multicast discovery.
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(#[source] std::io::Error),

    /// The remote transport address could not be reached.
    #[error("connect error: {0}")]
    Connect(String),

    /// The Noise handshake failed.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// The responder proved an identity other than the one that was dialed.
    #[error("identity mismatch: expected peer {expected}, responder proved {actual}")]
    IdentityMismatch {
        /// Identity the initiator intended to reach.
        expected: PeerId,
        /// Identity the responder actually proved.
        actual: PeerId,
    },

    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The endpoint or session has been closed.
    #[error("endpoint or session is closed")]
    Closed,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// No live session and no known address for the peer.
    #[error("no session with peer {0}")]
    NoSession(PeerId),

    /// The remote side refused the requested protocol.
    #[error("peer refused protocol {0}")]
    UnsupportedProtocol(String),

    /// An address or peer id failed to parse.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Stream-level failure on an established session.
    #[error("stream error: {0}")]
    Stream(String),

    /// QUIC write error.
    #[error("QUIC write error: {0}")]
    QuicWrite(#[from] quinn::WriteError),

    /// QUIC read error.
    #[error("QUIC read error: {0}")]
    QuicRead(#[from] quinn::ReadToEndError),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a connect error.
    pub fn connect<S: Display>(msg: S) -> Self {
        Self::Connect(msg.to_string())
    }

    /// Create a handshake error.
    pub fn handshake<S: Display>(msg: S) -> Self {
        Self::Handshake(msg.to_string())
    }

    /// Create a stream error.
    pub fn stream<S: Display>(msg: S) -> Self {
        Self::Stream(msg.to_string())
    }

    /// Create a decode error.
    pub fn decode<S: Display>(msg: S) -> Self {
        Self::Decode(msg.to_string())
    }

    /// Create an invalid address error.
    pub fn invalid_address<S: Display>(msg: S) -> Self {
        Self::InvalidAddress(msg.to_string())
    }

    /// Whether the error ends a connect attempt instead of moving on to the
    /// peer's next address.
    ///
    /// Authentication failures are final: another address of the same peer
    /// cannot change what the responder proved.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::IdentityMismatch { .. } | Self::Handshake(_) | Self::Cancelled | Self::Closed
        )
    }
}

impl From<quinn::ConnectionError> for Error {
    fn from(err: quinn::ConnectionError) -> Self {
        match err {
            quinn::ConnectionError::LocallyClosed => Self::Closed,
            other => Self::Stream(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
