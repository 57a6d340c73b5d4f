//! Local-network peer discovery and authenticated message exchange over QUIC.
//!
//! A node creates an [`Endpoint`] with a fresh [`NodeIdentity`], registers a
//! [`ProtocolHandler`] per application protocol, and either announces itself
//! with [`Discovery`] or hands its printed [`PeerAddr`] to a peer out of band.
//! [`Endpoint::connect`] runs a Noise XX handshake on top of the QUIC
//! connection and fails with [`Error::IdentityMismatch`] when the responder is
//! not the node that was dialed.
//!
//! The [`json`] module implements the one-envelope-per-stream message
//! protocol the `lanlink` binary uses.

#![deny(missing_docs)]

pub mod addr;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod json;
pub mod protocol;
pub mod session;
pub mod stream;
mod tls;

// Re-export key types
pub use addr::{PeerAddr, PeerAddrInfo, TransportAddr};
pub use discovery::{
    select_peer, DiscoveredPeer, Discovery, DiscoveryConfig, PeerFeed, PeerSelection,
};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointConfig, SecurityProtocol, TransportConfig};
pub use error::{Error, Result};
pub use identity::{NodeIdentity, PeerId};
pub use json::{
    send_envelope, JsonIncoming, JsonProtocol, MessageEnvelope, ReceivedMessage, JSON_PROTOCOL,
};
pub use protocol::{handler_fn, protocol_name, ProtocolHandler};
pub use session::{Direction, NegotiationState, SecureSession};
pub use stream::{InboundStream, OutboundStream, StreamInfo};
pub use tls::ALPN;

/// The cancellation context accepted by blocking operations.
pub use tokio_util::sync::CancellationToken;
