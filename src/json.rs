//! The `/json/1.0.0` message protocol.
//!
//! One stream carries one [`MessageEnvelope`] encoded as a JSON object. There
//! is no length prefix: the sender finishes the stream after the last byte and
//! the receiver reads until end of stream.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::protocol::ProtocolHandler;
use crate::session::SecureSession;
use crate::stream::{InboundStream, OutboundStream};

/// Protocol name the envelope exchange runs under.
pub const JSON_PROTOCOL: &str = "/json/1.0.0";

const DEFAULT_CAPACITY: usize = 64;

/// A typed message: `{"type": ..., "content": ...}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

impl MessageEnvelope {
    /// Create an envelope.
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
        }
    }

    /// Message type.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Message body.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Encode as UTF-8 JSON.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from UTF-8 JSON. Unknown fields are ignored; both known fields
    /// are required.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Display for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{Type:{} Content:{}}}", self.kind, self.content)
    }
}

/// An envelope delivered by a peer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Authenticated sender.
    pub from: PeerId,
    /// The decoded message.
    pub envelope: MessageEnvelope,
    /// When decoding completed.
    pub received_at: SystemTime,
}

/// Receiver side handler; decoded envelopes come out of [`JsonIncoming`].
#[derive(Debug, Clone)]
pub struct JsonProtocol {
    sender: mpsc::Sender<ReceivedMessage>,
}

/// Stream of envelopes accepted by a [`JsonProtocol`] handler.
pub struct JsonIncoming {
    receiver: ReceiverStream<ReceivedMessage>,
}

impl JsonProtocol {
    /// Create the handler and the stream its messages arrive on.
    pub fn new() -> (Self, JsonIncoming) {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Like [`new`](Self::new) with an explicit queue size. Handlers wait for
    /// room when the queue is full.
    pub fn with_capacity(capacity: usize) -> (Self, JsonIncoming) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self { sender },
            JsonIncoming {
                receiver: ReceiverStream::new(receiver),
            },
        )
    }
}

impl ProtocolHandler for JsonProtocol {
    fn accept(&self, mut stream: InboundStream) -> impl Future<Output = Result<()>> + Send {
        let sender = self.sender.clone();
        async move {
            let from = stream.peer();
            let decoded = match stream.read_to_end().await {
                Ok(bytes) => MessageEnvelope::decode(&bytes),
                Err(e) => Err(e),
            };
            let envelope = match decoded {
                Ok(envelope) => envelope,
                Err(e @ Error::Closed) => return Err(e),
                Err(e) => {
                    stream.reject();
                    return Err(e);
                }
            };
            stream.finish()?;
            debug!(peer = %from.fmt_short(), kind = %envelope.kind(), "envelope received");
            sender
                .send(ReceivedMessage {
                    from,
                    envelope,
                    received_at: SystemTime::now(),
                })
                .await
                .map_err(|_| Error::Closed)
        }
    }
}

impl Stream for JsonIncoming {
    type Item = ReceivedMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

async fn write_envelope(mut stream: OutboundStream, envelope: &MessageEnvelope) -> Result<()> {
    let bytes = envelope.encode()?;
    stream.write_all(&bytes).await?;
    stream.finish().await?;
    Ok(())
}

/// Send one envelope on a new stream of `session`.
///
/// Returns once the receiver has consumed the stream; the session can be
/// closed afterwards.
pub async fn send_envelope(session: &SecureSession, envelope: &MessageEnvelope) -> Result<()> {
    let stream = session.open_stream(JSON_PROTOCOL).await?;
    write_envelope(stream, envelope).await?;
    info!(peer = %session.remote_id().fmt_short(), kind = %envelope.kind(), "envelope sent");
    Ok(())
}

/// Send one envelope to `peer` through the endpoint, connecting if needed.
pub async fn send_to(
    endpoint: &Endpoint,
    ctx: &CancellationToken,
    peer: PeerId,
    envelope: &MessageEnvelope,
) -> Result<()> {
    let stream = endpoint.open_stream(ctx, peer, JSON_PROTOCOL).await?;
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        sent = write_envelope(stream, envelope) => sent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_type_key() {
        let envelope = MessageEnvelope::new("Greeting", "Hello, securely over libp2p QUIC!");
        let json: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "Greeting", "content": "Hello, securely over libp2p QUIC!"})
        );
    }

    #[test]
    fn decodes_foreign_encoding() {
        let raw = r#"{ "content": "hi é", "type": "Note", "extra": 1 }"#;
        let envelope = MessageEnvelope::decode(raw.as_bytes()).unwrap();
        assert_eq!(envelope.kind(), "Note");
        assert_eq!(envelope.content(), "hi \u{e9}");
    }

    #[test]
    fn envelope_survives_encoding() {
        let envelope = MessageEnvelope::new("", "line\nbreak \"quoted\" \u{1f510}");
        let decoded = MessageEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        let cases: [&[u8]; 5] = [
            b"",
            b"not json",
            b"{\"type\":\"A\"}",
            b"{\"type\":1,\"content\":\"x\"}",
            b"\xff\xfe",
        ];
        for raw in cases {
            assert!(
                matches!(MessageEnvelope::decode(raw), Err(Error::Decode(_))),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn display_matches_receiver_output() {
        let envelope = MessageEnvelope::new("Greeting", "hi");
        assert_eq!(envelope.to_string(), "{Type:Greeting Content:hi}");
    }
}
