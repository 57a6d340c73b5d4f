//! Application streams on a secure session.
//!
//! Every application stream starts with a protocol header: one length byte
//! followed by the UTF-8 protocol name. The accepting side dispatches on that
//! name and refuses unknown protocols with [`PROTOCOL_REFUSED`].

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use quinn::{ConnectionError, ReadError, ReadExactError, ReadToEndError, VarInt, WriteError};
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::PeerId;

/// Stream error code sent when the requested protocol has no handler.
pub const PROTOCOL_REFUSED: VarInt = VarInt::from_u32(0x10);

/// Stream error code sent when a handler rejects the payload it received.
pub const PAYLOAD_REJECTED: VarInt = VarInt::from_u32(0x13);

/// How long [`OutboundStream::finish`] waits for the peer to consume the stream.
pub const DEFAULT_FINISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound of the reply the opener reads back while finishing.
const FINISH_REPLY_LIMIT: usize = 64;

/// Peer information attached to every application stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Authenticated identity of the remote node.
    pub peer: PeerId,
    /// Remote socket address of the session.
    pub remote_addr: SocketAddr,
    /// Protocol the stream was opened under.
    pub protocol: String,
    /// When the stream was opened or accepted.
    pub opened_at: Instant,
}

pub(crate) fn encode_protocol_header(protocol: &str) -> Result<Vec<u8>> {
    let name = protocol.as_bytes();
    let len = u8::try_from(name.len())
        .ok()
        .filter(|len| *len > 0)
        .ok_or_else(|| {
            Error::stream(format!(
                "protocol name must be 1..=255 bytes, got {}",
                name.len()
            ))
        })?;
    let mut header = Vec::with_capacity(1 + name.len());
    header.push(len);
    header.extend_from_slice(name);
    Ok(header)
}

pub(crate) async fn read_protocol_header(recv: &mut quinn::RecvStream) -> Result<String> {
    let mut len = [0u8; 1];
    recv.read_exact(&mut len).await.map_err(read_exact_error)?;
    if len[0] == 0 {
        return Err(Error::stream("empty protocol name"));
    }
    let mut name = vec![0u8; usize::from(len[0])];
    recv.read_exact(&mut name).await.map_err(read_exact_error)?;
    String::from_utf8(name).map_err(|_| Error::stream("protocol name is not UTF-8"))
}

pub(crate) fn read_exact_error(err: ReadExactError) -> Error {
    match err {
        ReadExactError::FinishedEarly(n) => {
            Error::stream(format!("stream finished after {n} bytes"))
        }
        ReadExactError::ReadError(e) => read_error(e),
    }
}

fn read_error(err: ReadError) -> Error {
    match err {
        ReadError::ConnectionLost(ConnectionError::LocallyClosed) => Error::Closed,
        ReadError::ConnectionLost(e) => Error::from(e),
        other => Error::stream(other),
    }
}

fn write_error(err: WriteError, protocol: &str) -> Error {
    match err {
        WriteError::Stopped(code) if code == PROTOCOL_REFUSED => {
            Error::UnsupportedProtocol(protocol.to_string())
        }
        WriteError::Stopped(code) if code == PAYLOAD_REJECTED => {
            Error::decode(format!("peer rejected {protocol} payload"))
        }
        WriteError::ConnectionLost(ConnectionError::LocallyClosed) => Error::Closed,
        other => Error::QuicWrite(other),
    }
}

/// A stream accepted from a peer, already dispatched by protocol name.
#[derive(Debug)]
pub struct InboundStream {
    info: StreamInfo,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    max_read: usize,
}

impl InboundStream {
    pub(crate) fn new(
        info: StreamInfo,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        max_read: usize,
    ) -> Self {
        Self {
            info,
            send,
            recv,
            max_read,
        }
    }

    /// Peer and protocol of this stream.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Authenticated identity of the remote node.
    pub fn peer(&self) -> PeerId {
        self.info.peer
    }

    /// Read until the opener finishes its side of the stream.
    ///
    /// Payloads larger than the endpoint's `max_message_size` fail with
    /// [`Error::Decode`].
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        self.recv
            .read_to_end(self.max_read)
            .await
            .map_err(|e| match e {
                ReadToEndError::TooLong => Error::decode(format!(
                    "payload exceeds {} bytes",
                    self.max_read
                )),
                ReadToEndError::Read(e) => read_error(e),
            })
    }

    /// Write a reply to the opener.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let protocol = self.info.protocol.clone();
        self.send
            .write_all(buf)
            .await
            .map_err(|e| write_error(e, &protocol))
    }

    /// Finish this side of the stream, telling the opener it was consumed.
    pub fn finish(mut self) -> Result<()> {
        self.send.finish().map_err(Error::stream)?;
        debug!(peer = %self.info.peer.fmt_short(), protocol = %self.info.protocol, "inbound stream finished");
        Ok(())
    }

    /// Reject a payload the handler could not use.
    ///
    /// The opener's [`OutboundStream::finish`] fails with [`Error::Decode`].
    pub fn reject(self) {
        debug!(peer = %self.info.peer.fmt_short(), protocol = %self.info.protocol, "inbound stream rejected");
        self.refuse(PAYLOAD_REJECTED);
    }

    /// Refuse the stream with an application error code.
    pub(crate) fn refuse(mut self, code: VarInt) {
        let _ = self.recv.stop(code);
        let _ = self.send.reset(code);
    }
}

/// A stream opened towards a peer under one protocol.
#[derive(Debug)]
pub struct OutboundStream {
    info: StreamInfo,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl OutboundStream {
    pub(crate) async fn open(
        conn: &quinn::Connection,
        peer: PeerId,
        protocol: &str,
    ) -> Result<Self> {
        let header = encode_protocol_header(protocol)?;
        let (mut send, recv) = conn.open_bi().await?;
        send.write_all(&header)
            .await
            .map_err(|e| write_error(e, protocol))?;
        Ok(Self {
            info: StreamInfo {
                peer,
                remote_addr: conn.remote_address(),
                protocol: protocol.to_string(),
                opened_at: Instant::now(),
            },
            send,
            recv,
        })
    }

    /// Peer and protocol of this stream.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Write payload bytes.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.send
            .write_all(buf)
            .await
            .map_err(|e| write_error(e, &self.info.protocol))
    }

    /// Finish the stream and wait until the peer has consumed it.
    ///
    /// End of stream is the message delimiter, so the session must not be
    /// closed before this returns.
    pub async fn finish(self) -> Result<Vec<u8>> {
        self.finish_within(DEFAULT_FINISH_TIMEOUT).await
    }

    /// Like [`finish`](Self::finish) with an explicit wait bound.
    pub async fn finish_within(mut self, wait: Duration) -> Result<Vec<u8>> {
        self.send.finish().map_err(Error::stream)?;
        let protocol = self.info.protocol.clone();
        let reply = tokio::time::timeout(wait, self.recv.read_to_end(FINISH_REPLY_LIMIT))
            .await
            .map_err(|_| {
                Error::stream(format!(
                    "peer did not consume {protocol} stream within {wait:?}"
                ))
            })?;
        match reply {
            Ok(reply) => Ok(reply),
            Err(ReadToEndError::Read(ReadError::Reset(code))) if code == PROTOCOL_REFUSED => {
                Err(Error::UnsupportedProtocol(protocol))
            }
            Err(ReadToEndError::Read(ReadError::Reset(code))) if code == PAYLOAD_REJECTED => {
                Err(Error::decode(format!("peer rejected {protocol} payload")))
            }
            Err(ReadToEndError::Read(e)) => Err(read_error(e)),
            Err(ReadToEndError::TooLong) => Err(Error::stream("reply too long")),
        }
    }
}
