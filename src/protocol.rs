//! Application protocol handlers.

use std::fmt;
use std::future::Future;

use futures_util::future::BoxFuture;

use crate::error::Result;
use crate::stream::InboundStream;

/// Build a protocol name from a name and version.
///
/// Converts ("json", "1.0.0") -> "/json/1.0.0"
pub fn protocol_name(name: &str, version: &str) -> String {
    format!(
        "/{}/{}",
        name.trim_matches('/'),
        version.trim_matches('/')
    )
}

/// Handles inbound streams opened under one protocol name.
///
/// `accept` is called once per stream, each call on its own task, so a slow
/// or failing stream never holds up the others. Errors are logged by the
/// endpoint together with the peer and protocol.
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Handle one inbound stream.
    fn accept(&self, stream: InboundStream) -> impl Future<Output = Result<()>> + Send;
}

/// Object-safe form of [`ProtocolHandler`] stored in the endpoint's registry.
pub(crate) trait DynProtocolHandler: Send + Sync + 'static {
    fn accept_boxed(&self, stream: InboundStream) -> BoxFuture<'_, Result<()>>;
}

impl<H: ProtocolHandler> DynProtocolHandler for H {
    fn accept_boxed(&self, stream: InboundStream) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.accept(stream))
    }
}

/// Protocol handler backed by a closure.
#[derive(Clone)]
pub struct FnHandler<F>(F);

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

/// Wrap a closure returning a future as a [`ProtocolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(InboundStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler(f)
}

impl<F, Fut> ProtocolHandler for FnHandler<F>
where
    F: Fn(InboundStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn accept(&self, stream: InboundStream) -> impl Future<Output = Result<()>> + Send {
        (self.0)(stream)
    }
}
