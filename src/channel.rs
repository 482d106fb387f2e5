//! The RPC channel contract.
//!
//! The wire-level codec (framing, request/reply correlation, batching) is
//! an external collaborator. This crate consumes it through the narrow,
//! object-safe traits below and never inspects message content itself.
//!
//! Two entry points produce channels:
//!
//! - [`ChannelFactory::bind`] frames an already-established duplex byte
//!   stream (an accepted socket, possibly TLS-wrapped, or an upgraded
//!   web-socket presented as a byte stream).
//! - [`ChannelConnector::connect`] dials a fresh connection to a backend;
//!   the subscription multiplexer uses this to open upstream sessions.
//!
//! Both take the [`RequestHandler`] that will receive every inbound request
//! delivered on the resulting channel.

use crate::{
    error::ChannelError,
    types::{ErrorPayload, Request},
};
use async_trait::async_trait;
use serde_json::value::RawValue;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Marker trait for duplex byte streams a channel can be bound over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An established duplex byte stream, ready for framing.
pub type BoxedIo = Box<dyn Io>;

/// One live RPC connection, with the codec and id correlation behind it.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Issue an outbound call and wait for the matching reply.
    async fn call(
        &self,
        method: &str,
        params: Box<RawValue>,
    ) -> Result<Box<RawValue>, ChannelError>;

    /// Send a success reply for the inbound request `id`.
    async fn reply(&self, id: &RawValue, result: Box<RawValue>) -> Result<(), ChannelError>;

    /// Send an error reply for the inbound request `id`.
    async fn reply_error(&self, id: &RawValue, error: ErrorPayload) -> Result<(), ChannelError>;

    /// Resolves once the peer has disconnected or the channel has been
    /// closed locally. May be awaited by any number of tasks.
    async fn closed(&self);

    /// Close the channel. Closing an already-closed channel must be
    /// harmless; errors are reported so callers can log them.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// Receiver for inbound requests delivered on a channel.
///
/// Registered when the channel is created. The channel awaits the handler
/// for each request in arrival order; handlers that want concurrency spawn
/// their own tasks.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one inbound request. `channel` is the channel the request
    /// arrived on, for sending the reply.
    async fn handle_request(self: Arc<Self>, channel: Arc<dyn RpcChannel>, request: Request);
}

/// Binds RPC channels over established byte streams.
pub trait ChannelFactory: Send + Sync {
    /// Frame `io` and start delivering inbound requests to `handler`.
    fn bind(&self, io: BoxedIo, handler: Arc<dyn RequestHandler>) -> Arc<dyn RpcChannel>;
}

/// Dials new upstream connections.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open a fresh connection to the backend and bind a channel over it,
    /// delivering backend-pushed requests to `handler`.
    async fn connect(
        &self,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn RpcChannel>, ChannelError>;
}
