//! submux: a dual-transport RPC session server with a shared-subscription
//! multiplexer.
//!
//! This crate provides the connection/session machinery for an RPC server
//! that accepts clients over two transports (raw stream sockets and a
//! web-socket upgrade path), plus a [`SubscriptionMux`] that coalesces many
//! logical subscribers onto a single upstream subscription per descriptor.
//!
//! The wire codec, the application's method handlers, and TLS certificates
//! are all collaborators supplied by the embedding application:
//!
//! - [`ChannelFactory`] / [`ChannelConnector`] bind and dial
//!   [`RpcChannel`]s; framing and request-id correlation live behind those
//!   traits.
//! - [`SessionFactory`] / [`AppSession`] supply the per-connection
//!   application object that every inbound request is routed to.
//!
//! ## Serving
//!
//! A [`Server`] keeps one stream listener and one web-socket listener
//! running, restarting either when it stops. Each accepted connection gets
//! a [`Session`] that guarantees exactly-once, ordered teardown no matter
//! which of peer disconnect, context cancellation, or explicit destroy
//! fires first.
//!
//! ```no_run
//! use std::sync::Arc;
//! use submux::{
//!     async_trait, AppSession, RpcContext, Server, ServerConfig, SessionError,
//!     SessionFactory, SessionHandle,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl AppSession for Echo {
//!     async fn rpc_handle(&self, cx: RpcContext) {
//!         let _ = cx.responder.reply(cx.request.params.get()).await;
//!     }
//!
//!     async fn destroy(&self) {}
//! }
//!
//! struct EchoFactory;
//!
//! #[async_trait]
//! impl SessionFactory for EchoFactory {
//!     async fn create_session(
//!         &self,
//!         _handle: SessionHandle,
//!     ) -> Result<Box<dyn AppSession>, SessionError> {
//!         Ok(Box::new(Echo))
//!     }
//! }
//!
//! # async fn demo(channels: Arc<dyn submux::ChannelFactory>) {
//! let server = Server::new(ServerConfig {
//!     stream_addr: "127.0.0.1:9000".into(),
//!     ws_addr: "127.0.0.1:9001".into(),
//!     ws_path: submux::DEFAULT_WS_PATH.into(),
//!     async_dispatch: true,
//!     tls: None,
//!     sessions: Arc::new(EchoFactory),
//!     channels,
//! });
//! server.start();
//! # }
//! ```
//!
//! ## Shared subscriptions
//!
//! Handlers that need fan-out subscriptions use a [`SubscriptionMux`].
//! Subscribers whose parameters derive the same descriptor share one
//! upstream subscription; each holds its own unsubscribe token, and the
//! upstream session is released the instant the last token leaves.
//!
//! ```no_run
//! use std::sync::Arc;
//! use submux::{async_trait, MuxConfig, NotificationSink, RawValue, Request, SubscriptionMux};
//!
//! struct Fanout;
//!
//! #[async_trait]
//! impl NotificationSink for Fanout {
//!     async fn notify(&self, request: Request, delivery_id: &str) {
//!         println!("{delivery_id}: {}", request.method);
//!     }
//! }
//!
//! # async fn demo(connector: Arc<dyn submux::ChannelConnector>) -> Result<(), submux::SubscribeError> {
//! let mux = SubscriptionMux::new(MuxConfig {
//!     async_dispatch: false,
//!     connector,
//!     subscribe_method: "subscribe".into(),
//!     descriptor: Arc::new(|params: &RawValue| params.get().to_owned()),
//!     notifications: Arc::new(Fanout),
//! });
//!
//! let params = submux::serde_json::value::to_raw_value(&"ticker:ETH").unwrap();
//! let (descriptor, token) = mux.subscribe(params).await?;
//! mux.unsubscribe(&descriptor, &token).await;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    clippy::missing_const_for_fn,
    rustdoc::all
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod app;
pub use app::{AppSession, RpcContext, SessionFactory, SessionHandle};

mod channel;
pub use channel::{BoxedIo, ChannelConnector, ChannelFactory, Io, RequestHandler, RpcChannel};

mod error;
pub use error::{ChannelError, SessionError, SubscribeError};

mod id;
pub use id::fresh_id;

mod mux;
pub use mux::{DescriptorFn, MuxConfig, NotificationSink, SubscriptionMux, UpstreamSession};

mod primitives;
pub use primitives::{RpcRecv, RpcSend};

mod responder;
pub use responder::Responder;

mod server;
pub use server::{Server, ServerConfig, DEFAULT_WS_PATH};

mod session;
pub use session::Session;

mod types;
pub use types::{ErrorPayload, Request, INTERNAL_ERROR_CODE};

mod worker;
mod ws;

/// Re-export of the [`async_trait`] attribute, used to implement the
/// channel and application contracts.
pub use async_trait::async_trait;

/// Re-export of the `serde_json` crate, primarily to provide the
/// [`RawValue`] type the channel contract traffics in.
pub use serde_json::{self, value::RawValue};
