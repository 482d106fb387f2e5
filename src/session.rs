//! Connection sessions: one per accepted client connection.
//!
//! A [`Session`] binds a connection to the application's per-session object
//! and guarantees well-ordered, idempotent teardown. Teardown runs at most
//! once no matter how many triggers fire (peer disconnect, cancellation of
//! the owning context, or an explicit destroy), and always executes its
//! steps in the same order: RPC channel, raw connection, application
//! object.

use crate::{
    app::{AppSession, RpcContext, SessionFactory, SessionHandle},
    channel::{BoxedIo, ChannelFactory, RequestHandler, RpcChannel},
    error::SessionError,
    id::fresh_id,
    responder::Responder,
    types::Request,
};
use async_trait::async_trait;
use core::fmt;
use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::select;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, info_span, Span};

/// The lifecycle owner of one client connection.
pub struct Session {
    handle: SessionHandle,
    app: Box<dyn AppSession>,
    channels: Arc<dyn ChannelFactory>,
    async_dispatch: bool,
    channel: OnceLock<Arc<dyn RpcChannel>>,
    conn_guard: OnceLock<CancellationToken>,
    tasks: TaskTracker,
    destroyed: AtomicBool,
    span: Span,
}

impl Session {
    /// Create a session for `session_id`, asking the application factory
    /// for the per-session object. A factory refusal propagates and no
    /// session is registered.
    ///
    /// The session's cancellation context is a child of `parent`; cancelling
    /// either triggers teardown.
    pub async fn create(
        factory: &Arc<dyn SessionFactory>,
        channels: Arc<dyn ChannelFactory>,
        async_dispatch: bool,
        session_id: String,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, SessionError> {
        let handle = SessionHandle {
            id: session_id.into(),
            cancel: parent.child_token(),
        };
        let span = info_span!("session", id = %handle.id());
        let app = factory.create_session(handle.clone()).await?;
        Ok(Arc::new(Self {
            handle,
            app,
            channels,
            async_dispatch,
            channel: OnceLock::new(),
            conn_guard: OnceLock::new(),
            tasks: TaskTracker::new(),
            destroyed: AtomicBool::new(false),
            span,
        }))
    }

    /// The session's opaque unique identifier.
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// A cloneable handle onto this session.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Serve a raw stream connection.
    ///
    /// The connection must be closed by the session itself during teardown,
    /// so the stream is wrapped with a guard the destroy path can fire to
    /// force the transport closed underneath the channel.
    pub async fn handle_stream(self: Arc<Self>, io: BoxedIo) {
        let guard = CancellationToken::new();
        let io: BoxedIo = Box::new(GuardedIo::new(io, guard.clone()));
        let _ = self.conn_guard.set(guard);
        self.run(io).await;
    }

    /// Serve an already-upgraded duplex stream (web-socket transport).
    ///
    /// Connection ownership passes wholly to the channel; there is no
    /// manual close step during teardown.
    pub async fn handle_ws(self: Arc<Self>, io: BoxedIo) {
        self.run(io).await;
    }

    /// Bind the RPC channel over `io`, then wait for a teardown trigger.
    async fn run(self: Arc<Self>, io: BoxedIo) {
        debug!(parent: &self.span, "binding rpc channel");
        let dispatcher: Arc<dyn RequestHandler> = Arc::new(Dispatcher {
            session: Arc::clone(&self),
        });
        let channel = self.channels.bind(io, dispatcher);
        let _ = self.channel.set(Arc::clone(&channel));

        select! {
            _ = self.handle.cancel.cancelled() => {
                info!(parent: &self.span, "session context cancelled");
            }
            _ = channel.closed() => {
                info!(parent: &self.span, "peer disconnected");
            }
        }
        self.destroy().await;
    }

    /// Route one inbound request to the application object, then run the
    /// responder's unanswered-request backstop.
    async fn dispatch(&self, channel: Arc<dyn RpcChannel>, request: Request) {
        let responder = Responder::new(Arc::clone(&channel), request.clone(), fresh_id());
        let cx = RpcContext {
            session: self.handle.clone(),
            channel,
            request,
            responder: responder.clone(),
        };
        self.app.rpc_handle(cx).await;
        responder.finalize().await;
    }

    /// Tear the session down: close the channel, force the raw connection
    /// closed (stream transport only), destroy the application object.
    ///
    /// Idempotent: concurrent callers race on one atomic flag and only the
    /// winner runs the steps. Every step is best-effort; failures are
    /// logged, never escalated.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(parent: &self.span, "destroying session");

        if let Some(channel) = self.channel.get() {
            debug!(parent: &self.span, "closing rpc channel");
            if let Err(err) = channel.close().await {
                debug!(parent: &self.span, %err, "error closing rpc channel");
            }
        }

        if let Some(guard) = self.conn_guard.get() {
            debug!(parent: &self.span, "force-closing client connection");
            guard.cancel();
        }

        debug!(parent: &self.span, "destroying application session");
        self.app.destroy().await;

        // Unblock anything still parked on the session context.
        self.handle.cancel.cancel();
        info!(parent: &self.span, "session destroyed");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Per-connection [`RequestHandler`]: routes every inbound request into the
/// session, one task per request when async dispatch is configured.
struct Dispatcher {
    session: Arc<Session>,
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle_request(self: Arc<Self>, channel: Arc<dyn RpcChannel>, request: Request) {
        if self.session.async_dispatch {
            let session = Arc::clone(&self.session);
            self.session.tasks.spawn(async move {
                session.dispatch(channel, request).await;
            });
        } else {
            self.session.dispatch(channel, request).await;
        }
    }
}

/// Byte-stream wrapper whose guard token forces the transport closed.
///
/// The channel owns the wrapped stream; firing the token makes every
/// subsequent (or pending) read and write fail, which the channel surfaces
/// as a disconnect. This is the stream transport's "close the connection
/// manually" teardown step.
struct GuardedIo {
    io: BoxedIo,
    guard: CancellationToken,
    cancelled: Pin<Box<dyn Future<Output = ()> + Send>>,
    dead: bool,
}

impl GuardedIo {
    fn new(io: BoxedIo, guard: CancellationToken) -> Self {
        let cancelled = Box::pin(guard.clone().cancelled_owned());
        Self {
            io,
            guard,
            cancelled,
            dead: false,
        }
    }

    fn aborted() -> io::Error {
        io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "connection closed by session teardown",
        )
    }
}

impl AsyncRead for GuardedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.dead && this.cancelled.as_mut().poll(cx).is_ready() {
            this.dead = true;
        }
        if this.dead {
            return Poll::Ready(Err(Self::aborted()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for GuardedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.dead || this.guard.is_cancelled() {
            this.dead = true;
            return Poll::Ready(Err(Self::aborted()));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.dead || this.guard.is_cancelled() {
            this.dead = true;
            return Poll::Ready(Err(Self::aborted()));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}
