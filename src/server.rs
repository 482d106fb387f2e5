//! Server assembly and listener supervision.
//!
//! The server owns three supervised units of work: a supervisor, a raw
//! stream listener, and a web-socket listener. The supervisor ticks on a
//! fixed interval and (re)starts either listener whenever it reports
//! stopped, which makes the listening loops resilient to bind and accept
//! failures: a listener that dies simply gets restarted one interval later.

use crate::{
    app::SessionFactory,
    channel::{BoxedIo, ChannelFactory},
    id::fresh_id,
    session::Session,
    worker::{Worker, WorkerHandle},
    ws,
};
use core::fmt;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select, time,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, info_span, warn, Span};

/// Supervisor tick and listener retry backoff.
const RESTART_INTERVAL: Duration = Duration::from_secs(1);

/// Default HTTP path the web-socket listener upgrades on.
pub const DEFAULT_WS_PATH: &str = "/socket";

/// Server configuration.
pub struct ServerConfig {
    /// Listen address for the raw stream transport, e.g. `"127.0.0.1:9000"`.
    pub stream_addr: String,
    /// Listen address for the web-socket transport.
    pub ws_addr: String,
    /// HTTP path the web-socket listener upgrades on; see
    /// [`DEFAULT_WS_PATH`].
    pub ws_path: String,
    /// Dispatch each inbound request on its own task instead of serially.
    pub async_dispatch: bool,
    /// When set, every accepted connection on either transport negotiates
    /// TLS as a server before RPC framing begins.
    pub tls: Option<TlsAcceptor>,
    /// Application session factory.
    pub sessions: Arc<dyn SessionFactory>,
    /// Codec collaborator binding RPC channels over accepted streams.
    pub channels: Arc<dyn ChannelFactory>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("stream_addr", &self.stream_addr)
            .field("ws_addr", &self.ws_addr)
            .field("ws_path", &self.ws_path)
            .field("async_dispatch", &self.async_dispatch)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// The dual-transport RPC server.
///
/// Cloning is cheap and clones share the same server.
#[derive(Debug, Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    supervisor: Worker,
    stream: Worker,
    ws: Worker,
    /// Handling task per accepted connection, on either transport.
    connections: TaskTracker,
    /// Parent for every session's cancellation context.
    conn_cancel: CancellationToken,
    span: Span,
}

impl fmt::Debug for ServerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server from its configuration. Nothing runs until
    /// [`Server::start`].
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                supervisor: Worker::new("supervisor"),
                stream: Worker::new("stream-listener"),
                ws: Worker::new("ws-listener"),
                connections: TaskTracker::new(),
                conn_cancel: CancellationToken::new(),
                span: info_span!("server"),
            }),
        }
    }

    /// Launch the supervisor, which starts (and keeps restarting) both
    /// listeners. Call once, from within a tokio runtime.
    pub fn start(&self) {
        info!(parent: &self.inner.span, "server starting");
        let inner = Arc::clone(&self.inner);
        self.inner.supervisor.start(move |h| supervise(inner, h));
    }

    /// Stop all workers, cancel live sessions, and wait for every handling
    /// task to drain.
    pub async fn shutdown(&self) {
        info!(parent: &self.inner.span, "server shutting down");
        self.inner.supervisor.request_stop();
        self.inner.stream.request_stop();
        self.inner.ws.request_stop();
        self.inner.conn_cancel.cancel();
        self.inner.supervisor.wait().await;
        self.inner.stream.wait().await;
        self.inner.ws.wait().await;
        self.inner.connections.close();
        self.inner.connections.wait().await;
        info!(parent: &self.inner.span, "server stopped");
    }

    /// Placeholder teardown hook. Releases nothing; callers that need the
    /// listeners and sessions gone use [`Server::shutdown`].
    pub fn destroy(&self) {}
}

/// Supervisor body: restart any listener found stopped, once per tick.
async fn supervise(inner: Arc<ServerInner>, h: WorkerHandle) {
    h.set_working();
    info!("supervisor running");
    let mut tick = time::interval(RESTART_INTERVAL);
    loop {
        select! {
            _ = h.stop().cancelled() => break,
            _ = tick.tick() => {
                if inner.stream.is_stopped() {
                    info!("stream listener is stopped; starting");
                    let body = Arc::clone(&inner);
                    inner.stream.start(move |wh| stream_listen(body, wh));
                }
                if inner.ws.is_stopped() {
                    info!("ws listener is stopped; starting");
                    let body = Arc::clone(&inner);
                    inner.ws.start(move |wh| ws_listen(body, wh));
                }
            }
        }
    }
    h.set_stopping();
    info!("supervisor exiting");
}

/// Stream listener body: bind, then accept in a loop, handing each
/// connection to an independent handling task.
async fn stream_listen(inner: Arc<ServerInner>, h: WorkerHandle) {
    let addr = &inner.config.stream_addr;
    info!(%addr, "stream listener binding");
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            // Exits the working state; the supervisor restarts us after the
            // poll interval.
            error!(%err, %addr, "stream listener bind failed");
            return;
        }
    };
    if let Ok(local) = listener.local_addr() {
        info!(%local, "stream listener accepting");
    }
    h.set_working();

    loop {
        if h.stop().is_cancelled() {
            break;
        }

        let session = match Session::create(
            &inner.config.sessions,
            Arc::clone(&inner.config.channels),
            inner.config.async_dispatch,
            fresh_id(),
            &inner.conn_cancel,
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                warn!(%err, "session construction refused");
                time::sleep(RESTART_INTERVAL).await;
                continue;
            }
        };

        let (conn, peer) = select! {
            _ = h.stop().cancelled() => {
                session.destroy().await;
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "accept failed");
                    session.destroy().await;
                    time::sleep(RESTART_INTERVAL).await;
                    continue;
                }
            }
        };
        debug!(session = session.id(), %peer, "accepted stream connection");

        let io: BoxedIo = match &inner.config.tls {
            Some(acceptor) => {
                debug!(session = session.id(), "tls handshake");
                match acceptor.accept(conn).await {
                    Ok(tls) => Box::new(tls),
                    Err(err) => {
                        warn!(session = session.id(), %err, "tls handshake failed");
                        session.destroy().await;
                        continue;
                    }
                }
            }
            None => Box::new(conn),
        };

        // The accept loop never blocks on a connection's lifetime.
        inner.connections.spawn(async move {
            session.handle_stream(io).await;
        });
    }
    h.set_stopping();
    info!("stream listener exiting");
}

/// Web-socket listener body: bind, accept, and hand each connection to an
/// independent task that runs its TLS negotiation and handshake.
async fn ws_listen(inner: Arc<ServerInner>, h: WorkerHandle) {
    'serve: loop {
        if h.stop().is_cancelled() {
            break;
        }
        let addr = &inner.config.ws_addr;
        info!(%addr, "ws listener binding");
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%err, %addr, "ws listener bind failed; retrying");
                select! {
                    _ = h.stop().cancelled() => break 'serve,
                    _ = time::sleep(RESTART_INTERVAL) => continue 'serve,
                }
            }
        };
        if let Ok(local) = listener.local_addr() {
            info!(%local, path = %inner.config.ws_path, "ws listener accepting");
        }
        h.set_working();

        loop {
            let (conn, peer) = select! {
                _ = h.stop().cancelled() => break 'serve,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "ws accept failed");
                        time::sleep(RESTART_INTERVAL).await;
                        continue;
                    }
                }
            };
            let conn_inner = Arc::clone(&inner);
            inner.connections.spawn(async move {
                ws_serve_conn(conn_inner, conn, peer).await;
            });
        }
    }
    h.set_stopping();
    info!("ws listener exiting");
}

/// Negotiate TLS when configured, then upgrade and run the session.
async fn ws_serve_conn(inner: Arc<ServerInner>, conn: TcpStream, peer: SocketAddr) {
    match inner.config.tls.clone() {
        Some(acceptor) => {
            debug!(%peer, "ws tls handshake");
            match acceptor.accept(conn).await {
                Ok(tls) => ws_upgrade_and_run(inner, tls, peer).await,
                Err(err) => warn!(%peer, %err, "ws tls handshake failed"),
            }
        }
        None => ws_upgrade_and_run(inner, conn, peer).await,
    }
}

async fn ws_upgrade_and_run<S>(inner: Arc<ServerInner>, io: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let stream = match ws::upgrade(io, &inner.config.ws_path).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(%peer, %err, "ws handshake failed");
            return;
        }
    };

    let session = match Session::create(
        &inner.config.sessions,
        Arc::clone(&inner.config.channels),
        inner.config.async_dispatch,
        fresh_id(),
        &inner.conn_cancel,
    )
    .await
    {
        Ok(session) => session,
        Err(err) => {
            warn!(%peer, %err, "session construction refused");
            return;
        }
    };
    debug!(session = session.id(), %peer, "accepted ws connection");
    session.handle_ws(Box::new(stream)).await;
}
