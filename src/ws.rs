//! Web-socket transport edge.
//!
//! Performs the server-side handshake on the configured path (any other
//! path is rejected during the handshake) and adapts the resulting
//! message stream into the duplex byte stream the channel factory expects,
//! so both transports meet the codec collaborator at the same seam.

use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        protocol::Message,
        Error as WsError,
    },
    WebSocketStream,
};
use tracing::debug;

/// Accept a web-socket handshake on `path`, rejecting every other route
/// with a 404 before the upgrade completes.
pub(crate) async fn upgrade<S>(io: S, path: &str) -> Result<WsByteStream<S>, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let expected = path.to_owned();
    let callback = move |req: &Request, resp: Response| {
        if req.uri().path() == expected {
            Ok(resp)
        } else {
            debug!(path = %req.uri().path(), "rejecting ws handshake on unknown route");
            let mut deny = ErrorResponse::new(Some("no such route".into()));
            *deny.status_mut() = StatusCode::NOT_FOUND;
            Err(deny)
        }
    };
    let ws = accept_hdr_async(io, callback).await?;
    Ok(WsByteStream::new(ws))
}

/// Adapter presenting a web-socket as `AsyncRead + AsyncWrite`.
///
/// Inbound text and binary payloads are surfaced as a byte stream; each
/// write becomes one binary message. A close frame or transport error
/// latches the read side into EOF.
pub(crate) struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
    complete: bool,
}

impl<S> WsByteStream<S> {
    pub(crate) fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
            complete: false,
        }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                let chunk = this.read_buf.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            if this.complete {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(payload))) => this.read_buf = payload,
                Some(Ok(Message::Text(payload))) => this.read_buf = payload.into(),
                Some(Ok(Message::Close(_))) => this.complete = true,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    this.complete = true;
                    return Poll::Ready(Err(io::Error::other(err)));
                }
                None => this.complete = true,
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(err) = ready!(Pin::new(&mut this.inner).poll_ready(cx)) {
            return Poll::Ready(Err(io::Error::other(err)));
        }
        if let Err(err) = Pin::new(&mut this.inner).start_send(Message::binary(buf.to_vec())) {
            return Poll::Ready(Err(io::Error::other(err)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
