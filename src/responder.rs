//! Exactly-once reply guard for inbound requests.

use crate::{
    channel::RpcChannel,
    error::ChannelError,
    primitives::{RpcRecv, RpcSend},
    types::{ErrorPayload, Request, INTERNAL_ERROR_CODE},
};
use core::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, info_span, warn, Span};

/// Guards exactly-once reply semantics for one inbound request.
///
/// Cloneable; all clones share one answered flag. The dispatch glue keeps a
/// clone and runs [`finalize`] when the handling routine returns, so a
/// request that was never answered still receives exactly one reply: the
/// generic internal error with code [`INTERNAL_ERROR_CODE`].
///
/// Replying twice is a caller error: the second reply targets an
/// already-finalized request and its effect is transport-defined. Correct
/// handlers reply at most once.
///
/// [`finalize`]: Responder::finalize
#[derive(Clone)]
pub struct Responder {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Arc<dyn RpcChannel>,
    request: Request,
    span: Span,
    answered: AtomicBool,
}

impl Responder {
    pub(crate) fn new(channel: Arc<dyn RpcChannel>, request: Request, call_id: String) -> Self {
        let span = info_span!("call", id = %call_id, method = %request.method);
        Self {
            inner: Arc::new(Inner {
                channel,
                request,
                span,
                answered: AtomicBool::new(false),
            }),
        }
    }

    /// Whether a reply (success or error) has been sent for this request.
    pub fn answered(&self) -> bool {
        self.inner.answered.load(Ordering::SeqCst)
    }

    /// Send a success reply and mark the request answered.
    pub async fn reply<T: RpcSend>(&self, result: T) -> Result<(), ChannelError> {
        let rv = result.into_raw_value().map_err(ChannelError::transport)?;
        self.inner.answered.store(true, Ordering::SeqCst);
        self.inner.channel.reply(&self.inner.request.id, rv).await
    }

    /// Send an error reply with `code` and `message`; marks answered.
    pub async fn reply_error(
        &self,
        code: i64,
        message: impl Into<String> + Send,
    ) -> Result<(), ChannelError> {
        self.send_error(ErrorPayload::new(code, message)).await
    }

    /// Log `message` to the call's span, then send it as an error reply.
    pub async fn log_reply_error(
        &self,
        code: i64,
        message: impl Into<String> + Send,
    ) -> Result<(), ChannelError> {
        let message = message.into();
        self.inner
            .span
            .in_scope(|| warn!(code, %message, "request failed"));
        self.send_error(ErrorPayload::new(code, message)).await
    }

    /// Deserialize the request params into `T`.
    ///
    /// On failure the error is logged and a code-500 error reply is sent;
    /// `None` tells the caller to stop processing the request.
    pub async fn parse_params<T: RpcRecv>(&self) -> Option<T> {
        match serde_json::from_str(self.inner.request.params.get()) {
            Ok(value) => Some(value),
            Err(err) => {
                self.inner
                    .span
                    .in_scope(|| debug!(%err, "request params did not deserialize"));
                if let Err(err) = self
                    .reply_error(INTERNAL_ERROR_CODE, "unparseable parameters")
                    .await
                {
                    self.inner
                        .span
                        .in_scope(|| debug!(%err, "failed to send parameter error reply"));
                }
                None
            }
        }
    }

    /// Backstop run when the handling routine for this request returns: a
    /// request that was never answered gets the generic internal-error
    /// reply. The built-in dispatch glue calls this unconditionally; custom
    /// dispatchers must do the same.
    pub async fn finalize(&self) {
        if self.answered() {
            return;
        }
        self.inner
            .span
            .in_scope(|| warn!("handler returned without replying; sending default error"));
        if let Err(err) = self.send_error(ErrorPayload::internal_error()).await {
            self.inner
                .span
                .in_scope(|| debug!(%err, "failed to send default error reply"));
        }
    }

    async fn send_error(&self, payload: ErrorPayload) -> Result<(), ChannelError> {
        self.inner.answered.store(true, Ordering::SeqCst);
        self.inner
            .channel
            .reply_error(&self.inner.request.id, payload)
            .await
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("method", &self.inner.request.method)
            .field("answered", &self.answered())
            .finish_non_exhaustive()
    }
}
