//! The application-context contract.
//!
//! The embedding application supplies a [`SessionFactory`]; the server asks
//! it for one [`AppSession`] per accepted connection. Every inbound request
//! on that connection is routed to [`AppSession::rpc_handle`] with an
//! [`RpcContext`] bundle. The core never interprets request payloads; the
//! application owns all method semantics and is responsible for answering
//! through the bundled [`Responder`].

use crate::{
    channel::RpcChannel, error::SessionError, responder::Responder, types::Request,
};
use async_trait::async_trait;
use core::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Cloneable handle onto a connection session.
///
/// Handed to the application at session creation so it can identify the
/// session and request its teardown without holding the session itself.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub(crate) id: Arc<str>,
    pub(crate) cancel: CancellationToken,
}

impl SessionHandle {
    /// The session's opaque unique identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request teardown of the session. Idempotent; the session's handling
    /// task observes the cancellation and runs its one-shot destroy path.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }
}

/// Everything a handler needs to answer one inbound request.
pub struct RpcContext {
    /// Handle onto the session the request arrived on.
    pub session: SessionHandle,
    /// The channel the request arrived on.
    pub channel: Arc<dyn RpcChannel>,
    /// The request itself.
    pub request: Request,
    /// Responder enforcing exactly-once reply semantics for this request.
    pub responder: Responder,
}

impl fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcContext")
            .field("session", &self.session.id())
            .field("method", &self.request.method)
            .finish_non_exhaustive()
    }
}

/// Creates one application session per accepted connection.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Produce the per-session application object. Returning an error
    /// refuses the connection; no session is registered.
    async fn create_session(
        &self,
        handle: SessionHandle,
    ) -> Result<Box<dyn AppSession>, SessionError>;
}

/// The application's per-connection object.
#[async_trait]
pub trait AppSession: Send + Sync {
    /// Single entry point for inbound requests on this session's
    /// connection. The implementation replies through `cx.responder`; a
    /// request left unanswered is defaulted to a generic internal-error
    /// reply when this method returns.
    async fn rpc_handle(&self, cx: RpcContext);

    /// Release application resources. Invoked exactly once, as the final
    /// step of session teardown.
    async fn destroy(&self);
}
