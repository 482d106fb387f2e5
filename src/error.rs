use crate::types::ErrorPayload;

/// Errors surfaced by an RPC channel implementation.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The peer answered an outbound call with an error reply.
    #[error("rpc error {}", .0)]
    Rpc(ErrorPayload),

    /// The channel is no longer usable: the peer disconnected or the
    /// channel was torn down locally.
    #[error("channel closed")]
    Closed,

    /// Transport-level failure (dial, read, write, serialization).
    #[error("transport error: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),
}

impl ChannelError {
    /// Wrap an arbitrary failure as a transport error.
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(err))
    }
}

/// Errors creating a connection session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The application's session factory refused to create a per-session
    /// object (resource limits, draining, ...). No session is registered.
    #[error("session factory refused session")]
    Rejected(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SessionError {
    /// Wrap an application error as a factory refusal.
    pub fn rejected<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Rejected(Box::new(err))
    }
}

/// Errors establishing a shared subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// Dialing the upstream connection failed.
    #[error("upstream connect failed")]
    Connect(#[source] ChannelError),

    /// The upstream subscribe call itself failed.
    #[error("upstream subscribe call failed")]
    Call(#[source] ChannelError),
}
