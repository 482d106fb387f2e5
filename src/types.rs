//! Wire-adjacent types shared by the channel contract and the core.

use core::fmt;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Error code carried by the generic internal-error reply, and by the
/// default reply sent for requests the handler never answered.
pub const INTERNAL_ERROR_CODE: i64 = 500;

/// One inbound RPC request as surfaced by a channel implementation.
///
/// All three fields are opaque here: the id is echoed back verbatim in the
/// reply, and the params are handed untouched to the application handler.
/// Framing, batching, and id correlation live in the channel collaborator.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request id, echoed back in the reply.
    pub id: Box<RawValue>,
    /// Method name.
    pub method: String,
    /// Raw request parameters.
    pub params: Box<RawValue>,
}

/// An error reply payload: integer code plus free-text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Integer error code surfaced to the caller.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl ErrorPayload {
    /// Build a payload from a code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The generic internal-error payload (code 500).
    pub fn internal_error() -> Self {
        Self::new(INTERNAL_ERROR_CODE, "internal error")
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
