use serde::de::DeserializeOwned;
use serde_json::value::RawValue;

/// An object that can be sent in the body of an RPC message.
///
/// Blanket-implemented for every [`serde::Serialize`] type satisfying the
/// required bounds. The [`into_raw_value`] method consumes `self` and
/// produces a serialized [`RawValue`], which is what the channel contract
/// traffics in.
///
/// [`into_raw_value`]: RpcSend::into_raw_value
pub trait RpcSend: Send + Sync + Unpin {
    /// Consume this value and serialize it into a [`RawValue`].
    fn into_raw_value(self) -> serde_json::Result<Box<RawValue>>;
}

impl<T> RpcSend for T
where
    T: serde::Serialize + Send + Sync + Unpin,
{
    fn into_raw_value(self) -> serde_json::Result<Box<RawValue>> {
        serde_json::value::to_raw_value(&self)
    }
}

/// An object that can be received in the body of an RPC message.
///
/// Blanket-implemented for every qualifying type. The `'static` bound keeps
/// received values free of borrows into the deserialization buffer, which
/// keeps handler signatures simple.
pub trait RpcRecv: DeserializeOwned + Send + Sync + Unpin + 'static {}

impl<T> RpcRecv for T where T: DeserializeOwned + Send + Sync + Unpin + 'static {}
