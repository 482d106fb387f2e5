use uuid::Uuid;

/// Produce a globally unique opaque identifier.
///
/// Session ids, unsubscribe tokens, and per-call/per-delivery ids are all
/// minted here. Callers must treat the value as opaque; only equality is
/// meaningful.
pub fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}
