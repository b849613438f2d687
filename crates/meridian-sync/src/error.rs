//! Error types for entity synchronization.

use meridian_net::ServerId;

/// Hard failures from a synchronization pass. Each one means the client's
/// bookkeeping has diverged from the server and the session must end.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The id is registered but no live replica entity backs it.
    #[error(
        "received {kind} for entity {id}: the id is registered but resolves to no local entity ({detail})"
    )]
    UnresolvedRegistered {
        /// Message kind that hit the inconsistency.
        kind: &'static str,
        /// Server id in the message.
        id: ServerId,
        /// Id-map diagnostics for `id`.
        detail: String,
    },

    /// The client does not implement this synchronization message.
    #[error("{kind} is not supported on the client (entity {entity:?})")]
    Unsupported {
        /// Message kind.
        kind: &'static str,
        /// Target entity, if the message names one.
        entity: Option<ServerId>,
    },
}

/// A behavior-tree component refused a state change. The component is left
/// exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The move is not an edge of the tree's state machine.
    #[error("{tree}: cannot transition from {from} to {to}")]
    Invalid {
        tree: &'static str,
        from: &'static str,
        to: &'static str,
    },
}
