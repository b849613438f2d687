//! Client-side entity state reconciliation.
//!
//! Server behavior-tree messages are applied to a local `bevy_ecs` replica
//! world, tolerating messages that arrive before their entity exists or
//! after it was destroyed. See [`SyncManager`] for the reconciliation rules
//! and [`ClientSession`] for how it is driven from the network.

pub mod context;
pub mod error;
pub mod field_table;
pub mod handlers;
pub mod id_map;
pub mod manager;
pub mod replica;
pub mod session;
pub mod tombstone;
pub mod trees;

pub use context::SynchronizationContext;
pub use error::{SyncError, TransitionError};
pub use field_table::{ApplyOutcome, FieldEntry, FieldTable, FromFieldValue, TransitionState};
pub use handlers::{ChunkSink, EntityHandler, SynchronizationHandler, TerrainHandler};
pub use id_map::EntityIdMap;
pub use manager::{MessageKey, PassReport, SyncManager};
pub use replica::{ReplicaGraph, ReplicaWorld};
pub use session::{ClientSession, default_router};
pub use tombstone::TombstoneSet;
pub use trees::default_field_table;
