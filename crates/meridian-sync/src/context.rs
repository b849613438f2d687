//! Per-connection synchronization state.
//!
//! A [`SynchronizationContext`] is built when a connection is established
//! and cleared when it ends. It bundles the replica world and the manager
//! so handlers reach both through one explicit value.

use std::sync::Arc;

use meridian_config::SyncConfig;
use meridian_net::ServerId;

use crate::error::SyncError;
use crate::field_table::FieldTable;
use crate::manager::{PassReport, SyncManager};
use crate::replica::ReplicaWorld;

/// The replica world plus the synchronization manager feeding it.
pub struct SynchronizationContext {
    pub replica: ReplicaWorld,
    pub sync: Arc<SyncManager>,
}

impl SynchronizationContext {
    pub fn new(table: Arc<FieldTable>, config: SyncConfig) -> Self {
        Self {
            replica: ReplicaWorld::new(),
            sync: Arc::new(SyncManager::new(table, config)),
        }
    }

    /// Run one synchronization pass against the replica world.
    pub fn process(&mut self) -> Result<PassReport, SyncError> {
        self.sync.process_messages(&mut self.replica)
    }

    /// Whether `id` was destroyed recently enough that its messages are
    /// suppressed.
    pub fn is_tombstoned(&self, id: ServerId) -> bool {
        self.sync.is_tombstoned(id)
    }

    /// Drop every replica, id mapping, queued message and tombstone.
    pub fn clear(&mut self) {
        self.replica.clear();
        self.sync.clear();
    }
}
