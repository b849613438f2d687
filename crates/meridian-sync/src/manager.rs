//! Entity synchronization manager.
//!
//! Behavior-tree messages are pushed into a pending queue from the router's
//! sync phase and applied once per simulation tick by
//! [`SyncManager::process_messages`]. A message whose target entity is not
//! known yet stays queued and its bounce count grows by one per pass. A
//! message whose target was destroyed is discarded without touching any
//! component. A target id that is registered but resolves to no live entity
//! means the bookkeeping has diverged, and is a hard failure unless
//! [`UnresolvedPolicy::Requeue`] is configured.
//!
//! The pending queue, bounce table and tombstone set share one mutex, held
//! for each push and for the whole of each pass.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use meridian_config::{SyncConfig, UnresolvedPolicy};
use meridian_net::ServerId;
use meridian_net::messages::SyncMessage;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::SyncError;
use crate::field_table::{ApplyOutcome, FieldTable};
use crate::replica::ReplicaGraph;
use crate::tombstone::TombstoneSet;
use crate::trees::describe_field;

/// Identifies one queued message for bounce accounting.
pub type MessageKey = u64;

/// Counts from one [`SyncManager::process_messages`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Field writes and transitions that reached a component.
    pub applied: usize,
    /// Messages dropped because their target is tombstoned.
    pub discarded: usize,
    /// Invalid transitions, unknown fields and malformed values.
    pub rejected: usize,
    /// Consumed without effect: component absent or a client-bound request.
    pub ignored: usize,
    /// Still queued after the pass.
    pub pending: usize,
    /// Tombstones evicted at the start of the pass.
    pub expired_tombstones: usize,
}

struct Pending {
    key: MessageKey,
    msg: SyncMessage,
}

#[derive(Default)]
struct SyncState {
    pending: VecDeque<Pending>,
    bounces: FxHashMap<MessageKey, u32>,
    warned: FxHashSet<MessageKey>,
    tombstones: TombstoneSet,
    next_key: MessageKey,
    passes: u64,
}

impl SyncState {
    fn forget(&mut self, key: MessageKey) {
        self.bounces.remove(&key);
        self.warned.remove(&key);
    }
}

/// What to do with one message after trying it.
enum Disposition {
    Done,
    Keep,
}

/// Applies server behavior-tree updates to replica components.
pub struct SyncManager {
    state: Mutex<SyncState>,
    table: Arc<FieldTable>,
    config: SyncConfig,
}

impl SyncManager {
    pub fn new(table: Arc<FieldTable>, config: SyncConfig) -> Self {
        Self {
            state: Mutex::new(SyncState::default()),
            table,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn field_table(&self) -> &Arc<FieldTable> {
        &self.table
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message for the next pass.
    pub fn push_message(&self, msg: SyncMessage) -> MessageKey {
        let mut state = self.lock();
        let key = state.next_key;
        state.next_key += 1;
        state.pending.push_back(Pending { key, msg });
        key
    }

    /// Record that the server destroyed `id`.
    pub fn add_tombstone(&self, id: ServerId) {
        self.lock().tombstones.insert(id);
    }

    pub fn is_tombstoned(&self, id: ServerId) -> bool {
        self.lock().tombstones.contains(id)
    }

    /// Remove a tombstone because the server re-created `id`.
    pub fn eject_tombstone(&self, id: ServerId) -> bool {
        self.lock().tombstones.eject(id)
    }

    /// Passes since `id` was tombstoned.
    pub fn tombstone_age(&self, id: ServerId) -> Option<u32> {
        self.lock().tombstones.age(id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.lock().tombstones.len()
    }

    /// Consecutive unresolved passes of a queued message.
    pub fn bounce_count(&self, key: MessageKey) -> Option<u32> {
        self.lock().bounces.get(&key).copied()
    }

    /// Number of messages tracked in the bounce table.
    pub fn bouncing(&self) -> usize {
        self.lock().bounces.len()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Passes run since creation or the last [`clear`](Self::clear).
    pub fn passes(&self) -> u64 {
        self.lock().passes
    }

    /// Forget all queued messages, bounce counts and tombstones.
    pub fn clear(&self) {
        let mut state = self.lock();
        let next_key = state.next_key;
        *state = SyncState {
            next_key,
            ..SyncState::default()
        };
    }

    /// Run one pass over the pending queue against `graph`.
    ///
    /// On a hard failure the failing message and everything after it stay
    /// queued in order, except an unsupported message, which is consumed.
    /// Tree attach and detach are only unsupported once their target
    /// resolves; before that they bounce like any other message.
    pub fn process_messages<G: ReplicaGraph>(
        &self,
        graph: &mut G,
    ) -> Result<PassReport, SyncError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.passes += 1;

        let mut report = PassReport {
            expired_tombstones: state
                .tombstones
                .age_all(self.config.tombstone_retention_passes),
            ..PassReport::default()
        };

        let mut queue = std::mem::take(&mut state.pending);
        let mut kept = VecDeque::with_capacity(queue.len());

        while let Some(item) = queue.pop_front() {
            match self.process_one(state, graph, &item, &mut report) {
                Ok(Disposition::Done) => state.forget(item.key),
                Ok(Disposition::Keep) => kept.push_back(item),
                Err(err) => {
                    if matches!(err, SyncError::UnresolvedRegistered { .. }) {
                        kept.push_back(item);
                    } else {
                        state.forget(item.key);
                    }
                    kept.append(&mut queue);
                    state.pending = kept;
                    return Err(err);
                }
            }
        }

        report.pending = kept.len();
        state.pending = kept;
        if report.applied + report.discarded + report.rejected > 0 || report.pending > 0 {
            tracing::trace!(?report, "Synchronization pass");
        }
        Ok(report)
    }

    fn process_one<G: ReplicaGraph>(
        &self,
        state: &mut SyncState,
        graph: &mut G,
        item: &Pending,
        report: &mut PassReport,
    ) -> Result<Disposition, SyncError> {
        let msg = &item.msg;
        let id = match msg {
            SyncMessage::LoadScene { .. } => {
                return Err(SyncError::Unsupported {
                    kind: msg.kind_name(),
                    entity: None,
                });
            }
            SyncMessage::UpdateState { target, .. } | SyncMessage::Transition { target, .. } => {
                target.entity_id
            }
            SyncMessage::RequestAction { entity_id, .. }
            | SyncMessage::AttachTree { entity_id, .. }
            | SyncMessage::DetachTree { entity_id, .. } => *entity_id,
        };

        if state.tombstones.contains(id) {
            report.discarded += 1;
            return Ok(Disposition::Done);
        }

        let registered = graph.contains_id(id);
        let Some(entity) = graph.resolve(id) else {
            if registered {
                let detail = format!("{}; {}", graph.describe_id(id), graph.describe_status());
                match self.config.unresolved_registered {
                    UnresolvedPolicy::Fail => {
                        return Err(SyncError::UnresolvedRegistered {
                            kind: msg.kind_name(),
                            id,
                            detail,
                        });
                    }
                    UnresolvedPolicy::Requeue => {
                        tracing::error!(
                            kind = msg.kind_name(),
                            %id,
                            %detail,
                            "Registered id resolves to no local entity; keeping message queued"
                        );
                    }
                }
            }
            self.bounce(state, graph, item);
            return Ok(Disposition::Keep);
        };

        let table = &self.table;
        match msg {
            SyncMessage::UpdateState { target, value } => {
                let outcome = table.apply_update(graph.world_mut(), entity, *target, value);
                self.record(outcome, msg, report);
            }
            SyncMessage::Transition { target, state: next } => {
                let outcome = table.apply_transition(graph.world_mut(), entity, *target, *next);
                self.record(outcome, msg, report);
            }
            SyncMessage::RequestAction { .. } => {
                tracing::debug!(%id, "Ignoring client-bound action request");
                report.ignored += 1;
            }
            SyncMessage::AttachTree { .. }
            | SyncMessage::DetachTree { .. }
            | SyncMessage::LoadScene { .. } => {
                return Err(SyncError::Unsupported {
                    kind: msg.kind_name(),
                    entity: Some(id),
                });
            }
        }
        Ok(Disposition::Done)
    }

    fn record(&self, outcome: ApplyOutcome, msg: &SyncMessage, report: &mut PassReport) {
        let Some(target) = msg.target() else {
            return;
        };
        match outcome {
            ApplyOutcome::Applied => report.applied += 1,
            ApplyOutcome::ComponentAbsent => report.ignored += 1,
            ApplyOutcome::Rejected(err) => {
                tracing::warn!(entity = %target.entity_id, error = %err, "Transition rejected");
                report.rejected += 1;
            }
            other => {
                tracing::warn!(
                    kind = msg.kind_name(),
                    entity = %target.entity_id,
                    field = %describe_field(&self.table, target.tree_id, target.field_id),
                    outcome = ?other,
                    "Synchronization message not applied"
                );
                report.rejected += 1;
            }
        }
    }

    fn bounce<G: ReplicaGraph>(&self, state: &mut SyncState, graph: &G, item: &Pending) {
        let count = state.bounces.entry(item.key).or_insert(0);
        *count += 1;
        let count = *count;
        if count <= self.config.bounce_warning_threshold || !state.warned.insert(item.key) {
            return;
        }

        let msg = &item.msg;
        let id = msg.entity_id();
        let (tree, field) = match msg {
            SyncMessage::UpdateState { target, .. } | SyncMessage::Transition { target, .. } => {
                (Some(target.tree_id.0), Some(target.field_id.0))
            }
            SyncMessage::RequestAction { tree_id, .. }
            | SyncMessage::AttachTree { tree_id, .. }
            | SyncMessage::DetachTree { tree_id, .. } => (Some(tree_id.0), None),
            SyncMessage::LoadScene { .. } => (None, None),
        };
        let server_type = id.and_then(|id| graph.server_type(id));
        let registered = id.is_some_and(|id| graph.contains_id(id));
        let resolved = id.and_then(|id| graph.resolve(id));
        let tombstone_age = id.and_then(|id| state.tombstones.age(id));
        tracing::warn!(
            bounces = count,
            threshold = self.config.bounce_warning_threshold,
            kind = msg.kind_name(),
            entity = ?id.map(|id| id.0),
            server_type = ?server_type,
            registered,
            resolved = ?resolved,
            tree = ?tree,
            field = ?field,
            tombstone_age = ?tombstone_age,
            "Synchronization message keeps bouncing"
        );
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
