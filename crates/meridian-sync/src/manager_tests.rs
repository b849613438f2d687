use std::sync::Arc;

use bevy_ecs::entity::Entity;
use meridian_config::{SyncConfig, UnresolvedPolicy};
use meridian_net::messages::{CreateEntity, FieldTarget, SyncMessage};
use meridian_net::{FieldValue, ServerId, TreeId};

use super::*;
use crate::replica::{CATEGORY_CREATURE, CATEGORY_ITEM, ReplicaGraph, ReplicaWorld};
use crate::trees::ids::*;
use crate::trees::{AttackState, AttackTree, JumpState, JumpTree, default_field_table};

fn config() -> SyncConfig {
    SyncConfig {
        bounce_warning_threshold: 3,
        tombstone_retention_passes: 5,
        unresolved_registered: UnresolvedPolicy::Fail,
    }
}

fn manager(config: SyncConfig) -> SyncManager {
    SyncManager::new(Arc::new(default_field_table()), config)
}

fn spawn(replica: &mut ReplicaWorld, id: i32, category: i32) -> Entity {
    replica.spawn_replica(&CreateEntity {
        entity_id: ServerId(id),
        category,
        subtype: "human".into(),
        creature_template: "villager".into(),
        position: [0.0; 3],
        rotation: [0.0, 0.0, 0.0, 1.0],
    })
}

fn jump_frame(id: i32, frame: i32) -> SyncMessage {
    SyncMessage::UpdateState {
        target: FieldTarget {
            entity_id: ServerId(id),
            tree_id: JUMP_TREE,
            field_id: JUMP_CURRENT_FRAME,
        },
        value: FieldValue::Int(frame),
    }
}

fn jump_transition(id: i32, state: JumpState) -> SyncMessage {
    SyncMessage::Transition {
        target: FieldTarget {
            entity_id: ServerId(id),
            tree_id: JUMP_TREE,
            field_id: JUMP_STATE,
        },
        state: state.as_short(),
    }
}

fn jump(replica: &ReplicaWorld, entity: Entity) -> JumpTree {
    replica
        .world()
        .get::<JumpTree>(entity)
        .cloned()
        .expect("creature has a jump tree")
}

#[test]
fn test_update_applies_to_resolved_entity() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let e = spawn(&mut replica, 42, CATEGORY_CREATURE);

    sync.push_message(jump_frame(42, 7));
    let report = sync.process_messages(&mut replica).unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.pending, 0);
    assert_eq!(sync.pending_len(), 0);
    assert_eq!(jump(&replica, e).current_frame, 7);
}

#[test]
fn test_unknown_entity_bounces_each_pass() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();

    let key = sync.push_message(jump_frame(99, 1));
    sync.process_messages(&mut replica).unwrap();
    assert_eq!(sync.bounce_count(key), Some(1));
    assert_eq!(sync.pending_len(), 1);

    // Well past the warning threshold: still no error, still queued.
    for _ in 0..9 {
        let report = sync.process_messages(&mut replica).unwrap();
        assert_eq!(report.pending, 1);
    }
    assert_eq!(sync.bounce_count(key), Some(10));
    assert_eq!(sync.bouncing(), 1);
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

impl CapturedLog {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_bounce_warning_fires_once_past_threshold() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let log = CapturedLog::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let log = log.clone();
            move || log.clone()
        })
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();

    let key = sync.push_message(jump_frame(99, 1));
    tracing::subscriber::with_default(subscriber, || {
        for pass in 1..=3 {
            sync.process_messages(&mut replica).unwrap();
            assert_eq!(sync.bounce_count(key), Some(pass));
        }
        assert!(!log.contents().contains("keeps bouncing"));

        for _ in 0..7 {
            sync.process_messages(&mut replica).unwrap();
        }
    });

    let output = log.contents();
    assert_eq!(output.matches("keeps bouncing").count(), 1);
    assert!(output.contains("bounces=4"));
    assert_eq!(sync.bounce_count(key), Some(10));
}

#[test]
fn test_bouncing_message_is_discarded_once_tombstoned() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();

    let key = sync.push_message(jump_frame(13, 1));
    for _ in 0..4 {
        sync.process_messages(&mut replica).unwrap();
    }
    assert_eq!(sync.bounce_count(key), Some(4));

    // Destroyed before it was ever created here.
    sync.add_tombstone(ServerId(13));
    let report = sync.process_messages(&mut replica).unwrap();

    assert_eq!(report.discarded, 1);
    assert_eq!(report.pending, 0);
    assert_eq!(sync.pending_len(), 0);
    assert_eq!(sync.bouncing(), 0);
    assert_eq!(sync.bounce_count(key), None);
}

#[test]
fn test_bounced_message_applies_once_entity_arrives() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();

    let key = sync.push_message(jump_frame(5, 12));
    sync.process_messages(&mut replica).unwrap();
    sync.process_messages(&mut replica).unwrap();
    assert_eq!(sync.bounce_count(key), Some(2));

    let e = spawn(&mut replica, 5, CATEGORY_CREATURE);
    let report = sync.process_messages(&mut replica).unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(sync.pending_len(), 0);
    assert_eq!(sync.bounce_count(key), None);
    assert_eq!(sync.bouncing(), 0);
    assert_eq!(jump(&replica, e).current_frame, 12);
}

#[test]
fn test_tombstoned_message_is_discarded() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let e = spawn(&mut replica, 7, CATEGORY_CREATURE);
    sync.add_tombstone(ServerId(7));

    sync.push_message(jump_frame(7, 3));
    let report = sync.process_messages(&mut replica).unwrap();

    assert_eq!(report.discarded, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(sync.pending_len(), 0);
    assert_eq!(jump(&replica, e).current_frame, 0);
}

#[test]
fn test_tombstone_expires_after_retention() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    sync.add_tombstone(ServerId(8));
    assert_eq!(sync.tombstone_age(ServerId(8)), Some(0));

    for _ in 0..5 {
        sync.process_messages(&mut replica).unwrap();
    }
    assert!(sync.is_tombstoned(ServerId(8)));
    assert_eq!(sync.tombstone_age(ServerId(8)), Some(5));

    let report = sync.process_messages(&mut replica).unwrap();
    assert_eq!(report.expired_tombstones, 1);
    assert!(!sync.is_tombstoned(ServerId(8)));

    // A late message for the id now bounces instead of being discarded.
    let key = sync.push_message(jump_frame(8, 1));
    sync.process_messages(&mut replica).unwrap();
    assert_eq!(sync.bounce_count(key), Some(1));
}

#[test]
fn test_ejected_tombstone_lets_messages_through() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    sync.add_tombstone(ServerId(4));
    assert!(sync.eject_tombstone(ServerId(4)));
    assert!(!sync.eject_tombstone(ServerId(4)));

    let e = spawn(&mut replica, 4, CATEGORY_CREATURE);
    sync.push_message(jump_frame(4, 2));
    sync.process_messages(&mut replica).unwrap();
    assert_eq!(jump(&replica, e).current_frame, 2);
}

#[test]
fn test_invalid_transition_leaves_state_intact() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let e = spawn(&mut replica, 1, CATEGORY_CREATURE);

    // Inactive -> AwaitingLand skips Active.
    sync.push_message(jump_transition(1, JumpState::AwaitingLand));
    let report = sync.process_messages(&mut replica).unwrap();

    assert_eq!(report.rejected, 1);
    assert_eq!(sync.pending_len(), 0);
    assert_eq!(jump(&replica, e).state, JumpState::Inactive);
}

#[test]
fn test_valid_transitions_in_order() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let e = spawn(&mut replica, 1, CATEGORY_CREATURE);

    sync.push_message(jump_transition(1, JumpState::Active));
    sync.push_message(jump_frame(1, 4));
    sync.push_message(jump_transition(1, JumpState::AwaitingLand));
    let report = sync.process_messages(&mut replica).unwrap();

    assert_eq!(report.applied, 3);
    let tree = jump(&replica, e);
    assert_eq!(tree.state, JumpState::AwaitingLand);
    assert_eq!(tree.current_frame, 4);
}

#[test]
fn test_repeated_update_is_idempotent() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let e = spawn(&mut replica, 2, CATEGORY_CREATURE);

    sync.push_message(jump_frame(2, 9));
    sync.process_messages(&mut replica).unwrap();
    let once = jump(&replica, e);

    sync.push_message(jump_frame(2, 9));
    sync.process_messages(&mut replica).unwrap();
    assert_eq!(jump(&replica, e), once);
}

#[test]
fn test_last_arrival_wins_within_a_pass() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let e = spawn(&mut replica, 2, CATEGORY_CREATURE);

    for frame in [1, 2, 3] {
        sync.push_message(jump_frame(2, frame));
    }
    sync.process_messages(&mut replica).unwrap();
    assert_eq!(jump(&replica, e).current_frame, 3);
}

#[test]
fn test_missing_component_is_ignored() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    spawn(&mut replica, 6, CATEGORY_ITEM);

    sync.push_message(jump_frame(6, 1));
    let report = sync.process_messages(&mut replica).unwrap();
    assert_eq!(report.ignored, 1);
    assert_eq!(sync.pending_len(), 0);
}

#[test]
fn test_unknown_field_and_wrong_kind_are_rejected() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let e = spawn(&mut replica, 3, CATEGORY_CREATURE);

    sync.push_message(SyncMessage::UpdateState {
        target: FieldTarget {
            entity_id: ServerId(3),
            tree_id: TreeId(200),
            field_id: JUMP_STATE,
        },
        value: FieldValue::Int(1),
    });
    sync.push_message(SyncMessage::UpdateState {
        target: FieldTarget {
            entity_id: ServerId(3),
            tree_id: JUMP_TREE,
            field_id: JUMP_CURRENT_FRAME,
        },
        value: FieldValue::Str("seven".into()),
    });
    let report = sync.process_messages(&mut replica).unwrap();

    assert_eq!(report.rejected, 2);
    assert_eq!(sync.pending_len(), 0);
    assert_eq!(jump(&replica, e).current_frame, 0);
}

#[test]
fn test_action_request_is_consumed() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    spawn(&mut replica, 3, CATEGORY_CREATURE);

    sync.push_message(SyncMessage::RequestAction {
        entity_id: ServerId(3),
        tree_id: ATTACK_TREE,
        value: 1,
    });
    let report = sync.process_messages(&mut replica).unwrap();
    assert_eq!(report.ignored, 1);
    assert_eq!(sync.pending_len(), 0);
}

#[test]
fn test_registered_but_unresolved_is_a_hard_failure() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let alive = spawn(&mut replica, 1, CATEGORY_CREATURE);
    let dead = spawn(&mut replica, 2, CATEGORY_CREATURE);
    replica.world_mut().despawn(dead);

    sync.push_message(jump_frame(1, 5));
    sync.push_message(jump_frame(2, 5));
    sync.push_message(jump_frame(1, 6));

    let err = sync.process_messages(&mut replica).unwrap_err();
    match &err {
        SyncError::UnresolvedRegistered { id, detail, .. } => {
            assert_eq!(*id, ServerId(2));
            assert!(detail.contains("alive: false"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The first message ran; the failing one and the rest stay queued.
    assert_eq!(jump(&replica, alive).current_frame, 5);
    assert_eq!(sync.pending_len(), 2);
}

#[test]
fn test_requeue_policy_keeps_bouncing() {
    let sync = manager(SyncConfig {
        unresolved_registered: UnresolvedPolicy::Requeue,
        ..config()
    });
    let mut replica = ReplicaWorld::new();
    let dead = spawn(&mut replica, 2, CATEGORY_CREATURE);
    replica.world_mut().despawn(dead);

    let key = sync.push_message(jump_frame(2, 5));
    for _ in 0..3 {
        let report = sync.process_messages(&mut replica).unwrap();
        assert_eq!(report.pending, 1);
    }
    assert_eq!(sync.bounce_count(key), Some(3));
}

#[test]
fn test_scene_load_is_unsupported() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let e = spawn(&mut replica, 1, CATEGORY_CREATURE);

    sync.push_message(SyncMessage::LoadScene {
        path: "scenes/arena".into(),
    });
    sync.push_message(jump_frame(1, 8));

    let err = sync.process_messages(&mut replica).unwrap_err();
    assert!(matches!(err, SyncError::Unsupported { entity: None, .. }));
    assert_eq!(sync.pending_len(), 1);

    sync.process_messages(&mut replica).unwrap();
    assert_eq!(jump(&replica, e).current_frame, 8);
}

#[test]
fn test_tree_attach_fails_only_once_resolved() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();

    let key = sync.push_message(SyncMessage::AttachTree {
        entity_id: ServerId(11),
        tree_id: ATTACK_TREE,
    });
    sync.process_messages(&mut replica).unwrap();
    assert_eq!(sync.bounce_count(key), Some(1));

    spawn(&mut replica, 11, CATEGORY_CREATURE);
    let err = sync.process_messages(&mut replica).unwrap_err();
    assert!(matches!(
        err,
        SyncError::Unsupported {
            entity: Some(ServerId(11)),
            ..
        }
    ));
    assert_eq!(sync.pending_len(), 0);
    assert_eq!(sync.bouncing(), 0);
}

#[test]
fn test_attack_transition_counts_swings() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    let e = spawn(&mut replica, 1, CATEGORY_CREATURE);

    for state in [AttackState::Windup, AttackState::Attack, AttackState::Cooldown] {
        sync.push_message(SyncMessage::Transition {
            target: FieldTarget {
                entity_id: ServerId(1),
                tree_id: ATTACK_TREE,
                field_id: ATTACK_STATE,
            },
            state: state.as_short(),
        });
    }
    let report = sync.process_messages(&mut replica).unwrap();
    assert_eq!(report.applied, 3);

    let tree = replica.world().get::<AttackTree>(e).unwrap();
    assert_eq!(tree.state, AttackState::Cooldown);
    assert_eq!(tree.swings, 1);
}

#[test]
fn test_clear_forgets_everything() {
    let sync = manager(config());
    let mut replica = ReplicaWorld::new();
    sync.add_tombstone(ServerId(1));
    let first = sync.push_message(jump_frame(2, 1));
    sync.process_messages(&mut replica).unwrap();

    sync.clear();
    assert_eq!(sync.pending_len(), 0);
    assert_eq!(sync.tombstone_count(), 0);
    assert_eq!(sync.bouncing(), 0);
    assert_eq!(sync.passes(), 0);

    // Keys keep increasing so stale keys never alias new messages.
    let second = sync.push_message(jump_frame(2, 1));
    assert!(second > first);
}

#[test]
fn test_ten_thousand_unresolved_messages_apply_in_one_pass() {
    let sync = manager(SyncConfig::default());
    let mut replica = ReplicaWorld::new();

    for frame in 0..10_000 {
        sync.push_message(jump_frame(77, frame));
    }
    let report = sync.process_messages(&mut replica).unwrap();
    assert_eq!(report.pending, 10_000);
    assert_eq!(sync.bouncing(), 10_000);

    let e = spawn(&mut replica, 77, CATEGORY_CREATURE);
    let report = sync.process_messages(&mut replica).unwrap();

    assert_eq!(report.applied, 10_000);
    assert_eq!(report.pending, 0);
    assert_eq!(sync.bouncing(), 0);
    assert_eq!(jump(&replica, e).current_frame, 9_999);
}
