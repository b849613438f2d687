//! Replica behavior-tree components and their synchronized fields.
//!
//! Each component mirrors the synchronized fields of one server-side
//! behavior tree. Fields are addressed on the wire by stable
//! `(TreeId, FieldId)` pairs, listed in [`ids`]. State fields whose
//! changes carry side effects go through [`TransitionState`], which
//! validates the move against the tree's state machine.

use bevy_ecs::component::Component;
use meridian_net::{FieldId, TreeId};

use crate::error::TransitionError;
use crate::field_table::{FieldTable, TransitionState};
use crate::short_enum;

/// Stable wire ids.
pub mod ids {
    use meridian_net::{FieldId, TreeId};

    pub const ATTACK_TREE: TreeId = TreeId(1);
    pub const BLOCK_TREE: TreeId = TreeId(2);
    pub const TOOLBAR: TreeId = TreeId(3);
    pub const GROWTH: TreeId = TreeId(4);
    pub const JUMP_TREE: TreeId = TreeId(5);
    pub const LIFE_TREE: TreeId = TreeId(6);
    pub const LOD_TREE: TreeId = TreeId(7);
    pub const MOVEMENT_TREE: TreeId = TreeId(8);

    pub const ATTACK_STATE: FieldId = FieldId(1);
    pub const ATTACK_DRIFT_STATE: FieldId = FieldId(2);
    pub const ATTACK_CURRENT_MOVE_ID: FieldId = FieldId(3);

    pub const BLOCK_STATE: FieldId = FieldId(1);
    pub const BLOCK_CURRENT_VARIANT: FieldId = FieldId(2);

    pub const TOOLBAR_SELECTED_SLOT: FieldId = FieldId(1);

    pub const GROWTH_STATUS: FieldId = FieldId(1);

    pub const JUMP_STATE: FieldId = FieldId(1);
    pub const JUMP_CURRENT_FRAME: FieldId = FieldId(2);
    pub const JUMP_FORCE: FieldId = FieldId(3);

    pub const LIFE_STATE: FieldId = FieldId(1);
    pub const LIFE_LAST_DAMAGE_TICK: FieldId = FieldId(2);

    pub const LOD_LEVEL: FieldId = FieldId(1);

    pub const MOVEMENT_FACING: FieldId = FieldId(1);
    pub const MOVEMENT_SPEED: FieldId = FieldId(2);
}

fn invalid(tree: &'static str, from: &'static str, to: &'static str) -> TransitionError {
    TransitionError::Invalid { tree, from, to }
}

// ---------------------------------------------------------------------------
// Jump
// ---------------------------------------------------------------------------

short_enum! {
    pub enum JumpState {
        Inactive = 0,
        Active = 1,
        AwaitingLand = 2,
    }
}

/// Jump behavior.
#[derive(Component, Debug, Clone, PartialEq)]
pub struct JumpTree {
    pub state: JumpState,
    pub current_frame: i32,
    pub jump_force: f32,
}

impl Default for JumpTree {
    fn default() -> Self {
        Self {
            state: JumpState::Inactive,
            current_frame: 0,
            jump_force: 0.0,
        }
    }
}

impl TransitionState for JumpTree {
    type State = JumpState;

    fn transition_state(&mut self, next: JumpState) -> Result<(), TransitionError> {
        use JumpState::*;
        let allowed = self.state == next
            || matches!(
                (self.state, next),
                (Inactive, Active)
                    | (Active, AwaitingLand)
                    | (Active, Inactive)
                    | (AwaitingLand, Inactive)
            );
        if !allowed {
            return Err(invalid("JumpTree", self.state.name(), next.name()));
        }
        if next == Active && self.state != Active {
            self.current_frame = 0;
        }
        self.state = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Attack
// ---------------------------------------------------------------------------

short_enum! {
    pub enum AttackState {
        Windup = 0,
        Hold = 1,
        Attack = 2,
        BlockRecoil = 3,
        Cooldown = 4,
        Idle = 5,
    }
}

short_enum! {
    pub enum DriftState {
        Drift = 0,
        NoDrift = 1,
    }
}

/// Melee attack behavior.
#[derive(Component, Debug, Clone, PartialEq)]
pub struct AttackTree {
    pub state: AttackState,
    pub drift_state: DriftState,
    pub current_move_id: String,
    /// Swings started on this replica; not synchronized.
    pub swings: u32,
}

impl Default for AttackTree {
    fn default() -> Self {
        Self {
            state: AttackState::Idle,
            drift_state: DriftState::NoDrift,
            current_move_id: String::new(),
            swings: 0,
        }
    }
}

impl TransitionState for AttackTree {
    type State = AttackState;

    fn transition_state(&mut self, next: AttackState) -> Result<(), TransitionError> {
        use AttackState::*;
        let allowed = next == Idle
            || self.state == next
            || matches!(
                (self.state, next),
                (Idle, Windup)
                    | (Windup, Hold)
                    | (Windup, Attack)
                    | (Hold, Attack)
                    | (Attack, Cooldown)
                    | (Attack, BlockRecoil)
                    | (BlockRecoil, Cooldown)
                    | (Cooldown, Windup)
            );
        if !allowed {
            return Err(invalid("AttackTree", self.state.name(), next.name()));
        }
        if next == Attack && self.state != Attack {
            self.swings += 1;
        }
        self.state = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

short_enum! {
    pub enum BlockState {
        WindUp = 0,
        Blocking = 1,
        Cooldown = 2,
        NotBlocking = 3,
    }
}

/// Blocking behavior.
#[derive(Component, Debug, Clone, PartialEq)]
pub struct BlockTree {
    pub state: BlockState,
    pub current_block_variant: String,
}

impl Default for BlockTree {
    fn default() -> Self {
        Self {
            state: BlockState::NotBlocking,
            current_block_variant: String::new(),
        }
    }
}

impl TransitionState for BlockTree {
    type State = BlockState;

    fn transition_state(&mut self, next: BlockState) -> Result<(), TransitionError> {
        use BlockState::*;
        let allowed = next == NotBlocking
            || self.state == next
            || matches!(
                (self.state, next),
                (NotBlocking, WindUp) | (WindUp, Blocking) | (Blocking, Cooldown)
            );
        if !allowed {
            return Err(invalid("BlockTree", self.state.name(), next.name()));
        }
        self.state = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plain-field trees
// ---------------------------------------------------------------------------

/// Selected toolbar slot.
#[derive(Component, Debug, Clone, Default, PartialEq)]
pub struct ToolbarState {
    pub selected_slot: i32,
}

/// Foliage growth.
#[derive(Component, Debug, Clone, Default, PartialEq)]
pub struct GrowthTree {
    pub status: i32,
}

/// Level of detail the server simulates this entity at.
#[derive(Component, Debug, Clone, Default, PartialEq)]
pub struct LodTree {
    pub level: i32,
}

short_enum! {
    pub enum LifeState {
        Alive = 0,
        Dying = 1,
        Dead = 2,
    }
}

/// Health state.
#[derive(Component, Debug, Clone, PartialEq)]
pub struct LifeTree {
    pub state: LifeState,
    pub last_damage_tick: i64,
}

impl Default for LifeTree {
    fn default() -> Self {
        Self {
            state: LifeState::Alive,
            last_damage_tick: 0,
        }
    }
}

short_enum! {
    pub enum Facing {
        Forward = 0,
        Left = 1,
        Right = 2,
        Backward = 3,
    }
}

/// Ground movement.
#[derive(Component, Debug, Clone, PartialEq)]
pub struct MovementTree {
    pub facing: Facing,
    pub speed: f64,
}

impl Default for MovementTree {
    fn default() -> Self {
        Self {
            facing: Facing::Forward,
            speed: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// The table of every synchronized field the client understands.
pub fn default_field_table() -> FieldTable {
    use ids::*;

    let mut t = FieldTable::new();
    t.register_field(
        ATTACK_TREE,
        ATTACK_STATE,
        "AttackTree.state",
        |c: &mut AttackTree, v: AttackState| c.state = v,
    );
    t.register_transition::<AttackTree>(ATTACK_TREE, ATTACK_STATE, "AttackTree.state");
    t.register_field(
        ATTACK_TREE,
        ATTACK_DRIFT_STATE,
        "AttackTree.drift_state",
        |c: &mut AttackTree, v: DriftState| c.drift_state = v,
    );
    t.register_field(
        ATTACK_TREE,
        ATTACK_CURRENT_MOVE_ID,
        "AttackTree.current_move_id",
        |c: &mut AttackTree, v: String| c.current_move_id = v,
    );

    t.register_field(
        BLOCK_TREE,
        BLOCK_STATE,
        "BlockTree.state",
        |c: &mut BlockTree, v: BlockState| c.state = v,
    );
    t.register_transition::<BlockTree>(BLOCK_TREE, BLOCK_STATE, "BlockTree.state");
    t.register_field(
        BLOCK_TREE,
        BLOCK_CURRENT_VARIANT,
        "BlockTree.current_block_variant",
        |c: &mut BlockTree, v: String| c.current_block_variant = v,
    );

    t.register_field(
        TOOLBAR,
        TOOLBAR_SELECTED_SLOT,
        "ToolbarState.selected_slot",
        |c: &mut ToolbarState, v: i32| c.selected_slot = v,
    );

    t.register_field(
        GROWTH,
        GROWTH_STATUS,
        "GrowthTree.status",
        |c: &mut GrowthTree, v: i32| c.status = v,
    );

    t.register_field(
        JUMP_TREE,
        JUMP_STATE,
        "JumpTree.state",
        |c: &mut JumpTree, v: JumpState| c.state = v,
    );
    t.register_transition::<JumpTree>(JUMP_TREE, JUMP_STATE, "JumpTree.state");
    t.register_field(
        JUMP_TREE,
        JUMP_CURRENT_FRAME,
        "JumpTree.current_frame",
        |c: &mut JumpTree, v: i32| c.current_frame = v,
    );
    t.register_field(
        JUMP_TREE,
        JUMP_FORCE,
        "JumpTree.jump_force",
        |c: &mut JumpTree, v: f32| c.jump_force = v,
    );

    t.register_field(
        LIFE_TREE,
        LIFE_STATE,
        "LifeTree.state",
        |c: &mut LifeTree, v: LifeState| c.state = v,
    );
    t.register_field(
        LIFE_TREE,
        LIFE_LAST_DAMAGE_TICK,
        "LifeTree.last_damage_tick",
        |c: &mut LifeTree, v: i64| c.last_damage_tick = v,
    );

    t.register_field(
        LOD_TREE,
        LOD_LEVEL,
        "LodTree.level",
        |c: &mut LodTree, v: i32| c.level = v,
    );

    t.register_field(
        MOVEMENT_TREE,
        MOVEMENT_FACING,
        "MovementTree.facing",
        |c: &mut MovementTree, v: Facing| c.facing = v,
    );
    t.register_field(
        MOVEMENT_TREE,
        MOVEMENT_SPEED,
        "MovementTree.speed",
        |c: &mut MovementTree, v: f64| c.speed = v,
    );

    t
}

/// Tree id and field id of a registered field, for log output.
pub fn describe_field(table: &FieldTable, tree: TreeId, field: FieldId) -> String {
    match table.get(tree, field) {
        Some(entry) => entry.label().to_string(),
        None => format!("tree {} field {}", tree.0, field.0),
    }
}
