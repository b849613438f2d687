//! The (tree, field) dispatch table.
//!
//! Every synchronized behavior-tree field is registered once at startup
//! under its stable `(TreeId, FieldId)` key together with the primitive kind
//! it carries. Registration produces type-erased appliers that look up the
//! component on the target entity and call its setter, or its validated
//! `transition_state` for transition messages.
//!
//! A component that is not attached to the entity is a silent no-op: the
//! entity may simply not support that behavior yet.

use bevy_ecs::component::Component;
use bevy_ecs::entity::Entity;
use bevy_ecs::world::World;
use meridian_net::{FieldId, FieldTarget, FieldValue, TreeId, ValueKind};
use rustc_hash::FxHashMap;

use crate::error::TransitionError;

// ---------------------------------------------------------------------------
// Value conversion
// ---------------------------------------------------------------------------

/// A Rust type a synchronized field value decodes into.
pub trait FromFieldValue: Sized + Send + Sync + 'static {
    /// The wire kind this type is carried as.
    const KIND: ValueKind;

    /// Convert a value of kind [`Self::KIND`]. `None` if the value is out of
    /// range for the type (e.g. an undefined enum discriminant).
    fn from_field_value(value: &FieldValue) -> Option<Self>;
}

impl FromFieldValue for i32 {
    const KIND: ValueKind = ValueKind::Int;

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromFieldValue for i64 {
    const KIND: ValueKind = ValueKind::Long;

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromFieldValue for f32 {
    const KIND: ValueKind = ValueKind::Float;

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromFieldValue for f64 {
    const KIND: ValueKind = ValueKind::Double;

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromFieldValue for String {
    const KIND: ValueKind = ValueKind::Str;

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Declares a state enum carried on the wire as a short, with conversions
/// and a [`FromFieldValue`] impl.
#[macro_export]
macro_rules! short_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Decode from the wire short.
            pub fn from_short(value: i16) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            /// Wire short for this state.
            pub fn as_short(self) -> i16 {
                match self {
                    $(Self::$variant => $value,)+
                }
            }

            /// Variant name, for diagnostics.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)+
                }
            }
        }

        impl $crate::field_table::FromFieldValue for $name {
            const KIND: meridian_net::ValueKind = meridian_net::ValueKind::EnumShort;

            fn from_field_value(value: &meridian_net::FieldValue) -> Option<Self> {
                match value {
                    meridian_net::FieldValue::EnumShort(v) => Self::from_short(*v),
                    _ => None,
                }
            }
        }
    };
}

/// A component whose state field changes only through validated moves.
pub trait TransitionState: Component {
    /// The state enum.
    type State: FromFieldValue;

    /// Move to `next`, or reject the move and leave `self` untouched.
    fn transition_state(&mut self, next: Self::State) -> Result<(), TransitionError>;
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Result of applying one value to one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The setter or transition ran.
    Applied,
    /// The entity lacks the component; nothing happened.
    ComponentAbsent,
    /// No entry for this (tree, field).
    UnknownField,
    /// The entry exists but has no transition operation.
    NoTransition,
    /// The carried value has the wrong kind for the field.
    KindMismatch {
        expected: ValueKind,
        actual: ValueKind,
    },
    /// The value has the right kind but is out of range for the field.
    InvalidValue,
    /// The component refused the transition.
    Rejected(TransitionError),
}

type Applier = Box<dyn Fn(&mut World, Entity, &FieldValue) -> ApplyOutcome + Send + Sync>;

/// One registered field.
pub struct FieldEntry {
    kind: ValueKind,
    label: &'static str,
    set: Option<Applier>,
    transition: Option<Applier>,
}

impl FieldEntry {
    /// Declared value kind.
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Human-readable `Tree.field` label.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Whether transition messages are accepted for this field.
    pub fn has_transition(&self) -> bool {
        self.transition.is_some()
    }
}

/// Registration table mapping `(TreeId, FieldId)` to appliers.
#[derive(Default)]
pub struct FieldTable {
    entries: FxHashMap<(TreeId, FieldId), FieldEntry>,
}

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain field setter on component `C`.
    pub fn register_field<C, V>(
        &mut self,
        tree: TreeId,
        field: FieldId,
        label: &'static str,
        setter: fn(&mut C, V),
    ) where
        C: Component,
        V: FromFieldValue,
    {
        let apply: Applier = Box::new(
            move |world: &mut World, entity: Entity, value: &FieldValue| {
                let Some(decoded) = V::from_field_value(value) else {
                    return ApplyOutcome::InvalidValue;
                };
                match world.get_mut::<C>(entity) {
                    Some(mut component) => {
                        setter(&mut component, decoded);
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::ComponentAbsent,
                }
            },
        );
        self.entry(tree, field, label, V::KIND).set = Some(apply);
    }

    /// Register the transition operation of component `C` for its state
    /// field.
    pub fn register_transition<C: TransitionState>(
        &mut self,
        tree: TreeId,
        field: FieldId,
        label: &'static str,
    ) {
        let apply: Applier = Box::new(|world: &mut World, entity: Entity, value: &FieldValue| {
            let Some(next) = C::State::from_field_value(value) else {
                return ApplyOutcome::InvalidValue;
            };
            let Some(mut component) = world.get_mut::<C>(entity) else {
                return ApplyOutcome::ComponentAbsent;
            };
            match component.transition_state(next) {
                Ok(()) => ApplyOutcome::Applied,
                Err(err) => ApplyOutcome::Rejected(err),
            }
        });
        self.entry(tree, field, label, C::State::KIND).transition = Some(apply);
    }

    fn entry(
        &mut self,
        tree: TreeId,
        field: FieldId,
        label: &'static str,
        kind: ValueKind,
    ) -> &mut FieldEntry {
        let entry = self.entries.entry((tree, field)).or_insert(FieldEntry {
            kind,
            label,
            set: None,
            transition: None,
        });
        if entry.kind != kind {
            tracing::warn!(
                label,
                previous = ?entry.kind,
                ?kind,
                "Field re-registered with a different kind"
            );
            entry.kind = kind;
        }
        entry
    }

    /// Look up a registered field.
    pub fn get(&self, tree: TreeId, field: FieldId) -> Option<&FieldEntry> {
        self.entries.get(&(tree, field))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a plain field write.
    pub fn apply_update(
        &self,
        world: &mut World,
        entity: Entity,
        target: FieldTarget,
        value: &FieldValue,
    ) -> ApplyOutcome {
        let Some(entry) = self.get(target.tree_id, target.field_id) else {
            return ApplyOutcome::UnknownField;
        };
        if value.kind() != entry.kind {
            return ApplyOutcome::KindMismatch {
                expected: entry.kind,
                actual: value.kind(),
            };
        }
        match &entry.set {
            Some(set) => set(world, entity, value),
            None => ApplyOutcome::UnknownField,
        }
    }

    /// Apply a validated state transition.
    pub fn apply_transition(
        &self,
        world: &mut World,
        entity: Entity,
        target: FieldTarget,
        state: i16,
    ) -> ApplyOutcome {
        let Some(entry) = self.get(target.tree_id, target.field_id) else {
            return ApplyOutcome::UnknownField;
        };
        match &entry.transition {
            Some(transition) => transition(world, entity, &FieldValue::EnumShort(state)),
            None => ApplyOutcome::NoTransition,
        }
    }
}

impl std::fmt::Debug for FieldTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut labels: Vec<_> = self.entries.values().map(|e| e.label).collect();
        labels.sort_unstable();
        f.debug_struct("FieldTable").field("fields", &labels).finish()
    }
}
