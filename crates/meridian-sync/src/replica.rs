//! The local replica entity graph.
//!
//! [`ReplicaGraph`] is what the synchronization manager resolves server ids
//! against. [`ReplicaWorld`] implements it over a `bevy_ecs` [`World`] plus
//! an [`EntityIdMap`].

use bevy_ecs::component::Component;
use bevy_ecs::entity::Entity;
use bevy_ecs::world::World;
use meridian_net::ServerId;
use meridian_net::messages::CreateEntity;

use crate::id_map::EntityIdMap;
use crate::trees::{
    AttackTree, BlockTree, GrowthTree, JumpTree, LifeTree, LodTree, MovementTree, ToolbarState,
};

/// Entity category sent with entity creation.
pub const CATEGORY_CREATURE: i32 = 0;
/// Entity category sent with entity creation.
pub const CATEGORY_ITEM: i32 = 1;
/// Entity category sent with entity creation.
pub const CATEGORY_FOLIAGE: i32 = 2;

/// Resolution of server ids to live local entities.
pub trait ReplicaGraph {
    /// Whether the client registered `id` (it agreed to expect this entity).
    fn contains_id(&self, id: ServerId) -> bool;

    /// The live local entity for `id`, if any.
    fn resolve(&self, id: ServerId) -> Option<Entity>;

    /// The world appliers write into.
    fn world_mut(&mut self) -> &mut World;

    /// Server-side type of `id`, if the graph can locate it.
    fn server_type(&self, _id: ServerId) -> Option<String> {
        None
    }

    /// Diagnostic dump of everything known about `id`.
    fn describe_id(&self, id: ServerId) -> String;

    /// Diagnostic dump of the id translation layer.
    fn describe_status(&self) -> String;
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Server id of a replica entity.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replicated(pub ServerId);

/// What the server said this entity is.
#[derive(Component, Debug, Clone, PartialEq)]
pub struct ReplicaKind {
    pub category: i32,
    pub subtype: String,
    pub creature_template: String,
}

/// Server-authoritative placement at creation time.
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct ReplicaTransform {
    pub position: [f64; 3],
    pub rotation: [f64; 4],
}

// ---------------------------------------------------------------------------
// ReplicaWorld
// ---------------------------------------------------------------------------

/// A `bevy_ecs` world of replica entities keyed by server id.
pub struct ReplicaWorld {
    world: World,
    ids: EntityIdMap,
}

impl Default for ReplicaWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaWorld {
    pub fn new() -> Self {
        Self {
            world: World::new(),
            ids: EntityIdMap::new(),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn ids(&self) -> &EntityIdMap {
        &self.ids
    }

    /// Spawn the replica for a server creation message, attach the behavior
    /// trees its category carries, and register its id.
    ///
    /// If the id is already registered the old replica is despawned first.
    pub fn spawn_replica(&mut self, create: &CreateEntity) -> Entity {
        if self.ids.contains(create.entity_id) {
            tracing::debug!(id = %create.entity_id, "Re-creating registered entity");
            self.despawn_replica(create.entity_id);
        }

        let mut entity = self.world.spawn((
            Replicated(create.entity_id),
            ReplicaKind {
                category: create.category,
                subtype: create.subtype.clone(),
                creature_template: create.creature_template.clone(),
            },
            ReplicaTransform {
                position: create.position,
                rotation: create.rotation,
            },
        ));
        match create.category {
            CATEGORY_CREATURE => {
                entity.insert((
                    JumpTree::default(),
                    AttackTree::default(),
                    BlockTree::default(),
                    ToolbarState::default(),
                    LifeTree::default(),
                    MovementTree::default(),
                    LodTree::default(),
                ));
            }
            CATEGORY_FOLIAGE => {
                entity.insert((GrowthTree::default(), LodTree::default()));
            }
            _ => {
                entity.insert(LodTree::default());
            }
        }
        let entity = entity.id();
        self.ids.register(create.entity_id, entity);
        entity
    }

    /// Deregister `id` and despawn its replica. Returns `false` if the id
    /// was not registered.
    pub fn despawn_replica(&mut self, id: ServerId) -> bool {
        let Some(entity) = self.ids.deregister(id) else {
            return false;
        };
        if self.world.get_entity(entity).is_ok() {
            self.world.despawn(entity);
        }
        true
    }

    /// Register an existing entity under `id` without spawning anything.
    pub fn register(&mut self, id: ServerId, entity: Entity) {
        self.ids.register(id, entity);
    }

    /// Despawn every replica and forget all ids.
    pub fn clear(&mut self) {
        let entities: Vec<Entity> = self.ids.iter().map(|(_, e)| e).collect();
        for entity in entities {
            if self.world.get_entity(entity).is_ok() {
                self.world.despawn(entity);
            }
        }
        self.ids.clear();
    }
}

impl ReplicaGraph for ReplicaWorld {
    fn contains_id(&self, id: ServerId) -> bool {
        self.ids.contains(id)
    }

    fn resolve(&self, id: ServerId) -> Option<Entity> {
        let entity = self.ids.local(id)?;
        self.world.get_entity(entity).is_ok().then_some(entity)
    }

    fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    fn server_type(&self, id: ServerId) -> Option<String> {
        let entity = self.resolve(id)?;
        self.world
            .get::<ReplicaKind>(entity)
            .map(|kind| kind.subtype.clone())
    }

    fn describe_id(&self, id: ServerId) -> String {
        match self.ids.local(id) {
            None => format!("server id {id} is not registered"),
            Some(entity) => {
                let alive = self.world.get_entity(entity).is_ok();
                let kind = self
                    .world
                    .get::<ReplicaKind>(entity)
                    .map(|k| format!("{} ({})", k.subtype, k.creature_template))
                    .unwrap_or_else(|| "unknown".to_string());
                format!("server id {id} -> {entity:?}, alive: {alive}, kind: {kind}")
            }
        }
    }

    fn describe_status(&self) -> String {
        let registered = self.ids.len();
        let live = self
            .ids
            .iter()
            .filter(|(_, e)| self.world.get_entity(*e).is_ok())
            .count();
        format!(
            "{registered} ids registered, {live} resolve to live entities, {} entities in world",
            self.world.entities().len()
        )
    }
}
