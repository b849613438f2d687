//! Bidirectional server-id ↔ local entity mapping.

use bevy_ecs::entity::Entity;
use meridian_net::ServerId;
use rustc_hash::FxHashMap;

/// Maps server ids to local replica entities and back.
///
/// A server id maps to at most one local entity. Absence means the id was
/// never created or has been deleted.
#[derive(Debug, Default)]
pub struct EntityIdMap {
    server_to_local: FxHashMap<ServerId, Entity>,
    local_to_server: FxHashMap<Entity, ServerId>,
}

impl EntityIdMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `id` with `entity`. Returns the entity previously mapped
    /// to `id`, if any; its reverse entry is dropped.
    pub fn register(&mut self, id: ServerId, entity: Entity) -> Option<Entity> {
        let previous = self.server_to_local.insert(id, entity);
        if let Some(old) = previous {
            self.local_to_server.remove(&old);
        }
        if let Some(old_id) = self.local_to_server.insert(entity, id)
            && old_id != id
        {
            self.server_to_local.remove(&old_id);
        }
        previous
    }

    /// Removes `id`, returning the entity it mapped to.
    pub fn deregister(&mut self, id: ServerId) -> Option<Entity> {
        let entity = self.server_to_local.remove(&id)?;
        self.local_to_server.remove(&entity);
        Some(entity)
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: ServerId) -> bool {
        self.server_to_local.contains_key(&id)
    }

    /// Local entity registered for `id`.
    pub fn local(&self, id: ServerId) -> Option<Entity> {
        self.server_to_local.get(&id).copied()
    }

    /// Server id registered for a local entity.
    pub fn server(&self, entity: Entity) -> Option<ServerId> {
        self.local_to_server.get(&entity).copied()
    }

    /// Registered pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (ServerId, Entity)> + '_ {
        self.server_to_local.iter().map(|(id, e)| (*id, *e))
    }

    pub fn len(&self) -> usize {
        self.server_to_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.server_to_local.is_empty()
    }

    pub fn clear(&mut self) {
        self.server_to_local.clear();
        self.local_to_server.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::world::World;

    #[test]
    fn test_register_and_lookup_both_ways() {
        let mut world = World::new();
        let e = world.spawn_empty().id();
        let mut map = EntityIdMap::new();

        assert_eq!(map.register(ServerId(42), e), None);
        assert!(map.contains(ServerId(42)));
        assert_eq!(map.local(ServerId(42)), Some(e));
        assert_eq!(map.server(e), Some(ServerId(42)));
    }

    #[test]
    fn test_reregister_replaces_reverse_entry() {
        let mut world = World::new();
        let a = world.spawn_empty().id();
        let b = world.spawn_empty().id();
        let mut map = EntityIdMap::new();

        map.register(ServerId(1), a);
        assert_eq!(map.register(ServerId(1), b), Some(a));
        assert_eq!(map.server(a), None);
        assert_eq!(map.server(b), Some(ServerId(1)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_entity_moved_to_new_id_drops_old_id() {
        let mut world = World::new();
        let e = world.spawn_empty().id();
        let mut map = EntityIdMap::new();

        map.register(ServerId(1), e);
        map.register(ServerId(2), e);
        assert!(!map.contains(ServerId(1)));
        assert_eq!(map.server(e), Some(ServerId(2)));
    }

    #[test]
    fn test_deregister() {
        let mut world = World::new();
        let e = world.spawn_empty().id();
        let mut map = EntityIdMap::new();

        map.register(ServerId(5), e);
        assert_eq!(map.deregister(ServerId(5)), Some(e));
        assert_eq!(map.deregister(ServerId(5)), None);
        assert!(map.is_empty());
        assert_eq!(map.server(e), None);
    }
}
