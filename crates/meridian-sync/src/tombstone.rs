//! Deletion tombstones.
//!
//! When the server destroys an entity, messages for it may still be in
//! flight or queued. A tombstone suppresses them silently. Each entry is
//! aged once per synchronization pass and evicted once it is older than the
//! retention window, which bounds the set's footprint.

use meridian_net::ServerId;
use rustc_hash::FxHashMap;

/// Server ids the client was told to destroy, with their age in passes.
#[derive(Debug, Default)]
pub struct TombstoneSet {
    ages: FxHashMap<ServerId, u32>,
}

impl TombstoneSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tombstone `id` at age 0. Re-inserting resets the age.
    pub fn insert(&mut self, id: ServerId) {
        self.ages.insert(id, 0);
    }

    /// Age every entry by one pass and evict those older than `retention`.
    /// Returns the number evicted.
    pub fn age_all(&mut self, retention: u32) -> usize {
        let before = self.ages.len();
        self.ages.retain(|_, age| {
            *age = age.saturating_add(1);
            *age <= retention
        });
        before - self.ages.len()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.ages.contains_key(&id)
    }

    /// Passes since `id` was tombstoned.
    pub fn age(&self, id: ServerId) -> Option<u32> {
        self.ages.get(&id).copied()
    }

    /// Remove a tombstone, e.g. when the server re-creates the id.
    pub fn eject(&mut self, id: ServerId) -> bool {
        self.ages.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.ages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ages.is_empty()
    }

    pub fn clear(&mut self) {
        self.ages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_survives_exactly_retention_passes() {
        let mut set = TombstoneSet::new();
        set.insert(ServerId(7));

        for pass in 1..=3 {
            assert_eq!(set.age_all(3), 0);
            assert_eq!(set.age(ServerId(7)), Some(pass));
        }
        assert_eq!(set.age_all(3), 1);
        assert!(!set.contains(ServerId(7)));
    }

    #[test]
    fn test_reinsert_resets_age() {
        let mut set = TombstoneSet::new();
        set.insert(ServerId(1));
        set.age_all(10);
        set.age_all(10);
        set.insert(ServerId(1));
        assert_eq!(set.age(ServerId(1)), Some(0));
    }

    #[test]
    fn test_eject() {
        let mut set = TombstoneSet::new();
        set.insert(ServerId(1));
        assert!(set.eject(ServerId(1)));
        assert!(!set.eject(ServerId(1)));
        assert!(set.is_empty());
    }
}
