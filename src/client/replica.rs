//! Client mirror of observed entities
//!
//! Keyed by the full generational id: once an entity has left, late updates
//! carrying its id are ignored even if the server has already handed the
//! slot to a new entity.

use rustc_hash::FxHashMap;

use crate::game::entity::EntityId;
use crate::net::protocol::EntitySnapshot;

#[derive(Debug, Default)]
pub struct ReplicaSet {
    entities: FxHashMap<EntityId, EntitySnapshot>,
}

impl ReplicaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entity entered view; replaces any stale copy under the same id
    pub fn on_entered(&mut self, snapshot: EntitySnapshot) {
        self.entities.insert(snapshot.entity, snapshot);
    }

    /// Apply an update. Unknown ids and out-of-date snapshots are ignored.
    pub fn on_update(&mut self, snapshot: EntitySnapshot) -> bool {
        match self.entities.get_mut(&snapshot.entity) {
            Some(current) if snapshot.tick >= current.tick => {
                *current = snapshot;
                true
            }
            _ => false,
        }
    }

    pub fn on_left(&mut self, entity: EntityId) -> bool {
        self.entities.remove(&entity).is_some()
    }

    #[inline]
    pub fn get(&self, entity: EntityId) -> Option<&EntitySnapshot> {
        self.entities.get(&entity)
    }

    #[inline]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.entities.contains_key(&entity)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySnapshot> {
        self.entities.values()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }
}
