//! Generational entity arena
//!
//! Slots are recycled through a LIFO free list. Every removal bumps the slot
//! generation, so a handle kept from a previous occupant never resolves to
//! the entity that reuses its index.

use bitvec::vec::BitVec;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Generation-tagged entity handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub index: u32,
    pub generation: u32,
}

impl EntityId {
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of entities addressed by [`EntityId`]
#[derive(Debug)]
pub struct EntityTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    /// One bit per slot, set while occupied
    live: BitVec,
}

impl<T> EntityTable<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            live: BitVec::with_capacity(capacity),
        }
    }

    /// Store a value and hand out its id. Reuses the most recently freed slot.
    pub fn insert(&mut self, value: T) -> EntityId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            self.live.set(index as usize, true);
            return EntityId::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        self.live.push(true);
        EntityId::new(index, 0)
    }

    /// Remove the entity if `id` still refers to it
    pub fn remove(&mut self, id: EntityId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live.set(id.index as usize, false);
        self.free.push(id.index);
        Some(value)
    }

    #[inline]
    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    #[inline]
    pub fn contains(&self, id: EntityId) -> bool {
        self.get(id).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live.count_ones()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live.not_any()
    }

    /// Live entities in slot order
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> + '_ {
        self.live.iter_ones().filter_map(move |index| {
            let slot = &self.slots[index];
            slot.value
                .as_ref()
                .map(|value| (EntityId::new(index as u32, slot.generation), value))
        })
    }

    /// Live ids in slot order
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.iter().map(|(id, _)| id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut T)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|value| (EntityId::new(index as u32, generation), value))
        })
    }
}

impl<T: Send> EntityTable<T> {
    /// Parallel mutable iteration; every entity is visited by exactly one worker
    pub fn par_iter_mut(&mut self) -> impl ParallelIterator<Item = (EntityId, &mut T)> + '_ {
        self.slots.par_iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|value| (EntityId::new(index as u32, generation), value))
        })
    }
}

impl<T> Default for EntityTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
