//! Authoritative world: entity arena, movement and the spatial index.
//!
//! The session drives one tick as `begin_tick` → inputs → `step` →
//! `sync_index`. Only `step` and `teleport` ever change positions.

use rayon::prelude::*;
use tracing::debug;

use crate::game::entity::{EntityId, EntityTable};
use crate::game::movement::{self, Direction, InputState, MotionState, MovementParams};
use crate::game::spatial::SpatialIndex;
use crate::game::Tick;
use crate::util::shape::Shape;
use crate::util::vec3::Vec3;

/// Axis a patrolling actor walks along
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatrolAxis {
    Horizontal,
    Vertical,
}

/// Per-entity logic, dispatched by variant each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Input comes from the owning connection
    Controlled,
    /// Never moves on its own
    Idle,
    /// Walks back and forth, turning every `period` ticks
    Patrol {
        axis: PatrolAxis,
        period: u32,
        elapsed: u32,
        forward: bool,
    },
}

impl Behavior {
    pub fn patrol(axis: PatrolAxis, period: u32) -> Self {
        Behavior::Patrol {
            axis,
            period: period.max(1),
            elapsed: 0,
            forward: true,
        }
    }

    /// Input to apply this tick
    fn next_input(&mut self, current: InputState) -> InputState {
        match self {
            Behavior::Controlled => current,
            Behavior::Idle => InputState::NEUTRAL,
            Behavior::Patrol {
                axis,
                period,
                elapsed,
                forward,
            } => {
                if *elapsed >= *period {
                    *elapsed = 0;
                    *forward = !*forward;
                }
                *elapsed += 1;
                let direction = match (*axis, *forward) {
                    (PatrolAxis::Horizontal, true) => Direction::Right,
                    (PatrolAxis::Horizontal, false) => Direction::Left,
                    (PatrolAxis::Vertical, true) => Direction::Down,
                    (PatrolAxis::Vertical, false) => Direction::Up,
                };
                InputState::neutral().with(direction)
            }
        }
    }
}

/// Simulated entity
#[derive(Debug, Clone)]
pub struct Entity {
    pub motion: MotionState,
    pub input: InputState,
    pub half_extent: f32,
    pub behavior: Behavior,
    /// Owner must receive an authoritative update this tick
    pub dirty: bool,
}

impl Entity {
    pub fn new(position: Vec3, half_extent: f32, behavior: Behavior) -> Self {
        Self {
            motion: MotionState::at(position),
            input: InputState::NEUTRAL,
            half_extent,
            behavior,
            dirty: false,
        }
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        self.motion.position
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        Shape::rect(self.motion.position, self.half_extent, self.half_extent)
    }
}

pub struct World {
    entities: EntityTable<Entity>,
    index: SpatialIndex,
    params: MovementParams,
    dt: f32,
    tick: Tick,
}

impl World {
    pub fn new(index: SpatialIndex, params: MovementParams, dt: f32) -> Self {
        Self {
            entities: EntityTable::new(),
            index,
            params,
            dt,
            tick: 0,
        }
    }

    /// Last fully simulated tick
    #[inline]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Start the next tick and return its number
    #[inline]
    pub fn begin_tick(&mut self) -> Tick {
        self.tick += 1;
        self.tick
    }

    #[inline]
    pub fn params(&self) -> &MovementParams {
        &self.params
    }

    #[inline]
    pub fn dt(&self) -> f32 {
        self.dt
    }

    #[inline]
    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn spawn(&mut self, position: Vec3, half_extent: f32, behavior: Behavior) -> EntityId {
        let entity = Entity::new(position, half_extent, behavior);
        let shape = entity.shape();
        let id = self.entities.insert(entity);
        self.index.set_location(id, shape);
        debug!("Spawned entity {} at ({:.1}, {:.1})", id, position.x, position.y);
        id
    }

    /// Remove an entity from the arena and the index, releasing its id
    pub fn despawn(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(id)?;
        self.index.remove(id);
        debug!("Despawned entity {}", id);
        Some(entity)
    }

    #[inline]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    #[inline]
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> + '_ {
        self.entities.iter()
    }

    /// Replace the held input. Returns false for unknown or stale ids.
    pub fn set_input(&mut self, id: EntityId, input: InputState) -> bool {
        match self.entities.get_mut(id) {
            Some(entity) => {
                entity.input = input;
                true
            }
            None => false,
        }
    }

    /// Default the input to neutral and force an update to the owner
    pub fn neutralize(&mut self, id: EntityId) -> bool {
        match self.entities.get_mut(id) {
            Some(entity) => {
                entity.input = InputState::NEUTRAL;
                entity.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Move an entity outside the movement step. Non-finite targets are refused.
    pub fn teleport(&mut self, id: EntityId, position: Vec3) -> bool {
        if !position.is_finite() {
            return false;
        }
        let Some(entity) = self.entities.get_mut(id) else {
            return false;
        };
        entity.motion = MotionState::at(position);
        entity.dirty = true;
        let shape = entity.shape();
        self.index.set_location(id, shape);
        true
    }

    /// Run behaviors and the movement step for every entity
    pub fn step(&mut self) {
        let params = self.params;
        let dt = self.dt;
        self.entities.par_iter_mut().for_each(|(_, entity)| {
            entity.input = entity.behavior.next_input(entity.input);
            entity.motion = movement::step(entity.motion, entity.input, &params, dt);
        });
    }

    /// Push every entity's current shape into the spatial index
    pub fn sync_index(&mut self) {
        for (id, entity) in self.entities.iter() {
            self.index.set_location(id, entity.shape());
        }
    }

    pub fn clear_dirty(&mut self) {
        for (_, entity) in self.entities.iter_mut() {
            entity.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::constants::sim::DT;

    fn world() -> World {
        World::new(SpatialIndex::new(32.0, 32.0), MovementParams::default(), DT)
    }

    #[test]
    fn test_spawn_tracks_in_index() {
        let mut world = world();
        let id = world.spawn(Vec3::planar(10.0, 10.0), 4.0, Behavior::Idle);
        assert!(world.index().contains(id));
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn test_despawn_releases_id() {
        let mut world = world();
        let old = world.spawn(Vec3::ZERO, 4.0, Behavior::Controlled);
        world.despawn(old);
        let new = world.spawn(Vec3::planar(100.0, 0.0), 4.0, Behavior::Controlled);

        assert_eq!(old.index, new.index);
        assert!(!world.set_input(old, InputState::neutral().with(Direction::Up)));
        assert!(world.teleport(new, Vec3::planar(1.0, 1.0)));
        assert!(!world.teleport(old, Vec3::planar(1.0, 1.0)));
        assert!(world.get(new).unwrap().input.is_neutral());
        assert!(!world.index().contains(old));
        world.index().check_invariants().unwrap();
    }

    #[test]
    fn test_step_matches_movement_step() {
        let mut world = world();
        let id = world.spawn(Vec3::ZERO, 4.0, Behavior::Controlled);
        let input = InputState::neutral().with(Direction::Right);
        world.set_input(id, input);

        let mut expected = MotionState::at(Vec3::ZERO);
        for _ in 0..10 {
            world.begin_tick();
            world.step();
            world.sync_index();
            expected = movement::step(expected, input, &MovementParams::default(), DT);
        }
        assert_eq!(world.get(id).unwrap().motion, expected);
        assert_eq!(world.tick(), 10);
        assert_eq!(
            world.index().shape_of(id),
            Some(world.get(id).unwrap().shape())
        );
    }

    #[test]
    fn test_patrol_turns_around() {
        let mut world = world();
        let id = world.spawn(Vec3::ZERO, 4.0, Behavior::patrol(PatrolAxis::Horizontal, 10));

        for _ in 0..10 {
            world.step();
        }
        assert!(world.get(id).unwrap().input.is_pressed(Direction::Right));
        let furthest = world.get(id).unwrap().position().x;
        assert!(furthest > 0.0);

        for _ in 0..10 {
            world.step();
        }
        assert!(world.get(id).unwrap().input.is_pressed(Direction::Left));
        assert!(world.get(id).unwrap().position().x < furthest);
    }

    #[test]
    fn test_idle_ignores_input() {
        let mut world = world();
        let id = world.spawn(Vec3::ZERO, 4.0, Behavior::Idle);
        world.set_input(id, InputState::neutral().with(Direction::Down));
        world.step();
        assert_eq!(world.get(id).unwrap().position(), Vec3::ZERO);
    }

    #[test]
    fn test_teleport_marks_dirty_and_reindexes() {
        let mut world = world();
        let id = world.spawn(Vec3::ZERO, 4.0, Behavior::Controlled);
        assert!(world.teleport(id, Vec3::planar(500.0, 500.0)));
        assert!(world.get(id).unwrap().dirty);
        assert!(!world.teleport(id, Vec3::planar(f32::NAN, 0.0)));
        world.index().check_invariants().unwrap();

        world.clear_dirty();
        assert!(!world.get(id).unwrap().dirty);
        assert!(world.neutralize(id));
        assert!(world.get(id).unwrap().dirty);
    }
}
