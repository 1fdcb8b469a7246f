//! Deterministic movement step shared by server simulation and client
//! prediction.
//!
//! `step` is a pure function of its arguments. Client and server run the
//! exact same sequence of f32 operations, so a client replaying the inputs
//! the server used lands on bit-identical state.

use serde::{Deserialize, Serialize};

use crate::game::constants::movement::{ACCELERATION, MAX_SPEED};
use crate::util::vec3::Vec3;

/// Cardinal movement direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    #[inline]
    fn bit(self) -> u8 {
        match self {
            Direction::Up => 0b0001,
            Direction::Down => 0b0010,
            Direction::Left => 0b0100,
            Direction::Right => 0b1000,
        }
    }
}

/// Pressed/released state of every direction, packed into one byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputState(u8);

impl InputState {
    const MASK: u8 = 0b1111;

    /// Nothing pressed
    pub const NEUTRAL: InputState = InputState(0);

    #[inline]
    pub fn neutral() -> Self {
        Self::NEUTRAL
    }

    /// Rebuild from wire bits; unknown bits are discarded
    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    #[inline]
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Builder form of [`InputState::press`]
    #[inline]
    pub fn with(mut self, direction: Direction) -> Self {
        self.press(direction);
        self
    }

    #[inline]
    pub fn press(&mut self, direction: Direction) {
        self.0 |= direction.bit();
    }

    #[inline]
    pub fn release(&mut self, direction: Direction) {
        self.0 &= !direction.bit();
    }

    pub fn set(&mut self, direction: Direction, pressed: bool) {
        if pressed {
            self.press(direction);
        } else {
            self.release(direction);
        }
    }

    #[inline]
    pub fn is_pressed(&self, direction: Direction) -> bool {
        self.0 & direction.bit() != 0
    }

    #[inline]
    pub fn is_neutral(&self) -> bool {
        self.0 & Self::MASK == 0
    }

    /// Unit heading on the plane. Opposing keys cancel; diagonals are
    /// normalized so they are not faster than straight lines.
    pub fn heading(&self) -> Vec3 {
        let mut x = 0.0f32;
        let mut y = 0.0f32;
        if self.is_pressed(Direction::Up) {
            y -= 1.0;
        }
        if self.is_pressed(Direction::Down) {
            y += 1.0;
        }
        if self.is_pressed(Direction::Left) {
            x -= 1.0;
        }
        if self.is_pressed(Direction::Right) {
            x += 1.0;
        }
        Vec3::planar(x, y).planar_normalize()
    }
}

/// Position and velocity of one moving entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionState {
    pub position: Vec3,
    pub velocity: Vec3,
}

impl MotionState {
    #[inline]
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
        }
    }
}

/// Movement tuning shared by client and server
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementParams {
    /// Top speed (world units per second)
    pub max_speed: f32,
    /// Velocity change rate (world units per second squared)
    pub acceleration: f32,
}

impl Default for MovementParams {
    fn default() -> Self {
        Self {
            max_speed: MAX_SPEED,
            acceleration: ACCELERATION,
        }
    }
}

/// Advance one tick.
///
/// Velocity moves toward `heading * max_speed` by at most `acceleration * dt`,
/// then position integrates the new velocity. The layer height (`z`) never
/// changes here. A result that is not finite is rejected: the entity keeps
/// its previous position and stops.
pub fn step(state: MotionState, input: InputState, params: &MovementParams, dt: f32) -> MotionState {
    let target = input.heading() * params.max_speed;
    let velocity = state.velocity.move_towards(target, params.acceleration * dt);
    let velocity = Vec3::planar(velocity.x, velocity.y);
    let position = Vec3::new(
        state.position.x + velocity.x * dt,
        state.position.y + velocity.y * dt,
        state.position.z,
    );

    if position.is_finite() && velocity.is_finite() {
        MotionState { position, velocity }
    } else {
        MotionState::at(state.position)
    }
}

/// Apply a run of inputs, one tick each
pub fn simulate(
    state: MotionState,
    inputs: &[InputState],
    params: &MovementParams,
    dt: f32,
) -> MotionState {
    inputs
        .iter()
        .fold(state, |state, input| step(state, *input, params, dt))
}
