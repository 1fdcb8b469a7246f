use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// World-space vector. Movement happens on the x/y plane, `z` is the layer
/// height and is carried through the simulation untouched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };
    pub const UP: Vec3 = Vec3 { x: 0.0, y: -1.0, z: 0.0 };
    pub const DOWN: Vec3 = Vec3 { x: 0.0, y: 1.0, z: 0.0 };
    pub const LEFT: Vec3 = Vec3 { x: -1.0, y: 0.0, z: 0.0 };
    pub const RIGHT: Vec3 = Vec3 { x: 1.0, y: 0.0, z: 0.0 };

    #[inline]
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Point on the ground layer
    #[inline]
    pub fn planar(x: f32, y: f32) -> Self {
        Self { x, y, z: 0.0 }
    }

    /// Length measured on the x/y plane only
    #[inline]
    pub fn planar_length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    #[inline]
    pub fn planar_length_sq(&self) -> f32 {
        self.x * self.x + self.y * self.y
    }

    #[inline]
    pub fn planar_distance_to(&self, other: Vec3) -> f32 {
        (*self - other).planar_length()
    }

    /// Unit vector on the plane (z dropped); zero stays zero
    pub fn planar_normalize(&self) -> Self {
        let len = self.planar_length();
        if len > 0.0 {
            Self::new(self.x / len, self.y / len, 0.0)
        } else {
            Self::ZERO
        }
    }

    /// Moves `self` toward `target` by at most `max_delta` on the x/y plane.
    /// Reaches the target exactly once within range so integration never
    /// oscillates around it.
    pub fn move_towards(&self, target: Vec3, max_delta: f32) -> Self {
        let delta = target - *self;
        let dist = delta.planar_length();
        if dist <= max_delta || dist == 0.0 {
            Self::new(target.x, target.y, self.z)
        } else {
            let scale = max_delta / dist;
            Self::new(self.x + delta.x * scale, self.y + delta.y * scale, self.z)
        }
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Check if vector is approximately equal to another
    pub fn approx_eq(&self, other: Vec3, epsilon: f32) -> bool {
        (self.x - other.x).abs() < epsilon
            && (self.y - other.y).abs() < epsilon
            && (self.z - other.z).abs() < epsilon
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
        }
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
        }
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self {
            x: self.x * rhs,
            y: self.y * rhs,
            z: self.z * rhs,
        }
    }
}

impl Neg for Vec3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
        self.z += rhs.z;
    }
}

impl SubAssign for Vec3 {
    fn sub_assign(&mut self, rhs: Self) {
        self.x -= rhs.x;
        self.y -= rhs.y;
        self.z -= rhs.z;
    }
}

impl MulAssign<f32> for Vec3 {
    fn mul_assign(&mut self, rhs: f32) {
        self.x *= rhs;
        self.y *= rhs;
        self.z *= rhs;
    }
}
