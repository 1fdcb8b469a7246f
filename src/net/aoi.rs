//! Area of Interest (AOI) manager, one per connection
//!
//! Each tick the AOI rectangle is recomputed from the owned entity's
//! position (or pinned to a fixed origin) and the spatial index is queried
//! with the exact shape test. The new visible set is diffed against the
//! previous one in both directions:
//! - present now, absent before → entered (full snapshot to the client)
//! - absent now, present before → left (id only)
//!
//! The owned entity itself is never part of its own visible set.

use std::str::FromStr;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::game::constants::aoi::{HEIGHT, WIDTH};
use crate::game::entity::EntityId;
use crate::game::spatial::SpatialIndex;
use crate::util::shape::{Rect, Shape};
use crate::util::vec3::Vec3;

// ============================================================================
// AOI Configuration
// ============================================================================

/// Where the AOI rectangle sits
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AoiAnchor {
    /// Centered on the owned entity, following it
    Centered,
    /// Top-left corner pinned at a world position
    Fixed { x: f32, y: f32 },
}

impl AoiAnchor {
    #[inline]
    pub fn is_finite(&self) -> bool {
        match self {
            AoiAnchor::Centered => true,
            AoiAnchor::Fixed { x, y } => x.is_finite() && y.is_finite(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Expected `centered` or `x,y`, got '{0}'")]
pub struct AnchorParseError(pub String);

/// Parses `centered` or a fixed top-left corner written `x,y`
impl FromStr for AoiAnchor {
    type Err = AnchorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("centered") {
            return Ok(AoiAnchor::Centered);
        }
        let invalid = || AnchorParseError(s.to_string());
        let (x, y) = trimmed.split_once(',').ok_or_else(invalid)?;
        let x: f32 = x.trim().parse().map_err(|_| invalid())?;
        let y: f32 = y.trim().parse().map_err(|_| invalid())?;
        let anchor = AoiAnchor::Fixed { x, y };
        if anchor.is_finite() {
            Ok(anchor)
        } else {
            Err(invalid())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AoiConfig {
    pub width: f32,
    pub height: f32,
    pub anchor: AoiAnchor,
}

impl Default for AoiConfig {
    fn default() -> Self {
        Self {
            width: WIDTH,
            height: HEIGHT,
            anchor: AoiAnchor::Centered,
        }
    }
}

/// Rectangle of world space replicated to one client
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaOfInterest {
    /// Top-left corner
    pub origin: Vec3,
    pub width: f32,
    pub height: f32,
}

impl AreaOfInterest {
    pub fn rect(&self) -> Rect {
        Rect::new(
            self.origin.x,
            self.origin.y,
            self.origin.x + self.width,
            self.origin.y + self.height,
        )
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        Shape::Rect(self.rect())
    }
}

/// Visibility changes from one update, both sorted by id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AoiDelta {
    pub entered: SmallVec<[EntityId; 8]>,
    pub left: SmallVec<[EntityId; 8]>,
}

impl AoiDelta {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.left.is_empty()
    }
}

// ============================================================================
// AOI Manager
// ============================================================================

pub struct AreaOfInterestManager {
    config: AoiConfig,
    visible: FxHashSet<EntityId>,
    area: Option<AreaOfInterest>,
}

impl AreaOfInterestManager {
    pub fn new(config: AoiConfig) -> Self {
        Self {
            config,
            visible: FxHashSet::default(),
            area: None,
        }
    }

    #[inline]
    pub fn config(&self) -> &AoiConfig {
        &self.config
    }

    /// AOI for an owner standing at `position`
    pub fn area_for(&self, position: Vec3) -> AreaOfInterest {
        let origin = match self.config.anchor {
            AoiAnchor::Centered => Vec3::new(
                position.x - self.config.width * 0.5,
                position.y - self.config.height * 0.5,
                position.z,
            ),
            AoiAnchor::Fixed { x, y } => Vec3::new(x, y, position.z),
        };
        AreaOfInterest {
            origin,
            width: self.config.width,
            height: self.config.height,
        }
    }

    /// Recompute visibility and report what changed since the last call
    pub fn update(&mut self, owner: EntityId, position: Vec3, index: &SpatialIndex) -> AoiDelta {
        let area = self.area_for(position);
        let mut now = index.query(&area.shape());
        now.remove(&owner);

        let mut delta = AoiDelta::default();
        delta.entered.extend(now.difference(&self.visible).copied());
        delta.left.extend(self.visible.difference(&now).copied());
        delta.entered.sort_unstable();
        delta.left.sort_unstable();

        self.visible = now;
        self.area = Some(area);
        delta
    }

    /// Drop a destroyed entity right away. Returns true if it was visible,
    /// in which case the client must be told it left.
    pub fn forget(&mut self, entity: EntityId) -> bool {
        self.visible.remove(&entity)
    }

    #[inline]
    pub fn visible(&self) -> &FxHashSet<EntityId> {
        &self.visible
    }

    #[inline]
    pub fn is_visible(&self, entity: EntityId) -> bool {
        self.visible.contains(&entity)
    }

    /// Visible ids in ascending order
    pub fn visible_sorted(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self.visible.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[inline]
    pub fn current_area(&self) -> Option<AreaOfInterest> {
        self.area
    }

    /// Forget everything; the next update reports every visible entity as entered
    pub fn reset(&mut self) {
        self.visible.clear();
        self.area = None;
    }
}

impl Default for AreaOfInterestManager {
    fn default() -> Self {
        Self::new(AoiConfig::default())
    }
}
