//! Uniform grid spatial index ("entity locator")
//!
//! Divides the world into fixed-size cells. Each entity is linked into every
//! cell its shape overlaps: the whole bounding extent for rectangles, the
//! extent minus untouched corner cells for circles. A reverse map remembers
//! the extent so a move only touches the cells it actually leaves and enters.
//!
//! Queries run in two passes: a coarse pass collecting every entity linked to
//! a cell under the query's bounding extent, then a fine pass testing the
//! exact shapes. The coarse pass alone is enough for interest management
//! heuristics; the fine pass gives exact membership.

use hashbrown::HashMap;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::warn;

use crate::game::constants::spatial::{CELL_INLINE, CELL_SIZE, CELL_SLACK, INITIAL_CELL_CAPACITY};
use crate::game::entity::EntityId;
use crate::util::shape::{Rect, Shape};

/// Grid cell key - (x, y) cell coordinates
pub type CellKey = (i32, i32);

type CellList = SmallVec<[EntityId; CELL_INLINE]>;

/// Inclusive range of grid cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellExtent {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl CellExtent {
    #[inline]
    pub fn contains(&self, (x, y): CellKey) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Number of cells covered; saturates instead of overflowing
    pub fn cell_count(&self) -> u64 {
        let w = (self.max_x as i64 - self.min_x as i64 + 1).max(0) as u64;
        let h = (self.max_y as i64 - self.min_y as i64 + 1).max(0) as u64;
        w.saturating_mul(h)
    }

    pub fn cells(&self) -> impl Iterator<Item = CellKey> {
        let (min_x, max_x) = (self.min_x, self.max_x);
        (self.min_y..=self.max_y).flat_map(move |y| (min_x..=max_x).map(move |x| (x, y)))
    }
}

/// Recorded placement of one entity
#[derive(Debug, Clone, Copy)]
struct Placement {
    extent: CellExtent,
    shape: Shape,
}

/// Errors from grid configuration and invariant checks
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpatialError {
    #[error("Invalid cell size {0}x{1}")]
    InvalidCellSize(f32, f32),
    #[error("Cell {cell:?} lists untracked entity {entity}")]
    UntrackedEntity { cell: CellKey, entity: EntityId },
    #[error("Entity {entity} linked into cell {cell:?} it does not overlap")]
    StrayCellEntry { cell: CellKey, entity: EntityId },
    #[error("Entity {entity} listed twice in cell {cell:?}")]
    DuplicateCellEntry { cell: CellKey, entity: EntityId },
    #[error("Entity {entity} missing from covered cell {cell:?}")]
    MissingCellEntry { cell: CellKey, entity: EntityId },
    #[error("Entity {0} has an extent that does not match its shape")]
    StaleExtent(EntityId),
}

/// Grid occupancy summary
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpatialStats {
    pub entities: usize,
    pub occupied_cells: usize,
    pub max_per_cell: usize,
    pub avg_per_cell: f32,
}

/// Uniform grid mapping cells to the entities overlapping them
#[derive(Debug)]
pub struct SpatialIndex {
    cell_width: f32,
    cell_height: f32,
    inv_cell_width: f32,
    inv_cell_height: f32,
    cells: HashMap<CellKey, CellList>,
    placements: HashMap<EntityId, Placement>,
}

impl SpatialIndex {
    /// Create an index; non-positive or non-finite sizes fall back to the default
    pub fn new(cell_width: f32, cell_height: f32) -> Self {
        let (cell_width, cell_height) = if valid_cell_size(cell_width, cell_height) {
            (cell_width, cell_height)
        } else {
            warn!(
                "Invalid spatial cell size {}x{}, using {}",
                cell_width, cell_height, CELL_SIZE
            );
            (CELL_SIZE, CELL_SIZE)
        };

        Self {
            cell_width,
            cell_height,
            inv_cell_width: 1.0 / cell_width,
            inv_cell_height: 1.0 / cell_height,
            cells: HashMap::with_capacity(INITIAL_CELL_CAPACITY),
            placements: HashMap::new(),
        }
    }

    #[inline]
    pub fn cell_size(&self) -> (f32, f32) {
        (self.cell_width, self.cell_height)
    }

    /// Change the cell size and re-bucket every tracked entity
    pub fn set_grid_size(&mut self, width: f32, height: f32) -> Result<(), SpatialError> {
        if !valid_cell_size(width, height) {
            return Err(SpatialError::InvalidCellSize(width, height));
        }

        self.cell_width = width;
        self.cell_height = height;
        self.inv_cell_width = 1.0 / width;
        self.inv_cell_height = 1.0 / height;

        self.cells.clear();
        let placements: Vec<(EntityId, Shape)> = self
            .placements
            .drain()
            .map(|(entity, placement)| (entity, placement.shape))
            .collect();
        for (entity, shape) in placements {
            self.set_location(entity, shape);
        }
        Ok(())
    }

    #[inline]
    fn cell_x(&self, x: f32) -> i32 {
        (x * self.inv_cell_width).floor() as i32
    }

    #[inline]
    fn cell_y(&self, y: f32) -> i32 {
        (y * self.inv_cell_height).floor() as i32
    }

    /// Cells covered by a bounding rectangle
    #[inline]
    pub fn extent_for(&self, bounds: &Rect) -> CellExtent {
        CellExtent {
            min_x: self.cell_x(bounds.min_x),
            min_y: self.cell_y(bounds.min_y),
            max_x: self.cell_x(bounds.max_x),
            max_y: self.cell_y(bounds.max_y),
        }
    }

    /// World rectangle of a cell, widened by a hair so float rounding in
    /// `cell_x`/`cell_y` never hides a touching shape
    fn cell_rect(&self, (x, y): CellKey) -> Rect {
        let slack_x = self.cell_width * CELL_SLACK;
        let slack_y = self.cell_height * CELL_SLACK;
        Rect::new(
            x as f32 * self.cell_width - slack_x,
            y as f32 * self.cell_height - slack_y,
            (x as f32 + 1.0) * self.cell_width + slack_x,
            (y as f32 + 1.0) * self.cell_height + slack_y,
        )
    }

    /// Whether `shape` belongs in `cell`, given the cell is inside its extent
    #[inline]
    fn overlaps_cell(&self, shape: &Shape, cell: CellKey) -> bool {
        match shape {
            Shape::Rect(_) => true,
            Shape::Circle { .. } => shape.intersects(&Shape::Rect(self.cell_rect(cell))),
        }
    }

    /// Insert or move an entity
    pub fn set_location(&mut self, entity: EntityId, shape: Shape) {
        let extent = self.extent_for(&shape.bounds());

        if let Some(placement) = self.placements.get_mut(&entity) {
            // A rectangle fills its extent, so the linked cells cannot change
            let both_rects = matches!((placement.shape, shape), (Shape::Rect(_), Shape::Rect(_)));
            if placement.extent == extent && both_rects {
                placement.shape = shape;
                return;
            }
            let previous = placement.extent;
            self.unlink(entity, previous);
        }

        for cell in extent.cells() {
            if self.overlaps_cell(&shape, cell) {
                self.cells.entry(cell).or_default().push(entity);
            }
        }
        self.placements.insert(entity, Placement { extent, shape });
    }

    /// Drop an entity from the index. Returns false if it was not tracked.
    pub fn remove(&mut self, entity: EntityId) -> bool {
        match self.placements.remove(&entity) {
            Some(placement) => {
                self.unlink(entity, placement.extent);
                true
            }
            None => false,
        }
    }

    fn unlink(&mut self, entity: EntityId, extent: CellExtent) {
        for cell in extent.cells() {
            if let Some(list) = self.cells.get_mut(&cell) {
                if let Some(pos) = list.iter().position(|e| *e == entity) {
                    list.swap_remove(pos);
                }
                if list.is_empty() {
                    self.cells.remove(&cell);
                }
            }
        }
    }

    /// Visit each entity linked under `extent` once
    fn for_each_candidate(&self, extent: CellExtent, mut visit: impl FnMut(EntityId)) {
        let mut seen = FxHashSet::default();
        // Huge query extents walk the occupied cells instead of the empty grid
        if extent.cell_count() > self.cells.len() as u64 {
            for (cell, list) in &self.cells {
                if extent.contains(*cell) {
                    for entity in list {
                        if seen.insert(*entity) {
                            visit(*entity);
                        }
                    }
                }
            }
        } else {
            for cell in extent.cells() {
                if let Some(list) = self.cells.get(&cell) {
                    for entity in list {
                        if seen.insert(*entity) {
                            visit(*entity);
                        }
                    }
                }
            }
        }
    }

    /// Coarse pass: every entity sharing a cell with the shape's bounding extent
    pub fn query_coarse(&self, shape: &Shape) -> FxHashSet<EntityId> {
        let mut result = FxHashSet::default();
        self.for_each_candidate(self.extent_for(&shape.bounds()), |entity| {
            result.insert(entity);
        });
        result
    }

    /// Exact query: entities whose recorded shape intersects `shape`
    pub fn query(&self, shape: &Shape) -> FxHashSet<EntityId> {
        let mut result = FxHashSet::default();
        self.for_each_candidate(self.extent_for(&shape.bounds()), |entity| {
            if let Some(placement) = self.placements.get(&entity) {
                if shape.intersects(&placement.shape) {
                    result.insert(entity);
                }
            }
        });
        result
    }

    #[inline]
    pub fn extent_of(&self, entity: EntityId) -> Option<CellExtent> {
        self.placements.get(&entity).map(|p| p.extent)
    }

    #[inline]
    pub fn shape_of(&self, entity: EntityId) -> Option<Shape> {
        self.placements.get(&entity).map(|p| p.shape)
    }

    #[inline]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.placements.contains_key(&entity)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.placements.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.placements.clear();
    }

    pub fn stats(&self) -> SpatialStats {
        let occupied_cells = self.cells.len();
        let links: usize = self.cells.values().map(|list| list.len()).sum();
        SpatialStats {
            entities: self.placements.len(),
            occupied_cells,
            max_per_cell: self.cells.values().map(|list| list.len()).max().unwrap_or(0),
            avg_per_cell: if occupied_cells > 0 {
                links as f32 / occupied_cells as f32
            } else {
                0.0
            },
        }
    }

    /// Verify forward lists and the reverse map agree exactly. Test support.
    pub fn check_invariants(&self) -> Result<(), SpatialError> {
        for (cell, list) in &self.cells {
            let mut seen = FxHashSet::default();
            for entity in list {
                let entity = *entity;
                let placement = self
                    .placements
                    .get(&entity)
                    .ok_or(SpatialError::UntrackedEntity { cell: *cell, entity })?;
                if !placement.extent.contains(*cell) || !self.overlaps_cell(&placement.shape, *cell) {
                    return Err(SpatialError::StrayCellEntry { cell: *cell, entity });
                }
                if !seen.insert(entity) {
                    return Err(SpatialError::DuplicateCellEntry { cell: *cell, entity });
                }
            }
        }

        for (entity, placement) in &self.placements {
            if placement.extent != self.extent_for(&placement.shape.bounds()) {
                return Err(SpatialError::StaleExtent(*entity));
            }
            for cell in placement.extent.cells() {
                if !self.overlaps_cell(&placement.shape, cell) {
                    continue;
                }
                let linked = self
                    .cells
                    .get(&cell)
                    .is_some_and(|list| list.contains(entity));
                if !linked {
                    return Err(SpatialError::MissingCellEntry {
                        cell,
                        entity: *entity,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(CELL_SIZE, CELL_SIZE)
    }
}

#[inline]
fn valid_cell_size(width: f32, height: f32) -> bool {
    width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0
}
