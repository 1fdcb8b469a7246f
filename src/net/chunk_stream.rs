//! Incremental map chunk streaming, one per connection
//!
//! The streamer remembers the chunk its owner stood in and which chunks the
//! client already holds. Crossing a chunk border only yields the chunks that
//! just came into range; a chunk is sent again only after it was invalidated.

use rustc_hash::FxHashSet;

use crate::game::constants::map::{CHUNK_TILES, STREAM_MARGIN, TILE_SIZE};
use crate::game::constants::aoi;
use crate::game::map::ChunkPosition;
use crate::util::vec3::Vec3;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// World units per tile
    pub tile_size: f32,
    /// Tiles per chunk side
    pub chunk_tiles: u32,
    /// Chebyshev radius, in chunks, kept streamed around the owner
    pub view_radius: u32,
}

impl StreamConfig {
    /// Radius large enough to cover an AOI of the given size from anywhere
    /// inside the owner's chunk, plus the prefetch margin
    pub fn for_aoi(aoi_width: f32, aoi_height: f32, tile_size: f32, chunk_tiles: u32) -> Self {
        let chunk_size = (tile_size * chunk_tiles.max(1) as f32).max(f32::EPSILON);
        let half = aoi_width.max(aoi_height).max(0.0) * 0.5;
        let radius = (half / chunk_size).ceil() as u32 + STREAM_MARGIN;
        Self {
            tile_size,
            chunk_tiles,
            view_radius: radius,
        }
    }

    #[inline]
    pub fn chunk_of(&self, position: Vec3) -> ChunkPosition {
        ChunkPosition::containing(position, self.tile_size, self.chunk_tiles)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::for_aoi(aoi::WIDTH, aoi::HEIGHT, TILE_SIZE, CHUNK_TILES)
    }
}

pub struct ChunkStreamer {
    config: StreamConfig,
    last_chunk: Option<ChunkPosition>,
    streamed: FxHashSet<ChunkPosition>,
    /// Invalidated chunks inside the current neighborhood
    pending: Vec<ChunkPosition>,
}

impl ChunkStreamer {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            last_chunk: None,
            streamed: FxHashSet::default(),
            pending: Vec::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Chunks to send for an owner now at `position`, nearest first.
    /// Every returned chunk is marked streamed.
    pub fn update(&mut self, position: Vec3) -> Vec<ChunkPosition> {
        let current = self.config.chunk_of(position);
        let radius = self.config.view_radius;

        let mut out: Vec<ChunkPosition> = self
            .pending
            .drain(..)
            .filter(|chunk| chunk.distance(current) <= radius)
            .collect();

        match self.last_chunk {
            None => out.extend(current.neighborhood(radius)),
            Some(previous) if previous != current => out.extend(
                current
                    .neighborhood(radius)
                    .filter(|chunk| chunk.distance(previous) > radius),
            ),
            Some(_) => {}
        }
        self.last_chunk = Some(current);

        out.retain(|chunk| !self.streamed.contains(chunk));
        out.sort_unstable_by_key(|chunk| {
            let dx = (chunk.x as i64 - current.x as i64).pow(2);
            let dy = (chunk.y as i64 - current.y as i64).pow(2);
            (chunk.distance(current), dx + dy, chunk.y, chunk.x)
        });
        out.dedup();
        self.streamed.extend(out.iter().copied());
        out
    }

    /// Forget the owner's location (teleport, respawn). The next update
    /// covers the whole neighborhood again, minus what the client holds.
    pub fn reset(&mut self) {
        self.last_chunk = None;
    }

    /// Mark a chunk's tiles as changed so it is sent again when in range
    pub fn invalidate(&mut self, chunk: ChunkPosition) {
        if !self.streamed.remove(&chunk) {
            return;
        }
        if let Some(current) = self.last_chunk {
            if chunk.distance(current) <= self.config.view_radius {
                self.pending.push(chunk);
            }
        }
    }

    #[inline]
    pub fn streamed(&self) -> &FxHashSet<ChunkPosition> {
        &self.streamed
    }

    #[inline]
    pub fn is_streamed(&self, chunk: ChunkPosition) -> bool {
        self.streamed.contains(&chunk)
    }

    #[inline]
    pub fn last_chunk(&self) -> Option<ChunkPosition> {
        self.last_chunk
    }
}

impl Default for ChunkStreamer {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streamer(radius: u32) -> ChunkStreamer {
        // 10 units per chunk keeps positions readable
        ChunkStreamer::new(StreamConfig {
            tile_size: 1.0,
            chunk_tiles: 10,
            view_radius: radius,
        })
    }

    #[test]
    fn test_first_update_is_full_burst_nearest_first() {
        let mut s = streamer(1);
        let chunks = s.update(Vec3::planar(5.0, 5.0));
        assert_eq!(chunks.len(), 9);
        assert_eq!(chunks[0], ChunkPosition::new(0, 0));
        assert!(chunks[1..].iter().all(|c| c.distance(ChunkPosition::new(0, 0)) == 1));
        assert!(s.is_streamed(ChunkPosition::new(-1, -1)));
    }

    #[test]
    fn test_same_chunk_sends_nothing() {
        let mut s = streamer(1);
        s.update(Vec3::planar(5.0, 5.0));
        assert!(s.update(Vec3::planar(9.0, 1.0)).is_empty());
    }

    #[test]
    fn test_crossing_sends_new_edge_only() {
        let mut s = streamer(1);
        s.update(Vec3::planar(5.0, 5.0));
        let chunks = s.update(Vec3::planar(15.0, 5.0));
        assert_eq!(
            chunks,
            vec![
                ChunkPosition::new(2, 0),
                ChunkPosition::new(2, -1),
                ChunkPosition::new(2, 1),
            ]
        );
    }

    #[test]
    fn test_walking_back_never_resends() {
        let mut s = streamer(1);
        s.update(Vec3::planar(5.0, 5.0));
        s.update(Vec3::planar(15.0, 5.0));
        s.update(Vec3::planar(25.0, 5.0));
        assert!(s.update(Vec3::planar(15.0, 5.0)).is_empty());
        assert!(s.update(Vec3::planar(5.0, 5.0)).is_empty());
        assert_eq!(s.streamed().len(), 15);
    }

    #[test]
    fn test_reset_sends_only_missing() {
        let mut s = streamer(1);
        s.update(Vec3::planar(5.0, 5.0));
        s.reset();
        // Teleport two chunks right: column x=1 is already held
        let chunks = s.update(Vec3::planar(25.0, 5.0));
        assert_eq!(chunks.len(), 6);
        assert!(chunks.iter().all(|c| c.x >= 2));
        assert_eq!(chunks[0], ChunkPosition::new(2, 0));
    }

    #[test]
    fn test_invalidate_resends_once() {
        let mut s = streamer(1);
        s.update(Vec3::planar(5.0, 5.0));

        s.invalidate(ChunkPosition::new(1, 1));
        s.invalidate(ChunkPosition::new(40, 40)); // never streamed
        assert!(!s.is_streamed(ChunkPosition::new(1, 1)));

        assert_eq!(s.update(Vec3::planar(5.0, 5.0)), vec![ChunkPosition::new(1, 1)]);
        assert!(s.update(Vec3::planar(5.0, 5.0)).is_empty());
    }

    #[test]
    fn test_invalidated_out_of_range_waits_until_in_range() {
        let mut s = streamer(1);
        s.update(Vec3::planar(5.0, 5.0));
        s.update(Vec3::planar(35.0, 5.0));
        // (-1, 0) is held but far away now
        s.invalidate(ChunkPosition::new(-1, 0));
        assert!(s.update(Vec3::planar(35.0, 5.0)).is_empty());

        let back = s.update(Vec3::planar(5.0, 5.0));
        assert!(back.contains(&ChunkPosition::new(-1, 0)));
        assert!(!back.contains(&ChunkPosition::new(0, 0)));
    }

    #[test]
    fn test_for_aoi_covers_view() {
        let config = StreamConfig::for_aoi(640.0, 480.0, 16.0, 16);
        // 320 / 256 rounds up to 2, plus the margin
        assert_eq!(config.view_radius, 2 + STREAM_MARGIN);
    }
}
