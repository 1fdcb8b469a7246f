//! Tile map chunks and their palette-compressed wire form.
//!
//! The map itself lives outside the replication core; it is reached through
//! the [`TileMap`] trait. [`GeneratedTileMap`] is a deterministic procedural
//! map used by the server binary and tests.

use serde::{Deserialize, Serialize};

use crate::game::constants::map::{CHUNK_TILES, LAYERS, MAX_LAYER_TILES, TILE_SIZE};
use crate::util::vec3::Vec3;

/// Tile type identifier
pub type TileId = u16;

/// Chunk coordinates (world position / tile size / chunk tiles, floored)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub x: i32,
    pub y: i32,
}

impl ChunkPosition {
    #[inline]
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chunk containing a world position
    #[inline]
    pub fn containing(position: Vec3, tile_size: f32, chunk_tiles: u32) -> Self {
        let chunk_size = tile_size * chunk_tiles as f32;
        Self {
            x: (position.x / chunk_size).floor() as i32,
            y: (position.y / chunk_size).floor() as i32,
        }
    }

    /// Chessboard distance in chunks
    #[inline]
    pub fn distance(&self, other: ChunkPosition) -> u32 {
        let dx = (self.x as i64 - other.x as i64).unsigned_abs();
        let dy = (self.y as i64 - other.y as i64).unsigned_abs();
        dx.max(dy).min(u32::MAX as u64) as u32
    }

    /// Square of chunks within `radius` of this one
    pub fn neighborhood(&self, radius: u32) -> impl Iterator<Item = ChunkPosition> {
        let r = radius as i32;
        let center = *self;
        (-r..=r).flat_map(move |dy| {
            (-r..=r).map(move |dx| ChunkPosition::new(center.x + dx, center.y + dy))
        })
    }
}

/// Source of chunk tile data
pub trait TileMap: Send + Sync {
    /// Tiles per chunk side
    fn chunk_tiles(&self) -> u32;

    /// Row-major tile layers for one chunk, each `chunk_tiles²` long
    fn chunk_layers(&self, chunk: ChunkPosition) -> Vec<Vec<TileId>>;
}

/// Ground tile ids used by the generated map
pub mod tiles {
    use super::TileId;

    pub const EMPTY: TileId = 0;
    pub const GRASS: TileId = 1;
    pub const DIRT: TileId = 2;
    pub const WATER: TileId = 3;
    pub const SAND: TileId = 4;
    pub const FLOWERS: TileId = 10;
    pub const ROCK: TileId = 11;
}

/// Deterministic procedural map
#[derive(Debug, Clone)]
pub struct GeneratedTileMap {
    seed: u64,
    chunk_tiles: u32,
}

impl GeneratedTileMap {
    pub fn new(seed: u64, chunk_tiles: u32) -> Self {
        Self {
            seed,
            chunk_tiles: chunk_tiles.max(1),
        }
    }

    fn hash(&self, x: i64, y: i64, salt: u64) -> u64 {
        // splitmix64 over the packed coordinates
        let mut z = self
            .seed
            .wrapping_add(salt.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .wrapping_add((x as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9))
            .wrapping_add((y as u64).wrapping_mul(0x94D0_49BB_1331_11EB));
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Ground tile at absolute tile coordinates
    pub fn ground_at(&self, tx: i64, ty: i64) -> TileId {
        // Coarse 8x8 biome blocks with per-tile speckle
        let biome = self.hash(tx.div_euclid(8), ty.div_euclid(8), 1) % 10;
        let speckle = self.hash(tx, ty, 2) % 16;
        match biome {
            0 => tiles::WATER,
            1 if speckle < 12 => tiles::SAND,
            2 | 3 if speckle < 10 => tiles::DIRT,
            _ => tiles::GRASS,
        }
    }

    /// Decoration tile at absolute tile coordinates
    pub fn decoration_at(&self, tx: i64, ty: i64) -> TileId {
        if self.ground_at(tx, ty) == tiles::WATER {
            return tiles::EMPTY;
        }
        match self.hash(tx, ty, 3) % 32 {
            0 => tiles::ROCK,
            1 | 2 => tiles::FLOWERS,
            _ => tiles::EMPTY,
        }
    }
}

impl Default for GeneratedTileMap {
    fn default() -> Self {
        Self::new(crate::game::constants::world::SEED, CHUNK_TILES)
    }
}

impl TileMap for GeneratedTileMap {
    fn chunk_tiles(&self) -> u32 {
        self.chunk_tiles
    }

    fn chunk_layers(&self, chunk: ChunkPosition) -> Vec<Vec<TileId>> {
        let n = self.chunk_tiles as i64;
        let origin_x = chunk.x as i64 * n;
        let origin_y = chunk.y as i64 * n;

        let mut layers = vec![Vec::with_capacity((n * n) as usize); LAYERS];
        for ty in origin_y..origin_y + n {
            for tx in origin_x..origin_x + n {
                layers[0].push(self.ground_at(tx, ty));
                layers[1].push(self.decoration_at(tx, ty));
            }
        }
        layers
    }
}

// ============================================================================
// Palette Compression
// ============================================================================

/// Errors when expanding a palette layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaletteError {
    #[error("Bit width {0} is too wide for palette of {1} entries")]
    BadBitWidth(u8, usize),
    #[error("Packed data holds {0} words, {1} needed")]
    Truncated(usize, usize),
    #[error("Palette index {0} out of range ({1} entries)")]
    IndexOutOfRange(u64, usize),
    #[error("Layer claims {0} tiles, at most {1} allowed")]
    TooLong(u32, usize),
}

/// One tile layer as a palette of distinct ids plus packed indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteLayer {
    pub palette: Vec<TileId>,
    pub bits_per_index: u8,
    pub len: u32,
    pub packed: Vec<u64>,
}

impl PaletteLayer {
    /// Palette in first-seen order; indices use the fewest bits that fit it
    pub fn compress(tiles: &[TileId]) -> Self {
        let mut palette: Vec<TileId> = Vec::new();
        let mut indices: Vec<u64> = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let index = match palette.iter().position(|p| p == tile) {
                Some(index) => index,
                None => {
                    palette.push(*tile);
                    palette.len() - 1
                }
            };
            indices.push(index as u64);
        }

        let bits = bits_for(palette.len());
        let mut packed = vec![0u64; words_for(tiles.len(), bits)];
        if bits > 0 {
            for (i, index) in indices.iter().enumerate() {
                let bit = i * bits as usize;
                let word = bit / 64;
                let offset = bit % 64;
                packed[word] |= index << offset;
                if offset + bits as usize > 64 {
                    packed[word + 1] |= index >> (64 - offset);
                }
            }
        }

        Self {
            palette,
            bits_per_index: bits,
            len: tiles.len() as u32,
            packed,
        }
    }

    pub fn decompress(&self) -> Result<Vec<TileId>, PaletteError> {
        let len = self.len as usize;
        if len > MAX_LAYER_TILES {
            return Err(PaletteError::TooLong(self.len, MAX_LAYER_TILES));
        }
        let bits = self.bits_per_index;
        if bits > 16 || (bits == 0 && self.palette.len() > 1) {
            return Err(PaletteError::BadBitWidth(bits, self.palette.len()));
        }
        let needed = words_for(len, bits);
        if self.packed.len() < needed {
            return Err(PaletteError::Truncated(self.packed.len(), needed));
        }

        let mask = if bits == 0 { 0 } else { (1u64 << bits) - 1 };
        let mut tiles = Vec::with_capacity(len);
        for i in 0..len {
            let index = if bits == 0 {
                0
            } else {
                let bit = i * bits as usize;
                let word = bit / 64;
                let offset = bit % 64;
                let mut value = self.packed[word] >> offset;
                if offset + bits as usize > 64 {
                    value |= self.packed[word + 1] << (64 - offset);
                }
                value & mask
            };
            let tile = self
                .palette
                .get(index as usize)
                .ok_or(PaletteError::IndexOutOfRange(index, self.palette.len()))?;
            tiles.push(*tile);
        }
        Ok(tiles)
    }
}

#[inline]
fn bits_for(palette_len: usize) -> u8 {
    if palette_len <= 1 {
        0
    } else {
        (usize::BITS - (palette_len - 1).leading_zeros()) as u8
    }
}

#[inline]
fn words_for(len: usize, bits: u8) -> usize {
    (len * bits as usize).div_ceil(64)
}

/// Palette-compressed tile layers of one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkData {
    pub position: ChunkPosition,
    pub layers: Vec<PaletteLayer>,
}

impl ChunkData {
    pub fn compress(position: ChunkPosition, layers: &[Vec<TileId>]) -> Self {
        Self {
            position,
            layers: layers.iter().map(|layer| PaletteLayer::compress(layer)).collect(),
        }
    }

    /// Load and compress a chunk from a map
    pub fn from_map(map: &dyn TileMap, position: ChunkPosition) -> Self {
        Self::compress(position, &map.chunk_layers(position))
    }

    pub fn decompress(&self) -> Result<Vec<Vec<TileId>>, PaletteError> {
        self.layers.iter().map(PaletteLayer::decompress).collect()
    }
}

/// Default world-to-chunk mapping
#[inline]
pub fn chunk_of(position: Vec3) -> ChunkPosition {
    ChunkPosition::containing(position, TILE_SIZE, CHUNK_TILES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_of_negative_positions() {
        // 16 tiles * 16 units = 256 units per chunk
        assert_eq!(chunk_of(Vec3::planar(0.0, 0.0)), ChunkPosition::new(0, 0));
        assert_eq!(chunk_of(Vec3::planar(255.9, 256.0)), ChunkPosition::new(0, 1));
        assert_eq!(chunk_of(Vec3::planar(-0.1, -256.0)), ChunkPosition::new(-1, -1));
    }

    #[test]
    fn test_neighborhood_and_distance() {
        let center = ChunkPosition::new(3, -2);
        let around: Vec<_> = center.neighborhood(1).collect();
        assert_eq!(around.len(), 9);
        assert!(around.iter().all(|c| center.distance(*c) <= 1));
        assert_eq!(center.distance(ChunkPosition::new(-1, 0)), 4);
    }

    #[test]
    fn test_palette_single_tile_uses_no_bits() {
        let tiles = vec![tiles::GRASS; 256];
        let layer = PaletteLayer::compress(&tiles);
        assert_eq!(layer.bits_per_index, 0);
        assert!(layer.packed.is_empty());
        assert_eq!(layer.decompress().unwrap(), tiles);
    }

    #[test]
    fn test_palette_bit_widths() {
        assert_eq!(bits_for(2), 1);
        assert_eq!(bits_for(3), 2);
        assert_eq!(bits_for(4), 2);
        assert_eq!(bits_for(5), 3);
        assert_eq!(bits_for(300), 9);
    }

    #[test]
    fn test_palette_indices_cross_word_boundaries() {
        // 5 distinct ids -> 3 bits, so entries straddle u64 words
        let tiles: Vec<TileId> = (0..200).map(|i| [7, 9, 11, 13, 15][i % 5]).collect();
        let layer = PaletteLayer::compress(&tiles);
        assert_eq!(layer.bits_per_index, 3);
        assert_eq!(layer.palette, vec![7, 9, 11, 13, 15]);
        assert_eq!(layer.packed.len(), 10);
        assert_eq!(layer.decompress().unwrap(), tiles);
    }

    #[test]
    fn test_corrupt_layer_rejected() {
        let mut layer = PaletteLayer::compress(&[1, 2, 3, 1]);
        layer.packed.clear();
        assert!(matches!(layer.decompress(), Err(PaletteError::Truncated(0, 1))));

        let mut layer = PaletteLayer::compress(&[1, 2, 3, 1]);
        layer.palette.truncate(2);
        assert!(matches!(
            layer.decompress(),
            Err(PaletteError::IndexOutOfRange(2, 2))
        ));
    }

    #[test]
    fn test_oversized_layer_rejected_before_allocating() {
        let mut layer = PaletteLayer::compress(&[7; 4]);
        assert_eq!(layer.bits_per_index, 0);
        layer.len = u32::MAX;
        assert_eq!(
            layer.decompress(),
            Err(PaletteError::TooLong(u32::MAX, MAX_LAYER_TILES))
        );

        let full = PaletteLayer::compress(&vec![7; MAX_LAYER_TILES]);
        assert_eq!(full.decompress().map(|tiles| tiles.len()), Ok(MAX_LAYER_TILES));
    }

    #[test]
    fn test_generated_map_is_deterministic() {
        let a = GeneratedTileMap::new(42, 16);
        let b = GeneratedTileMap::new(42, 16);
        let chunk = ChunkPosition::new(-3, 7);

        let layers = a.chunk_layers(chunk);
        assert_eq!(layers, b.chunk_layers(chunk));
        assert_eq!(layers.len(), LAYERS);
        assert!(layers.iter().all(|layer| layer.len() == 256));

        let data = ChunkData::from_map(&a, chunk);
        assert_eq!(data.decompress().unwrap(), layers);
        assert!(data.layers[0].palette.len() <= 4);
    }
}
