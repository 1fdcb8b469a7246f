/// Simulation timing
pub mod sim {
    /// Server tick rate in Hz
    pub const TICK_RATE: u32 = 30;
    /// Delta time per tick in seconds
    pub const DT: f32 = 1.0 / 30.0;
    /// Seconds of simulation between periodic stats log lines
    pub const STATS_LOG_SECONDS: u64 = 30;
}

/// Tile-grid movement tuning
pub mod movement {
    /// Top walking speed (world units per second)
    pub const MAX_SPEED: f32 = 96.0;
    /// Velocity change per second while accelerating or braking
    pub const ACCELERATION: f32 = 960.0;
    /// Half width of an actor's collision box
    pub const ACTOR_HALF_EXTENT: f32 = 6.0;
}

/// Spatial index tuning
pub mod spatial {
    /// Default grid cell edge (world units). Four 16px tiles per cell.
    pub const CELL_SIZE: f32 = 64.0;
    /// Initial capacity for the cell map
    pub const INITIAL_CELL_CAPACITY: usize = 256;
    /// Entities stored inline per cell before spilling to the heap
    pub const CELL_INLINE: usize = 4;
    /// Fraction of a cell edge a cell is widened by for circle overlap tests
    pub const CELL_SLACK: f32 = 1.0e-4;
}

/// Input sequencing and clock drift
pub mod input {
    /// Smallest accepted lead of an input tick over the server tick
    pub const MIN_LEAD: i64 = 1;
    /// Largest accepted lead of an input tick over the server tick
    pub const MAX_LEAD: i64 = 3;
    /// Samples needed before a drift decision is made
    pub const MIN_FRESH_SAMPLES: usize = 8;
    /// Ticks to ignore samples after issuing an adjustment
    pub const SETTLE_TICKS: u64 = 10;
    /// Tick difference beyond which a connection is considered desynced
    pub const DESYNC_LIMIT: u64 = 600;
    /// Client input history length (ticks)
    pub const HISTORY_LENGTH: usize = 20;
    /// Client start offset ahead of the server tick
    pub const INITIAL_LEAD: u64 = 2;
    /// Largest adjustment a client will apply before declaring desync
    pub const MAX_ADJUSTMENT: u64 = 120;
}

/// Area of interest defaults
pub mod aoi {
    /// AOI width in world units (40 tiles)
    pub const WIDTH: f32 = 640.0;
    /// AOI height in world units (30 tiles)
    pub const HEIGHT: f32 = 480.0;
    /// Ticks between owned entity updates (dirty entities skip the wait)
    pub const OWNER_UPDATE_INTERVAL: u64 = 1;
    /// Ticks between updates for observed entities
    pub const OBSERVED_UPDATE_INTERVAL: u64 = 3;
    /// Position change below which an observed entity is considered still
    pub const POSITION_EPSILON: f32 = 0.05;
    /// Velocity change below which an observed entity is considered steady
    pub const VELOCITY_EPSILON: f32 = 0.5;
}

/// Tile map layout
pub mod map {
    /// Tile edge in world units
    pub const TILE_SIZE: f32 = 16.0;
    /// Tiles per chunk side
    pub const CHUNK_TILES: u32 = 16;
    /// Tile layers per chunk (ground, decoration)
    pub const LAYERS: usize = 2;
    /// Extra chunks streamed beyond the AOI edge
    pub const STREAM_MARGIN: u32 = 1;
    /// Largest chunk side accepted from configuration
    pub const MAX_CHUNK_TILES: u32 = 256;
    /// Most tiles one decoded layer may claim
    pub const MAX_LAYER_TILES: usize = (MAX_CHUNK_TILES * MAX_CHUNK_TILES) as usize;
}

/// Network constants
pub mod net {
    /// Maximum framed message size
    pub const MAX_MESSAGE_SIZE: usize = 65536;
    /// Inbound hand-off queue capacity (events between ticks)
    pub const INBOUND_QUEUE_CAPACITY: usize = 4096;
    /// Per-client outbound channel capacity (encoded messages)
    pub const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;
    /// Idle time before a connection is dropped
    pub const CONNECTION_TIMEOUT_MS: u64 = 10_000;
    /// Concurrent connection cap
    pub const MAX_CONNECTIONS: usize = 256;
}

/// World population
pub mod world {
    /// Non-player actors spawned at startup
    pub const NPC_COUNT: usize = 32;
    /// Half size of the square NPCs are scattered over
    pub const NPC_SPREAD: f32 = 1024.0;
    /// Ticks an NPC patrols in one direction before turning
    pub const PATROL_PERIOD: u32 = 90;
    /// Seed for procedural content
    pub const SEED: u64 = 0x7117_2ea1;
}
