use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::game::constants::{aoi, input, map, net, sim, spatial, world};
use crate::game::spatial::SpatialIndex;
use crate::net::aoi::{AoiAnchor, AoiConfig};
use crate::net::chunk_stream::StreamConfig;
use crate::net::sequencer::SequencerConfig;

/// Server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Spatial grid cell side, world units
    pub grid_cell_size: f32,
    /// AOI rectangle replicated to each client
    pub aoi_width: f32,
    pub aoi_height: f32,
    /// `centered` follows the owned entity; `x,y` pins the top-left corner
    pub aoi_anchor: AoiAnchor,
    /// World units per tile
    pub tile_size: f32,
    /// Tiles per chunk side
    pub chunk_tiles: u32,
    /// Accepted input lead window, in ticks ahead of the server
    pub input_min_lead: i64,
    pub input_max_lead: i64,
    /// Silence after which a connection is dropped
    pub connection_timeout_ms: u64,
    pub max_connections: usize,
    /// Port of the metrics HTTP endpoint
    pub metrics_port: u16,
    /// Patrolling non-player entities spawned at startup
    pub npc_count: usize,
    pub world_seed: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Port cannot be 0")]
    ZeroPort,
    #[error("Tick rate must be 1-240, got {0}")]
    TickRate(u32),
    #[error("{name} must be a positive finite number, got {value}")]
    NotPositive { name: &'static str, value: f32 },
    #[error("Fixed AOI anchor must be finite, got {0:?}")]
    AnchorNotFinite(AoiAnchor),
    #[error("chunk_tiles must be 1-256, got {0}")]
    ChunkTiles(u32),
    #[error("Input lead window [{min}, {max}] is empty or starts below 0")]
    LeadWindow { min: i64, max: i64 },
    #[error("max_connections must be at least 1")]
    ZeroConnections,
    #[error("Connection timeout must be at least one tick ({tick_ms}ms), got {timeout_ms}ms")]
    Timeout { timeout_ms: u64, tick_ms: u64 },
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4433,
            tick_rate: sim::TICK_RATE,
            grid_cell_size: spatial::CELL_SIZE,
            aoi_width: aoi::WIDTH,
            aoi_height: aoi::HEIGHT,
            aoi_anchor: AoiAnchor::Centered,
            tile_size: map::TILE_SIZE,
            chunk_tiles: map::CHUNK_TILES,
            input_min_lead: input::MIN_LEAD,
            input_max_lead: input::MAX_LEAD,
            connection_timeout_ms: net::CONNECTION_TIMEOUT_MS,
            max_connections: net::MAX_CONNECTIONS,
            metrics_port: 9090,
            npc_count: world::NPC_COUNT,
            world_seed: world::SEED,
        }
    }
}

/// Parse one variable, warning and returning None when it is malformed or
/// fails `accept`
fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    accept: impl Fn(&T) -> bool,
    rule: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) if accept(&value) => Some(value),
        Ok(_) => {
            tracing::warn!("{} must be {}, using default", name, rule);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

fn positive(value: &f32) -> bool {
    value.is_finite() && *value > 0.0
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load config from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parse_var(&lookup, "BIND_ADDRESS", |_: &IpAddr| true, "an IP address") {
            config.bind_address = addr;
        }
        if let Some(port) = parse_var(&lookup, "PORT", |p: &u16| *p > 0, "> 0") {
            config.port = port;
        }
        if let Some(rate) = parse_var(&lookup, "TICK_RATE", |r: &u32| (1..=240).contains(r), "1-240") {
            config.tick_rate = rate;
        }
        if let Some(size) = parse_var(&lookup, "GRID_CELL_SIZE", positive, "> 0") {
            config.grid_cell_size = size;
        }
        if let Some(width) = parse_var(&lookup, "AOI_WIDTH", positive, "> 0") {
            config.aoi_width = width;
        }
        if let Some(height) = parse_var(&lookup, "AOI_HEIGHT", positive, "> 0") {
            config.aoi_height = height;
        }
        if let Some(anchor) = parse_var(&lookup, "AOI_ANCHOR", |_: &AoiAnchor| true, "`centered` or `x,y`") {
            config.aoi_anchor = anchor;
        }
        if let Some(size) = parse_var(&lookup, "TILE_SIZE", positive, "> 0") {
            config.tile_size = size;
        }
        if let Some(tiles) = parse_var(
            &lookup,
            "CHUNK_TILES",
            |t: &u32| (1..=map::MAX_CHUNK_TILES).contains(t),
            "1-256",
        ) {
            config.chunk_tiles = tiles;
        }
        if let Some(lead) = parse_var(&lookup, "INPUT_MIN_LEAD", |l: &i64| *l >= 0, ">= 0") {
            config.input_min_lead = lead;
        }
        if let Some(lead) = parse_var(&lookup, "INPUT_MAX_LEAD", |l: &i64| *l >= 0, ">= 0") {
            config.input_max_lead = lead;
        }
        if let Some(ms) = parse_var(&lookup, "CONNECTION_TIMEOUT_MS", |ms: &u64| *ms > 0, "> 0") {
            config.connection_timeout_ms = ms;
        }
        if let Some(max) = parse_var(&lookup, "MAX_CONNECTIONS", |m: &usize| *m > 0, "> 0") {
            config.max_connections = max;
        }
        if let Some(port) = parse_var(&lookup, "METRICS_PORT", |p: &u16| *p > 0, "> 0") {
            config.metrics_port = port;
        }
        if let Some(count) = parse_var(&lookup, "NPC_COUNT", |_: &usize| true, "a count") {
            config.npc_count = count;
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if !(1..=240).contains(&self.tick_rate) {
            return Err(ConfigError::TickRate(self.tick_rate));
        }
        for (name, value) in [
            ("grid_cell_size", self.grid_cell_size),
            ("aoi_width", self.aoi_width),
            ("aoi_height", self.aoi_height),
            ("tile_size", self.tile_size),
        ] {
            if !positive(&value) {
                return Err(ConfigError::NotPositive { name, value });
            }
        }
        if !self.aoi_anchor.is_finite() {
            return Err(ConfigError::AnchorNotFinite(self.aoi_anchor));
        }
        if !(1..=map::MAX_CHUNK_TILES).contains(&self.chunk_tiles) {
            return Err(ConfigError::ChunkTiles(self.chunk_tiles));
        }
        if self.input_min_lead < 0 || self.input_min_lead > self.input_max_lead {
            return Err(ConfigError::LeadWindow {
                min: self.input_min_lead,
                max: self.input_max_lead,
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        let tick_ms = self.tick_duration().as_millis() as u64;
        if self.connection_timeout_ms < tick_ms {
            return Err(ConfigError::Timeout {
                timeout_ms: self.connection_timeout_ms,
                tick_ms,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate.max(1) as f32
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate.max(1) as u64)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn spatial_index(&self) -> SpatialIndex {
        SpatialIndex::new(self.grid_cell_size, self.grid_cell_size)
    }

    pub fn sequencer(&self) -> SequencerConfig {
        SequencerConfig {
            min_lead: self.input_min_lead,
            max_lead: self.input_max_lead,
            ..SequencerConfig::default()
        }
    }

    pub fn aoi(&self) -> AoiConfig {
        AoiConfig {
            width: self.aoi_width,
            height: self.aoi_height,
            anchor: self.aoi_anchor,
        }
    }

    pub fn stream(&self) -> StreamConfig {
        StreamConfig::for_aoi(self.aoi_width, self.aoi_height, self.tile_size, self.chunk_tiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4433);
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.input_min_lead, 1);
        assert_eq!(config.input_max_lead, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
    }

    #[test]
    fn test_from_lookup_applies_valid_values() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "7000"),
            ("TICK_RATE", "60"),
            ("GRID_CELL_SIZE", "32.5"),
            ("INPUT_MAX_LEAD", "5"),
            ("BIND_ADDRESS", "127.0.0.1"),
        ]));
        assert_eq!(config.port, 7000);
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.grid_cell_size, 32.5);
        assert_eq!(config.input_max_lead, 5);
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_from_lookup_ignores_invalid_values() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "0"),
            ("TICK_RATE", "fast"),
            ("GRID_CELL_SIZE", "-4"),
            ("AOI_WIDTH", "NaN"),
        ]));
        let defaults = ServerConfig::default();
        assert_eq!(config.port, defaults.port);
        assert_eq!(config.tick_rate, defaults.tick_rate);
        assert_eq!(config.grid_cell_size, defaults.grid_cell_size);
        assert_eq!(config.aoi_width, defaults.aoi_width);
    }

    #[test]
    fn test_aoi_anchor_from_env() {
        let fixed = ServerConfig::from_lookup(lookup(&[("AOI_ANCHOR", "100,-50")]));
        assert_eq!(fixed.aoi().anchor, AoiAnchor::Fixed { x: 100.0, y: -50.0 });

        let bad = ServerConfig::from_lookup(lookup(&[("AOI_ANCHOR", "somewhere")]));
        assert_eq!(bad.aoi().anchor, AoiAnchor::Centered);

        let config = ServerConfig {
            aoi_anchor: AoiAnchor::Fixed { x: f32::NAN, y: 0.0 },
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::AnchorNotFinite(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_lead_window() {
        let config = ServerConfig {
            input_min_lead: 4,
            input_max_lead: 2,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::LeadWindow { min: 4, max: 2 })
        );
    }

    #[test]
    fn test_validate_rejects_timeout_below_tick() {
        let config = ServerConfig {
            tick_rate: 10,
            connection_timeout_ms: 50,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Timeout { .. })));
    }

    #[test]
    fn test_component_configs_follow_settings() {
        let config = ServerConfig {
            input_min_lead: 2,
            input_max_lead: 6,
            aoi_width: 320.0,
            grid_cell_size: 48.0,
            ..ServerConfig::default()
        };
        assert_eq!(config.sequencer().max_lead, 6);
        assert_eq!(config.sequencer().target_lead(), 4.0);
        assert_eq!(config.aoi().width, 320.0);
        assert_eq!(config.spatial_index().cell_size(), (48.0, 48.0));
        assert_eq!(config.tick_duration(), Duration::from_micros(33_333));
    }
}
