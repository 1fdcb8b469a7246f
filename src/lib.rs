//! TileRealm Server Library
//!
//! Authoritative replication core for a tile-based multiplayer world: a
//! fixed-rate simulation with tick-stamped input sequencing, per-client
//! area-of-interest replication and map chunk streaming, plus the client
//! half (tick synchronisation, prediction and reconciliation) that talks to it.

pub mod client;
pub mod config;
pub mod game;
pub mod metrics;
pub mod net;
pub mod util;
