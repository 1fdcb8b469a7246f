pub mod constants;
pub mod entity;
pub mod input_buffer;
pub mod input_history;
pub mod map;
pub mod movement;
pub mod spatial;
pub mod world;

/// One discrete simulation step
pub type Tick = u64;
