pub mod aoi;
pub mod chunk_stream;
pub mod connection;
pub mod framing;
pub mod game_session;
pub mod protocol;
pub mod sequencer;
pub mod transport;
