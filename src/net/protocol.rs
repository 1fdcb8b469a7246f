//! Wire messages between client and server
//!
//! The message types carry no encoding logic; `encode`/`decode` below are the
//! only place the wire format is chosen.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::entity::EntityId;
use crate::game::map::ChunkData;
use crate::game::movement::{InputState, MotionState};
use crate::game::Tick;
use crate::util::vec3::Vec3;

/// Network identity of one connection
pub type ClientId = Uuid;

/// Full replicated state of one entity at a tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub tick: Tick,
    pub entity: EntityId,
    pub position: Vec3,
    pub velocity: Vec3,
    pub input: InputState,
    pub half_extent: f32,
}

impl EntitySnapshot {
    #[inline]
    pub fn motion(&self) -> MotionState {
        MotionState {
            position: self.position,
            velocity: self.velocity,
        }
    }
}

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Input edge, tagged with the tick it applies to
    InputChangeRequest { tick: Tick, input: InputState },
    /// Liveness and clock sample when nothing else is queued
    Heartbeat { tick: Tick },
    /// Graceful leave
    Disconnect,
}

impl ClientMessage {
    /// Client tick carried by the message, if any
    pub fn tick(&self) -> Option<Tick> {
        match self {
            ClientMessage::InputChangeRequest { tick, .. } | ClientMessage::Heartbeat { tick } => {
                Some(*tick)
            }
            ClientMessage::Disconnect => None,
        }
    }
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Sent once per accepted connection
    ConnectionResponse {
        tick: Tick,
        entity: EntityId,
        spawn_position: Vec3,
    },
    /// Authoritative state for the owned entity, or a periodic update for an observed one
    EntityUpdate(EntitySnapshot),
    /// Entity came into the area of interest
    EntityEntered(EntitySnapshot),
    /// Entity left the area of interest or was destroyed
    EntityLeft { tick: Tick, entity: EntityId },
    /// Map chunk newly in range
    ChunkData(ChunkData),
    /// Shift the client tick once by `delta`
    TickAdjustment { delta: i64 },
    /// Connection is being closed by the server
    Kicked { reason: String },
}

impl ServerMessage {
    /// Short name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionResponse { .. } => "connection_response",
            ServerMessage::EntityUpdate(_) => "entity_update",
            ServerMessage::EntityEntered(_) => "entity_entered",
            ServerMessage::EntityLeft { .. } => "entity_left",
            ServerMessage::ChunkData(_) => "chunk_data",
            ServerMessage::TickAdjustment { .. } => "tick_adjustment",
            ServerMessage::Kicked { .. } => "kicked",
        }
    }
}

/// Encode a message using bincode (legacy config: fixed-size integers)
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode (legacy config: fixed-size integers)
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::map::{ChunkPosition, PaletteLayer};
    use crate::game::movement::Direction;

    fn snapshot() -> EntitySnapshot {
        EntitySnapshot {
            tick: 77,
            entity: EntityId::new(3, 9),
            position: Vec3::new(10.5, -4.25, 1.0),
            velocity: Vec3::planar(96.0, 0.0),
            input: InputState::neutral().with(Direction::Right),
            half_extent: 6.0,
        }
    }

    #[test]
    fn test_client_messages_survive_encoding() {
        let messages = vec![
            ClientMessage::InputChangeRequest {
                tick: 1234,
                input: InputState::neutral().with(Direction::Up).with(Direction::Left),
            },
            ClientMessage::Heartbeat { tick: u64::MAX },
            ClientMessage::Disconnect,
        ];
        for message in messages {
            let bytes = encode(&message).unwrap();
            let decoded: ClientMessage = decode(&bytes).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_server_messages_survive_encoding() {
        let chunk = ChunkData {
            position: ChunkPosition::new(-1, 2),
            layers: vec![PaletteLayer::compress(&[1, 1, 2, 3])],
        };
        let messages = vec![
            ServerMessage::ConnectionResponse {
                tick: 10,
                entity: EntityId::new(0, 1),
                spawn_position: Vec3::ZERO,
            },
            ServerMessage::EntityUpdate(snapshot()),
            ServerMessage::EntityEntered(snapshot()),
            ServerMessage::EntityLeft {
                tick: 5,
                entity: EntityId::new(8, 2),
            },
            ServerMessage::ChunkData(chunk),
            ServerMessage::TickAdjustment { delta: -7 },
            ServerMessage::Kicked {
                reason: "desync".to_string(),
            },
        ];
        for message in messages {
            let bytes = encode(&message).unwrap();
            let decoded: ServerMessage = decode(&bytes).unwrap();
            assert_eq!(decoded, message, "{} changed on the wire", message.kind());
        }
    }

    #[test]
    fn test_entity_left_is_lightweight() {
        let left = encode(&ServerMessage::EntityLeft {
            tick: 1,
            entity: EntityId::new(1, 1),
        })
        .unwrap();
        let entered = encode(&ServerMessage::EntityEntered(snapshot())).unwrap();
        assert!(left.len() < entered.len());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<ClientMessage, _> = decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(result.is_err());
    }

    #[test]
    fn test_message_tick() {
        assert_eq!(ClientMessage::Heartbeat { tick: 4 }.tick(), Some(4));
        assert_eq!(ClientMessage::Disconnect.tick(), None);
    }
}
