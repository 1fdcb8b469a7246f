use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::game::entity::EntityId;
use crate::net::aoi::{AoiConfig, AreaOfInterestManager};
use crate::net::chunk_stream::{ChunkStreamer, StreamConfig};
use crate::net::protocol::{ClientId, EntitySnapshot};
use crate::net::sequencer::{InputSequencer, SequencerConfig, SequencerError};

/// Reason the server drops a connection on its own
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionFault {
    #[error("Clock desynchronised: {0}")]
    Desync(#[from] SequencerError),
    #[error("Timed out after {idle_ms}ms of silence")]
    Timeout { idle_ms: u64 },
    #[error("Server full ({max} connections)")]
    ServerFull { max: usize },
    #[error("Fell {capacity} messages behind on outbound traffic")]
    Backlog { capacity: usize },
}

/// Server-side state of one connected client
pub struct ClientConnection {
    pub id: ClientId,
    pub remote_addr: SocketAddr,
    /// Entity this client controls
    pub entity: EntityId,
    pub sequencer: InputSequencer,
    pub aoi: AreaOfInterestManager,
    pub streamer: ChunkStreamer,
    /// Last snapshot sent for each visible entity
    pub observed: FxHashMap<EntityId, EntitySnapshot>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl ClientConnection {
    pub fn new(
        id: ClientId,
        remote_addr: SocketAddr,
        entity: EntityId,
        sequencer: SequencerConfig,
        aoi: AoiConfig,
        stream: StreamConfig,
        now: Instant,
    ) -> Self {
        Self {
            id,
            remote_addr,
            entity,
            sequencer: InputSequencer::new(sequencer),
            aoi: AreaOfInterestManager::new(aoi),
            streamer: ChunkStreamer::new(stream),
            observed: FxHashMap::default(),
            created_at: now,
            last_activity: now,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    /// Update last activity timestamp
    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Record a message queued for this client
    #[inline]
    pub fn record_sent(&mut self) {
        self.messages_sent += 1;
    }

    /// Record bytes received
    pub fn record_received(&mut self, bytes: usize, now: Instant) {
        self.bytes_received += bytes as u64;
        self.messages_received += 1;
        self.touch(now);
    }

    /// Time since the last received message
    #[inline]
    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Whether the connection has been silent for longer than `timeout`
    #[inline]
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.idle_time(now) > timeout
    }
}
