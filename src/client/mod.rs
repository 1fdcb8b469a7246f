//! Client side of the replication protocol
//!
//! [`GameClient`] is transport-agnostic: feed it decoded [`ServerMessage`]s,
//! call [`GameClient::tick`] once per local fixed step and ship whatever
//! [`GameClient::drain_outbox`] returns.

pub mod predictor;
pub mod replica;
pub mod tick_sync;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::game::constants::{input::HISTORY_LENGTH, sim::DT};
use crate::game::entity::EntityId;
use crate::game::map::{ChunkPosition, PaletteError, TileId};
use crate::game::movement::{InputState, MotionState, MovementParams};
use crate::game::Tick;
use crate::net::protocol::{ClientMessage, ServerMessage};

use predictor::{Correction, Predictor, ReconcileOutcome};
use replica::ReplicaSet;
use tick_sync::{SyncConfig, SyncError, TickSynchronizer};

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub sync: SyncConfig,
    pub movement: MovementParams,
    pub dt: f32,
    /// Ticks of input kept for replay
    pub history_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            movement: MovementParams::default(),
            dt: DT,
            history_length: HISTORY_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("Corrupt chunk {position:?}: {source}")]
    Chunk {
        position: ChunkPosition,
        source: PaletteError,
    },
    #[error("Kicked by server: {0}")]
    Kicked(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientState {
    /// Waiting for the connection response
    Connecting,
    Playing,
    Kicked(String),
    /// Clock state is unusable; the client has asked to leave
    Faulted(SyncError),
    Disconnected,
}

pub struct GameClient {
    state: ClientState,
    sync: TickSynchronizer,
    predictor: Predictor,
    replicas: ReplicaSet,
    chunks: FxHashMap<ChunkPosition, Vec<Vec<TileId>>>,
    entity: Option<EntityId>,
    input: InputState,
    /// Input carried by the last request sent
    last_sent: InputState,
    /// Tick of the last request sent
    last_request: Option<Tick>,
    resend: bool,
    outbox: Vec<ClientMessage>,
}

impl GameClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            state: ClientState::Connecting,
            sync: TickSynchronizer::new(config.sync),
            predictor: Predictor::new(config.movement, config.dt, config.history_length),
            replicas: ReplicaSet::new(),
            chunks: FxHashMap::default(),
            entity: None,
            input: InputState::NEUTRAL,
            last_sent: InputState::NEUTRAL,
            last_request: None,
            resend: false,
            outbox: Vec::new(),
        }
    }

    /// Apply one server message. Errors are also reflected in [`Self::state`].
    pub fn handle_message(&mut self, message: ServerMessage) -> Result<(), ClientError> {
        match message {
            ServerMessage::ConnectionResponse {
                tick,
                entity,
                spawn_position,
            } => {
                if self.state != ClientState::Connecting {
                    warn!("Ignoring repeated connection response for {}", entity);
                    return Ok(());
                }
                let start = self.sync.on_connection_response(tick);
                self.predictor.reset(MotionState::at(spawn_position));
                self.entity = Some(entity);
                self.state = ClientState::Playing;
                info!("Joined as {} at server tick {}, starting at {}", entity, tick, start);
            }
            ServerMessage::EntityUpdate(snapshot) => {
                if Some(snapshot.entity) == self.entity {
                    self.predictor.queue_correction(Correction {
                        tick: snapshot.tick,
                        state: snapshot.motion(),
                        input: snapshot.input,
                    });
                } else {
                    let entity = snapshot.entity;
                    if !self.replicas.on_update(snapshot) {
                        debug!("Stale or unknown update for {}", entity);
                    }
                }
            }
            ServerMessage::EntityEntered(snapshot) => {
                if Some(snapshot.entity) != self.entity {
                    self.replicas.on_entered(snapshot);
                }
            }
            ServerMessage::EntityLeft { entity, .. } => {
                self.replicas.on_left(entity);
            }
            ServerMessage::ChunkData(chunk) => {
                let position = chunk.position;
                let layers = chunk
                    .decompress()
                    .map_err(|source| ClientError::Chunk { position, source })?;
                self.chunks.insert(position, layers);
            }
            ServerMessage::TickAdjustment { delta } => match self.sync.apply_adjustment(delta) {
                Ok(tick) => {
                    debug!("Tick adjusted by {} to {}", delta, tick);
                    self.resend = true;
                }
                Err(e) => {
                    warn!("Leaving after bad tick adjustment: {}", e);
                    self.state = ClientState::Faulted(e.clone());
                    self.outbox.push(ClientMessage::Disconnect);
                    return Err(e.into());
                }
            },
            ServerMessage::Kicked { reason } => {
                warn!("Kicked: {}", reason);
                self.state = ClientState::Kicked(reason.clone());
                return Err(ClientError::Kicked(reason));
            }
        }
        Ok(())
    }

    /// Input to apply from the next tick on
    pub fn set_input(&mut self, input: InputState) {
        self.input = input;
    }

    /// One local fixed step: reconcile, predict, queue the tick's message
    pub fn tick(&mut self) -> Option<ReconcileOutcome> {
        if self.state != ClientState::Playing {
            return None;
        }

        let outcome = self.predictor.reconcile();
        if let Some(ReconcileOutcome::Replayed {
            tick,
            input_matched: false,
            ..
        }) = outcome
        {
            // The server applied our last request yet holds something else
            if self.last_request.map_or(true, |sent| sent <= tick) {
                debug!("Server input differs at tick {}, resending", tick);
                self.resend = true;
            }
        }

        let tick = self.sync.advance();
        self.predictor.predict(tick, self.input);

        if self.resend || self.input != self.last_sent {
            self.outbox.push(ClientMessage::InputChangeRequest {
                tick,
                input: self.input,
            });
            self.last_sent = self.input;
            self.last_request = Some(tick);
            self.resend = false;
        } else {
            self.outbox.push(ClientMessage::Heartbeat { tick });
        }
        outcome
    }

    /// Leave gracefully
    pub fn disconnect(&mut self) {
        if matches!(self.state, ClientState::Connecting | ClientState::Playing) {
            self.outbox.push(ClientMessage::Disconnect);
            self.state = ClientState::Disconnected;
        }
    }

    pub fn drain_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    #[inline]
    pub fn state(&self) -> &ClientState {
        &self.state
    }

    #[inline]
    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    /// Tick of the latest local step
    #[inline]
    pub fn current_tick(&self) -> Tick {
        self.sync.current()
    }

    pub fn sync(&self) -> &TickSynchronizer {
        &self.sync
    }

    /// Predicted state of the owned entity
    pub fn predicted(&self) -> MotionState {
        self.predictor.state()
    }

    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    pub fn chunk(&self, position: ChunkPosition) -> Option<&Vec<Vec<TileId>>> {
        self.chunks.get(&position)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for GameClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::game::input_buffer::InboundSender;
    use crate::game::map::{GeneratedTileMap, TileMap};
    use crate::game::movement::Direction;
    use crate::metrics::Metrics;
    use crate::net::game_session::{GameSession, Outbound};
    use crate::net::protocol::ClientId;
    use std::sync::Arc;
    use std::time::Instant;
    use uuid::Uuid;

    /// Server and clients in one thread, one server tick then one client
    /// tick per step with no latency
    struct Harness {
        session: GameSession,
        sender: InboundSender,
        clients: Vec<(ClientId, GameClient)>,
        outcomes: Vec<ReconcileOutcome>,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let config = ServerConfig {
                npc_count: 0,
                ..ServerConfig::default()
            };
            let session = GameSession::new(
                &config,
                Arc::new(GeneratedTileMap::default()),
                Arc::new(Metrics::new()),
            );
            let sender = session.inbound_sender();
            Self {
                session,
                sender,
                clients: Vec::new(),
                outcomes: Vec::new(),
                now: Instant::now(),
            }
        }

        fn join(&mut self) -> ClientId {
            let id = Uuid::new_v4();
            self.sender
                .connected(id, "127.0.0.1:6000".parse().unwrap())
                .unwrap();
            self.clients.push((id, GameClient::default()));
            id
        }

        fn client(&mut self, id: ClientId) -> &mut GameClient {
            &mut self
                .clients
                .iter_mut()
                .find(|(c, _)| *c == id)
                .unwrap()
                .1
        }

        fn server_tick(&mut self) {
            self.session.tick_at(self.now);
            for out in self.session.drain_outbound() {
                if let Outbound::Send { client, message } = out {
                    if let Some((_, c)) = self.clients.iter_mut().find(|(id, _)| *id == client) {
                        let _ = c.handle_message(message);
                    }
                }
            }
        }

        fn step_filtered(&mut self, keep: impl Fn(&ClientMessage) -> bool) {
            self.server_tick();
            for (id, client) in &mut self.clients {
                if let Some(outcome) = client.tick() {
                    self.outcomes.push(outcome);
                }
                for message in client.drain_outbox() {
                    if keep(&message) {
                        self.sender.message(*id, message, 8).unwrap();
                    }
                }
            }
        }

        fn step(&mut self) {
            self.step_filtered(|_| true);
        }

        fn run(&mut self, steps: usize) {
            for _ in 0..steps {
                self.step();
            }
        }

        fn server_motion(&self, id: ClientId) -> MotionState {
            let entity = self.session.entity_of(id).unwrap();
            self.session.world().get(entity).unwrap().motion
        }

        fn server_input(&self, id: ClientId) -> InputState {
            let entity = self.session.entity_of(id).unwrap();
            self.session.world().get(entity).unwrap().input
        }
    }

    #[test]
    fn test_join_starts_ahead_of_server() {
        let mut h = Harness::new();
        let id = h.join();
        h.step();

        let client = h.client(id);
        assert_eq!(client.state(), &ClientState::Playing);
        // Response at tick 0, lead of 2, then one local step
        assert_eq!(client.current_tick(), 3);
        assert_eq!(client.entity(), h.session.entity_of(id));
    }

    #[test]
    fn test_prediction_matches_server_without_loss() {
        let mut h = Harness::new();
        let id = h.join();
        h.run(3);

        let right = InputState::neutral().with(Direction::Right);
        let diagonal = InputState::neutral().with(Direction::Down).with(Direction::Left);
        for (input, steps) in [(right, 20), (diagonal, 10), (InputState::NEUTRAL, 40)] {
            h.client(id).set_input(input);
            h.run(steps);
        }

        for outcome in &h.outcomes {
            if let ReconcileOutcome::Replayed { error, input_matched, .. } = outcome {
                assert_eq!(*error, 0.0);
                assert!(input_matched);
            }
        }
        let predicted = h.client(id).predicted();
        let server = h.server_motion(id);
        assert_eq!(predicted.position, server.position);
        assert_eq!(server.velocity, crate::util::vec3::Vec3::ZERO);

        let stats = h.session.connection(id).unwrap().sequencer.stats();
        assert_eq!(stats.dropped(), 0);
        assert_eq!(h.client(id).sync().adjustments_applied(), 0);
    }

    #[test]
    fn test_lost_input_is_resent() {
        let mut h = Harness::new();
        let id = h.join();
        h.run(3);

        let right = InputState::neutral().with(Direction::Right);
        h.client(id).set_input(right);
        h.step_filtered(|m| !matches!(m, ClientMessage::InputChangeRequest { .. }));
        h.run(2);
        assert_eq!(h.server_input(id), InputState::NEUTRAL);

        // The correction for the lost tick shows the mismatch
        h.run(4);
        assert_eq!(h.server_input(id), right);
    }

    #[test]
    fn test_stalled_client_is_pulled_back_into_window() {
        let mut h = Harness::new();
        let id = h.join();
        h.run(5);

        // Client misses several local steps
        for _ in 0..5 {
            h.server_tick();
        }
        h.run(80);
        assert!(h.client(id).sync().adjustments_applied() >= 1);

        let right = InputState::neutral().with(Direction::Right);
        h.client(id).set_input(right);
        h.run(5);
        assert_eq!(h.server_input(id), right);
    }

    #[test]
    fn test_chunks_cached_on_join() {
        let mut h = Harness::new();
        let id = h.join();
        h.step();

        let radius = h.session.config().stream().view_radius as usize;
        assert_eq!(h.client(id).chunk_count(), (2 * radius + 1).pow(2));

        let map = GeneratedTileMap::default();
        let origin = ChunkPosition::new(0, 0);
        assert_eq!(h.client(id).chunk(origin), Some(&map.chunk_layers(origin)));
    }

    #[test]
    fn test_peers_replicated_and_removed() {
        let mut h = Harness::new();
        let a = h.join();
        let b = h.join();
        h.run(2);

        let b_entity = h.session.entity_of(b).unwrap();
        assert!(h.client(a).replicas().contains(b_entity));
        let a_entity = h.session.entity_of(a).unwrap();
        assert!(!h.client(a).replicas().contains(a_entity));

        h.client(b).disconnect();
        h.run(2);
        assert!(!h.client(a).replicas().contains(b_entity));
        assert_eq!(h.session.connection_count(), 1);
    }

    #[test]
    fn test_adjustment_before_connect_faults() {
        let mut client = GameClient::default();
        let result = client.handle_message(ServerMessage::TickAdjustment { delta: 1 });

        assert_eq!(result, Err(ClientError::Sync(SyncError::NotSynced)));
        assert_eq!(client.state(), &ClientState::Faulted(SyncError::NotSynced));
        assert_eq!(client.drain_outbox(), vec![ClientMessage::Disconnect]);
        assert_eq!(client.tick(), None);
    }

    #[test]
    fn test_kicked_stops_ticking() {
        let mut client = GameClient::default();
        let result = client.handle_message(ServerMessage::Kicked {
            reason: "full".to_string(),
        });
        assert_eq!(result, Err(ClientError::Kicked("full".to_string())));
        assert_eq!(client.state(), &ClientState::Kicked("full".to_string()));
        assert_eq!(client.tick(), None);
        assert!(client.drain_outbox().is_empty());
    }
}
