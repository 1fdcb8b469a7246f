//! Game session - owns the authoritative world and runs one tick at a time
//!
//! A tick always runs in the same order:
//! 1. drain the inbound queue (connects, inputs, heartbeats, disconnects)
//! 2. drop timed-out connections
//! 3. release sequenced inputs due this tick
//! 4. movement step
//! 5. spatial index sync
//! 6. per-connection AOI diff, chunk streaming and entity updates
//! 7. queue outbound messages
//!
//! The session never touches sockets. Outbound messages are queued and taken
//! by the caller once per tick with [`GameSession::drain_outbound`].

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::game::constants::{
    aoi, movement::ACTOR_HALF_EXTENT, sim::STATS_LOG_SECONDS, world as world_consts,
};
use crate::game::entity::EntityId;
use crate::game::input_buffer::{InboundEvent, InboundKind, InboundQueue, InboundSender};
use crate::game::map::{ChunkData, ChunkPosition, TileMap};
use crate::game::movement::{InputState, MovementParams};
use crate::game::world::{Behavior, Entity, PatrolAxis, World};
use crate::game::Tick;
use crate::metrics::Metrics;
use crate::net::connection::{ClientConnection, ConnectionFault};
use crate::net::protocol::{ClientId, ClientMessage, EntitySnapshot, ServerMessage};
use crate::net::sequencer::Admission;
use crate::net::transport::OutboundRouter;
use crate::util::vec3::Vec3;

/// Work for the transport produced by one tick
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Send { client: ClientId, message: ServerMessage },
    /// Close the connection after flushing what was queued before
    Close { client: ClientId },
}

/// Replication output for one connection
#[derive(Default)]
struct Replication {
    messages: Vec<ServerMessage>,
    entered: u64,
    left: u64,
    updates: u64,
    chunks: u64,
}

/// Spawn radius around the origin for connecting clients
const CLIENT_SPAWN_RADIUS: f32 = 64.0;

pub struct GameSession {
    config: ServerConfig,
    world: World,
    map: Arc<dyn TileMap>,
    connections: HashMap<ClientId, ClientConnection>,
    inbound: InboundQueue,
    outbound: Vec<Outbound>,
    metrics: Arc<Metrics>,
    rng: StdRng,
    npc_count: usize,
}

impl GameSession {
    pub fn new(config: &ServerConfig, map: Arc<dyn TileMap>, metrics: Arc<Metrics>) -> Self {
        let world = World::new(config.spatial_index(), MovementParams::default(), config.dt());
        let mut session = Self {
            config: config.clone(),
            world,
            map,
            connections: HashMap::new(),
            inbound: InboundQueue::default(),
            outbound: Vec::new(),
            metrics,
            rng: StdRng::seed_from_u64(config.world_seed),
            npc_count: 0,
        };
        session.spawn_npcs(config.npc_count);
        session
    }

    fn spawn_npcs(&mut self, count: usize) {
        let half = world_consts::NPC_SPREAD * 0.5;
        for _ in 0..count {
            let position = Vec3::planar(
                self.rng.gen_range(-half..half),
                self.rng.gen_range(-half..half),
            );
            let axis = if self.rng.gen_bool(0.5) {
                PatrolAxis::Horizontal
            } else {
                PatrolAxis::Vertical
            };
            let behavior = Behavior::patrol(axis, world_consts::PATROL_PERIOD);
            self.world.spawn(position, ACTOR_HALF_EXTENT, behavior);
        }
        self.npc_count += count;
        info!("Spawned {} patrolling entities", count);
    }

    /// Handle for connection tasks to submit events
    pub fn inbound_sender(&self) -> InboundSender {
        self.inbound.sender()
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    pub fn world(&self) -> &World {
        &self.world
    }

    #[inline]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Last completed tick
    #[inline]
    pub fn tick(&self) -> Tick {
        self.world.tick()
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, client: ClientId) -> Option<&ClientConnection> {
        self.connections.get(&client)
    }

    /// Entity controlled by a client
    pub fn entity_of(&self, client: ClientId) -> Option<EntityId> {
        self.connections.get(&client).map(|conn| conn.entity)
    }

    /// Take everything queued for the transport
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// Run one full tick. `now` is used for connection timeouts.
    pub fn tick_at(&mut self, now: Instant) -> Tick {
        for event in self.inbound.drain() {
            self.handle_event(event, now);
        }

        self.check_timeouts(now);

        let tick = self.world.begin_tick();
        self.release_inputs(tick);
        self.world.step();
        self.world.sync_index();
        self.replicate(tick);
        self.world.clear_dirty();

        self.metrics.server_tick.store(tick, Ordering::Relaxed);
        self.metrics.entity_count.store(self.world.len() as u64, Ordering::Relaxed);
        self.metrics.npc_count.store(self.npc_count as u64, Ordering::Relaxed);
        self.metrics
            .connections_active
            .store(self.connections.len() as u64, Ordering::Relaxed);
        tick
    }

    /// Move a client's entity, outside the movement step
    pub fn teleport(&mut self, client: ClientId, position: Vec3) -> bool {
        let Some(conn) = self.connections.get_mut(&client) else {
            return false;
        };
        if !self.world.teleport(conn.entity, position) {
            return false;
        }
        conn.streamer.reset();
        true
    }

    /// Tear a connection down for a fault found outside the tick, such as
    /// the transport falling behind. Returns false for unknown clients.
    pub fn fault(&mut self, client: ClientId, fault: ConnectionFault) -> bool {
        if !self.connections.contains_key(&client) {
            return false;
        }
        self.disconnect(client, Some(fault));
        true
    }

    /// A chunk's tiles changed; resend it to every client holding it
    pub fn invalidate_chunk(&mut self, chunk: ChunkPosition) {
        for conn in self.connections.values_mut() {
            conn.streamer.invalidate(chunk);
        }
    }

    fn send(&mut self, client: ClientId, message: ServerMessage) {
        if let Some(conn) = self.connections.get_mut(&client) {
            conn.record_sent();
        }
        self.outbound.push(Outbound::Send { client, message });
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn handle_event(&mut self, event: InboundEvent, now: Instant) {
        let client = event.client;
        match event.kind {
            InboundKind::Connected { addr } => self.connect(client, addr, now),
            InboundKind::Disconnected => {
                if self.connections.contains_key(&client) {
                    debug!("Client {} transport closed", client);
                    self.disconnect(client, None);
                }
            }
            InboundKind::Message(message) => {
                let Some(conn) = self.connections.get_mut(&client) else {
                    debug!("Ignoring {:?} from unknown client {}", message, client);
                    return;
                };
                conn.record_received(event.bytes, now);
                self.metrics.record_received(event.bytes);

                match message {
                    ClientMessage::InputChangeRequest { tick, input } => {
                        self.receive_input(client, tick, input)
                    }
                    ClientMessage::Heartbeat { tick } => self.receive_heartbeat(client, tick),
                    ClientMessage::Disconnect => {
                        info!("Client {} disconnected", client);
                        self.disconnect(client, None);
                    }
                }
            }
        }
    }

    fn connect(&mut self, client: ClientId, addr: SocketAddr, now: Instant) {
        if self.connections.contains_key(&client) {
            warn!("Client {} connected twice, ignoring", client);
            return;
        }

        let max = self.config.max_connections;
        if self.connections.len() >= max {
            let fault = ConnectionFault::ServerFull { max };
            warn!("Rejecting {} from {}: {}", client, addr, fault);
            self.outbound.push(Outbound::Send {
                client,
                message: ServerMessage::Kicked {
                    reason: fault.to_string(),
                },
            });
            self.outbound.push(Outbound::Close { client });
            self.metrics.connections_kicked.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let spawn = Vec3::planar(
            self.rng.gen_range(-CLIENT_SPAWN_RADIUS..CLIENT_SPAWN_RADIUS),
            self.rng.gen_range(-CLIENT_SPAWN_RADIUS..CLIENT_SPAWN_RADIUS),
        );
        let entity = self.world.spawn(spawn, ACTOR_HALF_EXTENT, Behavior::Controlled);
        let conn = ClientConnection::new(
            client,
            addr,
            entity,
            self.config.sequencer(),
            self.config.aoi(),
            self.config.stream(),
            now,
        );
        self.connections.insert(client, conn);
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);

        info!("Client {} connected from {} as entity {}", client, addr, entity);
        let tick = self.world.tick();
        self.send(
            client,
            ServerMessage::ConnectionResponse {
                tick,
                entity,
                spawn_position: spawn,
            },
        );
    }

    fn receive_input(&mut self, client: ClientId, input_tick: Tick, input: InputState) {
        let server_tick = self.world.tick();
        let Some(conn) = self.connections.get_mut(&client) else {
            return;
        };
        let entity = conn.entity;
        let result = conn.sequencer.receive(server_tick, input_tick, input);
        let adjustment = conn.sequencer.take_adjustment();

        match result {
            Ok(Admission::Accepted) => {
                self.metrics.inputs_accepted.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Admission::Dropped(reason)) => {
                debug!(
                    "Dropped {:?} input from {} for tick {} at server tick {}",
                    reason, client, input_tick, server_tick
                );
                self.metrics.record_drop(reason);
                self.world.neutralize(entity);
            }
            Err(e) => {
                self.disconnect(client, Some(ConnectionFault::from(e)));
                return;
            }
        }
        self.send_adjustment(client, adjustment);
    }

    fn receive_heartbeat(&mut self, client: ClientId, client_tick: Tick) {
        let server_tick = self.world.tick();
        let Some(conn) = self.connections.get_mut(&client) else {
            return;
        };
        let result = conn.sequencer.observe(server_tick, client_tick);
        let adjustment = conn.sequencer.take_adjustment();
        if let Err(e) = result {
            self.disconnect(client, Some(ConnectionFault::from(e)));
            return;
        }
        self.send_adjustment(client, adjustment);
    }

    fn send_adjustment(&mut self, client: ClientId, adjustment: Option<i64>) {
        if let Some(delta) = adjustment {
            debug!("Adjusting client {} tick by {}", client, delta);
            self.metrics.tick_adjustments.fetch_add(1, Ordering::Relaxed);
            self.send(client, ServerMessage::TickAdjustment { delta });
        }
    }

    fn check_timeouts(&mut self, now: Instant) {
        let timeout = self.config.connection_timeout();
        let expired: Vec<(ClientId, u64)> = self
            .connections
            .values()
            .filter(|conn| conn.is_timed_out(now, timeout))
            .map(|conn| (conn.id, conn.idle_time(now).as_millis() as u64))
            .collect();

        for (client, idle_ms) in expired {
            self.metrics.connections_timed_out.fetch_add(1, Ordering::Relaxed);
            self.disconnect(client, Some(ConnectionFault::Timeout { idle_ms }));
        }
    }

    /// Remove a connection and its entity. Every other client that could see
    /// the entity is told it left. A fault is reported to the client first.
    fn disconnect(&mut self, client: ClientId, fault: Option<ConnectionFault>) {
        let Some(conn) = self.connections.remove(&client) else {
            return;
        };

        if let Some(fault) = fault {
            warn!("Dropping client {}: {}", client, fault);
            self.metrics.connections_kicked.fetch_add(1, Ordering::Relaxed);
            self.outbound.push(Outbound::Send {
                client,
                message: ServerMessage::Kicked {
                    reason: fault.to_string(),
                },
            });
        }
        self.outbound.push(Outbound::Close { client });

        let entity = conn.entity;
        self.world.despawn(entity);

        let tick = self.world.tick();
        for (other_id, other) in self.connections.iter_mut() {
            if other.aoi.forget(entity) {
                other.observed.remove(&entity);
                other.record_sent();
                self.outbound.push(Outbound::Send {
                    client: *other_id,
                    message: ServerMessage::EntityLeft { tick, entity },
                });
                self.metrics.aoi_leaves.fetch_add(1, Ordering::Relaxed);
            }
        }

        debug!(
            "Client {} removed after {} messages in / {} out",
            client, conn.messages_received, conn.messages_sent
        );
    }

    // ========================================================================
    // Simulation
    // ========================================================================

    fn release_inputs(&mut self, tick: Tick) {
        for conn in self.connections.values_mut() {
            for (_, input) in conn.sequencer.release(tick) {
                self.world.set_input(conn.entity, input);
            }
        }
    }

    // ========================================================================
    // Replication
    // ========================================================================

    fn replicate(&mut self, tick: Tick) {
        let world = &self.world;
        let map = self.map.as_ref();

        let batches: Vec<(ClientId, Replication)> = self
            .connections
            .par_iter_mut()
            .map(|(client, conn)| (*client, replicate_connection(conn, world, map, tick)))
            .collect();

        for (client, batch) in batches {
            self.metrics.aoi_enters.fetch_add(batch.entered, Ordering::Relaxed);
            self.metrics.aoi_leaves.fetch_add(batch.left, Ordering::Relaxed);
            self.metrics.entity_updates.fetch_add(batch.updates, Ordering::Relaxed);
            self.metrics.chunks_streamed.fetch_add(batch.chunks, Ordering::Relaxed);
            for message in batch.messages {
                self.send(client, message);
            }
        }
    }
}

fn snapshot(tick: Tick, id: EntityId, entity: &Entity) -> EntitySnapshot {
    EntitySnapshot {
        tick,
        entity: id,
        position: entity.motion.position,
        velocity: entity.motion.velocity,
        input: entity.input,
        half_extent: entity.half_extent,
    }
}

/// Whether an observed entity changed enough since the last update sent
fn changed(previous: &EntitySnapshot, current: &EntitySnapshot) -> bool {
    previous.input != current.input
        || previous.position.planar_distance_to(current.position) > aoi::POSITION_EPSILON
        || previous.velocity.planar_distance_to(current.velocity) > aoi::VELOCITY_EPSILON
        || previous.position.z != current.position.z
}

fn replicate_connection(
    conn: &mut ClientConnection,
    world: &World,
    map: &dyn TileMap,
    tick: Tick,
) -> Replication {
    let mut out = Replication::default();
    let Some(owner) = world.get(conn.entity) else {
        return out;
    };
    let position = owner.position();

    let delta = conn.aoi.update(conn.entity, position, world.index());
    for &id in &delta.left {
        conn.observed.remove(&id);
        out.messages.push(ServerMessage::EntityLeft { tick, entity: id });
        out.left += 1;
    }
    for &id in &delta.entered {
        if let Some(entity) = world.get(id) {
            let snap = snapshot(tick, id, entity);
            conn.observed.insert(id, snap);
            out.messages.push(ServerMessage::EntityEntered(snap));
            out.entered += 1;
        }
    }

    for chunk in conn.streamer.update(position) {
        out.messages.push(ServerMessage::ChunkData(ChunkData::from_map(map, chunk)));
        out.chunks += 1;
    }

    if owner.dirty || tick % aoi::OWNER_UPDATE_INTERVAL.max(1) == 0 {
        out.messages
            .push(ServerMessage::EntityUpdate(snapshot(tick, conn.entity, owner)));
        out.updates += 1;
    }

    let due = tick % aoi::OBSERVED_UPDATE_INTERVAL.max(1) == 0;
    for id in conn.aoi.visible_sorted() {
        if delta.entered.contains(&id) {
            continue;
        }
        let Some(entity) = world.get(id) else {
            continue;
        };
        if !due && !entity.dirty {
            continue;
        }
        let snap = snapshot(tick, id, entity);
        let send = match conn.observed.get(&id) {
            Some(previous) => entity.dirty || changed(previous, &snap),
            None => true,
        };
        if send {
            conn.observed.insert(id, snap);
            out.messages.push(ServerMessage::EntityUpdate(snap));
            out.updates += 1;
        }
    }

    out
}

/// Hand the queued outbound batch to `router`. Clients whose writer
/// overflowed are torn down like any other fault, and the leaves that
/// produces are routed in the same pass.
pub fn deliver_outbound(session: &mut GameSession, router: &OutboundRouter) {
    let mut batch = session.drain_outbound();
    while !batch.is_empty() {
        for client in router.route(batch) {
            session.fault(
                client,
                ConnectionFault::Backlog {
                    capacity: router.capacity(),
                },
            );
        }
        batch = session.drain_outbound();
    }
}

/// Start the tick loop task. It owns the session; outbound messages are
/// handed to `router` after every tick.
pub fn start_game_loop(mut session: GameSession, router: OutboundRouter) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tick_duration = session.config().tick_duration();
        let tick_rate = session.config().tick_rate;
        let stats_interval = tick_rate as u64 * STATS_LOG_SECONDS;
        let mut ticker = interval(tick_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Game loop started at {} Hz", tick_rate);
        let start = Instant::now();

        loop {
            ticker.tick().await;

            let tick_start = Instant::now();
            let tick = session.tick_at(tick_start);
            deliver_outbound(&mut session, &router);
            session.metrics().record_tick_time(tick_start.elapsed());

            if stats_interval > 0 && tick % stats_interval == 0 {
                let metrics = session.metrics();
                info!(
                    "Game: {}s, tick {}, {} clients, {} entities | tick p95 {}us, {} inputs dropped",
                    start.elapsed().as_secs(),
                    tick,
                    session.connection_count(),
                    session.world().len(),
                    metrics.tick_time_p95_us.load(Ordering::Relaxed),
                    metrics.inputs_dropped(),
                );
            }
        }
    })
}
