//! TCP transport
//!
//! One reader task per connection decodes framed client messages and hands
//! them to the simulation through the inbound queue. One writer task per
//! connection drains a bounded channel filled by [`OutboundRouter`] after
//! every tick. Neither task touches simulation state.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::constants::net::OUTBOUND_CHANNEL_CAPACITY;
use crate::game::input_buffer::{InboundError, InboundSender};
use crate::metrics::Metrics;
use crate::net::framing::{read_typed, write_typed, FramingError};
use crate::net::game_session::Outbound;
use crate::net::protocol::{ClientId, ClientMessage, ServerMessage};

/// Instruction for a connection's writer task
#[derive(Debug)]
pub enum WriterCommand {
    Send(ServerMessage),
    /// Flush and shut the socket down
    Close,
}

/// Fans the session's outbound queue out to per-connection writer tasks
#[derive(Clone)]
pub struct OutboundRouter {
    writers: Arc<RwLock<HashMap<ClientId, mpsc::Sender<WriterCommand>>>>,
    capacity: usize,
}

impl OutboundRouter {
    pub fn new() -> Self {
        Self::with_capacity(OUTBOUND_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            writers: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Create the channel for a new connection's writer
    pub fn register(&self, client: ClientId) -> mpsc::Receiver<WriterCommand> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.writers.write().insert(client, tx);
        rx
    }

    pub fn unregister(&self, client: ClientId) {
        self.writers.write().remove(&client);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.writers.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.writers.read().is_empty()
    }

    /// Deliver one tick's outbound batch without blocking.
    ///
    /// A full writer channel means the client has fallen behind on messages
    /// that are sent only once (enters, leaves, chunks). Its writer is dropped,
    /// which closes the socket after the queued backlog, and the client is
    /// returned so the session can tear the connection down. Later messages
    /// for it in the same batch are discarded.
    pub fn route(&self, batch: Vec<Outbound>) -> Vec<ClientId> {
        let mut closed = Vec::new();
        let mut overflowed = Vec::new();
        {
            let writers = self.writers.read();
            for item in batch {
                let (client, command) = match item {
                    Outbound::Send { client, message } => (client, WriterCommand::Send(message)),
                    Outbound::Close { client } => {
                        closed.push(client);
                        (client, WriterCommand::Close)
                    }
                };
                if overflowed.contains(&client) {
                    continue;
                }
                let Some(tx) = writers.get(&client) else {
                    continue;
                };
                match tx.try_send(command) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            "Outbound channel for {} full ({} queued), dropping connection",
                            client, self.capacity
                        );
                        overflowed.push(client);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Writer for {} already gone", client);
                    }
                }
            }
        }
        if !closed.is_empty() || !overflowed.is_empty() {
            let mut writers = self.writers.write();
            for client in closed.iter().chain(overflowed.iter()) {
                writers.remove(client);
            }
        }
        overflowed
    }

    /// Per-connection channel capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for OutboundRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// TCP listener feeding the simulation
pub struct TcpTransport {
    listener: TcpListener,
    inbound: InboundSender,
    router: OutboundRouter,
    metrics: Arc<Metrics>,
}

impl TcpTransport {
    pub async fn bind(
        addr: SocketAddr,
        inbound: InboundSender,
        router: OutboundRouter,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            inbound,
            router,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever
    pub async fn run(self) -> anyhow::Result<()> {
        info!("TCP transport listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            let inbound = self.inbound.clone();
            let router = self.router.clone();
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                handle_connection(stream, addr, inbound, router, metrics).await;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    inbound: InboundSender,
    router: OutboundRouter,
    metrics: Arc<Metrics>,
) {
    let client = Uuid::new_v4();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", addr, e);
    }
    let (reader, writer) = stream.into_split();

    // Writer first, so a rejection sent in the connect tick still reaches the client
    let commands = router.register(client);
    tokio::spawn(write_loop(client, writer, commands, router.clone(), metrics.clone()));

    if let Err(e) = inbound.connected(client, addr) {
        warn!("Rejecting {} from {}: {}", client, addr, e);
        router.unregister(client);
        return;
    }
    debug!("Connection from {} assigned client {}", addr, client);

    match read_loop(client, reader, &inbound, &metrics).await {
        Ok(()) => debug!("Client {} closed the connection", client),
        Err(e) => debug!("Client {} read error: {}", client, e),
    }

    if let Err(e) = inbound.disconnected(client) {
        // The session drops the connection on timeout instead
        warn!("Could not report disconnect of {}: {}", client, e);
    }
}

async fn read_loop(
    client: ClientId,
    mut reader: OwnedReadHalf,
    inbound: &InboundSender,
    metrics: &Metrics,
) -> Result<(), FramingError> {
    loop {
        let (message, bytes) = match read_typed::<ClientMessage, _>(&mut reader).await {
            Ok(decoded) => decoded,
            Err(FramingError::ConnectionClosed) => return Ok(()),
            Err(FramingError::Decode(e)) => {
                warn!("Failed to decode message from {}: {}", client, e);
                continue;
            }
            Err(e) => return Err(e),
        };

        let leaving = matches!(message, ClientMessage::Disconnect);
        match inbound.message(client, message, bytes) {
            Ok(()) => {}
            Err(InboundError::Full) => {
                metrics.inbound_overflow.fetch_add(1, Ordering::Relaxed);
                warn!("Inbound queue full, dropping message from {}", client);
            }
            Err(InboundError::Disconnected) => return Ok(()),
        }
        if leaving {
            return Ok(());
        }
    }
}

async fn write_loop(
    client: ClientId,
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::Receiver<WriterCommand>,
    router: OutboundRouter,
    metrics: Arc<Metrics>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send(message) => match write_typed(&mut writer, &message).await {
                Ok(bytes) => metrics.record_sent(bytes),
                Err(e) => {
                    debug!("Write to {} failed: {}", client, e);
                    break;
                }
            },
            WriterCommand::Close => break,
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of {} failed: {}", client, e);
    }
    router.unregister(client);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::input_buffer::{InboundEvent, InboundKind, InboundQueue};
    use std::time::Duration;

    async fn next_event(queue: &InboundQueue) -> InboundEvent {
        for _ in 0..200 {
            if let Some(event) = queue.drain().into_iter().next() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no inbound event within 2s");
    }

    #[test]
    fn test_route_without_writer_is_noop() {
        let router = OutboundRouter::new();
        let overflowed = router.route(vec![Outbound::Close { client: Uuid::new_v4() }]);
        assert!(overflowed.is_empty());
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn test_route_close_unregisters() {
        let router = OutboundRouter::with_capacity(4);
        let client = Uuid::new_v4();
        let mut rx = router.register(client);
        router.route(vec![
            Outbound::Send {
                client,
                message: ServerMessage::TickAdjustment { delta: 2 },
            },
            Outbound::Close { client },
        ]);

        assert!(matches!(
            rx.recv().await,
            Some(WriterCommand::Send(ServerMessage::TickAdjustment { delta: 2 }))
        ));
        assert!(matches!(rx.recv().await, Some(WriterCommand::Close)));
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn test_full_writer_drops_connection_instead_of_message() {
        let router = OutboundRouter::with_capacity(1);
        let slow = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut slow_rx = router.register(slow);
        let mut other_rx = router.register(other);
        let left = ServerMessage::EntityLeft {
            tick: 7,
            entity: crate::game::entity::EntityId::new(3, 1),
        };

        let overflowed = router.route(vec![
            Outbound::Send {
                client: slow,
                message: ServerMessage::TickAdjustment { delta: 1 },
            },
            Outbound::Send {
                client: slow,
                message: left.clone(),
            },
            Outbound::Send {
                client: other,
                message: left.clone(),
            },
            Outbound::Send {
                client: slow,
                message: ServerMessage::TickAdjustment { delta: 2 },
            },
        ]);

        assert_eq!(overflowed, vec![slow]);
        assert_eq!(router.len(), 1);
        // Backlog is flushed, then the channel ends so the writer closes the socket
        assert!(matches!(
            slow_rx.recv().await,
            Some(WriterCommand::Send(ServerMessage::TickAdjustment { delta: 1 }))
        ));
        assert!(slow_rx.recv().await.is_none());
        assert!(matches!(other_rx.recv().await, Some(WriterCommand::Send(m)) if m == left));
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let queue = InboundQueue::new(16);
        let router = OutboundRouter::new();
        let metrics = Arc::new(Metrics::new());
        let transport = TcpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            queue.sender(),
            router.clone(),
            metrics.clone(),
        )
        .await
        .unwrap();
        let addr = transport.local_addr().unwrap();
        tokio::spawn(transport.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let connected = next_event(&queue).await;
        let client = connected.client;
        assert!(matches!(connected.kind, InboundKind::Connected { .. }));

        write_typed(&mut stream, &ClientMessage::Heartbeat { tick: 42 })
            .await
            .unwrap();
        let event = next_event(&queue).await;
        assert_eq!(event.client, client);
        assert_eq!(
            event.kind,
            InboundKind::Message(ClientMessage::Heartbeat { tick: 42 })
        );
        assert!(event.bytes > 0);

        router.route(vec![
            Outbound::Send {
                client,
                message: ServerMessage::Kicked {
                    reason: "bye".to_string(),
                },
            },
            Outbound::Close { client },
        ]);
        let (message, _) = read_typed::<ServerMessage, _>(&mut stream).await.unwrap();
        assert_eq!(
            message,
            ServerMessage::Kicked {
                reason: "bye".to_string()
            }
        );
        assert!(matches!(
            read_typed::<ServerMessage, _>(&mut stream).await,
            Err(FramingError::ConnectionClosed)
        ));
        assert!(metrics.messages_sent.load(Ordering::Relaxed) >= 1);
    }
}
