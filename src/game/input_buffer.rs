//! Lock-free inbound hand-off queue
//!
//! Connection tasks push events through cloned [`InboundSender`]s; the
//! simulation drains everything once per tick at a fixed point, so no
//! simulation structure is ever touched from an I/O task.

use std::net::SocketAddr;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::game::constants::net::INBOUND_QUEUE_CAPACITY;
use crate::net::protocol::{ClientId, ClientMessage};

/// What happened on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    Connected { addr: SocketAddr },
    Message(ClientMessage),
    /// Transport closed or failed
    Disconnected,
}

/// Event from a connection task to the simulation
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub client: ClientId,
    pub kind: InboundKind,
    /// Encoded size, for traffic accounting
    pub bytes: usize,
}

/// Bounded multi-producer queue drained by the tick loop
pub struct InboundQueue {
    sender: Sender<InboundEvent>,
    receiver: Receiver<InboundEvent>,
    capacity: usize,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Create a new sender handle for a connection task
    pub fn sender(&self) -> InboundSender {
        InboundSender {
            sender: self.sender.clone(),
        }
    }

    /// Take every pending event in arrival order
    pub fn drain(&self) -> Vec<InboundEvent> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new(INBOUND_QUEUE_CAPACITY)
    }
}

/// Clonable sender handle for connection tasks
#[derive(Clone)]
pub struct InboundSender {
    sender: Sender<InboundEvent>,
}

impl InboundSender {
    /// Submit without blocking; a full queue is backpressure, not a fault
    #[inline]
    pub fn try_send(&self, event: InboundEvent) -> Result<(), InboundError> {
        self.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => InboundError::Full,
            TrySendError::Disconnected(_) => InboundError::Disconnected,
        })
    }

    pub fn connected(&self, client: ClientId, addr: SocketAddr) -> Result<(), InboundError> {
        self.try_send(InboundEvent {
            client,
            kind: InboundKind::Connected { addr },
            bytes: 0,
        })
    }

    pub fn message(
        &self,
        client: ClientId,
        message: ClientMessage,
        bytes: usize,
    ) -> Result<(), InboundError> {
        self.try_send(InboundEvent {
            client,
            kind: InboundKind::Message(message),
            bytes,
        })
    }

    pub fn disconnected(&self, client: ClientId) -> Result<(), InboundError> {
        self.try_send(InboundEvent {
            client,
            kind: InboundKind::Disconnected,
            bytes: 0,
        })
    }
}

/// Inbound queue errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    #[error("Inbound queue full")]
    Full,
    #[error("Simulation stopped")]
    Disconnected,
}
