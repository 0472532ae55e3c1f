//! Transport boundary of a node
//!
//! A node only ever talks to the outside world through [`Transport`]: it asks
//! for at most one inbound packet at a time and hands outbound packets to a
//! port. The port equal to the neighbor count is the local user.

use crate::address::Port;
use crate::packet::{CodecError, Packet};
use std::collections::VecDeque;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Port {0} is not connected")]
    UnknownPort(Port),

    #[error("Link closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Send rejected on port {0}")]
    Rejected(Port),
}

/// Send/receive primitives consumed by a node
pub trait Transport {
    /// Hand a packet to `port` for transmission
    fn send(&mut self, port: Port, packet: Packet) -> Result<(), TransportError>;

    /// Poll for one inbound packet. `Ok(None)` means nothing is available now.
    fn receive(&mut self) -> Result<Option<(Port, Packet)>, TransportError>;
}

/// In-memory transport with an inbox and an outbox.
///
/// Used by tests and the lockstep simulation: inbound packets are pushed by
/// the driver, outbound packets accumulate until drained. An optional send
/// budget makes sends fail once exhausted.
#[derive(Debug, Default)]
pub struct QueueTransport {
    inbox: VecDeque<(Port, Packet)>,
    outbox: Vec<(Port, Packet)>,
    send_budget: Option<usize>,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet as if it arrived on `port`
    pub fn push_inbound(&mut self, port: Port, packet: Packet) {
        self.inbox.push_back((port, packet));
    }

    /// Packets sent since the last drain
    pub fn sent(&self) -> &[(Port, Packet)] {
        &self.outbox
    }

    pub fn drain_sent(&mut self) -> Vec<(Port, Packet)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbox.len()
    }

    /// Allow only `budget` more successful sends (`None` for unlimited)
    pub fn set_send_budget(&mut self, budget: Option<usize>) {
        self.send_budget = budget;
    }
}

impl Transport for QueueTransport {
    fn send(&mut self, port: Port, packet: Packet) -> Result<(), TransportError> {
        if let Some(budget) = self.send_budget.as_mut() {
            if *budget == 0 {
                return Err(TransportError::Rejected(port));
            }
            *budget -= 1;
        }
        self.outbox.push((port, packet));
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<(Port, Packet)>, TransportError> {
        Ok(self.inbox.pop_front())
    }
}
