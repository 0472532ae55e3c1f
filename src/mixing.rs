//! Outbound batching
//!
//! Routed packets are not sent as soon as they are ready. They wait in a
//! buffer until `mixing_factor` of them have accumulated and then leave
//! together, so an observer cannot pair an outgoing packet with the incoming
//! one that caused it.

use crate::address::Port;
use crate::packet::Packet;

/// Pending-mix buffer
#[derive(Debug, Clone)]
pub struct MixBuffer {
    capacity: usize,
    pending: Vec<(Port, Packet)>,
}

impl MixBuffer {
    /// Create a buffer releasing every `capacity` packets (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            pending: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &[(Port, Packet)] {
        &self.pending
    }

    /// Queue a packet. Returns the whole batch, in enqueue order, when this
    /// packet filled the buffer; the buffer is empty afterwards.
    pub fn push(&mut self, port: Port, packet: Packet) -> Option<Vec<(Port, Packet)>> {
        self.pending.push((port, packet));
        if self.pending.len() < self.capacity {
            return None;
        }
        Some(std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.capacity),
        ))
    }
}
