//! Wire packets for mixnode
//!
//! This module defines every packet kind exchanged between nodes and between a
//! node and its local user. Packets are serialized with MessagePack.

use crate::address::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded packet size in bytes
pub const MAX_PACKET_SIZE: usize = 4096;

/// Type tag of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    /// Spanning-tree advertisement
    Stp,
    /// Link-state advertisement
    Lsa,
    /// Tree-wide broadcast with an opaque payload
    Flood,
    /// Source-routed user data
    Data,
    /// Source-routed ping request or reply
    Ping,
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketType::Stp => write!(f, "STP"),
            PacketType::Lsa => write!(f, "LSA"),
            PacketType::Flood => write!(f, "FLOOD"),
            PacketType::Data => write!(f, "DATA"),
            PacketType::Ping => write!(f, "PING"),
        }
    }
}

/// Tree advertisement: "I believe `root` is the root and I am `path_length` hops from it"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StpAdvertisement {
    pub root: Address,
    pub path_length: u16,
    pub sender: Address,
}

/// One entry of a link-state advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub neighbor: Address,
    pub cost: u16,
}

/// A node's self-reported neighbor/cost list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStateAdvertisement {
    pub origin: Address,
    pub links: Vec<LinkEntry>,
}

impl LinkStateAdvertisement {
    pub fn neighbor_count(&self) -> usize {
        self.links.len()
    }
}

/// Source-routing header carried by data and ping packets.
///
/// `hops` lists the intermediate nodes only. `hop_index` is the position in
/// `hops` of the node the packet is currently travelling to; once it reaches
/// `hops.len()` the next target is the destination itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHeader {
    pub source: Address,
    pub destination: Address,
    pub hops: Vec<Address>,
    pub hop_index: u16,
}

impl RoutingHeader {
    pub fn new(source: Address, destination: Address, hops: Vec<Address>) -> Self {
        Self {
            source,
            destination,
            hops,
            hop_index: 0,
        }
    }

    /// Header a user hands to its node: only the destination matters
    pub fn to_destination(destination: Address) -> Self {
        Self::new(destination, destination, Vec::new())
    }

    /// Address the packet should be sent to next
    pub fn next_target(&self) -> Address {
        self.hops
            .get(self.hop_index as usize)
            .copied()
            .unwrap_or(self.destination)
    }

    /// Move one hop forward along the route
    pub fn advance(&mut self) {
        self.hop_index = self.hop_index.saturating_add(1);
    }

    /// Header for the opposite direction of this route
    pub fn reversed(&self) -> Self {
        let mut hops = self.hops.clone();
        hops.reverse();
        Self::new(self.destination, self.source, hops)
    }
}

/// Whether a ping is a request or a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingKind {
    Request,
    Reply,
}

/// Ping body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub kind: PingKind,
    /// Origination time in milliseconds of the originating node's clock
    pub sent_at_ms: u64,
}

/// Complete packet structure for transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Stp(StpAdvertisement),
    Lsa(LinkStateAdvertisement),
    Flood {
        payload: Vec<u8>,
    },
    Data {
        header: RoutingHeader,
        payload: Vec<u8>,
    },
    Ping {
        header: RoutingHeader,
        ping: PingPayload,
    },
}

impl Packet {
    /// Create a data packet as a user would inject it
    pub fn new_data(destination: Address, payload: Vec<u8>) -> Self {
        Packet::Data {
            header: RoutingHeader::to_destination(destination),
            payload,
        }
    }

    /// Create a ping request as a user would inject it (the node stamps the time)
    pub fn new_ping(destination: Address) -> Self {
        Packet::Ping {
            header: RoutingHeader::to_destination(destination),
            ping: PingPayload {
                kind: PingKind::Request,
                sent_at_ms: 0,
            },
        }
    }

    pub fn new_flood(payload: Vec<u8>) -> Self {
        Packet::Flood { payload }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Stp(_) => PacketType::Stp,
            Packet::Lsa(_) => PacketType::Lsa,
            Packet::Flood { .. } => PacketType::Flood,
            Packet::Data { .. } => PacketType::Data,
            Packet::Ping { .. } => PacketType::Ping,
        }
    }

    pub fn routing_header(&self) -> Option<&RoutingHeader> {
        match self {
            Packet::Data { header, .. } | Packet::Ping { header, .. } => Some(header),
            _ => None,
        }
    }

    pub fn routing_header_mut(&mut self) -> Option<&mut RoutingHeader> {
        match self {
            Packet::Data { header, .. } | Packet::Ping { header, .. } => Some(header),
            _ => None,
        }
    }

    /// Serialize packet to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, CodecError> {
        let bytes = rmp_serde::to_vec(self)?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserialize packet from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Wire codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Packet too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_serialization_roundtrip() {
        let packet = Packet::Ping {
            header: RoutingHeader::new(Address(1), Address(9), vec![Address(4), Address(6)]),
            ping: PingPayload {
                kind: PingKind::Request,
                sent_at_ms: 1234,
            },
        };

        let bytes = packet.to_msgpack().unwrap();
        let decoded = Packet::from_msgpack(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.packet_type(), PacketType::Ping);
    }

    #[test]
    fn test_packet_size_limit() {
        let packet = Packet::new_flood(vec![0u8; MAX_PACKET_SIZE + 1]);
        assert!(matches!(
            packet.to_msgpack(),
            Err(CodecError::TooLarge { .. })
        ));

        let oversized = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(Packet::from_msgpack(&oversized).is_err());
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        assert!(matches!(
            Packet::from_msgpack(&[0xc1, 0x00, 0xff]),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_next_target_walks_hops_then_destination() {
        let mut header = RoutingHeader::new(Address(1), Address(9), vec![Address(4), Address(6)]);
        assert_eq!(header.next_target(), Address(4));
        header.advance();
        assert_eq!(header.next_target(), Address(6));
        header.advance();
        assert_eq!(header.next_target(), Address(9));
        header.advance();
        assert_eq!(header.next_target(), Address(9));
    }

    #[test]
    fn test_reversed_header() {
        let mut header = RoutingHeader::new(Address(1), Address(9), vec![Address(4), Address(6)]);
        header.advance();
        let reply = header.reversed();
        assert_eq!(reply.source, Address(9));
        assert_eq!(reply.destination, Address(1));
        assert_eq!(reply.hops, vec![Address(6), Address(4)]);
        assert_eq!(reply.hop_index, 0);
    }

    #[test]
    fn test_routing_header_only_on_routed_packets() {
        assert!(Packet::new_flood(vec![1]).routing_header().is_none());
        assert!(Packet::new_data(Address(3), vec![1]).routing_header().is_some());
        assert_eq!(
            Packet::new_ping(Address(3)).routing_header().map(|h| h.destination),
            Some(Address(3))
        );
    }
}
