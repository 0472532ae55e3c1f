//! Node addressing and port numbering
//!
//! Every node in the overlay is identified by a 16-bit address. Addresses are
//! totally ordered and act as the tie-break key for root election, next-hop
//! selection and equal-cost shortest paths.

use serde::{Deserialize, Serialize};

/// Index of a point-to-point link on a node.
///
/// Ports `0..neighbor_count` are links to neighbors; the port equal to the
/// neighbor count is the local user port.
pub type Port = u8;

/// Node identifier on the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u16);

impl Address {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for Address {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
