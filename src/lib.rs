//! mixnode: overlay mix-network node
//!
//! Each node runs on a fixed set of point-to-point links and, with no central
//! coordinator:
//! - elects a root and prunes its links into a spanning tree,
//! - floods a link-state advertisement along that tree,
//! - computes shortest paths to every advertised node,
//! - source-routes user data and pings over those paths, batching outbound
//!   packets in a mix buffer so arrival order does not reveal send order.
//!
//! [`node::Node`] drives everything through a [`transport::Transport`].
//! [`sim`] runs whole overlays in one process.

pub mod address;
pub mod config;
pub mod events;
pub mod fabric;
pub mod forwarding;
pub mod lsa;
pub mod mixing;
pub mod node;
pub mod packet;
pub mod shortest_path;
pub mod sim;
pub mod stats;
pub mod stp;
pub mod topology;
pub mod transport;

pub use address::{Address, Port};
pub use config::{ConfigError, NodeConfig};
pub use node::{Node, NodeError};
pub use packet::{CodecError, Packet, PacketType, RoutingHeader};
pub use shortest_path::{shortest_paths, Route};
pub use stats::NodeStats;
pub use stp::{SpanningTree, TreeState};
pub use transport::{QueueTransport, Transport, TransportError};
