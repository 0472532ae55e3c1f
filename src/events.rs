//! Structured event logging for mixnode
//!
//! Every protocol-relevant event a node goes through is emitted as a
//! structured `tracing` record tagged with an [`EventType`].

use crate::address::{Address, Port};
use crate::packet::PacketType;
use crate::stp::TreeState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Node event types for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Tree state accepted from an advertisement
    TreeUpdate,
    /// Root path timed out and the node claimed the root
    Reelection,
    /// A link went silent and its neighbor was forgotten
    NeighborExpired,
    /// No tree change for the convergence window
    Converged,
    /// Link-state advertisement originated or accepted
    LinkState,
    /// Packet dropped by the forwarding engine
    PacketDropped,
    /// Ping round trip completed
    RoundTrip,
    /// Mix buffer released a batch
    MixRelease,
    /// Transport failure
    Transport,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::TreeUpdate => write!(f, "TREE_UPDATE"),
            EventType::Reelection => write!(f, "REELECTION"),
            EventType::NeighborExpired => write!(f, "NEIGHBOR_EXPIRED"),
            EventType::Converged => write!(f, "CONVERGED"),
            EventType::LinkState => write!(f, "LINK_STATE"),
            EventType::PacketDropped => write!(f, "PACKET_DROPPED"),
            EventType::RoundTrip => write!(f, "ROUND_TRIP"),
            EventType::MixRelease => write!(f, "MIX_RELEASE"),
            EventType::Transport => write!(f, "TRANSPORT"),
        }
    }
}

/// Why the forwarding engine dropped a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// Destination never advertised or not reachable
    UnknownDestination,
    /// No neighbor matches the required next hop
    NoMatchingNeighbor,
    /// Tree traffic arrived on a pruned link
    BlockedPort,
    /// Packet kind not valid on the port it arrived on
    Unexpected,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::UnknownDestination => write!(f, "UNKNOWN_DESTINATION"),
            DropReason::NoMatchingNeighbor => write!(f, "NO_MATCHING_NEIGHBOR"),
            DropReason::BlockedPort => write!(f, "BLOCKED_PORT"),
            DropReason::Unexpected => write!(f, "UNEXPECTED"),
        }
    }
}

/// Event logger for node events
pub struct EventLogger;

impl EventLogger {
    /// Log an accepted tree advertisement
    pub fn log_tree_update(node: Address, state: &TreeState) {
        debug!(
            event_type = %EventType::TreeUpdate,
            node = %node,
            root = %state.root,
            next_hop = %state.next_hop,
            path_length = state.path_length,
            "Tree state updated"
        );
    }

    /// Log a reelection caused by a silent root path
    pub fn log_reelection(node: Address, abandoned: Address) {
        info!(
            event_type = %EventType::Reelection,
            node = %node,
            abandoned_next_hop = %abandoned,
            "Root path timed out, claiming root"
        );
    }

    /// Log a neighbor forgotten after its link went silent
    pub fn log_neighbor_expired(node: Address, port: Port, neighbor: Address) {
        warn!(
            event_type = %EventType::NeighborExpired,
            node = %node,
            port = port,
            neighbor = %neighbor,
            "Neighbor silent, dropping link"
        );
    }

    /// Log convergence of the spanning tree
    pub fn log_convergence(node: Address, root: Address, advertisements_sent: u64) {
        info!(
            event_type = %EventType::Converged,
            node = %node,
            root = %root,
            advertisements_sent = advertisements_sent,
            "Spanning tree converged"
        );
    }

    /// Log a link-state advertisement
    pub fn log_link_state(node: Address, origin: Address, links: usize, originated: bool) {
        debug!(
            event_type = %EventType::LinkState,
            node = %node,
            origin = %origin,
            links = links,
            originated = originated,
            "Link-state advertisement"
        );
    }

    /// Log a dropped packet
    pub fn log_drop(node: Address, packet_type: PacketType, port: Port, reason: DropReason) {
        debug!(
            event_type = %EventType::PacketDropped,
            node = %node,
            packet_type = %packet_type,
            port = port,
            reason = %reason,
            "Packet dropped"
        );
    }

    /// Log a completed ping round trip
    pub fn log_round_trip(node: Address, peer: Address, rtt: Duration) {
        info!(
            event_type = %EventType::RoundTrip,
            node = %node,
            peer = %peer,
            rtt_ms = rtt.as_millis() as u64,
            "Ping reply received"
        );
    }

    /// Log a mix batch release
    pub fn log_mix_release(node: Address, batch: usize, sent: usize) {
        debug!(
            event_type = %EventType::MixRelease,
            node = %node,
            batch = batch,
            sent = sent,
            "Mix buffer released"
        );
    }

    /// Log a transport failure
    pub fn log_transport_failure(node: Address, port: Option<Port>, error: &dyn fmt::Display) {
        warn!(
            event_type = %EventType::Transport,
            node = %node,
            port = ?port,
            error = %error,
            "Transport failure"
        );
    }
}

/// Initialize logging to stdout.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. Does nothing if a
/// global subscriber is already installed.
pub fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

/// Initialize JSON logging to a daily-rotated file
///
/// # Arguments
/// * `log_dir` - Directory to store log files
/// * `max_files` - Maximum number of log files to keep
///
/// # Returns
/// The writer guard; logs are flushed when it is dropped
pub fn init_file_logging(
    log_dir: &str,
    max_files: usize,
) -> Result<tracing_appender::non_blocking::WorkerGuard, Box<dyn std::error::Error>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("mixnode")
        .filename_suffix("log")
        .max_log_files(max_files)
        .build(log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        );

    subscriber.try_init().ok();

    Ok(guard)
}
