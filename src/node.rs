//! The node context and its event loop
//!
//! A [`Node`] owns every piece of per-node state: election, topology, mix
//! buffer, statistics and the transport. All operations go through it, one at
//! a time, so no locking is needed. Several nodes in one process share nothing
//! but their transports.
//!
//! The protocol handlers live next to the state they drive:
//! - [`crate::lsa`] - link-state origination and flooding
//! - [`crate::forwarding`] - origination, relaying, delivery and mixing

use crate::address::{Address, Port};
use crate::config::{ConfigError, NodeConfig};
use crate::events::{DropReason, EventLogger};
use crate::lsa::LinkStateSchedule;
use crate::mixing::MixBuffer;
use crate::packet::{Packet, StpAdvertisement};
use crate::stats::{ConvergenceReport, NodeStats};
use crate::stp::{NeighborRecord, SpanningTree, TreeState};
use crate::topology::TopologyGraph;
use crate::transport::{Transport, TransportError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// One overlay node
pub struct Node<T: Transport> {
    pub(crate) config: NodeConfig,
    pub(crate) transport: T,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) started: Instant,
    pub(crate) tree: SpanningTree,
    pub(crate) topology: TopologyGraph,
    pub(crate) mixer: MixBuffer,
    pub(crate) rng: StdRng,
    pub(crate) link_state: LinkStateSchedule,
    pub(crate) stats: NodeStats,
}

impl<T: Transport> Node<T> {
    /// Create a node that starts now
    pub fn new(config: NodeConfig, transport: T) -> Result<Self, NodeError> {
        Self::with_start(config, transport, Instant::now())
    }

    /// Create a node whose clock starts at `started`
    pub fn with_start(config: NodeConfig, transport: T, started: Instant) -> Result<Self, NodeError> {
        config.validate()?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            tree: SpanningTree::new(config.address, config.neighbor_count(), started),
            topology: TopologyGraph::new(config.address),
            mixer: MixBuffer::new(config.mixing_factor),
            link_state: LinkStateSchedule::new(),
            running: Arc::new(AtomicBool::new(true)),
            stats: NodeStats::new(),
            started,
            rng,
            config,
            transport,
        })
    }

    /// Share an externally owned run flag
    pub fn with_stop_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn address(&self) -> Address {
        self.config.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn tree_state(&self) -> TreeState {
        self.tree.state()
    }

    pub fn spanning_tree(&self) -> &SpanningTree {
        &self.tree
    }

    pub fn neighbors(&self) -> &[NeighborRecord] {
        self.tree.neighbors()
    }

    pub fn topology(&self) -> &TopologyGraph {
        &self.topology
    }

    pub fn mix_buffer(&self) -> &MixBuffer {
        &self.mixer
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Flag the run loop watches; store `false` to stop the node
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Milliseconds on this node's clock
    pub(crate) fn clock_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started).as_millis() as u64
    }

    /// Run until the stop flag turns false
    pub fn run(&mut self) -> Result<(), NodeError> {
        info!(node = %self.address(), neighbors = self.config.neighbor_count(), "Node starting");
        while self.is_running() {
            if !self.step(Instant::now())? {
                std::thread::yield_now();
            }
        }
        info!(
            node = %self.address(),
            root = %self.tree.state().root,
            "Node stopped"
        );
        Ok(())
    }

    /// One loop iteration: at most one inbound packet, then at most one timer action.
    ///
    /// Returns whether any work was done.
    pub fn step(&mut self, now: Instant) -> Result<bool, NodeError> {
        let mut busy = false;
        match self.transport.receive() {
            Ok(Some((port, packet))) => {
                self.handle_packet(port, packet, now);
                busy = true;
            }
            Ok(None) => {}
            Err(TransportError::Codec(e)) => {
                EventLogger::log_transport_failure(self.address(), None, &e);
                self.stats.drops.record(DropReason::Unexpected);
                busy = true;
            }
            Err(e) => return Err(e.into()),
        }
        if self.is_running() && self.poll_timers(now) {
            busy = true;
        }
        Ok(busy)
    }

    /// Dispatch one inbound packet
    pub fn handle_packet(&mut self, port: Port, packet: Packet, now: Instant) {
        let user_port = self.config.user_port();
        if port > user_port {
            self.drop_packet(&packet, port, DropReason::Unexpected);
            return;
        }
        let from_user = port == user_port;
        match packet {
            Packet::Stp(ad) if !from_user => self.handle_advertisement(port, ad, now),
            Packet::Lsa(lsa) if !from_user => self.handle_link_state(port, lsa),
            Packet::Flood { .. } => self.handle_flood(port, packet),
            Packet::Data { .. } | Packet::Ping { .. } if from_user => self.originate(packet, now),
            Packet::Data { .. } | Packet::Ping { .. } => self.handle_routed(port, packet, now),
            other => self.drop_packet(&other, port, DropReason::Unexpected),
        }
    }

    fn handle_advertisement(&mut self, port: Port, ad: StpAdvertisement, now: Instant) {
        self.stats.advertisements_received += 1;
        let outcome = self.tree.on_advertisement(port, &ad, now);
        if outcome.accepted {
            self.stats.tree_changes += 1;
            EventLogger::log_tree_update(self.address(), &self.tree.state());
        }
        if outcome.neighbor_changed {
            self.refresh_local_edges();
        }
        if outcome.should_broadcast() {
            self.broadcast_tree_state();
        }
    }

    /// Perform the first due timer action. Returns whether one ran.
    pub fn poll_timers(&mut self, now: Instant) -> bool {
        if self.tree.hello_due(self.config.hello_interval(), now) {
            self.tree.mark_hello(now);
            self.broadcast_tree_state();
            return true;
        }

        if let Some(abandoned) = self
            .tree
            .check_reelection(self.config.reelection_interval(), now)
        {
            self.stats.reelections += 1;
            EventLogger::log_reelection(self.address(), abandoned);
            self.broadcast_tree_state();
            return true;
        }

        let expired = self
            .tree
            .expire_neighbors(self.config.neighbor_timeout(), now);
        if !expired.is_empty() {
            for &(port, neighbor) in &expired {
                EventLogger::log_neighbor_expired(self.address(), port, neighbor);
            }
            self.stats.neighbors_expired += expired.len() as u64;
            self.refresh_local_edges();
            return true;
        }

        if self
            .tree
            .check_convergence(self.config.convergence_window(), now)
        {
            let state = self.tree.state();
            EventLogger::log_convergence(self.address(), state.root, self.stats.advertisements_sent);
            self.stats.convergence.push(ConvergenceReport {
                at: chrono::Utc::now(),
                since_start_ms: self.clock_ms(now),
                root: state.root,
                path_length: state.path_length,
                advertisements_sent: self.stats.advertisements_sent,
            });
            return true;
        }

        if self.link_state.is_due(&self.config, self.started, now) {
            self.originate_link_state(now);
            return true;
        }

        false
    }

    /// Send the current tree state on every link, parent and pruned links included
    pub(crate) fn broadcast_tree_state(&mut self) {
        let packet = Packet::Stp(self.tree.advertisement());
        let ports: Vec<Port> = (0..self.config.neighbor_count()).map(|p| p as Port).collect();
        let sent = self.send_each(&ports, &packet);
        self.stats.advertisements_sent += sent as u64;
    }

    /// Send a copy of `packet` on each port.
    ///
    /// Stops early when the node is asked to stop or a send fails. Returns the
    /// number of successful sends.
    pub(crate) fn send_each(&mut self, ports: &[Port], packet: &Packet) -> usize {
        let mut sent = 0;
        for &port in ports {
            if !self.is_running() {
                break;
            }
            match self.transport.send(port, packet.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.stats.send_failures += 1;
                    EventLogger::log_transport_failure(self.address(), Some(port), &e);
                    break;
                }
            }
        }
        sent
    }

    pub(crate) fn drop_packet(&mut self, packet: &Packet, port: Port, reason: DropReason) {
        self.stats.drops.record(reason);
        EventLogger::log_drop(self.address(), packet.packet_type(), port, reason);
    }

    /// Deliver a packet to the local user, outside the mixer
    pub(crate) fn send_to_user(&mut self, packet: Packet) {
        let port = self.config.user_port();
        if let Err(e) = self.transport.send(port, packet) {
            self.stats.send_failures += 1;
            EventLogger::log_transport_failure(self.address(), Some(port), &e);
        } else {
            debug!(node = %self.address(), "Delivered packet to user");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QueueTransport;
    use std::time::Duration;

    fn node(address: u16, links: usize) -> (Node<QueueTransport>, Instant) {
        let start = Instant::now();
        let config = NodeConfig::new(Address(address), vec![1; links]).with_timers(100, 400);
        let node = Node::with_start(config, QueueTransport::new(), start).unwrap();
        (node, start)
    }

    fn stp(root: u16, path_length: u16, sender: u16) -> Packet {
        Packet::Stp(StpAdvertisement {
            root: Address(root),
            path_length,
            sender: Address(sender),
        })
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = NodeConfig::new(Address(1), vec![1]).with_mixing_factor(0);
        assert!(matches!(
            Node::new(config, QueueTransport::new()),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn test_first_poll_sends_root_hello_on_every_port() {
        let (mut node, start) = node(4, 3);
        assert!(node.poll_timers(start));
        let sent = node.transport_mut().drain_sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(_, p)| *p == stp(4, 0, 4)));
        assert_eq!(node.stats().advertisements_sent, 3);

        // nothing else is due right away
        assert!(!node.poll_timers(start + Duration::from_millis(10)));
    }

    #[test]
    fn test_accepted_advertisement_rebroadcasts() {
        let (mut node, start) = node(4, 2);
        node.handle_packet(1, stp(2, 0, 2), start);

        let state = node.tree_state();
        assert_eq!(state.root, Address(2));
        assert_eq!(state.path_length, 1);
        let sent = node.transport_mut().drain_sent();
        assert_eq!(sent, vec![(0, stp(2, 1, 4)), (1, stp(2, 1, 4))]);
        assert_eq!(node.stats().tree_changes, 1);
        assert_eq!(node.neighbors()[1].known_address, Some(Address(2)));
    }

    #[test]
    fn test_rejected_advertisement_is_silent() {
        let (mut node, start) = node(2, 1);
        node.handle_packet(0, stp(9, 0, 9), start);
        assert!(node.transport().sent().is_empty());
        assert!(node.neighbors()[0].blocked);
    }

    #[test]
    fn test_one_timer_action_per_step() {
        let (mut node, start) = node(4, 1);
        node.transport_mut().push_inbound(0, stp(1, 0, 1));
        assert!(node.step(start).unwrap());
        node.transport_mut().drain_sent();

        // reelection and convergence are both overdue; only one runs per step
        let later = start + Duration::from_secs(10);
        assert!(node.step(later).unwrap());
        assert_eq!(node.stats().reelections, 1);
        assert!(node.stats().convergence.is_empty());
    }

    #[test]
    fn test_stop_flag_interrupts_broadcast() {
        let (mut node, start) = node(4, 3);
        node.stop();
        node.poll_timers(start);
        assert!(node.transport().sent().is_empty());
    }

    #[test]
    fn test_send_failure_aborts_only_the_broadcast() {
        let (mut node, start) = node(4, 3);
        node.transport_mut().set_send_budget(Some(1));
        node.poll_timers(start);
        assert_eq!(node.transport().sent().len(), 1);
        assert_eq!(node.stats().send_failures, 1);
        assert_eq!(node.stats().advertisements_sent, 1);

        node.transport_mut().set_send_budget(None);
        node.handle_packet(0, stp(1, 0, 1), start);
        assert_eq!(node.tree_state().root, Address(1));
    }

    #[test]
    fn test_silent_neighbor_dropped_from_local_edges() {
        let (mut node, start) = node(4, 2);
        node.handle_packet(0, stp(1, 0, 1), start);
        node.handle_packet(1, stp(1, 2, 7), start + Duration::from_millis(500));
        assert_eq!(node.local_links().len(), 2);

        let t = start + Duration::from_millis(800);
        assert!(node.poll_timers(t));
        assert_eq!(node.stats().reelections, 1);
        assert!(node.poll_timers(t));
        assert_eq!(node.stats().neighbors_expired, 1);

        let links = node.local_links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].neighbor, Address(7));
        assert_eq!(node.topology().entry(Address(4)).unwrap().edges.len(), 1);
        assert!(node.neighbors()[0].blocked);
    }

    #[test]
    fn test_control_packets_from_user_dropped() {
        let (mut node, start) = node(4, 1);
        node.handle_packet(1, stp(1, 0, 1), start);
        assert!(node.tree.is_root());
        assert_eq!(node.stats().drops.unexpected, 1);
    }

    #[test]
    fn test_packet_on_unknown_port_dropped() {
        let (mut node, start) = node(4, 1);
        node.handle_packet(7, stp(1, 0, 1), start);
        assert_eq!(node.stats().drops.unexpected, 1);
    }

    #[test]
    fn test_convergence_report_recorded() {
        let (mut node, start) = node(4, 1);
        node.poll_timers(start);
        node.handle_packet(0, stp(1, 0, 1), start);
        // keep the parent alive and let the window pass
        let t = start + Duration::from_millis(300);
        node.handle_packet(0, stp(1, 0, 1), t);
        let t = start + Duration::from_millis(600);
        node.handle_packet(0, stp(1, 0, 1), t);
        let t = start + Duration::from_millis(800);
        node.handle_packet(0, stp(1, 0, 1), t);
        assert!(node.poll_timers(t));

        let report = node.stats().last_convergence().unwrap();
        assert_eq!(report.root, Address(1));
        assert_eq!(report.path_length, 1);
        assert_eq!(report.since_start_ms, 800);
        assert_eq!(report.advertisements_sent, node.stats().advertisements_sent);
    }
}
