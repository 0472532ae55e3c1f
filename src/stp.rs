//! Spanning-tree election
//!
//! Each node keeps a [`TreeState`] describing which node it believes to be the
//! root, its next hop toward that root and its distance from it. Tree
//! advertisements received from neighbors are judged against that state; the
//! lexicographically smaller `(root, path_length, next_hop)` always wins.
//!
//! The same advertisements decide which links are part of the tree. A port is
//! left unblocked only when it leads to the parent (the current next hop) or
//! to a child one hop farther from the root. All other links are pruned.
//!
//! This module is pure state: it never sends anything. The node turns the
//! returned outcomes into broadcasts.

use crate::address::{Address, Port};
use crate::packet::StpAdvertisement;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Root/next-hop/distance belief of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeState {
    pub root: Address,
    pub next_hop: Address,
    pub path_length: u16,
}

impl TreeState {
    /// State of a node that considers itself the root
    pub fn self_rooted(address: Address) -> Self {
        Self {
            root: address,
            next_hop: address,
            path_length: 0,
        }
    }

    pub fn is_root_of(&self, address: Address) -> bool {
        self.next_hop == address
    }

    /// Whether `ad` describes a better position in the tree than this state.
    ///
    /// Smaller claimed root wins, then shorter path, then smaller next hop.
    pub fn is_superseded_by(&self, ad: &StpAdvertisement) -> bool {
        let claimed = (ad.root, u32::from(ad.path_length) + 1, ad.sender);
        let current = (self.root, u32::from(self.path_length), self.next_hop);
        claimed < current
    }

    /// Whether `ad` comes from the parent and agrees with this state
    pub fn is_confirmed_by(&self, ad: &StpAdvertisement) -> bool {
        ad.root == self.root
            && u32::from(ad.path_length) + 1 == u32::from(self.path_length)
            && ad.sender == self.next_hop
    }

    /// Whether `ad` comes from a child: a node one hop farther from the same root
    pub fn is_child_advertisement(&self, ad: &StpAdvertisement) -> bool {
        ad.root == self.root && u32::from(ad.path_length) == u32::from(self.path_length) + 1
    }

    /// Advertisement a node in this state sends
    pub fn advertisement(&self, sender: Address) -> StpAdvertisement {
        StpAdvertisement {
            root: self.root,
            path_length: self.path_length,
            sender,
        }
    }
}

/// What the node knows about the link on one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NeighborRecord {
    pub known_address: Option<Address>,
    pub blocked: bool,
}

impl NeighborRecord {
    /// Links start blocked until an advertisement places them in the tree
    pub fn new() -> Self {
        Self {
            known_address: None,
            blocked: true,
        }
    }
}

/// Result of processing one advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StpOutcome {
    /// The tree state changed
    pub accepted: bool,
    /// The parent confirmed the current state (keepalive)
    pub heartbeat: bool,
    /// The port's neighbor address was learned or changed
    pub neighbor_changed: bool,
}

impl StpOutcome {
    /// Whether the node must broadcast its tree state
    pub fn should_broadcast(&self) -> bool {
        self.accepted || self.heartbeat
    }
}

/// Election state machine of one node
#[derive(Debug, Clone)]
pub struct SpanningTree {
    address: Address,
    state: TreeState,
    neighbors: Vec<NeighborRecord>,
    /// Last advertisement heard per port
    last_heard: Vec<Option<Instant>>,
    /// Port currently unblocked toward the parent
    upward_port: Option<Port>,
    /// Last parent confirmation (or the last state change)
    last_root_refresh: Instant,
    /// Last accepted state change
    last_change: Instant,
    /// Last broadcast while self-rooted
    last_hello: Option<Instant>,
    converged: bool,
}

impl SpanningTree {
    pub fn new(address: Address, neighbor_count: usize, now: Instant) -> Self {
        Self {
            address,
            state: TreeState::self_rooted(address),
            neighbors: vec![NeighborRecord::new(); neighbor_count],
            last_heard: vec![None; neighbor_count],
            upward_port: None,
            last_root_refresh: now,
            last_change: now,
            last_hello: None,
            converged: false,
        }
    }

    pub fn state(&self) -> TreeState {
        self.state
    }

    pub fn neighbors(&self) -> &[NeighborRecord] {
        &self.neighbors
    }

    pub fn is_root(&self) -> bool {
        self.state.is_root_of(self.address)
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    pub fn upward_port(&self) -> Option<Port> {
        self.upward_port
    }

    /// Current advertisement of this node
    pub fn advertisement(&self) -> StpAdvertisement {
        self.state.advertisement(self.address)
    }

    pub fn is_blocked(&self, port: Port) -> bool {
        self.neighbors
            .get(port as usize)
            .map(|n| n.blocked)
            .unwrap_or(true)
    }

    /// Unblocked link ports, in port order
    pub fn unblocked_ports(&self) -> impl Iterator<Item = Port> + '_ {
        self.neighbors
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.blocked)
            .map(|(port, _)| port as Port)
    }

    /// Lowest port whose neighbor has `address`
    pub fn port_of(&self, address: Address) -> Option<Port> {
        self.neighbors
            .iter()
            .position(|n| n.known_address == Some(address))
            .map(|port| port as Port)
    }

    /// Process an advertisement received on `port`
    pub fn on_advertisement(
        &mut self,
        port: Port,
        ad: &StpAdvertisement,
        now: Instant,
    ) -> StpOutcome {
        let mut outcome = StpOutcome::default();
        let Some(record) = self.neighbors.get_mut(port as usize) else {
            return outcome;
        };

        if record.known_address != Some(ad.sender) {
            record.known_address = Some(ad.sender);
            outcome.neighbor_changed = true;
        }
        if let Some(heard) = self.last_heard.get_mut(port as usize) {
            *heard = Some(now);
        }

        if self.state.is_superseded_by(ad) {
            let previous = self.state.next_hop;
            self.state = TreeState {
                root: ad.root,
                next_hop: ad.sender,
                path_length: ad.path_length.saturating_add(1),
            };
            if previous != self.address {
                self.block_toward(previous);
            }
            self.last_root_refresh = now;
            self.last_change = now;
            self.converged = false;
            outcome.accepted = true;
        } else if self.state.is_confirmed_by(ad) {
            self.last_root_refresh = now;
            outcome.heartbeat = true;
        }

        self.classify_port(port, ad);
        outcome
    }

    /// Decide whether `port` belongs to the tree given the advertisement just heard on it
    fn classify_port(&mut self, port: Port, ad: &StpAdvertisement) {
        if self.state.is_confirmed_by(ad) {
            if let Some(old) = self.upward_port.filter(|&old| old != port) {
                self.set_blocked(old, true);
            }
            self.upward_port = Some(port);
            self.set_blocked(port, false);
        } else if self.state.is_child_advertisement(ad) {
            if self.upward_port == Some(port) {
                self.upward_port = None;
            }
            self.set_blocked(port, false);
        } else {
            if self.upward_port == Some(port) {
                self.upward_port = None;
            }
            self.set_blocked(port, true);
        }
    }

    fn set_blocked(&mut self, port: Port, blocked: bool) {
        if let Some(record) = self.neighbors.get_mut(port as usize) {
            record.blocked = blocked;
        }
    }

    /// Block every port leading to `address`
    fn block_toward(&mut self, address: Address) {
        for (port, record) in self.neighbors.iter_mut().enumerate() {
            if record.known_address == Some(address) {
                record.blocked = true;
                if self.upward_port == Some(port as Port) {
                    self.upward_port = None;
                }
            }
        }
    }

    /// Whether a self-rooted node owes its neighbors a heartbeat
    pub fn hello_due(&self, hello_interval: Duration, now: Instant) -> bool {
        self.is_root()
            && self
                .last_hello
                .map_or(true, |last| now.saturating_duration_since(last) >= hello_interval)
    }

    /// Record a heartbeat broadcast
    pub fn mark_hello(&mut self, now: Instant) {
        self.last_hello = Some(now);
    }

    /// Fall back to self-rooted when the root path went silent.
    ///
    /// Returns the abandoned next hop when a reelection happened.
    pub fn check_reelection(
        &mut self,
        reelection_interval: Duration,
        now: Instant,
    ) -> Option<Address> {
        if self.is_root()
            || now.saturating_duration_since(self.last_root_refresh) < reelection_interval
        {
            return None;
        }
        let previous = self.state.next_hop;
        self.state = TreeState::self_rooted(self.address);
        self.block_toward(previous);
        self.upward_port = None;
        self.last_root_refresh = now;
        self.last_change = now;
        self.last_hello = Some(now);
        self.converged = false;
        Some(previous)
    }

    /// Forget neighbors silent for `timeout` and block their ports.
    ///
    /// Returns the expired `(port, address)` pairs.
    pub fn expire_neighbors(&mut self, timeout: Duration, now: Instant) -> Vec<(Port, Address)> {
        let mut expired = Vec::new();
        let records = self.neighbors.iter_mut().zip(self.last_heard.iter_mut());
        for (port, (record, heard)) in records.enumerate() {
            let (Some(address), Some(last)) = (record.known_address, *heard) else {
                continue;
            };
            if now.saturating_duration_since(last) < timeout {
                continue;
            }
            record.known_address = None;
            record.blocked = true;
            *heard = None;
            if self.upward_port == Some(port as Port) {
                self.upward_port = None;
            }
            expired.push((port as Port, address));
        }
        expired
    }

    /// Declare convergence after a quiet `window`. Returns true on the transition.
    pub fn check_convergence(&mut self, window: Duration, now: Instant) -> bool {
        if self.converged || now.saturating_duration_since(self.last_change) < window {
            return false;
        }
        self.converged = true;
        true
    }

    /// Time since the last accepted state change
    pub fn quiet_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_change)
    }
}
