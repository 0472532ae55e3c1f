//! Link-state dissemination
//!
//! After a warm-up period every node floods one advertisement listing its
//! neighbors and link costs along the spanning tree. Receivers store it in
//! their topology graph, pass the identical advertisement on to their other
//! tree links and recompute their routes. Flooding terminates because tree
//! links form no cycle; there is no sequence numbering.

use crate::address::Port;
use crate::config::NodeConfig;
use crate::events::{DropReason, EventLogger};
use crate::node::Node;
use crate::packet::{LinkEntry, LinkStateAdvertisement, Packet};
use crate::transport::Transport;
use std::time::Instant;

/// When the node originates its own advertisement
#[derive(Debug, Clone, Default)]
pub struct LinkStateSchedule {
    last_sent: Option<Instant>,
}

impl LinkStateSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an advertisement should be originated at `now`
    pub fn is_due(&self, config: &NodeConfig, started: Instant, now: Instant) -> bool {
        match self.last_sent {
            None => now.saturating_duration_since(started) >= config.link_state_delay(),
            Some(last) => config
                .link_state_refresh()
                .map_or(false, |refresh| now.saturating_duration_since(last) >= refresh),
        }
    }

    pub fn has_sent(&self) -> bool {
        self.last_sent.is_some()
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }
}

impl<T: Transport> Node<T> {
    /// Links whose neighbor address is known, in port order
    pub fn local_links(&self) -> Vec<LinkEntry> {
        self.tree
            .neighbors()
            .iter()
            .zip(&self.config.link_costs)
            .filter_map(|(record, &cost)| {
                record
                    .known_address
                    .map(|neighbor| LinkEntry { neighbor, cost })
            })
            .collect()
    }

    /// Push the current neighbor table into the local topology entry
    pub(crate) fn refresh_local_edges(&mut self) {
        let links = self.local_links();
        if self.topology.set_local_edges(links) {
            self.topology.recompute();
        }
    }

    /// Build and flood this node's advertisement on every tree link
    pub(crate) fn originate_link_state(&mut self, now: Instant) {
        let lsa = LinkStateAdvertisement {
            origin: self.address(),
            links: self.local_links(),
        };
        EventLogger::log_link_state(self.address(), lsa.origin, lsa.neighbor_count(), true);

        let ports: Vec<Port> = self.tree.unblocked_ports().collect();
        self.send_each(&ports, &Packet::Lsa(lsa));
        self.link_state.mark_sent(now);
        self.stats.lsas_originated += 1;
    }

    /// Store, re-flood and apply an advertisement received on `port`
    pub(crate) fn handle_link_state(&mut self, port: Port, lsa: LinkStateAdvertisement) {
        if self.tree.is_blocked(port) {
            self.drop_packet(&Packet::Lsa(lsa), port, DropReason::BlockedPort);
            return;
        }
        // Our own advertisement coming back means the tree is still settling
        if lsa.origin == self.address() {
            return;
        }

        self.stats.lsas_accepted += 1;
        EventLogger::log_link_state(self.address(), lsa.origin, lsa.neighbor_count(), false);
        self.topology.apply_advertisement(&lsa);

        let ports: Vec<Port> = self.tree.unblocked_ports().filter(|&p| p != port).collect();
        let forwarded = self.send_each(&ports, &Packet::Lsa(lsa));
        self.stats.lsas_forwarded += forwarded as u64;

        self.topology.recompute();
    }
}
