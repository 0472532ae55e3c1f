//! Forwarding and mixing engine
//!
//! User packets get a source route from the topology graph, optionally with a
//! random two-hop detour, and enter the mix buffer. Packets from neighbors are
//! either delivered to the user or advanced one hop along their route and
//! mixed as well. Ping requests are answered through the same path. Flood
//! packets skip routing and mixing and follow the spanning tree.
//!
//! Every failure here is a silent drop: the sender learns about loss only
//! through its own timeouts.

use crate::address::{Address, Port};
use crate::events::{DropReason, EventLogger};
use crate::node::Node;
use crate::packet::{Packet, PingKind, PingPayload, RoutingHeader};
use crate::shortest_path::Route;
use crate::stats::RttSample;
use crate::transport::Transport;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::{Duration, Instant};

impl<T: Transport> Node<T> {
    /// Turn a user packet into a routed packet and queue it
    pub(crate) fn originate(&mut self, packet: Packet, now: Instant) {
        let user_port = self.config.user_port();
        let Some(destination) = packet.routing_header().map(|h| h.destination) else {
            self.drop_packet(&packet, user_port, DropReason::Unexpected);
            return;
        };
        if destination == self.address() {
            self.drop_packet(&packet, user_port, DropReason::Unexpected);
            return;
        }
        let Some(route) = self.topology.route(destination).cloned() else {
            self.drop_packet(&packet, user_port, DropReason::UnknownDestination);
            return;
        };

        let header = RoutingHeader::new(self.address(), destination, self.plan_hops(&route));
        let outbound = match packet {
            Packet::Data { payload, .. } => Packet::Data { header, payload },
            _ => Packet::Ping {
                header,
                ping: PingPayload {
                    kind: PingKind::Request,
                    sent_at_ms: self.clock_ms(now),
                },
            },
        };

        if self.route_and_mix(outbound) {
            self.stats.packets_originated += 1;
        }
    }

    /// Hop list for a new packet following `route`.
    ///
    /// With random routing on, a coin flip may send the packet to another
    /// neighbor and back before it takes the shortest path.
    fn plan_hops(&mut self, route: &Route) -> Vec<Address> {
        let mut hops = route.intermediate_hops().to_vec();
        if !self.config.random_routing || !self.rng.gen_bool(0.5) {
            return hops;
        }

        let first_hop = route.first_hop();
        let mut alternates: Vec<Address> = self
            .tree
            .neighbors()
            .iter()
            .filter_map(|n| n.known_address)
            .filter(|&a| Some(a) != first_hop)
            .collect();
        alternates.sort();
        alternates.dedup();

        if let Some(&detour) = alternates.choose(&mut self.rng) {
            let mut detoured = vec![detour, self.address()];
            detoured.append(&mut hops);
            return detoured;
        }
        hops
    }

    /// Handle a routed packet that arrived from a neighbor
    pub(crate) fn handle_routed(&mut self, port: Port, mut packet: Packet, now: Instant) {
        let Some(destination) = packet.routing_header().map(|h| h.destination) else {
            self.drop_packet(&packet, port, DropReason::Unexpected);
            return;
        };
        if destination == self.address() {
            self.deliver(packet, now);
            return;
        }

        if let Some(header) = packet.routing_header_mut() {
            header.advance();
        }
        if self.route_and_mix(packet) {
            self.stats.packets_relayed += 1;
        }
    }

    /// Hand a packet addressed to this node to the user and answer pings
    fn deliver(&mut self, packet: Packet, now: Instant) {
        self.stats.packets_delivered += 1;

        if let Packet::Ping { header, ping } = &packet {
            match ping.kind {
                PingKind::Request => {
                    let reply = Packet::Ping {
                        header: header.reversed(),
                        ping: PingPayload {
                            kind: PingKind::Reply,
                            sent_at_ms: ping.sent_at_ms,
                        },
                    };
                    self.route_and_mix(reply);
                }
                PingKind::Reply => {
                    let rtt_ms = self.clock_ms(now).saturating_sub(ping.sent_at_ms);
                    let peer = header.source;
                    EventLogger::log_round_trip(self.address(), peer, Duration::from_millis(rtt_ms));
                    self.stats.rtt_samples.push(RttSample { peer, rtt_ms });
                }
            }
        }

        self.send_to_user(packet);
    }

    /// Resolve the port toward the packet's next target and queue it for mixing.
    ///
    /// Returns false when no neighbor matches and the packet was dropped.
    fn route_and_mix(&mut self, packet: Packet) -> bool {
        let Some(target) = packet.routing_header().map(RoutingHeader::next_target) else {
            return false;
        };
        match self.tree.port_of(target) {
            Some(port) => {
                self.mix(port, packet);
                true
            }
            None => {
                let user_port = self.config.user_port();
                self.drop_packet(&packet, user_port, DropReason::NoMatchingNeighbor);
                false
            }
        }
    }

    /// Add a packet to the mix buffer, releasing the batch when it is full
    pub(crate) fn mix(&mut self, port: Port, packet: Packet) {
        let Some(batch) = self.mixer.push(port, packet) else {
            return;
        };
        let size = batch.len();
        let mut sent = 0;
        for (port, packet) in batch {
            if !self.is_running() {
                break;
            }
            match self.transport.send(port, packet) {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.stats.send_failures += 1;
                    EventLogger::log_transport_failure(self.address(), Some(port), &e);
                    break;
                }
            }
        }
        self.stats.mix_releases += 1;
        EventLogger::log_mix_release(self.address(), size, sent);
    }

    /// Forward a flood along the spanning tree
    pub(crate) fn handle_flood(&mut self, port: Port, packet: Packet) {
        let from_user = port == self.config.user_port();
        if !from_user && self.tree.is_blocked(port) {
            self.drop_packet(&packet, port, DropReason::BlockedPort);
            return;
        }

        let ports: Vec<Port> = self
            .tree
            .unblocked_ports()
            .filter(|&p| from_user || p != port)
            .collect();
        let forwarded = self.send_each(&ports, &packet);
        self.stats.floods_forwarded += forwarded as u64;

        if !from_user {
            self.send_to_user(packet);
        }
    }
}
