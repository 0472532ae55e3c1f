//! Per-node view of the overlay topology
//!
//! The graph holds one entry per node this node has heard about: the edge list
//! that node last advertised plus the route computed toward it. The local
//! entry always exists and is fed from the node's own neighbor table.

use crate::address::Address;
use crate::packet::{LinkEntry, LinkStateAdvertisement};
use crate::shortest_path::{shortest_paths, Route};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Knowledge about one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEntry {
    /// Last advertised links, in advertisement order
    pub edges: Vec<LinkEntry>,
    /// Route from the local node; `None` means unreachable
    pub route: Option<Route>,
}

impl TopologyEntry {
    /// Total cost to reach the node, `None` when unreachable
    pub fn distance(&self) -> Option<u32> {
        self.route.as_ref().map(|r| r.distance)
    }

    /// Immediate next node toward this node, `None` when unreachable or local
    pub fn first_hop(&self) -> Option<Address> {
        self.route.as_ref().and_then(Route::first_hop)
    }

    pub fn path_length(&self) -> Option<usize> {
        self.route.as_ref().map(Route::path_length)
    }
}

/// The topology graph of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyGraph {
    local: Address,
    entries: BTreeMap<Address, TopologyEntry>,
}

impl TopologyGraph {
    pub fn new(local: Address) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            local,
            TopologyEntry {
                edges: Vec::new(),
                route: Some(Route {
                    distance: 0,
                    path: Vec::new(),
                }),
            },
        );
        Self { local, entries }
    }

    pub fn local(&self) -> Address {
        self.local
    }

    pub fn entry(&self, address: Address) -> Option<&TopologyEntry> {
        self.entries.get(&address)
    }

    /// Route toward `address` if it is known and reachable
    pub fn route(&self, address: Address) -> Option<&Route> {
        self.entries.get(&address).and_then(|e| e.route.as_ref())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Address, &TopologyEntry)> {
        self.entries.iter()
    }

    pub fn node_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of known nodes with a route
    pub fn reachable_count(&self) -> usize {
        self.entries.values().filter(|e| e.route.is_some()).count()
    }

    /// Replace the local edge list. Returns true when it changed.
    pub fn set_local_edges(&mut self, edges: Vec<LinkEntry>) -> bool {
        let local = self.entries.entry(self.local).or_default();
        if local.edges == edges {
            return false;
        }
        local.edges = edges;
        true
    }

    /// Store the edges from a link-state advertisement. Returns true when the
    /// stored edge list changed.
    ///
    /// The advertised list replaces whatever was known before. The local entry
    /// is never overwritten from the network.
    pub fn apply_advertisement(&mut self, lsa: &LinkStateAdvertisement) -> bool {
        if lsa.origin == self.local {
            return false;
        }
        let entry = self.entries.entry(lsa.origin).or_default();
        if entry.edges == lsa.links {
            return false;
        }
        entry.edges = lsa.links.clone();
        true
    }

    /// Recompute every route from scratch
    pub fn recompute(&mut self) {
        let edges: BTreeMap<Address, Vec<LinkEntry>> = self
            .entries
            .iter()
            .map(|(addr, entry)| (*addr, entry.edges.clone()))
            .collect();
        let mut routes = shortest_paths(self.local, &edges);
        for (addr, entry) in self.entries.iter_mut() {
            entry.route = routes.remove(addr);
        }
    }
}
