//! Single-source shortest paths over the topology graph
//!
//! Classic Dijkstra with a binary heap. Equal-distance candidates are resolved
//! toward the predecessor with the smaller address so that every node that
//! knows the full graph derives the same path for a given pair.

use crate::address::Address;
use crate::packet::LinkEntry;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

/// Computed route from the local node to one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Sum of link costs along the path
    pub distance: u32,
    /// Nodes after the local node, ending with the destination
    pub path: Vec<Address>,
}

impl Route {
    pub fn path_length(&self) -> usize {
        self.path.len()
    }

    /// Immediate next node toward the destination (`None` for the local node)
    pub fn first_hop(&self) -> Option<Address> {
        self.path.first().copied()
    }

    /// Nodes strictly between the local node and the destination
    pub fn intermediate_hops(&self) -> &[Address] {
        match self.path.split_last() {
            Some((_, intermediate)) => intermediate,
            None => &[],
        }
    }
}

/// Compute routes from `source` to every node reachable through advertised edges.
///
/// Only nodes present as keys of `edges` are destinations; edges pointing at
/// nodes that never advertised themselves are skipped. Unreachable nodes are
/// absent from the result. The source maps to a zero-distance empty route.
pub fn shortest_paths(
    source: Address,
    edges: &BTreeMap<Address, Vec<LinkEntry>>,
) -> BTreeMap<Address, Route> {
    let mut distance: BTreeMap<Address, u32> = BTreeMap::new();
    let mut predecessor: BTreeMap<Address, Address> = BTreeMap::new();
    let mut settled: BTreeSet<Address> = BTreeSet::new();
    let mut heap = BinaryHeap::new();

    if !edges.contains_key(&source) {
        return BTreeMap::new();
    }

    distance.insert(source, 0);
    heap.push(Reverse((0u32, source)));

    while let Some(Reverse((dist, node))) = heap.pop() {
        if !settled.insert(node) {
            continue;
        }
        let Some(links) = edges.get(&node) else {
            continue;
        };
        for link in links {
            let neighbor = link.neighbor;
            if settled.contains(&neighbor) || !edges.contains_key(&neighbor) {
                continue;
            }
            let candidate = dist.saturating_add(u32::from(link.cost));
            let better = match distance.get(&neighbor) {
                None => true,
                Some(&current) if candidate < current => true,
                Some(&current) if candidate == current => {
                    predecessor.get(&neighbor).map_or(true, |&p| node < p)
                }
                Some(_) => false,
            };
            if better {
                distance.insert(neighbor, candidate);
                predecessor.insert(neighbor, node);
                heap.push(Reverse((candidate, neighbor)));
            }
        }
    }

    let mut routes = BTreeMap::new();
    for (&node, &dist) in &distance {
        let mut path = Vec::new();
        let mut cursor = node;
        while cursor != source {
            path.push(cursor);
            match predecessor.get(&cursor) {
                Some(&prev) => cursor = prev,
                None => break,
            }
        }
        path.reverse();
        routes.insert(node, Route { distance: dist, path });
    }
    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(links: &[(u16, u16, u16)]) -> BTreeMap<Address, Vec<LinkEntry>> {
        let mut edges: BTreeMap<Address, Vec<LinkEntry>> = BTreeMap::new();
        for &(a, b, cost) in links {
            edges.entry(Address(a)).or_default().push(LinkEntry {
                neighbor: Address(b),
                cost,
            });
            edges.entry(Address(b)).or_default().push(LinkEntry {
                neighbor: Address(a),
                cost,
            });
        }
        edges
    }

    fn path(route: &Route) -> Vec<u16> {
        route.path.iter().map(|a| a.0).collect()
    }

    #[test]
    fn test_line_paths() {
        let edges = graph(&[(1, 2, 1), (2, 3, 1)]);
        let routes = shortest_paths(Address(1), &edges);

        assert_eq!(routes[&Address(1)].distance, 0);
        assert!(routes[&Address(1)].path.is_empty());
        assert_eq!(routes[&Address(1)].first_hop(), None);
        assert_eq!(path(&routes[&Address(3)]), vec![2, 3]);
        assert_eq!(routes[&Address(3)].distance, 2);
        assert_eq!(routes[&Address(3)].first_hop(), Some(Address(2)));
        assert_eq!(routes[&Address(3)].intermediate_hops(), &[Address(2)]);
    }

    #[test]
    fn test_prefers_cheaper_longer_path() {
        //   1 --10-- 3
        //    \      /
        //     1    1
        //      \  /
        //       2
        let edges = graph(&[(1, 3, 10), (1, 2, 1), (2, 3, 1)]);
        let routes = shortest_paths(Address(1), &edges);
        assert_eq!(path(&routes[&Address(3)]), vec![2, 3]);
        assert_eq!(routes[&Address(3)].distance, 2);
    }

    #[test]
    fn test_equal_cost_tie_break_prefers_smaller_predecessor() {
        // 1 -> {5, 4} -> 9, all unit costs
        let edges = graph(&[(1, 5, 1), (1, 4, 1), (5, 9, 1), (4, 9, 1)]);
        let routes = shortest_paths(Address(1), &edges);
        assert_eq!(path(&routes[&Address(9)]), vec![4, 9]);

        // Same graph listed in a different order
        let edges = graph(&[(4, 9, 1), (5, 9, 1), (1, 4, 1), (1, 5, 1)]);
        let routes = shortest_paths(Address(1), &edges);
        assert_eq!(path(&routes[&Address(9)]), vec![4, 9]);
    }

    #[test]
    fn test_unadvertised_neighbor_is_unreachable() {
        let mut edges = graph(&[(1, 2, 1)]);
        // 2 advertises a link to 7, but 7 never advertised itself
        edges.get_mut(&Address(2)).unwrap().push(LinkEntry {
            neighbor: Address(7),
            cost: 1,
        });
        let routes = shortest_paths(Address(1), &edges);
        assert!(routes.contains_key(&Address(2)));
        assert!(!routes.contains_key(&Address(7)));
    }

    #[test]
    fn test_disconnected_component_is_unreachable() {
        let edges = graph(&[(1, 2, 1), (8, 9, 1)]);
        let routes = shortest_paths(Address(1), &edges);
        assert_eq!(routes.len(), 2);
        assert!(!routes.contains_key(&Address(9)));
    }

    #[test]
    fn test_zero_cost_links() {
        let edges = graph(&[(1, 2, 0), (2, 3, 0), (1, 3, 0)]);
        let routes = shortest_paths(Address(1), &edges);
        assert_eq!(path(&routes[&Address(3)]), vec![3]);
        assert_eq!(routes[&Address(2)].distance, 0);
    }

    #[test]
    fn test_unknown_source_yields_nothing() {
        let edges = graph(&[(1, 2, 1)]);
        assert!(shortest_paths(Address(5), &edges).is_empty());
    }
}
