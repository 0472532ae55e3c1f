//! Network simulation
//!
//! Describes a topology once and runs a whole overlay from it, either in
//! deterministic virtual time ([`LockstepSimulation`]) or with one thread per
//! node over the channel fabric ([`ThreadedSimulation`]).

use crate::address::{Address, Port};
use crate::config::{ConfigError, NodeConfig};
use crate::fabric::{ChannelTransport, Fabric, FaultInjector, UserPort};
use crate::node::{Node, NodeError};
use crate::packet::Packet;
use crate::stats::NodeStats;
use crate::transport::{QueueTransport, Transport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Simulation errors
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Unknown node {0}")]
    UnknownNode(Address),

    #[error("Node {0} thread panicked")]
    ThreadPanicked(Address),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_cost() -> u16 {
    1
}

/// One undirected link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: Address,
    pub b: Address,
    #[serde(default = "default_cost")]
    pub cost: u16,
}

/// Where one port of a node leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLink {
    pub neighbor: Address,
    /// Port on the neighbor that leads back
    pub neighbor_port: Port,
    pub cost: u16,
}

/// Nodes and weighted links of an overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpec {
    pub nodes: Vec<Address>,
    pub links: Vec<LinkSpec>,
}

impl TopologySpec {
    fn numbered(n: usize) -> Vec<Address> {
        (1..=n.min(u16::MAX as usize)).map(|i| Address(i as u16)).collect()
    }

    fn link(a: usize, b: usize, cost: u16) -> LinkSpec {
        LinkSpec {
            a: Address(a as u16),
            b: Address(b as u16),
            cost,
        }
    }

    /// 1 - 2 - ... - n
    pub fn line(n: usize) -> Self {
        Self {
            nodes: Self::numbered(n),
            links: (1..n).map(|i| Self::link(i, i + 1, 1)).collect(),
        }
    }

    /// Line closed into a cycle; fewer than three nodes give a line
    pub fn ring(n: usize) -> Self {
        let mut spec = Self::line(n);
        if n >= 3 {
            spec.links.push(Self::link(n, 1, 1));
        }
        spec
    }

    /// Node 1 in the middle, every other node a leaf
    pub fn star(n: usize) -> Self {
        Self {
            nodes: Self::numbered(n),
            links: (2..=n).map(|i| Self::link(1, i, 1)).collect(),
        }
    }

    /// `width` x `height` mesh, numbered row by row
    pub fn grid(width: usize, height: usize) -> Self {
        let id = |x: usize, y: usize| y * width + x + 1;
        let mut links = Vec::new();
        for y in 0..height {
            for x in 0..width {
                if x + 1 < width {
                    links.push(Self::link(id(x, y), id(x + 1, y), 1));
                }
                if y + 1 < height {
                    links.push(Self::link(id(x, y), id(x, y + 1), 1));
                }
            }
        }
        Self {
            nodes: Self::numbered(width * height),
            links,
        }
    }

    /// Connected random graph with link costs in 1..=5.
    ///
    /// A random spanning tree keeps the graph connected; each remaining pair
    /// is then linked with probability `edge_probability`.
    pub fn random(n: usize, edge_probability: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let p = edge_probability.clamp(0.0, 1.0);
        let mut links = Vec::new();
        let mut linked = BTreeSet::new();

        for i in 2..=n {
            let j = rng.gen_range(1..i);
            links.push(Self::link(j, i, rng.gen_range(1..=5)));
            linked.insert((j, i));
        }
        for i in 1..=n {
            for j in (i + 1)..=n {
                if !linked.contains(&(i, j)) && rng.gen_bool(p) {
                    links.push(Self::link(i, j, rng.gen_range(1..=5)));
                }
            }
        }
        Self {
            nodes: Self::numbered(n),
            links,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, SimulationError> {
        let spec: Self = serde_json::from_str(json)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn load(path: &Path) -> Result<Self, SimulationError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String, SimulationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject duplicate nodes, dangling links, self loops, parallel links and
    /// nodes with more links than a port number can address
    pub fn validate(&self) -> Result<(), SimulationError> {
        let mut nodes = BTreeSet::new();
        for &node in &self.nodes {
            if !nodes.insert(node) {
                return Err(SimulationError::InvalidTopology(format!(
                    "node {} listed twice",
                    node
                )));
            }
        }

        let mut pairs = BTreeSet::new();
        let mut degree: BTreeMap<Address, usize> = BTreeMap::new();
        for link in &self.links {
            for end in [link.a, link.b] {
                if !nodes.contains(&end) {
                    return Err(SimulationError::UnknownNode(end));
                }
            }
            if link.a == link.b {
                return Err(SimulationError::InvalidTopology(format!(
                    "self loop on {}",
                    link.a
                )));
            }
            if !pairs.insert((link.a.min(link.b), link.a.max(link.b))) {
                return Err(SimulationError::InvalidTopology(format!(
                    "parallel link {} - {}",
                    link.a, link.b
                )));
            }
            for end in [link.a, link.b] {
                let count = degree.entry(end).or_default();
                *count += 1;
                if *count >= Port::MAX as usize {
                    return Err(SimulationError::InvalidTopology(format!(
                        "node {} has too many links",
                        end
                    )));
                }
            }
        }
        Ok(())
    }

    /// Port assignment of every node, in link order
    pub fn ports(&self) -> BTreeMap<Address, Vec<PortLink>> {
        let mut ports: BTreeMap<Address, Vec<PortLink>> =
            self.nodes.iter().map(|&a| (a, Vec::new())).collect();
        for link in &self.links {
            let (Some(port_a), Some(port_b)) = (
                ports.get(&link.a).map(|p| p.len() as Port),
                ports.get(&link.b).map(|p| p.len() as Port),
            ) else {
                continue;
            };
            if let Some(list) = ports.get_mut(&link.a) {
                list.push(PortLink {
                    neighbor: link.b,
                    neighbor_port: port_b,
                    cost: link.cost,
                });
            }
            if let Some(list) = ports.get_mut(&link.b) {
                list.push(PortLink {
                    neighbor: link.a,
                    neighbor_port: port_a,
                    cost: link.cost,
                });
            }
        }
        ports
    }
}

/// Settings shared by every node of a simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    pub hello_interval_ms: u64,
    pub reelection_interval_ms: u64,
    pub mixing_factor: usize,
    pub random_routing: bool,
    pub link_state_delay_ms: Option<u64>,
    /// Periodic link-state re-origination; routes only heal after a failure when set
    pub link_state_refresh_ms: Option<u64>,
    /// Node seeds are derived from this and the node address
    pub seed: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            hello_interval_ms: NodeConfig::DEFAULT_HELLO_MS,
            reelection_interval_ms: NodeConfig::DEFAULT_REELECTION_MS,
            mixing_factor: 1,
            random_routing: false,
            link_state_delay_ms: None,
            link_state_refresh_ms: None,
            seed: 42,
        }
    }
}

impl SimulationSettings {
    /// Configuration of the node at `address` with the given port links
    pub fn config_for(&self, address: Address, links: &[PortLink]) -> NodeConfig {
        let mut config = NodeConfig::new(address, links.iter().map(|l| l.cost).collect())
            .with_timers(self.hello_interval_ms, self.reelection_interval_ms)
            .with_mixing_factor(self.mixing_factor)
            .with_random_routing(self.random_routing)
            .with_seed(self.seed.wrapping_add(u64::from(address.value())));
        if let Some(delay) = self.link_state_delay_ms {
            config = config.with_link_state_delay(delay);
        }
        if let Some(refresh) = self.link_state_refresh_ms {
            config = config.with_link_state_refresh(refresh);
        }
        config
    }

    /// Time for survivors to drop a dead neighbor and re-advertise
    pub fn recovery_time(&self) -> Duration {
        let refresh = self.link_state_refresh_ms.unwrap_or(self.reelection_interval_ms);
        Duration::from_millis(3 * self.reelection_interval_ms + refresh)
    }

    /// Time after which a tree built from scratch has settled and link
    /// state has spread
    pub fn settle_time(&self) -> Duration {
        let warm_up = self
            .link_state_delay_ms
            .unwrap_or(2 * self.reelection_interval_ms);
        Duration::from_millis(warm_up.max(2 * self.reelection_interval_ms) + self.reelection_interval_ms)
    }
}

/// Final view of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub address: Address,
    pub root: Address,
    pub next_hop: Address,
    pub path_length: u16,
    pub converged: bool,
    pub unblocked_ports: Vec<Port>,
    pub known_nodes: usize,
    pub reachable_nodes: usize,
    pub stats: NodeStats,
}

impl NodeSummary {
    pub fn of<T: Transport>(node: &Node<T>) -> Self {
        let state = node.tree_state();
        Self {
            address: node.address(),
            root: state.root,
            next_hop: state.next_hop,
            path_length: state.path_length,
            converged: node.spanning_tree().is_converged(),
            unblocked_ports: node.spanning_tree().unblocked_ports().collect(),
            known_nodes: node.topology().node_count(),
            reachable_nodes: node.topology().reachable_count(),
            stats: node.stats().clone(),
        }
    }
}

/// Outcome of a simulation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub elapsed_ms: u64,
    pub nodes: Vec<NodeSummary>,
}

impl SimulationReport {
    pub fn new(elapsed: Duration, nodes: Vec<NodeSummary>) -> Self {
        Self {
            elapsed_ms: elapsed.as_millis() as u64,
            nodes,
        }
    }

    /// The root every node agrees on, if they do
    pub fn agreed_root(&self) -> Option<Address> {
        let first = self.nodes.first()?.root;
        self.nodes.iter().all(|n| n.root == first).then_some(first)
    }

    pub fn converged_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.converged).count()
    }

    pub fn rtt_count(&self) -> usize {
        self.nodes.iter().map(|n| n.stats.rtt_samples.len()).sum()
    }

    pub fn total_drops(&self) -> u64 {
        self.nodes.iter().map(|n| n.stats.drops.total()).sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Simulation Report ===")?;
        writeln!(f, "Elapsed:              {} ms", self.elapsed_ms)?;
        writeln!(f, "Nodes:                {}", self.nodes.len())?;
        match self.agreed_root() {
            Some(root) => writeln!(f, "Agreed root:          {}", root)?,
            None => writeln!(f, "Agreed root:          none")?,
        }
        writeln!(f, "Converged:            {}", self.converged_count())?;
        writeln!(f, "Round trips:          {}", self.rtt_count())?;
        writeln!(f, "Drops:                {}", self.total_drops())?;
        writeln!(f)?;
        writeln!(f, "{:>6} {:>6} {:>6} {:>5} {:>9} {:>6} {:>10}", "node", "root", "next", "len", "reachable", "rtts", "avg rtt")?;
        for node in &self.nodes {
            let avg = node
                .stats
                .average_rtt()
                .map(|d| format!("{} ms", d.as_millis()))
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:>6} {:>6} {:>6} {:>5} {:>9} {:>6} {:>10}",
                node.address.to_string(),
                node.root.to_string(),
                node.next_hop.to_string(),
                node.path_length,
                node.reachable_nodes,
                node.stats.rtt_samples.len(),
                avg
            )?;
        }
        Ok(())
    }
}

/// Deterministic virtual-time simulation.
///
/// Every tick each live node drains its inbox and runs its due timers; what
/// it sent is delivered to the neighbors at the next tick.
pub struct LockstepSimulation {
    started: Instant,
    elapsed: Duration,
    tick: Duration,
    ports: BTreeMap<Address, Vec<PortLink>>,
    nodes: BTreeMap<Address, Node<QueueTransport>>,
    dead: BTreeSet<Address>,
    delivered: BTreeMap<Address, Vec<Packet>>,
    faults: FaultInjector,
}

impl LockstepSimulation {
    pub fn new(spec: &TopologySpec, settings: &SimulationSettings) -> Result<Self, SimulationError> {
        spec.validate()?;
        let started = Instant::now();
        let ports = spec.ports();
        let mut nodes = BTreeMap::new();
        for (&address, links) in &ports {
            let config = settings.config_for(address, links);
            nodes.insert(address, Node::with_start(config, QueueTransport::new(), started)?);
        }
        Ok(Self {
            started,
            elapsed: Duration::ZERO,
            tick: Duration::from_millis(1),
            ports,
            nodes,
            dead: BTreeSet::new(),
            delivered: BTreeMap::new(),
            faults: FaultInjector::new(),
        })
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_micros(1));
        self
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn now(&self) -> Instant {
        self.started + self.elapsed
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn node(&self, address: Address) -> Option<&Node<QueueTransport>> {
        self.nodes.get(&address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node<QueueTransport>> {
        self.nodes.values()
    }

    pub fn is_alive(&self, address: Address) -> bool {
        self.nodes.contains_key(&address) && !self.dead.contains(&address)
    }

    /// Stop a node; it keeps its state for inspection but no longer runs
    pub fn kill(&mut self, address: Address) -> bool {
        let Some(node) = self.nodes.get(&address) else {
            return false;
        };
        node.stop();
        self.dead.insert(address)
    }

    /// Queue a packet on a node's user port
    pub fn inject(&mut self, address: Address, packet: Packet) -> Result<(), SimulationError> {
        if self.dead.contains(&address) {
            return Err(SimulationError::UnknownNode(address));
        }
        let node = self
            .nodes
            .get_mut(&address)
            .ok_or(SimulationError::UnknownNode(address))?;
        let port = node.config().user_port();
        node.transport_mut().push_inbound(port, packet);
        Ok(())
    }

    /// Packets a node delivered to its user so far
    pub fn user_packets(&self, address: Address) -> &[Packet] {
        self.delivered.get(&address).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn take_user_packets(&mut self, address: Address) -> Vec<Packet> {
        self.delivered.remove(&address).unwrap_or_default()
    }

    /// Run for `duration` of virtual time
    pub fn advance(&mut self, duration: Duration) -> Result<(), SimulationError> {
        let target = self.elapsed + duration;
        while self.elapsed < target {
            self.elapsed = (self.elapsed + self.tick).min(target);
            self.run_tick()?;
        }
        Ok(())
    }

    /// Run until `done` holds or `limit` of virtual time passed. Returns whether `done` held.
    pub fn run_until<F>(&mut self, limit: Duration, mut done: F) -> Result<bool, SimulationError>
    where
        F: FnMut(&Self) -> bool,
    {
        let target = self.elapsed + limit;
        while self.elapsed < target {
            if done(self) {
                return Ok(true);
            }
            self.elapsed = (self.elapsed + self.tick).min(target);
            self.run_tick()?;
        }
        Ok(done(self))
    }

    fn run_tick(&mut self) -> Result<(), SimulationError> {
        let now = self.now();
        let mut outbound = Vec::new();
        for (&address, node) in self.nodes.iter_mut() {
            if self.dead.contains(&address) {
                node.transport_mut().drain_sent();
                continue;
            }
            while node.step(now)? {}
            for (port, packet) in node.transport_mut().drain_sent() {
                outbound.push((address, port, packet));
            }
        }

        for (from, port, packet) in outbound {
            let Some(links) = self.ports.get(&from) else {
                continue;
            };
            let Some(link) = links.get(port as usize) else {
                self.delivered.entry(from).or_default().push(packet);
                continue;
            };
            if self.dead.contains(&link.neighbor) || self.faults.should_drop(from, link.neighbor) {
                continue;
            }
            if let Some(peer) = self.nodes.get_mut(&link.neighbor) {
                peer.transport_mut().push_inbound(link.neighbor_port, packet);
            }
        }
        Ok(())
    }

    pub fn report(&self) -> SimulationReport {
        SimulationReport::new(
            self.elapsed,
            self.nodes.values().map(NodeSummary::of).collect(),
        )
    }
}

type NodeThread = JoinHandle<Result<Node<ChannelTransport>, NodeError>>;

struct RunningNode {
    running: Arc<AtomicBool>,
    thread: NodeThread,
}

/// One thread per node, connected through the channel fabric
pub struct ThreadedSimulation {
    started: Instant,
    faults: Arc<FaultInjector>,
    running: BTreeMap<Address, RunningNode>,
    users: BTreeMap<Address, UserPort>,
}

impl ThreadedSimulation {
    /// Wire the topology and start every node
    pub fn start(
        spec: &TopologySpec,
        settings: &SimulationSettings,
        faults: Arc<FaultInjector>,
    ) -> Result<Self, SimulationError> {
        spec.validate()?;
        let ports = spec.ports();
        let endpoints = Fabric::new(Arc::clone(&faults)).wire(&ports);
        let started = Instant::now();

        let mut nodes = Vec::new();
        let mut users = BTreeMap::new();
        for (address, endpoint) in endpoints {
            let links = ports.get(&address).map(Vec::as_slice).unwrap_or(&[]);
            let node = Node::with_start(settings.config_for(address, links), endpoint.transport, started)?;
            nodes.push(node);
            users.insert(address, endpoint.user);
        }

        let mut running = BTreeMap::new();
        for mut node in nodes {
            let address = node.address();
            let flag = node.stop_handle();
            let thread = std::thread::Builder::new()
                .name(format!("node-{}", address))
                .spawn(move || {
                    node.run()?;
                    Ok(node)
                })?;
            running.insert(address, RunningNode { running: flag, thread });
        }
        info!(nodes = running.len(), "Threaded simulation started");

        Ok(Self {
            started,
            faults,
            running,
            users,
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    pub fn user(&self, address: Address) -> Option<&UserPort> {
        self.users.get(&address)
    }

    /// Crash a node: its links go silent and its thread stops
    pub fn kill(&self, address: Address) -> bool {
        let Some(node) = self.running.get(&address) else {
            return false;
        };
        self.faults.crash(address);
        node.running.store(false, Ordering::SeqCst);
        true
    }

    /// Stop every node and collect the final states
    pub fn finish(self) -> Result<BTreeMap<Address, Node<ChannelTransport>>, SimulationError> {
        for node in self.running.values() {
            node.running.store(false, Ordering::SeqCst);
        }
        let mut nodes = BTreeMap::new();
        for (address, node) in self.running {
            match node.thread.join() {
                Ok(Ok(node)) => {
                    nodes.insert(address, node);
                }
                Ok(Err(e)) => {
                    warn!(node = %address, error = %e, "Node stopped with error");
                    return Err(e.into());
                }
                Err(_) => return Err(SimulationError::ThreadPanicked(address)),
            }
        }
        Ok(nodes)
    }

    /// Stop every node and summarise the run
    pub fn finish_report(self) -> Result<SimulationReport, SimulationError> {
        let elapsed = self.elapsed();
        let nodes = self.finish()?;
        Ok(SimulationReport::new(
            elapsed,
            nodes.values().map(NodeSummary::of).collect(),
        ))
    }
}
