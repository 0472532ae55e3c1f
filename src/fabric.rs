//! In-process link fabric
//!
//! Connects nodes running on separate threads with `crossbeam` channels. Each
//! node owns one inbox; every link endpoint holds a sender into the peer's
//! inbox tagged with the port the packet arrives on. Packets cross the fabric
//! as MessagePack bytes, so every hop exercises the wire codec.
//!
//! A [`FaultInjector`] shared by all endpoints can lose packets at random or
//! silence crashed nodes.

use crate::address::{Address, Port};
use crate::packet::Packet;
use crate::sim::PortLink;
use crate::transport::{Transport, TransportError};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::info;

/// Default time a receive blocks before reporting an empty inbox
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2);

type Frame = (Port, Vec<u8>);

/// Fault injection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub packets_dropped: u64,
    pub packets_blackholed: u64,
    pub nodes_crashed: u64,
}

/// Packet loss and node crashes applied to link traffic
pub struct FaultInjector {
    drop_rate: f64,
    rng: Mutex<StdRng>,
    crashed: RwLock<HashSet<Address>>,
    stats: Mutex<FaultStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FaultInjector {
    /// A fault-free injector
    pub fn new() -> Self {
        Self::with_drop_rate(0.0, 0)
    }

    /// Lose each link packet with probability `drop_rate`
    pub fn with_drop_rate(drop_rate: f64, seed: u64) -> Self {
        Self {
            drop_rate: drop_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            crashed: RwLock::new(HashSet::new()),
            stats: Mutex::new(FaultStats::default()),
        }
    }

    pub fn drop_rate(&self) -> f64 {
        self.drop_rate
    }

    /// Should the packet from `from` to `to` be lost?
    pub fn should_drop(&self, from: Address, to: Address) -> bool {
        if self.is_crashed(from) || self.is_crashed(to) {
            lock(&self.stats).packets_blackholed += 1;
            return true;
        }
        if self.drop_rate > 0.0 && lock(&self.rng).gen_bool(self.drop_rate) {
            lock(&self.stats).packets_dropped += 1;
            return true;
        }
        false
    }

    /// Silence a node: nothing it sends or is sent reaches the other side
    pub fn crash(&self, address: Address) {
        let newly = self
            .crashed
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(address);
        if newly {
            lock(&self.stats).nodes_crashed += 1;
            info!(node = %address, "Node crashed by fault injector");
        }
    }

    pub fn recover(&self, address: Address) {
        self.crashed
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&address);
    }

    pub fn is_crashed(&self, address: Address) -> bool {
        self.crashed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&address)
    }

    pub fn stats(&self) -> FaultStats {
        lock(&self.stats).clone()
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending half of one link
#[derive(Debug, Clone)]
struct LinkSender {
    peer: Address,
    peer_port: Port,
    sender: Sender<Frame>,
}

/// Channel-backed [`Transport`] of one node
pub struct ChannelTransport {
    address: Address,
    inbox: Receiver<Frame>,
    links: Vec<Option<LinkSender>>,
    user: Sender<Vec<u8>>,
    faults: Arc<FaultInjector>,
    poll_interval: Duration,
}

impl ChannelTransport {
    pub fn address(&self) -> Address {
        self.address
    }

    fn user_port(&self) -> Port {
        self.links.len() as Port
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, port: Port, packet: Packet) -> Result<(), TransportError> {
        let bytes = packet.to_msgpack()?;
        if port == self.user_port() {
            return self.user.send(bytes).map_err(|_| TransportError::Closed);
        }
        let link = self
            .links
            .get(port as usize)
            .and_then(Option::as_ref)
            .ok_or(TransportError::UnknownPort(port))?;
        if self.faults.should_drop(self.address, link.peer) {
            return Ok(());
        }
        link.sender
            .send((link.peer_port, bytes))
            .map_err(|_| TransportError::Closed)
    }

    fn receive(&mut self) -> Result<Option<(Port, Packet)>, TransportError> {
        match self.inbox.recv_timeout(self.poll_interval) {
            Ok((port, bytes)) => Ok(Some((port, Packet::from_msgpack(&bytes)?))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

/// The local user's side of a node
pub struct UserPort {
    address: Address,
    port: Port,
    to_node: Sender<Frame>,
    from_node: Receiver<Vec<u8>>,
}

impl UserPort {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Hand a packet to the node
    pub fn send(&self, packet: Packet) -> Result<(), TransportError> {
        let bytes = packet.to_msgpack()?;
        self.to_node
            .send((self.port, bytes))
            .map_err(|_| TransportError::Closed)
    }

    /// Next packet the node delivered, if one is waiting
    pub fn try_receive(&self) -> Result<Option<Packet>, TransportError> {
        match self.from_node.try_recv() {
            Ok(bytes) => Ok(Some(Packet::from_msgpack(&bytes)?)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }

    /// Wait up to `timeout` for a delivered packet
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Packet>, TransportError> {
        match self.from_node.recv_timeout(timeout) {
            Ok(bytes) => Ok(Some(Packet::from_msgpack(&bytes)?)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    /// Every packet delivered so far; undecodable ones are skipped
    pub fn drain(&self) -> Vec<Packet> {
        self.from_node
            .try_iter()
            .filter_map(|bytes| Packet::from_msgpack(&bytes).ok())
            .collect()
    }
}

/// Both ends a node needs when wired into the fabric
pub struct Endpoint {
    pub transport: ChannelTransport,
    pub user: UserPort,
}

/// Builds channel links for a whole topology
pub struct Fabric {
    faults: Arc<FaultInjector>,
    poll_interval: Duration,
}

impl Fabric {
    pub fn new(faults: Arc<FaultInjector>) -> Self {
        Self {
            faults,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    /// Create one endpoint per node of `ports`.
    ///
    /// A link whose peer is missing from `ports` is left unconnected; sending
    /// on it yields [`TransportError::UnknownPort`].
    pub fn wire(&self, ports: &BTreeMap<Address, Vec<PortLink>>) -> BTreeMap<Address, Endpoint> {
        let inboxes: BTreeMap<Address, (Sender<Frame>, Receiver<Frame>)> = ports
            .keys()
            .map(|&address| (address, channel::unbounded()))
            .collect();

        let mut endpoints = BTreeMap::new();
        for (&address, links) in ports {
            let Some((own_sender, inbox)) = inboxes.get(&address) else {
                continue;
            };
            let links = links
                .iter()
                .map(|link| {
                    inboxes.get(&link.neighbor).map(|(sender, _)| LinkSender {
                        peer: link.neighbor,
                        peer_port: link.neighbor_port,
                        sender: sender.clone(),
                    })
                })
                .collect::<Vec<_>>();
            let port = links.len() as Port;
            let (user_sender, user_receiver) = channel::unbounded();

            endpoints.insert(
                address,
                Endpoint {
                    transport: ChannelTransport {
                        address,
                        inbox: inbox.clone(),
                        links,
                        user: user_sender,
                        faults: Arc::clone(&self.faults),
                        poll_interval: self.poll_interval,
                    },
                    user: UserPort {
                        address,
                        port,
                        to_node: own_sender.clone(),
                        from_node: user_receiver,
                    },
                },
            );
        }
        endpoints
    }
}
