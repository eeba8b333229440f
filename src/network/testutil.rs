// Shared mock collaborators for unit tests

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::crypto::identity::{Address, Identity};
use crate::network::inet::InetAddress;
use crate::network::node::{
    Cluster, Network, NodeContext, NodeServices, SelfAwareness, Topology,
};
use crate::network::peer::Peer;

/// Node services double that records every outbound datagram
pub struct MockNode {
    pub clock: AtomicU64,
    pub sent: Mutex<Vec<(InetAddress, InetAddress, Vec<u8>)>>,
    pub direct: Mutex<Vec<InetAddress>>,
    pub networks: Mutex<Vec<Arc<dyn Network>>>,
    pub allow_traffic: AtomicBool,
    pub transport_up: AtomicBool,
    prng_state: AtomicU64,
}

impl MockNode {
    pub fn new(now: u64) -> Self {
        Self {
            clock: AtomicU64::new(now),
            sent: Mutex::new(Vec::new()),
            direct: Mutex::new(Vec::new()),
            networks: Mutex::new(Vec::new()),
            allow_traffic: AtomicBool::new(true),
            transport_up: AtomicBool::new(true),
            prng_state: AtomicU64::new(0x9e3779b97f4a7c15),
        }
    }

    pub fn set_clock(&self, now: u64) {
        self.clock.store(now, Ordering::Relaxed);
    }

    /// Snapshot of everything sent so far
    pub fn sent_packets(&self) -> Vec<(InetAddress, InetAddress, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl NodeServices for MockNode {
    fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn prng(&self) -> u64 {
        // xorshift; deterministic across runs
        let mut x = self.prng_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.prng_state.store(x, Ordering::Relaxed);
        x
    }

    fn put_packet(&self, local: &InetAddress, remote: &InetAddress, data: &[u8]) -> bool {
        if !self.transport_up.load(Ordering::Relaxed) {
            return false;
        }
        self.sent
            .lock()
            .unwrap()
            .push((*local, *remote, data.to_vec()));
        true
    }

    fn direct_paths(&self) -> Vec<InetAddress> {
        self.direct.lock().unwrap().clone()
    }

    fn all_networks(&self) -> Vec<Arc<dyn Network>> {
        self.networks.lock().unwrap().clone()
    }

    fn should_use_path_for_traffic(&self, _local: &InetAddress, _remote: &InetAddress) -> bool {
        self.allow_traffic.load(Ordering::Relaxed)
    }
}

/// Fixed world descriptor
pub struct FixedWorld;

impl Topology for FixedWorld {
    fn world_id(&self) -> u64 {
        0xfeed_f00d_cafe_0001
    }

    fn world_timestamp(&self) -> u64 {
        1_700_000_000_000
    }
}

/// Self-awareness double with canned NAT predictions
pub struct MockSelfAwareness {
    pub predictions: Mutex<Vec<InetAddress>>,
}

impl MockSelfAwareness {
    pub fn new() -> Self {
        Self {
            predictions: Mutex::new(Vec::new()),
        }
    }
}

impl SelfAwareness for MockSelfAwareness {
    fn symmetric_nat_predictions(&self) -> Vec<InetAddress> {
        self.predictions.lock().unwrap().clone()
    }
}

/// Cluster double that always redirects to one endpoint
pub struct MockCluster {
    pub redirect_to: Option<InetAddress>,
    pub have_peer: Mutex<Vec<Address>>,
}

impl Cluster for MockCluster {
    fn find_better_endpoint(
        &self,
        _remote: &Address,
        _current: &InetAddress,
        _prefer_older: bool,
    ) -> Option<InetAddress> {
        self.redirect_to
    }

    fn broadcast_have_peer(&self, identity: &Identity) {
        self.have_peer.lock().unwrap().push(*identity.address());
    }
}

/// Network double counting announce requests
pub struct AnnounceCounter {
    pub announced: AtomicU64,
}

impl AnnounceCounter {
    pub fn new() -> Self {
        Self {
            announced: AtomicU64::new(0),
        }
    }
}

impl Network for AnnounceCounter {
    fn try_announce_multicast_groups_to(&self, _peer: &Peer) {
        self.announced.fetch_add(1, Ordering::Relaxed);
    }
}

/// Build a NodeContext around a mock node, optionally clustered
pub fn test_context(node: Arc<MockNode>, cluster: Option<Arc<MockCluster>>) -> Arc<NodeContext> {
    Arc::new(NodeContext {
        identity: Identity::generate(),
        node,
        topology: Arc::new(FixedWorld),
        self_awareness: Arc::new(MockSelfAwareness::new()),
        cluster: cluster.map(|c| c as Arc<dyn Cluster>),
    })
}

/// Build a NodeContext with explicit self-awareness predictions
pub fn test_context_with_nat(
    node: Arc<MockNode>,
    self_awareness: Arc<MockSelfAwareness>,
) -> Arc<NodeContext> {
    Arc::new(NodeContext {
        identity: Identity::generate(),
        node,
        topology: Arc::new(FixedWorld),
        self_awareness,
        cluster: None,
    })
}

/// Shorthand endpoint constructor for tests
pub fn addr(s: &str) -> InetAddress {
    InetAddress::new(s.parse().unwrap())
}
