use std::sync::Arc;

use crate::crypto::identity::{Address, Identity};
use crate::network::inet::InetAddress;
use crate::network::peer::Peer;

/// Services the containing node provides to the peer layer
pub trait NodeServices: Send + Sync {
    /// Monotonic milliseconds since the node started
    fn now(&self) -> u64;

    /// Non-cryptographic pseudorandom source
    fn prng(&self) -> u64;

    /// Write a datagram to the wire; true if the transport accepted it
    fn put_packet(&self, local: &InetAddress, remote: &InetAddress, data: &[u8]) -> bool;

    /// Locally bound addresses remotes may reach directly
    fn direct_paths(&self) -> Vec<InetAddress>;

    /// Overlay networks this node participates in
    fn all_networks(&self) -> Vec<Arc<dyn Network>>;

    /// Policy check before a (local, remote) pair may carry overlay traffic
    fn should_use_path_for_traffic(&self, local: &InetAddress, remote: &InetAddress) -> bool;
}

/// The node's view of the signed root topology descriptor
pub trait Topology: Send + Sync {
    fn world_id(&self) -> u64;
    fn world_timestamp(&self) -> u64;
}

/// Observed-address tracking, including symmetric NAT port prediction
pub trait SelfAwareness: Send + Sync {
    /// Likely externally mapped addresses behind a symmetric NAT
    fn symmetric_nat_predictions(&self) -> Vec<InetAddress>;
}

/// Optional cluster membership: geographically distributed nodes presenting
/// one logical ingress, redirecting peers to the best member
pub trait Cluster: Send + Sync {
    /// A better cluster ingress for this remote than the path it arrived on,
    /// if one exists
    fn find_better_endpoint(
        &self,
        remote: &Address,
        current: &InetAddress,
        prefer_older: bool,
    ) -> Option<InetAddress>;

    /// Tell other cluster members this node has a direct path to the peer
    fn broadcast_have_peer(&self, identity: &Identity);
}

/// An overlay network from the peer layer's point of view
pub trait Network: Send + Sync {
    /// Re-announce this network's multicast subscriptions to the peer
    fn try_announce_multicast_groups_to(&self, peer: &Peer);
}

/// Runtime wiring shared by every peer of one node
pub struct NodeContext {
    /// This node's own identity; must carry the private key
    pub identity: Identity,

    pub node: Arc<dyn NodeServices>,

    pub topology: Arc<dyn Topology>,

    pub self_awareness: Arc<dyn SelfAwareness>,

    /// Present when this node is a cluster member
    pub cluster: Option<Arc<dyn Cluster>>,
}
