// Meshwire - encrypted peer-to-peer overlay networking
//
// This crate implements the per-peer path management core of a Meshwire
// node: learning which transport paths reach a remote peer, scoring them,
// keeping NAT mappings warm, and steering traffic onto the best path.

pub mod config;
pub mod crypto;
pub mod error;
pub mod network;
pub mod protocol;

pub use config::OverlayConfig;
pub use crypto::identity::{Address, Identity, SharedSecret};
pub use error::OverlayError;
pub use network::inet::{AddressFamily, InetAddress, IpScope};
pub use network::node::{Cluster, Network, NodeContext, NodeServices, SelfAwareness, Topology};
pub use network::path::Path;
pub use network::peer::{Peer, RemoteVersion};
pub use network::registry::PeerRegistry;

// Initialize logging
pub fn init_logger() {
    env_logger::init();
}
