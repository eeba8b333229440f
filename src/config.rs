use serde::{Deserialize, Serialize};

/// Peer-tracking tunables for the containing node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Maximum number of peers tracked at once
    pub max_peers: usize,

    /// Evict a peer with no live paths after this much inactivity (ms)
    pub peer_inactivity_timeout: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            max_peers: 512,
            peer_inactivity_timeout: 600_000, // 10 minutes
        }
    }
}
