use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use log::debug;

use crate::config::OverlayConfig;
use crate::crypto::identity::{Address, Identity};
use crate::error::OverlayError;
use crate::network::node::NodeContext;
use crate::network::peer::Peer;

/// Bounded concurrent map of live peers keyed by overlay address
pub struct PeerRegistry {
    ctx: Arc<NodeContext>,
    peers: DashMap<Address, Arc<Peer>>,
    /// Serializes admissions so the cap check and insert are atomic
    admit: Mutex<()>,
    max_peers: usize,
    inactivity_timeout: u64,
}

impl PeerRegistry {
    pub fn new(ctx: Arc<NodeContext>, config: &OverlayConfig) -> Self {
        Self {
            ctx,
            peers: DashMap::new(),
            admit: Mutex::new(()),
            max_peers: config.max_peers,
            inactivity_timeout: config.peer_inactivity_timeout,
        }
    }

    /// Look up a peer by address
    pub fn get(&self, addr: &Address) -> Option<Arc<Peer>> {
        self.peers.get(addr).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a peer, constructing one from a freshly learned identity if
    /// needed. Fails when the registry is full or key agreement fails.
    pub fn get_or_create(&self, identity: Identity) -> Result<Arc<Peer>, OverlayError> {
        let now = self.ctx.node.now();

        if let Some(peer) = self.get(identity.address()) {
            peer.mark_used(now);
            return Ok(peer);
        }

        // Concurrent admissions would each see room below the cap; only one
        // may count it. Evictions never race this upward.
        let _admit = self.admit.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(peer) = self.get(identity.address()) {
            peer.mark_used(now);
            return Ok(peer);
        }

        if self.peers.len() >= self.max_peers {
            return Err(OverlayError::PeerLimitReached(self.max_peers));
        }

        let addr = *identity.address();
        let peer = Arc::new(Peer::new(Arc::clone(&self.ctx), identity)?);
        self.peers.insert(addr, Arc::clone(&peer));

        peer.mark_used(now);
        debug!("tracking peer {}", addr);
        Ok(peer)
    }

    /// Number of tracked peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Expire dead paths on every peer and evict peers that have gone idle
    /// with no paths left. Returns the number evicted.
    pub fn clean(&self, now: u64) -> usize {
        let mut evicted = 0usize;
        self.peers.retain(|addr, peer| {
            peer.clean(now);
            let idle = now.saturating_sub(peer.last_used()) >= self.inactivity_timeout
                && now.saturating_sub(peer.last_receive()) >= self.inactivity_timeout;
            let keep = peer.path_count() > 0 || !idle;
            if !keep {
                evicted += 1;
                debug!("evicting idle peer {}", addr);
            }
            keep
        });
        evicted
    }
}
