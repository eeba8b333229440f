use std::sync::atomic::{AtomicU64, Ordering};

use crate::network::inet::InetAddress;
use crate::network::node::NodeContext;
use crate::protocol::{NAT_KEEPALIVE_DELAY, PATH_ALIVE_WINDOW};

/// One transport channel to a remote endpoint.
///
/// A Path pairs a local socket binding with a remote address. Paths are
/// shared: several peers may hold the same Path, and a peer's path table
/// holds them behind `Arc`, so a Path outlives any one table entry.
pub struct Path {
    addr: InetAddress,
    local_address: InetAddress,
    last_send: AtomicU64,
    last_received: AtomicU64,
}

impl Path {
    pub fn new(local_address: InetAddress, addr: InetAddress) -> Self {
        Self {
            addr,
            local_address,
            last_send: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
        }
    }

    /// The remote endpoint
    pub fn address(&self) -> &InetAddress {
        &self.addr
    }

    /// The local binding this path sends from
    pub fn local_address(&self) -> &InetAddress {
        &self.local_address
    }

    /// Record an authenticated receive on this path
    pub fn mark_received(&self, now: u64) {
        self.last_received.store(now, Ordering::Relaxed);
    }

    /// Timestamp of the most recent receive
    pub fn last_received(&self) -> u64 {
        self.last_received.load(Ordering::Relaxed)
    }

    /// A path is alive if it received within the alive window
    pub fn alive(&self, now: u64) -> bool {
        now.saturating_sub(self.last_received.load(Ordering::Relaxed)) < PATH_ALIVE_WINDOW
    }

    /// True when the NAT keepalive window has elapsed since the last send
    pub fn needs_heartbeat(&self, now: u64) -> bool {
        now.saturating_sub(self.last_send.load(Ordering::Relaxed)) >= NAT_KEEPALIVE_DELAY
    }

    /// Write a datagram out this path. Stamps the send time only if the
    /// transport accepted the data.
    pub fn send(&self, ctx: &NodeContext, data: &[u8], now: u64) -> bool {
        if ctx.node.put_packet(&self.local_address, &self.addr, data) {
            self.last_send.store(now, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}
