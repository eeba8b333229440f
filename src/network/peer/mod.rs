mod path_table;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::crypto::identity::{Address, Identity, SharedSecret};
use crate::error::OverlayError;
use crate::network::inet::{AddressFamily, InetAddress, IpScope};
use crate::network::node::NodeContext;
use crate::network::path::Path;
use crate::protocol::packet::{Packet, IDX_PAYLOAD};
use crate::protocol::{
    Verb, CLUSTER_REDIRECT_BIT, DIRECT_PATH_PUSH_INTERVAL, MAX_PATHS, MULTICAST_LIKE_EXPIRE,
    PATH_EXPIRATION, PING_PERIOD, PROTO_VERSION, PUSH_CUTOFF_LIMIT, PUSH_CUTOFF_TIME,
    PUSH_MAX_PER_SCOPE_AND_FAMILY, PUSH_PACKET_SIZE_LIMIT, VERSION_MAJOR, VERSION_MINOR,
    VERSION_REVISION,
};

use self::path_table::PathTable;

/// Varying payload for NAT keepalives; 4 bytes, never a parseable packet
static NAT_KEEPALIVE_BUF: AtomicU32 = AtomicU32::new(0);

/// Remote software version as last reported over the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersion {
    pub proto: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
}

/// Path table plus the cluster hints that share its lock
struct PathState {
    table: PathTable,
    remote_cluster_optimal_v4: Option<InetAddress>,
    remote_cluster_optimal_v6: Vec<InetAddress>,
}

/// Everything this node remembers about one remote peer.
///
/// A Peer tracks the network paths by which its remote is reachable, picks
/// the best one for outbound traffic, learns new paths from inbound traffic,
/// and keeps NAT mappings warm. One mutex serializes the path table and the
/// cluster hints; every other scalar is a relaxed atomic whose readers only
/// feed heuristics.
pub struct Peer {
    ctx: Arc<NodeContext>,
    identity: Identity,
    key: SharedSecret,

    paths: Mutex<PathState>,

    last_used: AtomicU64,
    last_receive: AtomicU64,
    last_unicast_frame: AtomicU64,
    last_multicast_frame: AtomicU64,
    last_announced_to: AtomicU64,
    last_direct_path_push_sent: AtomicU64,
    last_direct_path_push_receive: AtomicU64,

    /// proto | major | minor packed above a u16 revision
    version: AtomicU64,
    latency: AtomicU32,
    direct_path_push_cutoff_count: AtomicU32,
}

impl Peer {
    /// Bind a peer object to a remote identity. The symmetric packet key is
    /// agreed here, once; failure means the peer cannot exist.
    pub fn new(ctx: Arc<NodeContext>, identity: Identity) -> Result<Self, OverlayError> {
        let key = ctx.identity.agree(&identity)?;
        Ok(Self {
            ctx,
            identity,
            key,
            paths: Mutex::new(PathState {
                table: PathTable::new(),
                remote_cluster_optimal_v4: None,
                remote_cluster_optimal_v6: Vec::new(),
            }),
            last_used: AtomicU64::new(0),
            last_receive: AtomicU64::new(0),
            last_unicast_frame: AtomicU64::new(0),
            last_multicast_frame: AtomicU64::new(0),
            last_announced_to: AtomicU64::new(0),
            last_direct_path_push_sent: AtomicU64::new(0),
            last_direct_path_push_receive: AtomicU64::new(0),
            version: AtomicU64::new(0),
            latency: AtomicU32::new(0),
            direct_path_push_cutoff_count: AtomicU32::new(0),
        })
    }

    /// The remote identity this peer is bound to
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The remote's overlay address
    pub fn address(&self) -> &Address {
        self.identity.address()
    }

    fn lock_paths(&self) -> MutexGuard<'_, PathState> {
        // A panic elsewhere must not wedge the receive path
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process an authenticated packet that arrived from this peer.
    ///
    /// Learns or refreshes the receiving path, emits cluster redirects and
    /// confirmation probes as needed, and triggers periodic multicast
    /// re-announcement. Never fails; transport errors are swallowed and the
    /// scorer eventually demotes dead paths.
    pub fn received(
        &self,
        path: &Arc<Path>,
        hops: u32,
        packet_id: u64,
        verb: Verb,
        in_re_packet_id: u64,
        in_re_verb: Verb,
        trust_established: bool,
    ) {
        let now = self.ctx.node.now();

        trace!(
            "received {} (id {:016x}, {} hops, in re {} {:016x}) from {} via {}",
            verb.name(),
            packet_id,
            hops,
            in_re_verb.name(),
            in_re_packet_id,
            self.identity.address(),
            path.address()
        );

        let mut suboptimal_path = false;
        if hops == 0 {
            if let Some(cluster) = self.ctx.cluster.as_ref() {
                // Redirect-class verbs never themselves trigger a redirect
                let redirectable = !matches!(
                    verb,
                    Verb::Ok | Verb::Error | Verb::Rendezvous | Verb::PushDirectPaths
                );
                if redirectable {
                    if let Some(redirect_to) =
                        cluster.find_better_endpoint(self.identity.address(), path.address(), false)
                    {
                        if self.remote_version().proto >= 5 {
                            self.send_cluster_redirect_push(path, &redirect_to, now);
                        } else {
                            // Older peers only understand RENDEZVOUS
                            self.send_cluster_redirect_rendezvous(path, &redirect_to, now);
                        }
                        suboptimal_path = true;
                    }
                }
            }
        }

        self.last_receive.store(now, Ordering::Relaxed);
        match verb {
            Verb::Frame | Verb::ExtFrame => self.last_unicast_frame.store(now, Ordering::Relaxed),
            Verb::MulticastFrame => self.last_multicast_frame.store(now, Ordering::Relaxed),
            _ => {}
        }
        path.mark_received(now);

        if hops == 0 {
            let mut state = self.lock_paths();
            if let Some(idx) = state.table.find_by_address(path.address()) {
                let slot = state.table.slot_mut(idx);
                slot.last_receive = now;
                slot.path = Some(Arc::clone(path)); // local binding may have changed
                slot.cluster_suboptimal = suboptimal_path;
            } else if self
                .ctx
                .node
                .should_use_path_for_traffic(path.local_address(), path.address())
            {
                if verb == Verb::Ok {
                    // OK proves the remote answered our probe on this path
                    let slot = state.table.insert(Arc::clone(path), now, suboptimal_path);
                    debug!(
                        "learned path to {} via {} (slot {})",
                        self.identity.address(),
                        path.address(),
                        slot
                    );
                    if let Some(cluster) = self.ctx.cluster.as_ref() {
                        cluster.broadcast_have_peer(&self.identity);
                    }
                } else {
                    trace!(
                        "got {} via unknown path {} to {}, confirming",
                        verb.name(),
                        path.address(),
                        self.identity.address()
                    );
                    let version = self.remote_version();
                    let modern = version.proto >= 5
                        && !(version.major == 1 && version.minor == 1 && version.revision == 0);
                    if modern {
                        let mut outp = Packet::new(
                            self.ctx.node.prng(),
                            self.identity.address(),
                            self.ctx.identity.address(),
                            Verb::Echo,
                        );
                        outp.armor(&self.key, true);
                        path.send(&self.ctx, outp.data(), now);
                    } else {
                        // Ancient nodes answer HELLO but not ECHO
                        self.send_hello(path.local_address(), path.address(), now);
                    }
                }
            }
        } else if trust_established {
            self.push_direct_paths(path, now);
        }

        if now.saturating_sub(self.last_announced_to.load(Ordering::Relaxed))
            >= (MULTICAST_LIKE_EXPIRE / 2) - 1_000
        {
            self.last_announced_to.store(now, Ordering::Relaxed);
            for network in self.ctx.node.all_networks() {
                network.try_announce_multicast_groups_to(self);
            }
        }
    }

    /// Send via the best available path. With all paths dead nothing is sent
    /// unless `force_even_if_dead` is set.
    pub fn send_direct(&self, data: &[u8], now: u64, force_even_if_dead: bool) -> bool {
        let state = self.lock_paths();
        let best = state.table.best_where(now, |slot| {
            force_even_if_dead || slot.path.as_ref().map_or(false, |p| p.alive(now))
        });
        match best {
            Some(idx) => state
                .table
                .slot(idx)
                .path
                .as_ref()
                .map_or(false, |path| path.send(&self.ctx, data, now)),
            None => false,
        }
    }

    /// The highest-scoring path, dead or alive
    pub fn best_path(&self, now: u64) -> Option<Arc<Path>> {
        let state = self.lock_paths();
        state
            .table
            .best_where(now, |_| true)
            .and_then(|idx| state.table.slot(idx).path.clone())
    }

    /// Send a HELLO to an arbitrary endpoint via the node's raw transport.
    ///
    /// HELLO bypasses path selection because it may target an address no
    /// confirmed path covers yet. It is MAC-armored but stays readable: the
    /// remote must be able to parse it before any key agreement.
    pub fn send_hello(&self, local_addr: &InetAddress, at_address: &InetAddress, now: u64) {
        let mut outp = Packet::new(
            self.ctx.node.prng(),
            self.identity.address(),
            self.ctx.identity.address(),
            Verb::Hello,
        );
        outp.append_u8(PROTO_VERSION);
        outp.append_u8(VERSION_MAJOR);
        outp.append_u8(VERSION_MINOR);
        outp.append_u16(VERSION_REVISION);
        outp.append_u64(now);

        let mut identity = Vec::new();
        self.ctx.identity.serialize(&mut identity, false);
        outp.append_bytes(&identity);

        let mut dest = Vec::new();
        at_address.serialize(&mut dest);
        outp.append_bytes(&dest);

        outp.append_u64(self.ctx.topology.world_id());
        outp.append_u64(self.ctx.topology.world_timestamp());

        outp.armor(&self.key, false);
        self.ctx.node.put_packet(local_addr, at_address, outp.data());
    }

    /// Ping or heartbeat the best path, optionally restricted to one address
    /// family. Returns whether any path matched the family at all.
    pub fn do_ping_and_keepalive(&self, now: u64, family: Option<AddressFamily>) -> bool {
        let state = self.lock_paths();
        let best = state.table.best_where(now, |slot| match family {
            Some(f) => slot.path.as_ref().map_or(false, |p| p.address().family() == f),
            None => true,
        });
        let idx = match best {
            Some(idx) => idx,
            None => return false,
        };

        let slot = state.table.slot(idx);
        if let Some(path) = slot.path.as_ref() {
            if now.saturating_sub(slot.last_receive) >= PING_PERIOD {
                self.send_hello(path.local_address(), path.address(), now);
            } else if path.needs_heartbeat(now) {
                // Tumble the payload so consecutive keepalives never repeat
                let step = (now.wrapping_mul(0x9e37_79b1) >> 1) as u32;
                let value = NAT_KEEPALIVE_BUF
                    .fetch_add(step, Ordering::Relaxed)
                    .wrapping_add(step);
                trace!(
                    "sending NAT keepalive to {} via {}",
                    self.identity.address(),
                    path.address()
                );
                path.send(&self.ctx, &value.to_be_bytes(), now);
            }
        }
        true
    }

    /// True iff a live entry with this exact remote address is alive
    pub fn has_active_path_to(&self, now: u64, addr: &InetAddress) -> bool {
        let state = self.lock_paths();
        let result = state.table.iter().any(|(_, slot)| {
            slot.path
                .as_ref()
                .map_or(false, |p| p.address() == addr && p.alive(now))
        });
        result
    }

    /// True iff any path to this peer is alive
    pub fn has_active_direct_path(&self, now: u64) -> bool {
        let state = self.lock_paths();
        let result = state
            .table
            .iter()
            .any(|(_, slot)| slot.path.as_ref().map_or(false, |p| p.alive(now)));
        result
    }

    /// The best-scoring remote address per family
    pub fn best_active_addresses(&self, now: u64) -> (Option<InetAddress>, Option<InetAddress>) {
        let state = self.lock_paths();
        let pick = |family: AddressFamily| {
            state
                .table
                .best_where(now, |slot| {
                    slot.path
                        .as_ref()
                        .map_or(false, |p| p.address().family() == family)
                })
                .and_then(|idx| state.table.slot(idx).path.as_ref().map(|p| *p.address()))
        };
        (pick(AddressFamily::Ipv4), pick(AddressFamily::Ipv6))
    }

    /// Advertise this node's reachable addresses to the remote so it can
    /// attempt a direct connection. No-op under clustering, where redirection
    /// supersedes it, and rate-limited otherwise.
    pub fn push_direct_paths(&self, path: &Arc<Path>, now: u64) -> bool {
        if self.ctx.cluster.is_some() {
            return false;
        }

        if now.saturating_sub(self.last_direct_path_push_sent.load(Ordering::Relaxed))
            < DIRECT_PATH_PUSH_INTERVAL
        {
            return false;
        }
        self.last_direct_path_push_sent.store(now, Ordering::Relaxed);

        let mut to_push = self.ctx.node.direct_paths();

        // Sample NAT predictions with replacement, bounded and deduplicated
        let predictions = self.ctx.self_awareness.symmetric_nat_predictions();
        if !predictions.is_empty() {
            let mut added = 0usize;
            for _ in 0..predictions.len() {
                let pick = predictions[(self.ctx.node.prng() % predictions.len() as u64) as usize];
                if !to_push.contains(&pick) {
                    to_push.push(pick);
                    added += 1;
                    if added >= PUSH_MAX_PER_SCOPE_AND_FAMILY {
                        break;
                    }
                }
            }
        }
        if to_push.is_empty() {
            return false;
        }

        debug!(
            "pushing {} direct paths to {}",
            to_push.len(),
            self.identity.address()
        );

        let mut queue = to_push.iter().peekable();
        while queue.peek().is_some() {
            let mut outp = Packet::new(
                self.ctx.node.prng(),
                self.identity.address(),
                self.ctx.identity.address(),
                Verb::PushDirectPaths,
            );
            outp.append_u16(0); // record count, back-patched below

            let mut count: u16 = 0;
            while let Some(addr) = queue.peek() {
                if outp.len() + 24 >= PUSH_PACKET_SIZE_LIMIT {
                    break;
                }
                outp.append_u8(0); // no flags
                outp.append_u16(0); // no extensions
                match addr.family() {
                    AddressFamily::Ipv4 => {
                        outp.append_u8(4);
                        outp.append_u8(6);
                    }
                    AddressFamily::Ipv6 => {
                        outp.append_u8(6);
                        outp.append_u8(18);
                    }
                }
                outp.append_bytes(&addr.raw_ip());
                outp.append_u16(addr.port());

                count += 1;
                queue.next();
            }

            if count > 0 {
                outp.set_u16_at(IDX_PAYLOAD, count);
                outp.armor(&self.key, true);
                path.send(&self.ctx, outp.data(), now);
            }
        }

        true
    }

    /// Drop paths that have expired
    pub fn clean(&self, now: u64) {
        let mut state = self.lock_paths();
        state
            .table
            .retain(|slot| now.saturating_sub(slot.last_receive) <= PATH_EXPIRATION);
    }

    /// Forget every path whose remote address falls in the given scope,
    /// sending each a HELLO first so it can be re-learned if still valid.
    /// Returns whether anything was dropped.
    pub fn reset_within_scope(&self, scope: IpScope, now: u64) -> bool {
        let mut state = self.lock_paths();
        let before = state.table.len();
        state.table.retain(|slot| match slot.path.as_ref() {
            Some(path) if path.address().scope() == scope => {
                self.send_hello(path.local_address(), path.address(), now);
                false
            }
            _ => true,
        });
        state.table.len() < before
    }

    /// Number of live path entries
    pub fn path_count(&self) -> usize {
        self.lock_paths().table.len()
    }

    /// Record that traffic logic selected this peer
    pub fn mark_used(&self, now: u64) {
        self.last_used.store(now, Ordering::Relaxed);
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    pub fn last_receive(&self) -> u64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    pub fn last_unicast_frame(&self) -> u64 {
        self.last_unicast_frame.load(Ordering::Relaxed)
    }

    pub fn last_multicast_frame(&self) -> u64 {
        self.last_multicast_frame.load(Ordering::Relaxed)
    }

    /// Informational one-way latency estimate in milliseconds
    pub fn latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    /// Fold a new latency measurement into the estimate, weighted 3:1
    /// toward history
    pub fn record_latency(&self, measurement: u32) {
        let measurement = measurement.min(u16::MAX as u32);
        let current = self.latency.load(Ordering::Relaxed);
        let next = if current == 0 {
            measurement
        } else {
            (measurement + current * 3) / 4
        };
        self.latency.store(next, Ordering::Relaxed);
    }

    /// The remote's version as last reported by HELLO or OK(HELLO)
    pub fn remote_version(&self) -> RemoteVersion {
        let packed = self.version.load(Ordering::Relaxed);
        RemoteVersion {
            proto: (packed >> 32) as u8,
            major: (packed >> 24) as u8,
            minor: (packed >> 16) as u8,
            revision: packed as u16,
        }
    }

    /// Record the remote's version; called by the HELLO/OK dispatch
    pub fn set_remote_version(&self, proto: u8, major: u8, minor: u8, revision: u16) {
        let packed = ((proto as u64) << 32)
            | ((major as u64) << 24)
            | ((minor as u64) << 16)
            | (revision as u64);
        self.version.store(packed, Ordering::Relaxed);
    }

    /// Admission gate for inbound PUSH_DIRECT_PATHS: a bounded burst per
    /// window, then refusal until the window rolls over
    pub fn rate_gate_inbound_push(&self, now: u64) -> bool {
        if now.saturating_sub(self.last_direct_path_push_receive.load(Ordering::Relaxed))
            >= PUSH_CUTOFF_TIME
        {
            self.last_direct_path_push_receive.store(now, Ordering::Relaxed);
            self.direct_path_push_cutoff_count.store(0, Ordering::Relaxed);
            true
        } else {
            self.direct_path_push_cutoff_count.fetch_add(1, Ordering::Relaxed) < PUSH_CUTOFF_LIMIT
        }
    }

    /// Record the ingress the remote's cluster called optimal for us
    pub fn set_cluster_optimal(&self, addr: InetAddress) {
        let mut state = self.lock_paths();
        match addr.family() {
            AddressFamily::Ipv4 => state.remote_cluster_optimal_v4 = Some(addr),
            AddressFamily::Ipv6 => {
                if !state.remote_cluster_optimal_v6.contains(&addr) {
                    if state.remote_cluster_optimal_v6.len() >= MAX_PATHS {
                        state.remote_cluster_optimal_v6.remove(0);
                    }
                    state.remote_cluster_optimal_v6.push(addr);
                }
            }
        }
    }

    /// Whether the remote's cluster has called this address optimal
    pub fn is_remote_cluster_optimal(&self, addr: &InetAddress) -> bool {
        let state = self.lock_paths();
        match addr.family() {
            AddressFamily::Ipv4 => state.remote_cluster_optimal_v4.as_ref() == Some(addr),
            AddressFamily::Ipv6 => state.remote_cluster_optimal_v6.contains(addr),
        }
    }

    fn send_cluster_redirect_push(&self, path: &Arc<Path>, redirect_to: &InetAddress, now: u64) {
        let mut outp = Packet::new(
            self.ctx.node.prng(),
            self.identity.address(),
            self.ctx.identity.address(),
            Verb::PushDirectPaths,
        );
        outp.append_u16(1); // count
        outp.append_u8(CLUSTER_REDIRECT_BIT);
        outp.append_u16(0); // no extensions
        match redirect_to.family() {
            AddressFamily::Ipv4 => {
                outp.append_u8(4);
                outp.append_u8(6);
            }
            AddressFamily::Ipv6 => {
                outp.append_u8(6);
                outp.append_u8(18);
            }
        }
        outp.append_bytes(&redirect_to.raw_ip());
        outp.append_u16(redirect_to.port());
        outp.armor(&self.key, true);
        path.send(&self.ctx, outp.data(), now);
    }

    fn send_cluster_redirect_rendezvous(
        &self,
        path: &Arc<Path>,
        redirect_to: &InetAddress,
        now: u64,
    ) {
        let mut outp = Packet::new(
            self.ctx.node.prng(),
            self.identity.address(),
            self.ctx.identity.address(),
            Verb::Rendezvous,
        );
        outp.append_u8(0); // no flags
        outp.append_bytes(self.ctx.identity.address().as_bytes());
        outp.append_u16(redirect_to.port());
        let ip = redirect_to.raw_ip();
        outp.append_u8(ip.len() as u8);
        outp.append_bytes(&ip);
        outp.armor(&self.key, true);
        path.send(&self.ctx, outp.data(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::thread;

    use crate::network::testutil::{
        addr, test_context, test_context_with_nat, AnnounceCounter, MockCluster, MockNode,
        MockSelfAwareness,
    };
    use crate::protocol::{ADDRESS_LENGTH, NAT_KEEPALIVE_DELAY, PATH_ALIVE_WINDOW};

    // Well past every protocol window, so zero-stamped timestamps read stale
    const T0: u64 = 10_000_000;

    fn new_peer(ctx: &Arc<NodeContext>) -> (Arc<Peer>, Identity) {
        let remote = Identity::generate();
        let peer = Peer::new(Arc::clone(ctx), remote.clone()).unwrap();
        (Arc::new(peer), remote)
    }

    fn path_to(remote: &str) -> Arc<Path> {
        Arc::new(Path::new(addr("0.0.0.0:9993"), addr(remote)))
    }

    fn decode(ctx: &Arc<NodeContext>, remote: &Identity, bytes: &[u8]) -> Packet {
        let key = remote.agree(&ctx.identity).unwrap();
        let mut packet = Packet::from_bytes(bytes).unwrap();
        packet.dearmor(&key).unwrap();
        packet
    }

    /// Decode the records of one PUSH_DIRECT_PATHS payload
    fn parse_push_records(payload: &[u8]) -> (u16, Vec<(u8, SocketAddr)>) {
        let count = u16::from_be_bytes([payload[0], payload[1]]);
        let mut records = Vec::new();
        let mut at = 2;
        while at < payload.len() {
            let flags = payload[at];
            let ext_len = u16::from_be_bytes([payload[at + 1], payload[at + 2]]);
            assert_eq!(ext_len, 0);
            let addr_type = payload[at + 3];
            let addr_len = payload[at + 4] as usize;
            at += 5;
            let socket = match addr_type {
                4 => {
                    assert_eq!(addr_len, 6);
                    let ip: [u8; 4] = payload[at..at + 4].try_into().unwrap();
                    let port = u16::from_be_bytes([payload[at + 4], payload[at + 5]]);
                    SocketAddr::from((ip, port))
                }
                6 => {
                    assert_eq!(addr_len, 18);
                    let ip: [u8; 16] = payload[at..at + 16].try_into().unwrap();
                    let port = u16::from_be_bytes([payload[at + 16], payload[at + 17]]);
                    SocketAddr::from((ip, port))
                }
                other => panic!("unknown address type {}", other),
            };
            at += addr_len;
            records.push((flags, socket));
        }
        (count, records)
    }

    #[test]
    fn test_unknown_path_probes_with_hello_for_legacy_peers() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, remote) = new_peer(&ctx);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Frame, 0, Verb::Nop, false);

        // Not inserted until the remote answers our probe
        assert_eq!(peer.path_count(), 0);
        assert!(!peer.has_active_path_to(T0, path.address()));

        let sent = node.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, *path.address());

        // The probe for a version-unknown peer is a cleartext-readable HELLO
        let probe = Packet::from_bytes(&sent[0].2).unwrap();
        assert_eq!(probe.verb(), Some(Verb::Hello));
        decode(&ctx, &remote, &sent[0].2);
    }

    #[test]
    fn test_unknown_path_probes_with_echo_for_modern_peers() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, remote) = new_peer(&ctx);
        peer.set_remote_version(8, 1, 2, 0);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Frame, 0, Verb::Nop, false);

        let sent = node.sent_packets();
        assert_eq!(sent.len(), 1);
        let probe = decode(&ctx, &remote, &sent[0].2);
        assert_eq!(probe.verb(), Some(Verb::Echo));
        assert!(probe.payload().is_empty());
    }

    #[test]
    fn test_product_version_1_1_0_still_gets_hello() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);
        peer.set_remote_version(8, 1, 1, 0);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Frame, 0, Verb::Nop, false);

        let sent = node.sent_packets();
        assert_eq!(sent.len(), 1);
        let probe = Packet::from_bytes(&sent[0].2).unwrap();
        assert_eq!(probe.verb(), Some(Verb::Hello));
    }

    #[test]
    fn test_ok_confirms_and_inserts_path() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 2, Verb::Ok, 1, Verb::Echo, false);

        assert_eq!(peer.path_count(), 1);
        assert!(peer.has_active_path_to(T0, path.address()));
        assert!(peer.has_active_direct_path(T0));
        assert!(node.sent_packets().is_empty());
    }

    #[test]
    fn test_full_confirmation_flow() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);
        let path = path_to("10.1.2.3:9993");

        // First contact on an unknown path: probe, no insert
        peer.received(&path, 0, 1, Verb::Echo, 0, Verb::Nop, false);
        assert_eq!(peer.path_count(), 0);
        assert_eq!(node.sent_packets().len(), 1);

        // The probe reply confirms the path
        peer.received(&path, 0, 2, Verb::Ok, 1, Verb::Echo, false);
        assert_eq!(peer.path_count(), 1);
        assert!(peer.has_active_path_to(T0, path.address()));
    }

    #[test]
    fn test_disallowed_path_never_inserted_or_probed() {
        let node = Arc::new(MockNode::new(T0));
        node.allow_traffic.store(false, std::sync::atomic::Ordering::Relaxed);
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Ok, 0, Verb::Nop, false);
        peer.received(&path, 0, 2, Verb::Frame, 0, Verb::Nop, false);

        assert_eq!(peer.path_count(), 0);
        assert!(node.sent_packets().is_empty());
    }

    #[test]
    fn test_known_path_is_refreshed_not_duplicated() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        let path = path_to("10.1.2.3:9993");
        peer.received(&path, 0, 1, Verb::Ok, 0, Verb::Nop, false);
        assert_eq!(peer.path_count(), 1);

        // Same remote address, new local binding: the slot's handle swaps
        node.set_clock(T0 + 5_000);
        let rebound = Arc::new(Path::new(addr("192.168.0.5:9993"), addr("10.1.2.3:9993")));
        peer.received(&rebound, 0, 2, Verb::Frame, 0, Verb::Nop, false);

        assert_eq!(peer.path_count(), 1);
        let best = peer.best_path(T0 + 5_000).unwrap();
        assert_eq!(best.local_address(), rebound.local_address());
    }

    #[test]
    fn test_best_path_prefers_freshest() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        let path_a = path_to("10.1.2.3:9993");
        peer.received(&path_a, 0, 1, Verb::Ok, 0, Verb::Nop, false);

        node.set_clock(T0 + 1_000);
        let path_b = path_to("10.9.9.9:9993");
        peer.received(&path_b, 0, 2, Verb::Ok, 0, Verb::Nop, false);

        let best = peer.best_path(T0 + 1_000).unwrap();
        assert_eq!(best.address(), path_b.address());
    }

    #[test]
    fn test_clean_expires_silent_paths() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        peer.received(&path_to("10.1.2.3:9993"), 0, 1, Verb::Ok, 0, Verb::Nop, false);
        peer.received(&path_to("10.1.2.4:9993"), 0, 2, Verb::Ok, 0, Verb::Nop, false);
        assert_eq!(peer.path_count(), 2);

        // Inside the expiration window nothing is dropped
        peer.clean(T0 + PATH_EXPIRATION);
        assert_eq!(peer.path_count(), 2);

        peer.clean(T0 + PATH_EXPIRATION + 1);
        assert_eq!(peer.path_count(), 0);
    }

    #[test]
    fn test_reset_within_scope_hellos_and_drops() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        let link_local = path_to("169.254.1.1:9993");
        let global = path_to("8.8.8.8:9993");
        peer.received(&link_local, 0, 1, Verb::Ok, 0, Verb::Nop, false);
        peer.received(&global, 0, 2, Verb::Ok, 0, Verb::Nop, false);
        node.clear_sent();

        assert!(peer.reset_within_scope(IpScope::LinkLocal, T0));

        // The dropped path got a parting HELLO so it can be re-learned
        let sent = node.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, *link_local.address());
        let hello = Packet::from_bytes(&sent[0].2).unwrap();
        assert_eq!(hello.verb(), Some(Verb::Hello));

        assert_eq!(peer.path_count(), 1);
        assert!(peer.has_active_path_to(T0, global.address()));
        assert!(!peer.has_active_path_to(T0, link_local.address()));

        // Nothing left in that scope
        assert!(!peer.reset_within_scope(IpScope::LinkLocal, T0));
    }

    #[test]
    fn test_send_direct_refuses_dead_paths() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        let path = path_to("10.1.2.3:9993");
        peer.received(&path, 0, 1, Verb::Ok, 0, Verb::Nop, false);
        node.clear_sent();

        let later = T0 + PATH_ALIVE_WINDOW + 1;
        assert!(!peer.send_direct(b"frame", later, false));
        assert!(node.sent_packets().is_empty());

        // Forcing transmits anyway
        assert!(peer.send_direct(b"frame", later, true));
        assert_eq!(node.sent_packets().len(), 1);
    }

    #[test]
    fn test_send_direct_empty_table() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        assert!(!peer.send_direct(b"frame", T0, true));
        assert!(peer.best_path(T0).is_none());
    }

    #[test]
    fn test_push_direct_paths_rate_limit() {
        let node = Arc::new(MockNode::new(T0));
        node.direct.lock().unwrap().push(addr("203.0.113.7:9993"));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);
        let relay = path_to("198.51.100.1:9993");

        assert!(peer.push_direct_paths(&relay, T0));
        assert_eq!(node.sent_packets().len(), 1);

        // A second push inside the interval is suppressed entirely
        node.clear_sent();
        assert!(!peer.push_direct_paths(&relay, T0 + 1));
        assert!(node.sent_packets().is_empty());

        assert!(peer.push_direct_paths(&relay, T0 + DIRECT_PATH_PUSH_INTERVAL));
        assert_eq!(node.sent_packets().len(), 1);
    }

    #[test]
    fn test_relayed_trusted_traffic_triggers_push() {
        let node = Arc::new(MockNode::new(T0));
        node.direct.lock().unwrap().push(addr("203.0.113.7:9993"));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, remote) = new_peer(&ctx);
        let relay = path_to("198.51.100.1:9993");

        // Untrusted relayed traffic must not leak our addresses
        peer.received(&relay, 2, 1, Verb::Frame, 0, Verb::Nop, false);
        assert!(node.sent_packets().is_empty());

        peer.received(&relay, 2, 2, Verb::Frame, 0, Verb::Nop, true);
        let sent = node.sent_packets();
        assert_eq!(sent.len(), 1);

        let push = decode(&ctx, &remote, &sent[0].2);
        assert_eq!(push.verb(), Some(Verb::PushDirectPaths));
        let (count, records) = parse_push_records(push.payload());
        assert_eq!(count, 1);
        assert_eq!(records[0].1, addr("203.0.113.7:9993").socket_addr());
    }

    #[test]
    fn test_push_splits_and_backpatches_counts() {
        let node = Arc::new(MockNode::new(T0));
        {
            let mut direct = node.direct.lock().unwrap();
            for i in 0..120u16 {
                direct.push(addr(&format!("203.0.113.7:{}", 10_000 + i)));
            }
        }
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, remote) = new_peer(&ctx);
        let relay = path_to("198.51.100.1:9993");

        assert!(peer.push_direct_paths(&relay, T0));

        let sent = node.sent_packets();
        assert!(sent.len() >= 2, "expected a split, got {} packet(s)", sent.len());

        let mut seen: Vec<SocketAddr> = Vec::new();
        for (_, _, bytes) in &sent {
            assert!(bytes.len() <= PUSH_PACKET_SIZE_LIMIT);
            let push = decode(&ctx, &remote, bytes);
            assert_eq!(push.verb(), Some(Verb::PushDirectPaths));
            let (count, records) = parse_push_records(push.payload());
            // The count prefix covers exactly the records that fit
            assert_eq!(count as usize, records.len());
            assert!(count > 0);
            for (flags, socket) in records {
                assert_eq!(flags, 0);
                seen.push(socket);
            }
        }

        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 120);
    }

    #[test]
    fn test_push_samples_nat_predictions_bounded() {
        let node = Arc::new(MockNode::new(T0));
        let self_awareness = Arc::new(MockSelfAwareness::new());
        {
            let mut predictions = self_awareness.predictions.lock().unwrap();
            for i in 0..30u16 {
                predictions.push(addr(&format!("198.51.100.20:{}", 20_000 + i)));
            }
        }
        let ctx = test_context_with_nat(Arc::clone(&node), self_awareness);
        let (peer, remote) = new_peer(&ctx);
        let relay = path_to("198.51.100.1:9993");

        assert!(peer.push_direct_paths(&relay, T0));

        let sent = node.sent_packets();
        assert_eq!(sent.len(), 1);
        let push = decode(&ctx, &remote, &sent[0].2);
        let (count, records) = parse_push_records(push.payload());

        assert!(count as usize <= PUSH_MAX_PER_SCOPE_AND_FAMILY);
        assert!(count > 0);
        for (_, socket) in &records {
            assert_eq!(socket.ip().to_string(), "198.51.100.20");
        }

        // Sampling never repeats an address within one push
        let mut sockets: Vec<_> = records.iter().map(|(_, s)| *s).collect();
        sockets.sort();
        sockets.dedup();
        assert_eq!(sockets.len(), records.len());
    }

    #[test]
    fn test_push_disabled_under_clustering() {
        let node = Arc::new(MockNode::new(T0));
        node.direct.lock().unwrap().push(addr("203.0.113.7:9993"));
        let cluster = Arc::new(MockCluster {
            redirect_to: None,
            have_peer: Mutex::new(Vec::new()),
        });
        let ctx = test_context(Arc::clone(&node), Some(cluster));
        let (peer, _) = new_peer(&ctx);
        let relay = path_to("198.51.100.1:9993");

        assert!(!peer.push_direct_paths(&relay, T0));
        assert!(node.sent_packets().is_empty());
    }

    #[test]
    fn test_cluster_redirect_modern_uses_push() {
        let node = Arc::new(MockNode::new(T0));
        let cluster = Arc::new(MockCluster {
            redirect_to: Some(addr("192.0.2.44:9993")),
            have_peer: Mutex::new(Vec::new()),
        });
        let ctx = test_context(Arc::clone(&node), Some(Arc::clone(&cluster)));
        let (peer, remote) = new_peer(&ctx);
        peer.set_remote_version(8, 1, 2, 3);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Frame, 0, Verb::Nop, false);

        // One redirect plus the usual unknown-path probe
        let sent = node.sent_packets();
        let mut redirects = 0;
        for (_, _, bytes) in &sent {
            let packet = decode(&ctx, &remote, bytes);
            if packet.verb() == Some(Verb::PushDirectPaths) {
                let (count, records) = parse_push_records(packet.payload());
                assert_eq!(count, 1);
                assert_eq!(records[0].0, CLUSTER_REDIRECT_BIT);
                assert_eq!(records[0].1, addr("192.0.2.44:9993").socket_addr());
                redirects += 1;
            }
        }
        assert_eq!(redirects, 1);
    }

    #[test]
    fn test_cluster_redirect_legacy_uses_rendezvous() {
        let node = Arc::new(MockNode::new(T0));
        let cluster = Arc::new(MockCluster {
            redirect_to: Some(addr("192.0.2.44:9993")),
            have_peer: Mutex::new(Vec::new()),
        });
        let ctx = test_context(Arc::clone(&node), Some(cluster));
        let (peer, remote) = new_peer(&ctx);
        peer.set_remote_version(4, 0, 9, 0);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Frame, 0, Verb::Nop, false);

        let sent = node.sent_packets();
        let mut rendezvous = 0;
        for (_, _, bytes) in &sent {
            let packet = decode(&ctx, &remote, bytes);
            if packet.verb() == Some(Verb::Rendezvous) {
                let payload = packet.payload();
                assert_eq!(payload[0], 0); // no flags
                assert_eq!(
                    &payload[1..1 + ADDRESS_LENGTH],
                    ctx.identity.address().as_bytes()
                );
                let port = u16::from_be_bytes([payload[6], payload[7]]);
                assert_eq!(port, 9993);
                assert_eq!(payload[8], 4);
                assert_eq!(&payload[9..13], &[192, 0, 2, 44]);
                rendezvous += 1;
            }
        }
        assert_eq!(rendezvous, 1);
    }

    #[test]
    fn test_confirmed_path_broadcasts_have_peer() {
        let node = Arc::new(MockNode::new(T0));
        let cluster = Arc::new(MockCluster {
            redirect_to: None,
            have_peer: Mutex::new(Vec::new()),
        });
        let ctx = test_context(Arc::clone(&node), Some(Arc::clone(&cluster)));
        let (peer, remote) = new_peer(&ctx);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Ok, 0, Verb::Echo, false);

        assert_eq!(peer.path_count(), 1);
        let have_peer = cluster.have_peer.lock().unwrap();
        assert_eq!(have_peer.as_slice(), &[*remote.address()]);
    }

    #[test]
    fn test_multicast_announce_cadence() {
        let node = Arc::new(MockNode::new(T0));
        let network = Arc::new(AnnounceCounter::new());
        node.networks
            .lock()
            .unwrap()
            .push(Arc::clone(&network) as Arc<dyn crate::network::node::Network>);
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Ok, 0, Verb::Nop, false);
        assert_eq!(network.announced.load(Ordering::Relaxed), 1);

        // Within the half-expiry window nothing new is announced
        node.set_clock(T0 + 10_000);
        peer.received(&path, 0, 2, Verb::Frame, 0, Verb::Nop, false);
        assert_eq!(network.announced.load(Ordering::Relaxed), 1);

        node.set_clock(T0 + (MULTICAST_LIKE_EXPIRE / 2) - 1_000);
        peer.received(&path, 0, 3, Verb::Frame, 0, Verb::Nop, false);
        assert_eq!(network.announced.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_ping_sends_hello_when_path_silent() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Ok, 0, Verb::Nop, false);
        node.clear_sent();

        assert!(peer.do_ping_and_keepalive(T0 + PING_PERIOD, None));

        let sent = node.sent_packets();
        assert_eq!(sent.len(), 1);
        let hello = Packet::from_bytes(&sent[0].2).unwrap();
        assert_eq!(hello.verb(), Some(Verb::Hello));
    }

    #[test]
    fn test_keepalive_sends_small_opaque_datagram() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Ok, 0, Verb::Nop, false);
        node.clear_sent();

        // Heard from recently, but nothing sent: NAT mapping needs refreshing
        assert!(peer.do_ping_and_keepalive(T0 + 1_000, None));

        let sent = node.sent_packets();
        assert_eq!(sent.len(), 1);
        // 4 bytes, below the minimum packet size, so never parseable
        assert_eq!(sent[0].2.len(), 4);

        // The next keepalive payload differs from the last
        node.clear_sent();
        assert!(peer.do_ping_and_keepalive(T0 + 2_000 + NAT_KEEPALIVE_DELAY, None));
        let again = node.sent_packets();
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].2, sent[0].2);
    }

    #[test]
    fn test_ping_honors_family_filter() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);
        let path = path_to("10.1.2.3:9993");

        peer.received(&path, 0, 1, Verb::Ok, 0, Verb::Nop, false);
        node.clear_sent();

        assert!(!peer.do_ping_and_keepalive(T0 + PING_PERIOD, Some(AddressFamily::Ipv6)));
        assert!(node.sent_packets().is_empty());

        assert!(peer.do_ping_and_keepalive(T0 + PING_PERIOD, Some(AddressFamily::Ipv4)));
        assert_eq!(node.sent_packets().len(), 1);
    }

    #[test]
    fn test_best_active_addresses_per_family() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        let v4 = path_to("10.1.2.3:9993");
        peer.received(&v4, 0, 1, Verb::Ok, 0, Verb::Nop, false);

        let (best_v4, best_v6) = peer.best_active_addresses(T0);
        assert_eq!(best_v4, Some(*v4.address()));
        assert_eq!(best_v6, None);

        let v6 = path_to("[2001:db8::7]:9993");
        peer.received(&v6, 0, 2, Verb::Ok, 0, Verb::Nop, false);

        let (best_v4, best_v6) = peer.best_active_addresses(T0);
        assert_eq!(best_v4, Some(*v4.address()));
        assert_eq!(best_v6, Some(*v6.address()));
    }

    #[test]
    fn test_duplicate_address_never_inserted_twice() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        let first = path_to("10.1.2.3:9993");
        let second = path_to("10.1.2.3:9993");
        peer.received(&first, 0, 1, Verb::Ok, 0, Verb::Nop, false);
        peer.received(&second, 0, 2, Verb::Ok, 0, Verb::Nop, false);

        assert_eq!(peer.path_count(), 1);
    }

    #[test]
    fn test_transport_failure_is_swallowed() {
        let node = Arc::new(MockNode::new(T0));
        node.transport_up.store(false, std::sync::atomic::Ordering::Relaxed);
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);
        let path = path_to("10.1.2.3:9993");

        // Probe send fails; received still completes and inserts nothing
        peer.received(&path, 0, 1, Verb::Frame, 0, Verb::Nop, false);
        assert_eq!(peer.path_count(), 0);

        peer.received(&path, 0, 2, Verb::Ok, 0, Verb::Nop, false);
        assert!(!peer.send_direct(b"frame", T0, false));
    }

    #[test]
    fn test_concurrent_receives_stay_bounded() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        let addrs: Vec<_> = (0..16)
            .map(|i| format!("10.0.0.{}:9993", i + 1))
            .collect();

        let mut handles = Vec::new();
        for remote in &addrs {
            let peer = Arc::clone(&peer);
            let path = path_to(remote);
            handles.push(thread::spawn(move || {
                peer.received(&path, 0, 1, Verb::Ok, 0, Verb::Nop, false);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peer.path_count(), MAX_PATHS);

        // Every surviving entry is one of the inserted addresses, undamaged
        let survivors = addrs
            .iter()
            .filter(|a| peer.has_active_path_to(T0, &addr(a)))
            .count();
        assert_eq!(survivors, MAX_PATHS);
    }

    #[test]
    fn test_remote_version_roundtrip() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        assert_eq!(peer.remote_version(), RemoteVersion::default());

        peer.set_remote_version(8, 1, 2, 513);
        assert_eq!(
            peer.remote_version(),
            RemoteVersion {
                proto: 8,
                major: 1,
                minor: 2,
                revision: 513,
            }
        );
    }

    #[test]
    fn test_latency_smoothing() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        assert_eq!(peer.latency(), 0);

        peer.record_latency(100);
        assert_eq!(peer.latency(), 100);

        peer.record_latency(200);
        assert_eq!(peer.latency(), 125);

        // Outliers are clamped before smoothing
        peer.record_latency(1_000_000);
        assert_eq!(peer.latency(), (65_535 + 125 * 3) / 4);
    }

    #[test]
    fn test_inbound_push_gate_allows_bounded_burst() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        assert!(peer.rate_gate_inbound_push(T0));
        for _ in 0..PUSH_CUTOFF_LIMIT {
            assert!(peer.rate_gate_inbound_push(T0 + 1));
        }
        assert!(!peer.rate_gate_inbound_push(T0 + 2));

        // A new window resets the burst budget
        assert!(peer.rate_gate_inbound_push(T0 + PUSH_CUTOFF_TIME));
        assert!(peer.rate_gate_inbound_push(T0 + PUSH_CUTOFF_TIME + 1));
    }

    #[test]
    fn test_cluster_optimal_hints() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, _) = new_peer(&ctx);

        let v4 = addr("192.0.2.10:9993");
        let v6 = addr("[2001:db8::10]:9993");
        assert!(!peer.is_remote_cluster_optimal(&v4));

        peer.set_cluster_optimal(v4);
        peer.set_cluster_optimal(v6);
        assert!(peer.is_remote_cluster_optimal(&v4));
        assert!(peer.is_remote_cluster_optimal(&v6));

        // A newer v4 hint displaces the old one
        let v4_new = addr("192.0.2.11:9993");
        peer.set_cluster_optimal(v4_new);
        assert!(!peer.is_remote_cluster_optimal(&v4));
        assert!(peer.is_remote_cluster_optimal(&v4_new));
    }

    #[test]
    fn test_construction_requires_local_private_key() {
        let node = Arc::new(MockNode::new(T0));
        let public_only = Identity::from_public_key(Identity::generate().public_bytes());
        let ctx = Arc::new(NodeContext {
            identity: public_only,
            node,
            topology: Arc::new(crate::network::testutil::FixedWorld),
            self_awareness: Arc::new(MockSelfAwareness::new()),
            cluster: None,
        });

        assert!(Peer::new(ctx, Identity::generate()).is_err());
    }

    #[test]
    fn test_hello_payload_layout() {
        let node = Arc::new(MockNode::new(T0));
        let ctx = test_context(Arc::clone(&node), None);
        let (peer, remote) = new_peer(&ctx);

        let at = addr("8.8.8.8:9993");
        peer.send_hello(&addr("0.0.0.0:9993"), &at, T0);

        let sent = node.sent_packets();
        assert_eq!(sent.len(), 1);
        let hello = decode(&ctx, &remote, &sent[0].2);
        let payload = hello.payload();

        assert_eq!(payload[0], PROTO_VERSION);
        assert_eq!(payload[1], VERSION_MAJOR);
        assert_eq!(payload[2], VERSION_MINOR);
        assert_eq!(&payload[3..5], &VERSION_REVISION.to_be_bytes());
        assert_eq!(&payload[5..13], &T0.to_be_bytes());

        // Identity follows, public key only
        let (sender, identity_len) = Identity::deserialize(&payload[13..]).unwrap();
        assert_eq!(sender, ctx.identity);
        assert!(!sender.has_private());

        // Then the destination as we observed it
        let at_start = 13 + identity_len;
        assert_eq!(payload[at_start], 4);
        assert_eq!(&payload[at_start + 1..at_start + 5], &[8, 8, 8, 8]);
        assert_eq!(
            &payload[at_start + 5..at_start + 7],
            &9993u16.to_be_bytes()
        );

        // World id and timestamp close the payload
        let world_start = at_start + 7;
        assert_eq!(
            &payload[world_start..world_start + 8],
            &ctx.topology.world_id().to_be_bytes()
        );
        assert_eq!(
            &payload[world_start + 8..world_start + 16],
            &ctx.topology.world_timestamp().to_be_bytes()
        );
        assert_eq!(payload.len(), world_start + 16);
    }
}
