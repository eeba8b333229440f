use std::sync::Arc;

use crate::network::inet::InetAddress;
use crate::network::path::Path;
use crate::protocol::MAX_PATHS;

/// One slot of the per-peer path table
#[derive(Clone, Default)]
pub(crate) struct PathSlot {
    pub path: Option<Arc<Path>>,

    /// Last authenticated receive on this path, as this peer saw it
    pub last_receive: u64,

    /// Set when the cluster decided a better local ingress exists
    pub cluster_suboptimal: bool,
}

/// Fixed-capacity table of candidate paths to one peer.
///
/// Live entries occupy the prefix `[0, len)`; slots past the prefix hold no
/// path handles. No two live entries carry the same remote address.
pub(crate) struct PathTable {
    slots: [PathSlot; MAX_PATHS],
    num: usize,
}

impl PathTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| PathSlot::default()),
            num: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.num
    }

    pub fn slot(&self, idx: usize) -> &PathSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut PathSlot {
        &mut self.slots[idx]
    }

    /// Iterate the live prefix
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PathSlot)> {
        self.slots[..self.num].iter().enumerate()
    }

    /// Rank a slot; higher is better. Alive paths always outrank dead ones,
    /// then freshness, then cluster optimality as the tie-breaker bit.
    pub fn score(&self, idx: usize, now: u64) -> u64 {
        let slot = &self.slots[idx];
        let alive = slot.path.as_ref().map_or(false, |p| p.alive(now));
        ((alive as u64) << 62) | (slot.last_receive << 1) | (!slot.cluster_suboptimal as u64)
    }

    /// Index of the live entry with this remote address, if any
    pub fn find_by_address(&self, addr: &InetAddress) -> Option<usize> {
        self.slots[..self.num]
            .iter()
            .position(|slot| slot.path.as_ref().map_or(false, |p| p.address() == addr))
    }

    /// Best-scoring slot among those passing the filter. Equal scores
    /// resolve to the later slot, so the most recently inserted path wins
    /// ties.
    pub fn best_where(&self, now: u64, mut filter: impl FnMut(&PathSlot) -> bool) -> Option<usize> {
        let mut best_score = 0u64;
        let mut best = None;
        for idx in 0..self.num {
            if !filter(&self.slots[idx]) {
                continue;
            }
            let score = self.score(idx, now);
            if score >= best_score {
                best_score = score;
                best = Some(idx);
            }
        }
        best
    }

    /// Place a confirmed path, returning its slot. Below capacity this
    /// appends; at capacity it replaces the worst slot of the same address
    /// family, or the worst slot overall if that family has none.
    pub fn insert(&mut self, path: Arc<Path>, now: u64, cluster_suboptimal: bool) -> usize {
        let slot = if self.num < MAX_PATHS {
            let idx = self.num;
            self.num += 1;
            idx
        } else {
            let family = path.address().family();
            let mut victim = None;
            let mut worst_score = u64::MAX;
            for idx in 0..self.num {
                let same_family = self.slots[idx]
                    .path
                    .as_ref()
                    .map_or(false, |p| p.address().family() == family);
                if same_family {
                    let score = self.score(idx, now);
                    if score < worst_score {
                        worst_score = score;
                        victim = Some(idx);
                    }
                }
            }
            match victim {
                Some(idx) => idx,
                None => {
                    // No slot of this family exists; take the worst overall
                    let mut victim = MAX_PATHS - 1;
                    let mut worst_score = u64::MAX;
                    for idx in 0..self.num {
                        let score = self.score(idx, now);
                        if score < worst_score {
                            worst_score = score;
                            victim = idx;
                        }
                    }
                    victim
                }
            }
        };

        self.slots[slot] = PathSlot {
            path: Some(path),
            last_receive: now,
            cluster_suboptimal,
        };
        slot
    }

    /// In-place compaction keeping entries the predicate accepts. Trailing
    /// slots release their path handles.
    pub fn retain(&mut self, mut keep: impl FnMut(&PathSlot) -> bool) {
        let old_num = self.num;
        let mut kept = 0;
        for idx in 0..old_num {
            if keep(&self.slots[idx]) {
                if idx != kept {
                    self.slots.swap(idx, kept);
                }
                kept += 1;
            }
        }
        self.num = kept;
        for slot in self.slots[kept..old_num].iter_mut() {
            *slot = PathSlot::default();
        }
    }
}
