//! Consistent-hash (sticky) load balancing strategy.
//!
//! Each eligible backend owns `VNODES_PER_WEIGHT * weight` points on a 64-bit
//! ring. A client key hashes to a point and is served by the next backend point
//! clockwise, so adding or removing one backend only remaps the keys that land
//! on that backend's arcs.

use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, PoisonError};

use crate::load_balancer::backend::{BackendId, BackendView};
use crate::load_balancer::context::RequestContext;
use crate::load_balancer::registry::Snapshot;
use crate::load_balancer::round_robin::RotationCursor;
use crate::load_balancer::{eligible, Policy, SelectError};

const VNODES_PER_WEIGHT: u32 = 64;

/// Ring position of `parts`. Stable across builds and platforms, so a client
/// keeps its backend through restarts and upgrades.
fn hash_of(parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

#[derive(Debug)]
struct Ring {
    /// (point, index into `members`), sorted by point.
    points: Vec<(u64, usize)>,
    members: Vec<BackendId>,
}

impl Ring {
    fn build(candidates: &[&BackendView], vnodes_per_weight: u32) -> Self {
        let members: Vec<BackendId> = candidates.iter().map(|b| b.id.clone()).collect();
        let mut points = Vec::new();
        for (index, backend) in candidates.iter().enumerate() {
            for vnode in 0..vnodes_per_weight * backend.weight.max(1) {
                points.push((hash_of(&[backend.id.as_str().as_bytes(), &vnode.to_be_bytes()]), index));
            }
        }
        points.sort_unstable();
        Self { points, members }
    }

    fn lookup(&self, key_hash: u64) -> Option<&BackendId> {
        if self.points.is_empty() {
            return None;
        }
        let pos = self.points.partition_point(|(point, _)| *point < key_hash);
        let (_, index) = self.points[pos % self.points.len()];
        self.members.get(index)
    }
}

/// Identity of the candidate set a ring was built from.
type RingKey = Vec<(BackendId, u32)>;

/// Sticky selector over a consistent-hash ring of the eligible backends.
/// Requests without a client key fall back to round-robin.
#[derive(Debug)]
pub struct ConsistentHash {
    vnodes_per_weight: u32,
    cache: Mutex<Option<(RingKey, Arc<Ring>)>>,
    fallback: RotationCursor,
}

impl ConsistentHash {
    pub fn new() -> Self {
        Self::with_vnodes(VNODES_PER_WEIGHT)
    }

    pub fn with_vnodes(vnodes_per_weight: u32) -> Self {
        Self {
            vnodes_per_weight: vnodes_per_weight.max(1),
            cache: Mutex::new(None),
            fallback: RotationCursor::default(),
        }
    }

    fn ring_for(&self, candidates: &[&BackendView]) -> Arc<Ring> {
        let key: RingKey = candidates.iter().map(|b| (b.id.clone(), b.weight)).collect();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached_key, ring)) = cache.as_ref() {
            if *cached_key == key {
                return ring.clone();
            }
        }
        let ring = Arc::new(Ring::build(candidates, self.vnodes_per_weight));
        *cache = Some((key, ring.clone()));
        ring
    }
}

impl Default for ConsistentHash {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for ConsistentHash {
    fn select(&self, snapshot: &Snapshot, ctx: &RequestContext) -> Result<BackendView, SelectError> {
        let candidates = eligible(snapshot, ctx);
        if candidates.is_empty() {
            return Err(SelectError::NoAvailableBackend);
        }

        let Some(key) = ctx.client_key.as_deref() else {
            let index = self.fallback.next(snapshot.membership_epoch()) % candidates.len();
            return Ok(candidates[index].clone());
        };

        let ring = self.ring_for(&candidates);
        let id = ring.lookup(hash_of(&[key.as_bytes()])).ok_or(SelectError::NoAvailableBackend)?;
        candidates
            .iter()
            .find(|b| &b.id == id)
            .map(|b| (*b).clone())
            .ok_or(SelectError::NoAvailableBackend)
    }

    fn name(&self) -> &'static str {
        "consistent_hash"
    }
}
