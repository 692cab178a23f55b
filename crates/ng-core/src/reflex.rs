//! Fast-path reflex table.
//!
//! A fixed, direct-mapped array of slots keyed by signal signature. A hit is
//! a single slot read lock and an `Arc` clone, and never touches the spatial
//! index. Slots are filled from slow-path outcomes and carry a confidence:
//! how often the signature resolved to the token it currently caches.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::PRIORITY_BUCKET_WIDTH;
use crate::index::Neighbor;
use crate::token::TokenId;

/// A cached slow-path outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct Reflex {
    pub signature: u64,
    pub token_id: TokenId,
    pub neighbors: Arc<[Neighbor]>,
    pub observations: u32,
    pub agreements: u32,
}

impl Reflex {
    pub fn confidence(&self) -> f64 {
        if self.observations == 0 {
            return 0.0;
        }
        self.agreements as f64 / self.observations as f64
    }

    fn references(&self, id: TokenId) -> bool {
        self.token_id == id || self.neighbors.iter().any(|(n, _)| *n == id)
    }
}

pub struct ReflexTable {
    slots: Box<[RwLock<Option<Arc<Reflex>>>]>,
    mask: usize,
    min_confidence: f64,
}

impl ReflexTable {
    /// `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize, min_confidence: f64) -> Self {
        let size = capacity.max(1).next_power_of_two();
        Self {
            slots: (0..size).map(|_| RwLock::new(None)).collect(),
            mask: size - 1,
            min_confidence,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, signature: u64) -> &RwLock<Option<Arc<Reflex>>> {
        &self.slots[signature as usize & self.mask]
    }

    /// A confident reflex for `signature`, if one is cached.
    pub fn lookup(&self, signature: u64) -> Option<Arc<Reflex>> {
        let slot = self.slot(signature).read();
        match slot.as_ref() {
            Some(r) if r.signature == signature && r.confidence() >= self.min_confidence => Some(Arc::clone(r)),
            _ => None,
        }
    }

    /// Record a slow-path outcome. A different signature in the same slot is
    /// evicted. Returns the confidence after recording.
    pub fn record(&self, signature: u64, token_id: TokenId, neighbors: &[Neighbor]) -> f64 {
        let mut slot = self.slot(signature).write();
        let (observations, agreements) = match slot.as_ref() {
            Some(prev) if prev.signature == signature => (
                prev.observations.saturating_add(1),
                prev.agreements
                    .saturating_add(u32::from(prev.token_id == token_id)),
            ),
            _ => (1, 1),
        };
        let reflex = Reflex {
            signature,
            token_id,
            neighbors: neighbors.into(),
            observations,
            agreements,
        };
        let confidence = reflex.confidence();
        *slot = Some(Arc::new(reflex));
        confidence
    }

    /// Drop every reflex that resolves to, or lists as neighbor, `id`.
    pub fn invalidate_token(&self, id: TokenId) -> usize {
        self.clear_where(|r| r.references(id))
    }

    /// Decay reflexes below the confidence floor. Counts are halved with
    /// rounding against agreement, so a demoted signature stays below the
    /// floor and must agree repeatedly before it is trusted again. Returns
    /// how many reflexes decayed.
    pub fn prune(&self) -> usize {
        let floor = self.min_confidence;
        let mut decayed = 0;
        for slot in self.slots.iter() {
            let mut slot = slot.write();
            let Some(r) = slot.as_deref() else { continue };
            if r.confidence() >= floor {
                continue;
            }
            let observations = r.observations.div_ceil(2);
            let agreements = r.agreements / 2;
            if (observations, agreements) == (r.observations, r.agreements) {
                continue;
            }
            let next = Reflex {
                observations,
                agreements,
                ..r.clone()
            };
            *slot = Some(Arc::new(next));
            decayed += 1;
        }
        decayed
    }

    pub fn clear(&self) -> usize {
        self.clear_where(|_| true)
    }

    fn clear_where(&self, pred: impl Fn(&Reflex) -> bool) -> usize {
        let mut cleared = 0;
        for slot in self.slots.iter() {
            let mut slot = slot.write();
            if slot.as_deref().is_some_and(&pred) {
                *slot = None;
                cleared += 1;
            }
        }
        cleared
    }

    /// Occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.read().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hashes signals into reflex signatures.
///
/// With a positive `resolution` vector components are quantized so that
/// near-identical signals collide; otherwise their exact bits are hashed.
#[derive(Clone)]
pub struct SignatureHasher {
    state: ahash::RandomState,
    resolution: f64,
}

impl SignatureHasher {
    pub fn new(resolution: f64) -> Self {
        Self {
            state: ahash::RandomState::with_seeds(
                0x9e37_79b9_7f4a_7c15,
                0xbf58_476d_1ce4_e5b9,
                0x94d0_49bb_1331_11eb,
                0x2545_f491_4f6c_dd1d,
            ),
            resolution,
        }
    }

    pub fn signature(&self, event_type: &str, priority: u8, vector: &[f32]) -> u64 {
        let mut h = self.state.build_hasher();
        event_type.hash(&mut h);
        (priority / PRIORITY_BUCKET_WIDTH).hash(&mut h);
        self.hash_vector(vector, &mut h);
        h.finish()
    }

    /// Signature of a placement point alone, used to stripe classification.
    pub fn cell(&self, point: &[f32]) -> u64 {
        let mut h = self.state.build_hasher();
        self.hash_vector(point, &mut h);
        h.finish()
    }

    /// Grid cell of a point at this hasher's resolution. Only meaningful
    /// for a positive resolution.
    pub fn grid_cell(&self, point: [f32; 3]) -> [i64; 3] {
        point.map(|v| (v as f64 / self.resolution).floor() as i64)
    }

    pub fn cell_key(&self, cell: [i64; 3]) -> u64 {
        self.state.hash_one(cell)
    }

    fn hash_vector(&self, vector: &[f32], h: &mut impl Hasher) {
        vector.len().hash(h);
        for &v in vector {
            if self.resolution > 0.0 {
                ((v as f64 / self.resolution).floor() as i64).hash(h);
            } else {
                // -0.0 and 0.0 are the same point
                (if v == 0.0 { 0u32 } else { v.to_bits() }).hash(h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(ReflexTable::new(1000, 0.8).capacity(), 1024);
        assert_eq!(ReflexTable::new(0, 0.8).capacity(), 1);
    }

    #[test]
    fn test_record_then_lookup() {
        let table = ReflexTable::new(64, 0.8);
        assert!(table.lookup(7).is_none());
        let c = table.record(7, 42, &[(3, 0.5)]);
        assert_eq!(c, 1.0);
        let hit = table.lookup(7).unwrap();
        assert_eq!(hit.token_id, 42);
        assert_eq!(&*hit.neighbors, &[(3, 0.5)]);
        // same slot, different signature
        assert!(table.lookup(7 + 64).is_none());
    }

    #[test]
    fn test_confidence_gates_lookup() {
        let table = ReflexTable::new(16, 0.8);
        table.record(1, 10, &[]);
        // disagreement drops confidence to 1/2
        let c = table.record(1, 11, &[]);
        assert_eq!(c, 0.5);
        assert!(table.lookup(1).is_none());
        // agreements with the new token climb back: 3/4 then 4/5
        table.record(1, 11, &[]);
        assert!(table.lookup(1).is_none());
        table.record(1, 11, &[]);
        assert_eq!(table.lookup(1).unwrap().token_id, 11);
    }

    #[test]
    fn test_eviction_resets_counts() {
        let table = ReflexTable::new(1, 0.8);
        table.record(1, 10, &[]);
        table.record(1, 11, &[]);
        table.record(2, 20, &[]);
        let r = table.lookup(2).unwrap();
        assert_eq!((r.observations, r.agreements), (1, 1));
        assert!(table.lookup(1).is_none());
    }

    #[test]
    fn test_invalidate_and_prune() {
        let table = ReflexTable::new(16, 0.8);
        table.record(1, 10, &[(5, 1.0)]);
        table.record(2, 20, &[]);
        table.record(3, 30, &[]);
        table.record(3, 31, &[]);
        assert_eq!(table.len(), 3);

        assert_eq!(table.invalidate_token(5), 1);
        assert!(table.lookup(1).is_none());
        // 1/2 decays to 0/1 and stays cached; 2 is confident and untouched
        assert_eq!(table.prune(), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.prune(), 0);
        assert_eq!(table.lookup(2).unwrap().observations, 1);
        assert_eq!(table.clear(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_pruned_signature_earns_trust_back() {
        let table = ReflexTable::new(16, 0.8);
        table.record(4, 40, &[]);
        table.record(4, 41, &[]);
        assert!(table.lookup(4).is_none());
        assert_eq!(table.prune(), 1);

        // one agreement after pruning is not enough
        assert_eq!(table.record(4, 41, &[]), 0.5);
        assert!(table.lookup(4).is_none());
        for _ in 0..3 {
            table.record(4, 41, &[]);
        }
        assert_eq!(table.lookup(4).unwrap().confidence(), 0.8);
    }

    #[test]
    fn test_prune_never_raises_confidence() {
        let table = ReflexTable::new(1, 0.8);
        let mut confidence = 0.0;
        for token in [90, 90, 90, 90, 90, 91, 91, 90, 90, 91, 91] {
            confidence = table.record(9, token, &[]);
        }
        // 8/11; flooring both counts would give a trusted 4/5
        assert_eq!(confidence, 8.0 / 11.0);
        assert_eq!(table.prune(), 1);
        assert!(table.lookup(9).is_none());
    }

    #[test]
    fn test_signature_components() {
        let h = SignatureHasher::new(0.0);
        let base = h.signature("a.b", 100, &[1.0, 2.0, 3.0]);
        assert_eq!(base, h.signature("a.b", 100, &[1.0, 2.0, 3.0]));
        // same priority bucket
        assert_eq!(base, h.signature("a.b", 99, &[1.0, 2.0, 3.0]));
        assert_ne!(base, h.signature("a.b", 200, &[1.0, 2.0, 3.0]));
        assert_ne!(base, h.signature("a.c", 100, &[1.0, 2.0, 3.0]));
        assert_ne!(base, h.signature("a.b", 100, &[1.0, 2.0, 3.000001]));
        assert_eq!(h.cell(&[0.0, 1.0]), h.cell(&[-0.0, 1.0]));
    }

    #[test]
    fn test_signature_quantized() {
        let h = SignatureHasher::new(0.5);
        assert_eq!(
            h.signature("a", 1, &[1.1, 2.2, 3.3]),
            h.signature("a", 1, &[1.2, 2.3, 3.4])
        );
        assert_ne!(
            h.signature("a", 1, &[1.1, 2.2, 3.3]),
            h.signature("a", 1, &[1.6, 2.2, 3.3])
        );
    }
}
