//! Per-space bucketed spatial index over token coordinates.
//!
//! The index owns the authoritative token records. Every coordinate change
//! goes through [`SpatialIndex::update`], which rewrites bucket membership
//! while the token's shard lock is held, so a token is always in exactly one
//! bucket for each space it occupies.
//!
//! Locking is fine-grained: tokens are sharded by id, and each space's
//! buckets are sharded by bucket key. Lock order is token shard, then bucket
//! shards in ascending shard index. Queries never hold a bucket lock while
//! taking a token lock.

use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::constants::{BUCKET_SHARDS, MAX_CUBE_BUCKETS, SPACE_COUNT, TOKEN_SHARDS};
use crate::error::{Error, Result};
use crate::space::{CoordinateSpace, euclidean};
use crate::token::{Token, TokenId};

/// Quantized coordinate cell.
pub type BucketKey = [i64; 3];

/// A query hit: token id and its distance from the query point.
pub type Neighbor = (TokenId, f64);

/// Index tuning. Thresholds are stored for higher-level analysis and are
/// not interpreted by the index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Edge length of a bucket cell.
    pub bucket_size: f64,
    /// Tokens per unit volume above which a region counts as dense.
    pub density_threshold: f64,
    /// Minimum tokens for a dense region to be reported.
    pub min_field_nodes: usize,
    /// Maximum number of tokens held.
    pub capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            bucket_size: 1.0,
            density_threshold: 0.5,
            min_field_nodes: 3,
            capacity: 1_000_000,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.bucket_size.is_finite() && self.bucket_size > 0.0) {
            return Err(Error::Config(format!(
                "bucket_size must be positive, got {}",
                self.bucket_size
            )));
        }
        if !(self.density_threshold.is_finite() && self.density_threshold >= 0.0) {
            return Err(Error::Config(format!(
                "density_threshold must be non-negative, got {}",
                self.density_threshold
            )));
        }
        if self.capacity == 0 {
            return Err(Error::Config("capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Occupancy counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexStats {
    pub tokens: usize,
    pub occupied_buckets: [usize; SPACE_COUNT],
}

type BucketShard = HashMap<BucketKey, HashSet<TokenId>>;

struct SpaceGrid {
    shards: Vec<RwLock<BucketShard>>,
    occupied: AtomicUsize,
}

impl SpaceGrid {
    fn new() -> Self {
        Self {
            shards: (0..BUCKET_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            occupied: AtomicUsize::new(0),
        }
    }

    fn attach(&self, shard: &mut BucketShard, key: BucketKey, id: TokenId) {
        let bucket = shard.entry(key).or_insert_with(|| {
            self.occupied.fetch_add(1, Ordering::Relaxed);
            HashSet::new()
        });
        bucket.insert(id);
    }

    fn detach(&self, shard: &mut BucketShard, key: &BucketKey, id: TokenId) {
        if let Some(bucket) = shard.get_mut(key) {
            bucket.remove(&id);
            if bucket.is_empty() {
                shard.remove(key);
                self.occupied.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct SpatialIndex {
    config: IndexConfig,
    tokens: Vec<RwLock<HashMap<TokenId, Token>>>,
    grids: [SpaceGrid; SPACE_COUNT],
    len: AtomicUsize,
    hasher: ahash::RandomState,
}

impl SpatialIndex {
    pub fn new(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tokens: (0..TOKEN_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            grids: std::array::from_fn(|_| SpaceGrid::new()),
            len: AtomicUsize::new(0),
            hasher: ahash::RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn bucket_size(&self) -> f64 {
        self.config.bucket_size
    }

    pub fn density_threshold(&self) -> f64 {
        self.config.density_threshold
    }

    pub fn min_field_nodes(&self) -> usize {
        self.config.min_field_nodes
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn bucket_key(&self, point: [f32; 3]) -> BucketKey {
        point.map(|v| quantize(v as f64, self.config.bucket_size))
    }

    fn token_shard(&self, id: TokenId) -> &RwLock<HashMap<TokenId, Token>> {
        &self.tokens[id as usize % TOKEN_SHARDS]
    }

    fn bucket_shard(&self, key: &BucketKey) -> usize {
        self.hasher.hash_one(key) as usize % BUCKET_SHARDS
    }

    // --- Mutation ---

    /// Insert or replace a token. Bucket membership follows the new record.
    /// Returns the replaced token, if any.
    pub fn insert(&self, token: Token) -> Result<Option<Token>> {
        let id = token.id();
        let mut shard = self.token_shard(id).write();

        let previous = shard.get(&id).cloned();
        if previous.is_none() {
            let capacity = self.config.capacity;
            self.len
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < capacity).then_some(n + 1)
                })
                .map_err(|_| Error::CapacityExceeded(capacity))?;
        }

        for space in CoordinateSpace::ALL {
            let from = previous
                .as_ref()
                .and_then(|t| t.get_coordinates(space))
                .map(|p| self.bucket_key(p));
            let to = token.get_coordinates(space).map(|p| self.bucket_key(p));
            self.relocate(space, id, from, to);
        }

        shard.insert(id, token);
        Ok(previous)
    }

    /// Remove a token from the table and from every bucket it occupies.
    pub fn remove(&self, id: TokenId) -> Option<Token> {
        let mut shard = self.token_shard(id).write();
        let token = shard.remove(&id)?;
        for space in token.occupied_spaces() {
            let from = token.get_coordinates(space).map(|p| self.bucket_key(p));
            self.relocate(space, id, from, None);
        }
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(token)
    }

    /// Apply `f` to a copy of the token and commit it together with any
    /// bucket moves. If `f` fails nothing changes.
    pub fn update<F>(&self, id: TokenId, f: F) -> Result<Token>
    where
        F: FnOnce(&mut Token) -> Result<()>,
    {
        let mut shard = self.token_shard(id).write();
        let current = shard.get_mut(&id).ok_or(Error::TokenNotFound(id))?;

        let mut next = current.clone();
        f(&mut next)?;

        for space in CoordinateSpace::ALL {
            let from = current.get_coordinates(space).map(|p| self.bucket_key(p));
            let to = next.get_coordinates(space).map(|p| self.bucket_key(p));
            self.relocate(space, id, from, to);
        }

        *current = next.clone();
        Ok(next)
    }

    pub fn set_coordinates(&self, id: TokenId, space: CoordinateSpace, x: f32, y: f32, z: f32) -> Result<()> {
        self.update(id, |t| t.set_coordinates(space, x, y, z))
            .map(|_| ())
    }

    pub fn clear_coordinates(&self, id: TokenId, space: CoordinateSpace) -> Result<()> {
        self.update(id, |t| {
            t.clear_coordinates(space);
            Ok(())
        })
        .map(|_| ())
    }

    /// Move `id` between buckets of one space. Both shards stay locked for
    /// the whole swap.
    fn relocate(&self, space: CoordinateSpace, id: TokenId, from: Option<BucketKey>, to: Option<BucketKey>) {
        if from == to {
            return;
        }
        let grid = &self.grids[space.index()];
        match (from, to) {
            (Some(f), Some(t)) => {
                let (sf, st) = (self.bucket_shard(&f), self.bucket_shard(&t));
                if sf == st {
                    let mut shard = grid.shards[sf].write();
                    grid.detach(&mut shard, &f, id);
                    grid.attach(&mut shard, t, id);
                } else {
                    let (lo, hi) = (sf.min(st), sf.max(st));
                    let mut lo_guard = grid.shards[lo].write();
                    let mut hi_guard = grid.shards[hi].write();
                    let (from_shard, to_shard) = if sf == lo {
                        (&mut *lo_guard, &mut *hi_guard)
                    } else {
                        (&mut *hi_guard, &mut *lo_guard)
                    };
                    grid.detach(from_shard, &f, id);
                    grid.attach(to_shard, t, id);
                }
            }
            (Some(f), None) => {
                let mut shard = grid.shards[self.bucket_shard(&f)].write();
                grid.detach(&mut shard, &f, id);
            }
            (None, Some(t)) => {
                let mut shard = grid.shards[self.bucket_shard(&t)].write();
                grid.attach(&mut shard, t, id);
            }
            (None, None) => {}
        }
    }

    // --- Lookup ---

    pub fn get(&self, id: TokenId) -> Option<Token> {
        self.token_shard(id).read().get(&id).cloned()
    }

    pub fn contains(&self, id: TokenId) -> bool {
        self.token_shard(id).read().contains_key(&id)
    }

    /// All token ids, ascending.
    pub fn ids(&self) -> Vec<TokenId> {
        let mut ids: Vec<TokenId> = self
            .tokens
            .iter()
            .flat_map(|s| s.read().keys().copied().collect::<Vec<_>>())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Occupied buckets of a space with their token counts.
    pub fn occupied_buckets(&self, space: CoordinateSpace) -> Vec<(BucketKey, usize)> {
        let mut out: Vec<(BucketKey, usize)> = self.grids[space.index()]
            .shards
            .iter()
            .flat_map(|s| {
                s.read()
                    .iter()
                    .map(|(k, ids)| (*k, ids.len()))
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_unstable();
        out
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            tokens: self.len(),
            occupied_buckets: std::array::from_fn(|i| self.grids[i].occupied.load(Ordering::Relaxed)),
        }
    }

    // --- Queries ---

    /// Up to `max_results` tokens within `radius` of the center token in
    /// `space`, nearest first, ties by id. The center itself is excluded.
    pub fn find_neighbors(
        &self,
        center: TokenId,
        space: CoordinateSpace,
        radius: f64,
        max_results: usize,
    ) -> Result<Vec<Neighbor>> {
        check_radius(radius)?;
        let token = self.get(center).ok_or(Error::TokenNotFound(center))?;
        let point = token
            .get_coordinates(space)
            .ok_or(Error::MissingSpace { token: center, space })?;

        let mut hits: Vec<Neighbor> = self
            .scan(space, point, radius, |_| ())
            .into_iter()
            .filter(|(id, _, _)| *id != center)
            .map(|(id, d, _)| (id, d))
            .collect();
        hits.truncate(max_results);
        Ok(hits)
    }

    /// Every token within `radius` of an arbitrary point, nearest first.
    pub fn range_query(&self, space: CoordinateSpace, x: f32, y: f32, z: f32, radius: f64) -> Result<Vec<Neighbor>> {
        check_radius(radius)?;
        let point = check_point(space, [x, y, z])?;
        Ok(self
            .scan(space, point, radius, |_| ())
            .into_iter()
            .map(|(id, d, _)| (id, d))
            .collect())
    }

    /// Closest token within `max_distance` of a point.
    pub fn nearest(&self, space: CoordinateSpace, point: [f32; 3], max_distance: f64) -> Result<Option<Neighbor>> {
        let [x, y, z] = point;
        Ok(self.range_query(space, x, y, z, max_distance)?.into_iter().next())
    }

    /// Tokens within `radius` divided by the sphere's volume.
    pub fn calculate_density(&self, space: CoordinateSpace, x: f32, y: f32, z: f32, radius: f64) -> Result<f64> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(Error::InvalidRadius(radius));
        }
        let point = check_point(space, [x, y, z])?;
        let count = self.scan(space, point, radius, |_| ()).len();
        if count == 0 {
            return Ok(0.0);
        }
        Ok(count as f64 / sphere_volume(radius))
    }

    /// Sum of `field_strength * (1 - d / field_radius)` over tokens within
    /// `radius` whose own field reaches the point.
    pub fn calculate_field_influence(&self, space: CoordinateSpace, x: f32, y: f32, z: f32, radius: f64) -> Result<f64> {
        check_radius(radius)?;
        let point = check_point(space, [x, y, z])?;
        let influence = self
            .scan(space, point, radius, |t| (t.field_radius() as f64, t.field_strength() as f64))
            .into_iter()
            .map(|(_, d, (field_radius, field_strength))| {
                if field_radius <= 0.0 || d > field_radius {
                    0.0
                } else {
                    field_strength * (1.0 - d / field_radius).max(0.0)
                }
            })
            .sum();
        Ok(influence)
    }

    /// Candidate collection plus exact distance filter. Results are sorted by
    /// distance, then id.
    fn scan<T>(
        &self,
        space: CoordinateSpace,
        center: [f32; 3],
        radius: f64,
        mut project: impl FnMut(&Token) -> T,
    ) -> Vec<(TokenId, f64, T)> {
        let bs = self.config.bucket_size;
        let lo: BucketKey = std::array::from_fn(|i| quantize(center[i] as f64 - radius, bs));
        let hi: BucketKey = std::array::from_fn(|i| quantize(center[i] as f64 + radius, bs));

        let grid = &self.grids[space.index()];
        let span = (0..3).fold(1u64, |acc, i| {
            let width = (hi[i] as i128 - lo[i] as i128 + 1).clamp(0, u64::MAX as i128) as u64;
            acc.saturating_mul(width)
        });

        let mut candidates: HashSet<TokenId> = HashSet::new();
        if span <= MAX_CUBE_BUCKETS && span <= grid.occupied.load(Ordering::Relaxed) as u64 {
            for bx in lo[0]..=hi[0] {
                for by in lo[1]..=hi[1] {
                    for bz in lo[2]..=hi[2] {
                        let key = [bx, by, bz];
                        if let Some(ids) = grid.shards[self.bucket_shard(&key)].read().get(&key) {
                            candidates.extend(ids.iter().copied());
                        }
                    }
                }
            }
        } else {
            for shard in &grid.shards {
                let shard = shard.read();
                for (key, ids) in shard.iter() {
                    if (0..3).all(|i| key[i] >= lo[i] && key[i] <= hi[i]) {
                        candidates.extend(ids.iter().copied());
                    }
                }
            }
        }

        let mut hits: Vec<(TokenId, f64, T)> = candidates
            .into_iter()
            .filter_map(|id| {
                let shard = self.token_shard(id).read();
                let token = shard.get(&id)?;
                let d = euclidean(center, token.get_coordinates(space)?);
                (d <= radius).then(|| (id, d, project(token)))
            })
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits
    }

    #[cfg(test)]
    fn buckets_holding(&self, space: CoordinateSpace, id: TokenId) -> usize {
        self.grids[space.index()]
            .shards
            .iter()
            .map(|s| s.read().values().filter(|ids| ids.contains(&id)).count())
            .sum()
    }
}

fn quantize(v: f64, bucket_size: f64) -> i64 {
    // `as` saturates on overflow
    (v / bucket_size).floor() as i64
}

fn sphere_volume(radius: f64) -> f64 {
    4.0 / 3.0 * PI * radius.powi(3)
}

fn check_radius(radius: f64) -> Result<()> {
    if radius.is_finite() && radius >= 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidRadius(radius))
    }
}

/// Query points may lie outside a normalized domain but must be finite.
fn check_point(space: CoordinateSpace, point: [f32; 3]) -> Result<[f32; 3]> {
    match point.iter().find(|v| !v.is_finite()) {
        Some(&value) => Err(Error::OutOfRange {
            space,
            value,
            min: f32::MIN,
            max: f32::MAX,
        }),
        None => Ok(point),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    const P: CoordinateSpace = CoordinateSpace::Physical;

    fn index() -> SpatialIndex {
        SpatialIndex::new(IndexConfig::default()).unwrap()
    }

    fn token_at(id: TokenId, p: [f32; 3]) -> Token {
        let mut t = Token::new(id);
        t.set_coordinates(P, p[0], p[1], p[2]).unwrap();
        t
    }

    #[test]
    fn test_insert_get_remove() {
        let idx = index();
        assert!(idx.insert(token_at(1, [0.5, 0.5, 0.5])).unwrap().is_none());
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.get(1).unwrap().get_coordinates(P), Some([0.5, 0.5, 0.5]));
        assert_eq!(idx.buckets_holding(P, 1), 1);

        let removed = idx.remove(1).unwrap();
        assert_eq!(removed.id(), 1);
        assert!(idx.get(1).is_none());
        assert_eq!(idx.buckets_holding(P, 1), 0);
        assert_eq!(idx.stats().occupied_buckets[P.index()], 0);
        assert!(idx.is_empty());
        assert!(idx.remove(1).is_none());
    }

    #[test]
    fn test_replace_moves_buckets() {
        let idx = index();
        idx.insert(token_at(1, [0.5, 0.5, 0.5])).unwrap();
        let prev = idx.insert(token_at(1, [10.5, 0.5, 0.5])).unwrap();
        assert!(prev.is_some());
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.buckets_holding(P, 1), 1);
        assert_eq!(idx.occupied_buckets(P), vec![([10, 0, 0], 1)]);
    }

    #[test]
    fn test_set_coordinates_relocates() {
        let idx = index();
        idx.insert(token_at(7, [0.1, 0.1, 0.1])).unwrap();
        idx.set_coordinates(7, P, -5.5, 3.2, 100.0).unwrap();
        assert_eq!(idx.occupied_buckets(P), vec![([-6, 3, 100], 1)]);
        assert_eq!(idx.range_query(P, -5.5, 3.2, 100.0, 0.0).unwrap(), vec![(7, 0.0)]);
        assert!(idx.range_query(P, 0.1, 0.1, 0.1, 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_failed_update_leaves_state() {
        let idx = index();
        let mut t = Token::new(3);
        t.set_coordinates(CoordinateSpace::Emotional, 0.2, 0.2, 0.2).unwrap();
        idx.insert(t.clone()).unwrap();
        let err = idx
            .set_coordinates(3, CoordinateSpace::Emotional, 0.2, 9.0, 0.2)
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(idx.get(3).unwrap(), t);
        assert_eq!(idx.buckets_holding(CoordinateSpace::Emotional, 3), 1);
    }

    #[test]
    fn test_clear_coordinates_detaches() {
        let idx = index();
        let mut t = token_at(1, [1.0, 1.0, 1.0]);
        t.set_coordinates(CoordinateSpace::Social, 0.0, 0.0, 0.0).unwrap();
        idx.insert(t).unwrap();
        idx.clear_coordinates(1, P).unwrap();
        assert_eq!(idx.buckets_holding(P, 1), 0);
        assert_eq!(idx.buckets_holding(CoordinateSpace::Social, 1), 1);
    }

    #[test]
    fn test_update_unknown_token() {
        let idx = index();
        assert_eq!(
            idx.set_coordinates(42, P, 0.0, 0.0, 0.0),
            Err(Error::TokenNotFound(42))
        );
    }

    #[test]
    fn test_capacity() {
        let idx = SpatialIndex::new(IndexConfig {
            capacity: 2,
            ..IndexConfig::default()
        })
        .unwrap();
        idx.insert(token_at(1, [0.0; 3])).unwrap();
        idx.insert(token_at(2, [0.0; 3])).unwrap();
        // replacing is fine at capacity
        idx.insert(token_at(2, [1.0; 3])).unwrap();
        assert_eq!(idx.insert(token_at(3, [0.0; 3])), Err(Error::CapacityExceeded(2)));
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_find_neighbors_sorted_and_excludes_center() {
        let idx = index();
        idx.insert(token_at(1, [0.0, 0.0, 0.0])).unwrap();
        idx.insert(token_at(2, [3.0, 0.0, 0.0])).unwrap();
        idx.insert(token_at(3, [1.0, 0.0, 0.0])).unwrap();
        idx.insert(token_at(4, [0.0, 2.0, 0.0])).unwrap();
        idx.insert(token_at(5, [0.0, 0.0, 9.0])).unwrap();

        let n = idx.find_neighbors(1, P, 5.0, 10).unwrap();
        assert_eq!(n.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![3, 4, 2]);
        assert_relative_eq!(n[2].1, 3.0);

        let capped = idx.find_neighbors(1, P, 5.0, 2).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn test_find_neighbors_tie_break_by_id() {
        let idx = index();
        idx.insert(token_at(10, [0.0, 0.0, 0.0])).unwrap();
        idx.insert(token_at(30, [1.0, 0.0, 0.0])).unwrap();
        idx.insert(token_at(20, [-1.0, 0.0, 0.0])).unwrap();
        idx.insert(token_at(25, [0.0, 1.0, 0.0])).unwrap();
        let n = idx.find_neighbors(10, P, 1.0, 10).unwrap();
        assert_eq!(n.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![20, 25, 30]);
    }

    #[test]
    fn test_find_neighbors_errors() {
        let idx = index();
        idx.insert(token_at(1, [0.0; 3])).unwrap();
        assert_eq!(
            idx.find_neighbors(1, CoordinateSpace::Motor, 1.0, 5),
            Err(Error::MissingSpace {
                token: 1,
                space: CoordinateSpace::Motor
            })
        );
        assert_eq!(idx.find_neighbors(2, P, 1.0, 5), Err(Error::TokenNotFound(2)));
        assert_eq!(idx.find_neighbors(1, P, -1.0, 5), Err(Error::InvalidRadius(-1.0)));
        assert!(matches!(
            idx.find_neighbors(1, P, f64::NAN, 5),
            Err(Error::InvalidRadius(_))
        ));
    }

    #[test]
    fn test_spaces_are_independent() {
        let idx = index();
        let mut a = token_at(1, [0.0; 3]);
        a.set_coordinates(CoordinateSpace::Abstract, 0.9, 0.9, 0.9).unwrap();
        let mut b = token_at(2, [0.1, 0.0, 0.0]);
        b.set_coordinates(CoordinateSpace::Abstract, -0.9, -0.9, -0.9).unwrap();
        idx.insert(a).unwrap();
        idx.insert(b).unwrap();
        assert_eq!(idx.find_neighbors(1, P, 0.5, 5).unwrap().len(), 1);
        assert!(idx.find_neighbors(1, CoordinateSpace::Abstract, 0.5, 5).unwrap().is_empty());
    }

    #[test]
    fn test_range_query_large_radius_uses_full_scan() {
        let idx = index();
        for i in 0..20 {
            idx.insert(token_at(i, [i as f32 * 100.0, 0.0, 0.0])).unwrap();
        }
        let all = idx.range_query(P, 0.0, 0.0, 0.0, 10_000.0).unwrap();
        assert_eq!(all.len(), 20);
        assert!(all.windows(2).all(|w| w[0].1 <= w[1].1));
        assert!(idx.range_query(P, 0.0, 0.0, f32::NAN, 1.0).is_err());
    }

    #[test]
    fn test_density_empty_and_invalid_radius() {
        let idx = index();
        assert_eq!(idx.calculate_density(P, 0.0, 0.0, 0.0, 1.0).unwrap(), 0.0);
        assert_eq!(idx.calculate_density(P, 0.0, 0.0, 0.0, 0.0), Err(Error::InvalidRadius(0.0)));
        assert_eq!(idx.calculate_density(P, 0.0, 0.0, 0.0, -2.0), Err(Error::InvalidRadius(-2.0)));
    }

    #[test]
    fn test_density_uniform_sphere() {
        let idx = index();
        let mut rng = SmallRng::seed_from_u64(42);
        let r = 4.0f64;
        let n = 500;
        let mut placed = 0;
        while placed < n {
            let p: [f32; 3] = std::array::from_fn(|_| rng.random_range(-3.9f32..3.9));
            if euclidean(p, [0.0; 3]) < r - 0.01 {
                idx.insert(token_at(placed, p)).unwrap();
                placed += 1;
            }
        }
        let density = idx.calculate_density(P, 0.0, 0.0, 0.0, r).unwrap();
        assert_relative_eq!(density, n as f64 / (4.0 / 3.0 * PI * r.powi(3)), max_relative = 1e-9);
    }

    #[test]
    fn test_field_influence_linear_falloff() {
        let idx = index();
        let mut a = token_at(1, [1.0, 0.0, 0.0]);
        a.set_field_radius(2.0);
        a.set_field_strength(1.0);
        let mut b = token_at(2, [0.0, 0.5, 0.0]);
        b.set_field_radius(0.25);
        idx.insert(a).unwrap();
        idx.insert(b).unwrap();

        // a contributes 1.0 * (1 - 1/2), b's field does not reach the origin
        let f = idx.calculate_field_influence(P, 0.0, 0.0, 0.0, 5.0).unwrap();
        assert_relative_eq!(f, 0.5, epsilon = 1e-6);

        // query radius excludes a
        let f = idx.calculate_field_influence(P, 0.0, 0.0, 0.0, 0.9).unwrap();
        assert_eq!(f, 0.0);
    }

    #[test]
    fn test_concurrent_moves_keep_single_membership() {
        let idx = index();
        for id in 0..64 {
            idx.insert(token_at(id, [id as f32, 0.0, 0.0])).unwrap();
        }
        std::thread::scope(|s| {
            for worker in 0..4u32 {
                let idx = &idx;
                s.spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(worker as u64);
                    for _ in 0..500 {
                        let id = rng.random_range(0..64);
                        let p: [f32; 3] = std::array::from_fn(|_| rng.random_range(-20.0f32..20.0));
                        idx.set_coordinates(id, P, p[0], p[1], p[2]).unwrap();
                        let _ = idx.range_query(P, p[0], p[1], p[2], 3.0).unwrap();
                    }
                });
            }
        });
        for id in 0..64 {
            assert_eq!(idx.buckets_holding(P, id), 1, "token {id} membership broken");
            let p = idx.get(id).unwrap().get_coordinates(P).unwrap();
            assert!(idx.range_query(P, p[0], p[1], p[2], 0.0).unwrap().iter().any(|(i, _)| *i == id));
        }
        let total: usize = idx.occupied_buckets(P).iter().map(|(_, n)| n).sum();
        assert_eq!(total, 64);
    }

    proptest! {
        #[test]
        fn prop_neighbor_ordering(
            points in prop::collection::vec(prop::array::uniform3(-10.0f32..10.0), 2..60),
            radius in 0.0f64..15.0,
            max_results in 0usize..20,
        ) {
            let idx = index();
            for (i, p) in points.iter().enumerate() {
                idx.insert(token_at(i as TokenId, *p)).unwrap();
            }
            let hits = idx.find_neighbors(0, P, radius, max_results).unwrap();
            prop_assert!(hits.len() <= max_results);
            prop_assert!(hits.iter().all(|(id, d)| *id != 0 && *d <= radius));
            prop_assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));

            // matches a brute-force scan
            let mut brute: Vec<Neighbor> = points.iter().enumerate().skip(1)
                .map(|(i, p)| (i as TokenId, euclidean(points[0], *p)))
                .filter(|(_, d)| *d <= radius)
                .collect();
            brute.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            brute.truncate(max_results);
            prop_assert_eq!(hits, brute);
        }
    }
}
