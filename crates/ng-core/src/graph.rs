//! Typed connections between indexed tokens and the spring step that moves
//! them.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::connection::Connection;
use crate::constants::EPSILON;
use crate::error::{Error, Result};
use crate::index::SpatialIndex;
use crate::space::CoordinateSpace;
use crate::token::TokenId;

type EdgeKey = (TokenId, TokenId);

fn edge_key(c: &Connection) -> EdgeKey {
    if c.bidirectional {
        (c.token_a.min(c.token_b), c.token_a.max(c.token_b))
    } else {
        (c.token_a, c.token_b)
    }
}

#[derive(Default)]
pub struct ConnectionGraph {
    edges: RwLock<HashMap<EdgeKey, Connection>>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a connection. Both endpoints must exist in `index`.
    pub fn connect(&self, index: &SpatialIndex, connection: Connection) -> Result<Option<Connection>> {
        for id in [connection.token_a, connection.token_b] {
            if !index.contains(id) {
                return Err(Error::TokenNotFound(id));
            }
        }
        let key = edge_key(&connection);
        Ok(self.edges.write().insert(key, connection))
    }

    fn find_key(edges: &HashMap<EdgeKey, Connection>, from: TokenId, to: TokenId) -> Option<EdgeKey> {
        [(from, to), (to, from)]
            .into_iter()
            .find(|k| edges.get(k).is_some_and(|c| c.links(from, to)))
    }

    /// The connection traversable from `from` to `to`.
    pub fn get(&self, from: TokenId, to: TokenId) -> Option<Connection> {
        let edges = self.edges.read();
        Self::find_key(&edges, from, to).and_then(|k| edges.get(&k).cloned())
    }

    pub fn disconnect(&self, from: TokenId, to: TokenId) -> Option<Connection> {
        let mut edges = self.edges.write();
        let key = Self::find_key(&edges, from, to)?;
        edges.remove(&key)
    }

    /// Record a traversal; returns the new activation count.
    pub fn activate(&self, from: TokenId, to: TokenId) -> Option<u32> {
        let mut edges = self.edges.write();
        let key = Self::find_key(&edges, from, to)?;
        let c = edges.get_mut(&key)?;
        c.activate();
        Some(c.activation_count)
    }

    /// Every connection touching `id`, ordered by endpoints.
    pub fn connections_of(&self, id: TokenId) -> Vec<Connection> {
        let mut out: Vec<Connection> = self
            .edges
            .read()
            .values()
            .filter(|c| c.token_a == id || c.token_b == id)
            .cloned()
            .collect();
        out.sort_by_key(|c| (c.token_a, c.token_b));
        out
    }

    /// Drop every connection touching `id`.
    pub fn remove_token(&self, id: TokenId) -> usize {
        let mut edges = self.edges.write();
        let before = edges.len();
        edges.retain(|_, c| c.token_a != id && c.token_b != id);
        before - edges.len()
    }

    pub fn len(&self) -> usize {
        self.edges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move tokens along every active connection in `space` by
    /// `force * dt`, split over both endpoints. Positions in bounded spaces
    /// are clamped to the domain.
    ///
    /// Every endpoint is resolved and every target position checked before
    /// the first token moves, so a dangling endpoint or a missing coordinate
    /// leaves the index untouched. A token removed concurrently while moves
    /// are being applied is skipped; the others still move. Returns the
    /// number of tokens moved.
    pub fn step_forces(&self, index: &SpatialIndex, space: CoordinateSpace, dt: f64) -> Result<usize> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(Error::InvalidTimeStep(dt));
        }

        let edges: Vec<Connection> = self
            .edges
            .read()
            .values()
            .filter(|c| c.active && c.is_space_active(space))
            .cloned()
            .collect();

        let mut positions: HashMap<TokenId, [f64; 3]> = HashMap::new();
        for c in &edges {
            for id in [c.token_a, c.token_b] {
                if positions.contains_key(&id) {
                    continue;
                }
                let token = index.get(id).ok_or(Error::TokenNotFound(id))?;
                let p = token
                    .get_coordinates(space)
                    .ok_or(Error::MissingSpace { token: id, space })?;
                positions.insert(id, p.map(f64::from));
            }
        }

        let mut shift: HashMap<TokenId, [f64; 3]> = HashMap::new();
        for c in &edges {
            let (pa, pb) = (positions[&c.token_a], positions[&c.token_b]);
            let delta: [f64; 3] = std::array::from_fn(|i| pb[i] - pa[i]);
            let d = delta.iter().map(|v| v * v).sum::<f64>().sqrt();
            if d < EPSILON {
                continue;
            }
            // half the displacement to each endpoint, along a -> b
            let step = c.calculate_force(d) * dt / 2.0 / d;
            let sa = shift.entry(c.token_a).or_insert([0.0; 3]);
            for i in 0..3 {
                sa[i] += delta[i] * step;
            }
            let sb = shift.entry(c.token_b).or_insert([0.0; 3]);
            for i in 0..3 {
                sb[i] -= delta[i] * step;
            }
        }

        let mut moves: Vec<(TokenId, [f32; 3])> = Vec::with_capacity(shift.len());
        for (id, s) in shift {
            let p = positions[&id];
            let mut next: [f32; 3] = std::array::from_fn(|i| (p[i] + s[i]) as f32);
            if let Some((lo, hi)) = space.bounds() {
                next = next.map(|v| v.clamp(lo, hi));
            }
            space.validate_point(next)?;
            moves.push((id, next));
        }
        moves.sort_by_key(|(id, _)| *id);

        let mut moved = 0;
        for &(id, [x, y, z]) in &moves {
            match index.set_coordinates(id, space, x, y, z) {
                Ok(()) => moved += 1,
                Err(Error::TokenNotFound(_)) => tracing::debug!(id, "token removed during force step"),
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(space = %space, edges = edges.len(), moved, "force step");
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::connection::ConnectionType;
    use crate::index::IndexConfig;
    use crate::token::Token;

    fn index_with(points: &[(TokenId, CoordinateSpace, [f32; 3])]) -> SpatialIndex {
        let index = SpatialIndex::new(IndexConfig::default()).unwrap();
        for &(id, space, [x, y, z]) in points {
            let mut t = index.get(id).unwrap_or_else(|| Token::new(id));
            t.set_coordinates(space, x, y, z).unwrap();
            index.insert(t).unwrap();
        }
        index
    }

    #[test]
    fn test_connect_requires_tokens() {
        let index = index_with(&[(1, CoordinateSpace::Physical, [0.0; 3])]);
        let graph = ConnectionGraph::new();
        let err = graph
            .connect(&index, Connection::new(1, 2, ConnectionType::Synonym))
            .unwrap_err();
        assert_eq!(err, Error::TokenNotFound(2));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_bidirectional_lookup_either_way() {
        let index = index_with(&[(1, CoordinateSpace::Physical, [0.0; 3]), (2, CoordinateSpace::Physical, [1.0; 3])]);
        let graph = ConnectionGraph::new();
        graph
            .connect(&index, Connection::new(2, 1, ConnectionType::Synonym))
            .unwrap();
        assert!(graph.get(1, 2).is_some());
        assert!(graph.get(2, 1).is_some());
        // same pair replaces
        let prev = graph
            .connect(&index, Connection::new(1, 2, ConnectionType::Antonym))
            .unwrap();
        assert!(prev.is_some());
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.activate(2, 1), Some(1));
        assert_eq!(graph.activate(1, 2), Some(2));
        assert!(graph.disconnect(2, 1).is_some());
        assert!(graph.is_empty());
    }

    #[test]
    fn test_directed_only_forward() {
        let index = index_with(&[(1, CoordinateSpace::Physical, [0.0; 3]), (2, CoordinateSpace::Physical, [1.0; 3])]);
        let graph = ConnectionGraph::new();
        graph
            .connect(&index, Connection::new(1, 2, ConnectionType::Cause).directed())
            .unwrap();
        assert!(graph.get(1, 2).is_some());
        assert!(graph.get(2, 1).is_none());
        assert!(graph.disconnect(2, 1).is_none());
        assert_eq!(graph.connections_of(2).len(), 1);
        assert_eq!(graph.remove_token(2), 1);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_step_reaches_equilibrium() {
        let index = index_with(&[(1, CoordinateSpace::Physical, [0.0; 3]), (2, CoordinateSpace::Physical, [3.0, 0.0, 0.0])]);
        let graph = ConnectionGraph::new();
        graph
            .connect(&index, Connection::new(1, 2, ConnectionType::Synonym))
            .unwrap();

        // force 2 at distance 3, dt 1: each endpoint moves 1 toward the other
        assert_eq!(graph.step_forces(&index, CoordinateSpace::Physical, 1.0).unwrap(), 2);
        let a = index.get(1).unwrap();
        let b = index.get(2).unwrap();
        assert_relative_eq!(a.get_coordinates(CoordinateSpace::Physical).unwrap()[0], 1.0);
        assert_relative_eq!(b.get_coordinates(CoordinateSpace::Physical).unwrap()[0], 2.0);
        assert_relative_eq!(a.distance_to(&b, CoordinateSpace::Physical).unwrap(), 1.0, epsilon = 1e-6);

        // at equilibrium nothing moves further
        graph.step_forces(&index, CoordinateSpace::Physical, 1.0).unwrap();
        assert_relative_eq!(
            index.get(1).unwrap().get_coordinates(CoordinateSpace::Physical).unwrap()[0],
            1.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_step_pushes_apart_inside_equilibrium() {
        let index = index_with(&[(1, CoordinateSpace::Physical, [0.0; 3]), (2, CoordinateSpace::Physical, [0.5, 0.0, 0.0])]);
        let graph = ConnectionGraph::new();
        graph
            .connect(&index, Connection::new(1, 2, ConnectionType::Synonym).with_spring(1.0, 2.0, 1.0))
            .unwrap();
        graph.step_forces(&index, CoordinateSpace::Physical, 0.5).unwrap();
        let a = index.get(1).unwrap();
        let b = index.get(2).unwrap();
        assert!(a.distance_to(&b, CoordinateSpace::Physical).unwrap() > 0.5);
    }

    #[test]
    fn test_step_clamps_bounded_space() {
        let index = index_with(&[(1, CoordinateSpace::Social, [-0.9, 0.0, 0.0]), (2, CoordinateSpace::Social, [0.9, 0.0, 0.0])]);
        let graph = ConnectionGraph::new();
        graph
            .connect(&index, Connection::new(1, 2, ConnectionType::Synonym).with_spring(1.0, 10.0, 1.0))
            .unwrap();
        graph.step_forces(&index, CoordinateSpace::Social, 1.0).unwrap();
        let a = index.get(1).unwrap().get_coordinates(CoordinateSpace::Social).unwrap();
        let b = index.get(2).unwrap().get_coordinates(CoordinateSpace::Social).unwrap();
        assert_eq!(a[0], -1.0);
        assert_eq!(b[0], 1.0);
    }

    #[test]
    fn test_dangling_endpoint_moves_nothing() {
        let index = index_with(&[
            (1, CoordinateSpace::Physical, [0.0; 3]),
            (2, CoordinateSpace::Physical, [3.0, 0.0, 0.0]),
            (3, CoordinateSpace::Physical, [0.0, 3.0, 0.0]),
        ]);
        let graph = ConnectionGraph::new();
        graph
            .connect(&index, Connection::new(1, 2, ConnectionType::Synonym))
            .unwrap();
        graph
            .connect(&index, Connection::new(2, 3, ConnectionType::Synonym))
            .unwrap();
        index.remove(3);

        let err = graph.step_forces(&index, CoordinateSpace::Physical, 1.0).unwrap_err();
        assert_eq!(err, Error::TokenNotFound(3));
        assert_eq!(index.get(1).unwrap().get_coordinates(CoordinateSpace::Physical), Some([0.0; 3]));
        assert_eq!(
            index.get(2).unwrap().get_coordinates(CoordinateSpace::Physical),
            Some([3.0, 0.0, 0.0])
        );
    }

    #[test]
    fn test_inactive_level_ignored() {
        let index = index_with(&[(1, CoordinateSpace::Physical, [0.0; 3]), (2, CoordinateSpace::Physical, [3.0, 0.0, 0.0])]);
        let graph = ConnectionGraph::new();
        let mut c = Connection::new(1, 2, ConnectionType::Synonym);
        c.set_level_active(CoordinateSpace::Physical.index(), false);
        graph.connect(&index, c).unwrap();
        assert_eq!(graph.step_forces(&index, CoordinateSpace::Physical, 1.0).unwrap(), 0);
    }

    #[test]
    fn test_bad_time_step() {
        let index = index_with(&[(1, CoordinateSpace::Physical, [0.0; 3])]);
        let graph = ConnectionGraph::new();
        for dt in [-1.0, f64::INFINITY] {
            assert_eq!(
                graph.step_forces(&index, CoordinateSpace::Physical, dt),
                Err(Error::InvalidTimeStep(dt))
            );
        }
        assert!(matches!(
            graph.step_forces(&index, CoordinateSpace::Physical, f64::NAN),
            Err(Error::InvalidTimeStep(_))
        ));
    }

    #[test]
    fn test_step_tolerates_concurrent_removal() {
        let points: Vec<_> = (1..=40)
            .map(|id| (id, CoordinateSpace::Physical, [id as f32 * 2.0, 0.0, 0.0]))
            .collect();
        let index = index_with(&points);
        let graph = ConnectionGraph::new();
        for id in 1..40 {
            graph
                .connect(&index, Connection::new(id, id + 1, ConnectionType::Synonym))
                .unwrap();
        }

        std::thread::scope(|s| {
            s.spawn(|| {
                for id in (2..=40).step_by(2) {
                    index.remove(id);
                }
            });
            for _ in 0..50 {
                match graph.step_forces(&index, CoordinateSpace::Physical, 0.01) {
                    Ok(_) | Err(Error::TokenNotFound(_)) => {}
                    Err(e) => panic!("unexpected step error: {e}"),
                }
            }
        });

        // survivors stay indexed and placed
        for id in (1..=39).step_by(2) {
            assert!(index.get(id).unwrap().get_coordinates(CoordinateSpace::Physical).is_some());
        }
        assert_eq!(index.len(), 20);
    }
}
