//! Signal routing: validation, two-tier classification, subscriber fan-out.
//!
//! ```text
//! emit ─► validate ─► reflex lookup ──hit──────────────────────┐
//!                         │ miss                               │
//!                         ▼                                    ▼
//!             stripe lock ─► novelty check ─► create / move ─► neighbors
//!                                                              │
//!                                  record reflex ◄─────────────┤
//!                                                              ▼
//!                                               stats ─► dispatch ─► result
//! ```
//!
//! The router is an ordinary value: construct it, share it behind an `Arc`,
//! drop it to shut down. Nothing is global.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::analysis::{self, AnalysisHandle, AnalysisReport};
use crate::config::Config;
use crate::constants::CLASSIFY_STRIPES;
use crate::error::{Error, Result};
use crate::index::{Neighbor, SpatialIndex};
use crate::queue::{IngestQueue, PushOutcome};
use crate::reflex::{ReflexTable, SignatureHasher};
use crate::signal::{Signal, SignalEvent, normalize_event_type};
use crate::space::CoordinateSpace;
use crate::stats::{RouterStats, StatsSnapshot};
use crate::subscription::{CallbackError, SubscriptionId, SubscriptionInfo, SubscriptionRegistry};
use crate::time::now_unix_millis;
use crate::token::{EntityType, Token, TokenId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Fast,
    Slow,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EmitResult {
    pub token_id: TokenId,
    pub is_novel: bool,
    pub route: Route,
    pub neighbors: Vec<Neighbor>,
    /// Validation plus classification. Subscriber dispatch is not included.
    pub processing_time_us: f64,
}

/// What a worker did before its queue closed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub processed: u64,
    pub failed: u64,
}

pub struct SignalRouter {
    config: Config,
    index: Arc<SpatialIndex>,
    reflexes: ReflexTable,
    registry: SubscriptionRegistry,
    stats: RouterStats,
    next_id: AtomicU32,
    stripes: Box<[Mutex<()>]>,
    hasher: SignatureHasher,
}

impl SignalRouter {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let index = SpatialIndex::new(config.index_config())?;
        tracing::info!(
            space = %config.signal_space,
            bucket_size = config.bucket_size,
            capacity = config.capacity,
            fast_path = config.enable_fast_path,
            "router started"
        );
        Ok(Self {
            index: Arc::new(index),
            reflexes: ReflexTable::new(config.fast_path_capacity, config.min_confidence),
            registry: SubscriptionRegistry::new(config.reserved_segments.clone()),
            stats: RouterStats::new(),
            next_id: AtomicU32::new(1),
            stripes: (0..CLASSIFY_STRIPES).map(|_| Mutex::new(())).collect(),
            hasher: SignatureHasher::new(config.novelty_threshold),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<SpatialIndex> {
        &self.index
    }

    pub fn reflexes(&self) -> &ReflexTable {
        &self.reflexes
    }

    // --- Emission ---

    pub fn emit(&self, event_type: &str, vector: &[f32], priority: u8) -> Result<EmitResult> {
        self.route(event_type, vector, priority, now_unix_millis())
    }

    /// Emit a queued or deserialized signal, keeping its timestamp.
    pub fn emit_signal(&self, signal: &Signal) -> Result<EmitResult> {
        self.route(&signal.event_type, &signal.vector, signal.priority, signal.timestamp_ms)
    }

    fn route(&self, raw_type: &str, vector: &[f32], priority: u8, timestamp_ms: u64) -> Result<EmitResult> {
        let started = Instant::now();
        let event_type = normalize_event_type(raw_type, &self.config.allowed_namespaces)?;
        let point = self.placement(vector)?;
        let signature = self.hasher.signature(&event_type, priority, vector);

        let reflex = if self.config.enable_fast_path {
            self.reflexes.lookup(signature)
        } else {
            None
        };

        let (result, elapsed) = match reflex {
            Some(reflex) => {
                let elapsed = started.elapsed();
                let result = EmitResult {
                    token_id: reflex.token_id,
                    is_novel: false,
                    route: Route::Fast,
                    neighbors: reflex.neighbors.to_vec(),
                    processing_time_us: 0.0,
                };
                (result, elapsed)
            }
            None => {
                let (token_id, is_novel) = self.classify(point)?;
                let neighbors = self.neighbors_of(token_id, point)?;
                if self.config.enable_fast_path {
                    self.record_reflex(signature, token_id, &neighbors);
                }
                let elapsed = started.elapsed();
                tracing::debug!(
                    event_type = %event_type,
                    token_id,
                    is_novel,
                    neighbors = neighbors.len(),
                    "slow path"
                );
                let result = EmitResult {
                    token_id,
                    is_novel,
                    route: Route::Slow,
                    neighbors,
                    processing_time_us: 0.0,
                };
                (result, elapsed)
            }
        };

        let fast_path = result.route == Route::Fast;
        self.stats
            .record_event(&event_type, fast_path, result.is_novel, elapsed.as_nanos() as u64);

        let event = SignalEvent {
            event_type: &event_type,
            vector,
            priority,
            timestamp_ms,
            token_id: result.token_id,
            is_novel: result.is_novel,
            fast_path,
        };
        let report = self.registry.dispatch(&event);
        self.stats.record_dispatch(&report);

        Ok(EmitResult {
            processing_time_us: elapsed.as_secs_f64() * 1e6,
            ..result
        })
    }

    /// Check the vector and return its placement point in the signal space.
    fn placement(&self, vector: &[f32]) -> Result<[f32; 3]> {
        if vector.len() != self.config.vector_dim {
            return Err(Error::Dimension {
                expected: self.config.vector_dim,
                got: vector.len(),
            });
        }
        if let Some(bad) = vector[3..].iter().find(|v| !v.is_finite()) {
            return Err(Error::InvalidSignal(format!("non-finite vector component {bad}")));
        }
        let point = [vector[0], vector[1], vector[2]];
        self.config.signal_space.validate_point(point)?;
        Ok(point)
    }

    /// Cache a slow-path outcome, then confirm every token it names still
    /// exists. `delete_token` removes from the index before invalidating, so
    /// a token missing here may have been deleted after its invalidation
    /// swept the table; drop what was just recorded.
    fn record_reflex(&self, signature: u64, token_id: TokenId, neighbors: &[Neighbor]) {
        let confidence = self.reflexes.record(signature, token_id, neighbors);
        let ids = std::iter::once(token_id).chain(neighbors.iter().map(|(n, _)| *n));
        for id in ids {
            if !self.index.contains(id) {
                let invalidated = self.reflexes.invalidate_token(id);
                tracing::debug!(id, invalidated, "reflex named a deleted token");
                return;
            }
        }
        tracing::trace!(signature, token_id, confidence, "reflex recorded");
    }

    /// Stripes guarding classification of `point`, ascending: its grid
    /// cell and every adjacent one. Two points within the novelty threshold
    /// of each other sit in the same or adjacent cells, so they always share
    /// at least one stripe.
    fn classify_stripes(&self, point: [f32; 3]) -> Vec<usize> {
        let n = self.stripes.len() as u64;
        if self.config.novelty_threshold <= 0.0 {
            return vec![(self.hasher.cell(&point) % n) as usize];
        }
        let [cx, cy, cz] = self.hasher.grid_cell(point);
        let mut stripes = Vec::with_capacity(27);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let cell = [cx.saturating_add(dx), cy.saturating_add(dy), cz.saturating_add(dz)];
                    stripes.push((self.hasher.cell_key(cell) % n) as usize);
                }
            }
        }
        stripes.sort_unstable();
        stripes.dedup();
        stripes
    }

    /// Map a point onto an existing token within the novelty threshold or
    /// create a new one. Concurrent signals within the threshold of each
    /// other serialize on a shared stripe, so they resolve to one token.
    fn classify(&self, point: [f32; 3]) -> Result<(TokenId, bool)> {
        let space = self.config.signal_space;
        let _guards: Vec<_> = self
            .classify_stripes(point)
            .into_iter()
            .map(|s| self.stripes[s].lock())
            .collect();

        if let Some((id, _)) = self.index.nearest(space, point, self.config.novelty_threshold)? {
            let [x, y, z] = point;
            let moved = self.index.update(id, |t| {
                t.set_coordinates(space, x, y, z)?;
                t.set_weight(t.weight() + 1.0);
                t.set_active(true);
                Ok(())
            });
            match moved {
                Ok(_) => return Ok((id, false)),
                // deleted since the lookup; fall through and create
                Err(Error::TokenNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let token = self.new_token(EntityType::Event, &[(space, point)])?;
        let id = token.id();
        self.index.insert(token)?;
        Ok((id, true))
    }

    fn neighbors_of(&self, id: TokenId, point: [f32; 3]) -> Result<Vec<Neighbor>> {
        let [x, y, z] = point;
        let mut neighbors = self
            .index
            .range_query(self.config.signal_space, x, y, z, self.config.neighbor_radius)?;
        neighbors.retain(|(n, _)| *n != id);
        neighbors.truncate(self.config.max_neighbors);
        Ok(neighbors)
    }

    fn new_token(&self, entity_type: EntityType, placements: &[(CoordinateSpace, [f32; 3])]) -> Result<Token> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut token = Token::new(id).with_entity_type(entity_type);
        for &(space, [x, y, z]) in placements {
            token.set_coordinates(space, x, y, z)?;
        }
        Ok(token)
    }

    // --- Subscriptions ---

    pub fn subscribe<F>(&self, name: &str, filter: &Value, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&SignalEvent<'_>) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.registry.subscribe(name, filter, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscriber_count()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.list()
    }

    pub fn subscription(&self, id: SubscriptionId) -> Result<SubscriptionInfo> {
        self.registry.get(id)
    }

    // --- Stats ---

    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
        tracing::debug!("stats reset");
    }

    // --- Tokens ---

    /// Create a token with a fresh id, placed in every listed space. Nothing
    /// is inserted if a coordinate is invalid.
    pub fn create_token(&self, entity_type: EntityType, placements: &[(CoordinateSpace, [f32; 3])]) -> Result<Token> {
        let token = self.new_token(entity_type, placements)?;
        self.index.insert(token.clone())?;
        tracing::debug!(id = token.id(), entity_type = entity_type.as_str(), "token created");
        Ok(token)
    }

    pub fn get_token(&self, id: TokenId) -> Result<Token> {
        self.index.get(id).ok_or(Error::TokenNotFound(id))
    }

    /// Edit a token in place. Cached reflexes that mention it are dropped,
    /// since its position or neighbors may have changed.
    pub fn update_token<F>(&self, id: TokenId, f: F) -> Result<Token>
    where
        F: FnOnce(&mut Token) -> Result<()>,
    {
        let token = self.index.update(id, f)?;
        self.reflexes.invalidate_token(id);
        Ok(token)
    }

    pub fn delete_token(&self, id: TokenId) -> Result<Token> {
        let token = self.index.remove(id).ok_or(Error::TokenNotFound(id))?;
        let invalidated = self.reflexes.invalidate_token(id);
        tracing::debug!(id, invalidated, "token deleted");
        Ok(token)
    }

    pub fn query_neighbors(
        &self,
        id: TokenId,
        space: CoordinateSpace,
        radius: f64,
        max_results: usize,
    ) -> Result<Vec<Neighbor>> {
        self.index.find_neighbors(id, space, radius, max_results)
    }

    // --- Ingestion ---

    /// Push onto `queue`, accounting for backpressure. A displaced signal is
    /// counted as dropped; a rejected one is counted and returned as an error.
    pub fn submit(&self, queue: &IngestQueue, signal: Signal) -> Result<()> {
        match queue.push(signal) {
            Ok(PushOutcome::Queued) => Ok(()),
            Ok(PushOutcome::Displaced(old)) => {
                self.stats.record_dropped();
                tracing::warn!(event_type = %old.event_type, "queue full, dropped oldest signal");
                Ok(())
            }
            Err(e @ Error::QueueFull(_)) => {
                self.stats.record_rejected();
                tracing::warn!("queue full, signal rejected");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Drain `queue` until it is closed and empty.
    pub fn run_worker(&self, queue: &IngestQueue) -> WorkerReport {
        let mut report = WorkerReport::default();
        while let Some(signal) = queue.pop() {
            match self.emit_signal(&signal) {
                Ok(_) => report.processed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(event_type = %signal.event_type, "signal failed: {e}");
                }
            }
        }
        tracing::debug!(processed = report.processed, failed = report.failed, "worker finished");
        report
    }

    // --- Analysis ---

    /// Report hotspots in the signal space and drop reflexes that fell
    /// below the confidence floor.
    pub fn analyze(&self) -> AnalysisReport {
        let hotspots = analysis::find_hotspots(&self.index, self.config.signal_space);
        let pruned_reflexes = self.reflexes.prune();
        let report = AnalysisReport {
            hotspots,
            pruned_reflexes,
            reflexes: self.reflexes.len(),
            tokens: self.index.len(),
        };
        tracing::info!(
            hotspots = report.hotspots.len(),
            pruned = report.pruned_reflexes,
            reflexes = report.reflexes,
            tokens = report.tokens,
            "analysis pass"
        );
        report
    }

    /// Run [`analyze`](Self::analyze) every `analysis_interval_secs` on a
    /// background thread until the handle is stopped or the router dropped.
    pub fn spawn_analysis(self: &Arc<Self>) -> AnalysisHandle {
        let interval = std::time::Duration::from_secs(self.config.analysis_interval_secs);
        let router = Arc::downgrade(self);
        AnalysisHandle::spawn(interval, move || match router.upgrade() {
            Some(router) => {
                router.analyze();
                true
            }
            None => false,
        })
    }
}
