use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::IndexConfig;
use crate::queue::BackpressurePolicy;
use crate::space::CoordinateSpace;

/// Router configuration. Every field has a default, so a partial TOML or
/// JSON document is enough.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Edge length of a spatial index bucket.
    pub bucket_size: f64,
    /// Tokens per unit volume for a bucket to be reported as a hotspot.
    pub density_threshold: f64,
    /// Minimum tokens in a hotspot.
    pub min_field_nodes: usize,
    /// Maximum number of tokens.
    pub capacity: usize,
    /// Ingestion queue capacity.
    pub channel_size: usize,
    /// What a full ingestion queue does with new signals.
    pub queue_policy: BackpressurePolicy,
    /// Period of the background analysis pass.
    pub analysis_interval_secs: u64,
    /// Reflex confidence required for a fast-path hit.
    pub min_confidence: f64,
    pub enable_fast_path: bool,
    /// Reflex table slots, rounded up to a power of two.
    pub fast_path_capacity: usize,
    /// Required signal vector length. The first three components place the
    /// signal in `signal_space`.
    pub vector_dim: usize,
    pub signal_space: CoordinateSpace,
    /// Distance at or below which a signal maps onto an existing token.
    pub novelty_threshold: f64,
    /// Neighbor query radius on the slow path.
    pub neighbor_radius: f64,
    /// Neighbor query cap on the slow path.
    pub max_neighbors: usize,
    /// When non-empty, the first event type segment must be one of these.
    pub allowed_namespaces: Vec<String>,
    /// Segments a `*` wildcard never expands over.
    pub reserved_segments: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let index = IndexConfig::default();
        Self {
            bucket_size: index.bucket_size,
            density_threshold: index.density_threshold,
            min_field_nodes: index.min_field_nodes,
            capacity: index.capacity,
            channel_size: 10_000,
            queue_policy: BackpressurePolicy::default(),
            analysis_interval_secs: 30,
            min_confidence: 0.8,
            enable_fast_path: true,
            fast_path_capacity: 4096,
            vector_dim: 3,
            signal_space: CoordinateSpace::Physical,
            novelty_threshold: 0.0,
            neighbor_radius: 1.0,
            max_neighbors: 10,
            allowed_namespaces: Vec::new(),
            reserved_segments: vec!["system".to_string()],
        }
    }
}

impl Config {
    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            bucket_size: self.bucket_size,
            density_threshold: self.density_threshold,
            min_field_nodes: self.min_field_nodes,
            capacity: self.capacity,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.index_config().validate()?;
        if self.channel_size == 0 {
            return Err(Error::Config("channel_size must be at least 1".into()));
        }
        if self.fast_path_capacity == 0 {
            return Err(Error::Config("fast_path_capacity must be at least 1".into()));
        }
        if self.vector_dim < 3 {
            return Err(Error::Config(format!(
                "vector_dim must be at least 3, got {}",
                self.vector_dim
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(Error::Config(format!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            )));
        }
        for (name, value) in [
            ("novelty_threshold", self.novelty_threshold),
            ("neighbor_radius", self.neighbor_radius),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::Config(format!("{name} must be non-negative, got {value}")));
            }
        }
        if self.analysis_interval_secs == 0 {
            return Err(Error::Config("analysis_interval_secs must be at least 1".into()));
        }
        Ok(())
    }
}
