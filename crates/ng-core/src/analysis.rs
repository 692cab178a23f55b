//! Periodic analysis: bucket hotspots and reflex housekeeping.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::index::{BucketKey, SpatialIndex};
use crate::space::CoordinateSpace;

/// A bucket dense enough to be worth reporting.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Hotspot {
    pub space: CoordinateSpace,
    pub bucket: BucketKey,
    /// Geometric center of the bucket.
    pub center: [f64; 3],
    pub tokens: usize,
    /// Tokens per unit volume.
    pub density: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub hotspots: Vec<Hotspot>,
    pub pruned_reflexes: usize,
    pub reflexes: usize,
    pub tokens: usize,
}

/// Buckets of `space` holding at least `min_field_nodes` tokens at a density
/// of at least `density_threshold`, densest first.
pub fn find_hotspots(index: &SpatialIndex, space: CoordinateSpace) -> Vec<Hotspot> {
    let bs = index.bucket_size();
    let volume = bs.powi(3);
    let mut hotspots: Vec<Hotspot> = index
        .occupied_buckets(space)
        .into_iter()
        .filter(|(_, count)| *count >= index.min_field_nodes())
        .map(|(bucket, tokens)| Hotspot {
            space,
            bucket,
            center: bucket.map(|k| (k as f64 + 0.5) * bs),
            tokens,
            density: tokens as f64 / volume,
        })
        .filter(|h| h.density >= index.density_threshold())
        .collect();
    hotspots.sort_by(|a, b| b.density.total_cmp(&a.density).then(a.bucket.cmp(&b.bucket)));
    hotspots
}

struct Shared {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background periodic task. Stops on [`stop`](Self::stop) or drop.
pub struct AnalysisHandle {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl AnalysisHandle {
    /// Call `tick` every `interval` until stopped or until `tick` returns
    /// false.
    pub fn spawn<F>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let shared = Arc::new(Shared {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("ng-analysis".into())
            .spawn(move || {
                loop {
                    {
                        let mut stopped = worker.stopped.lock();
                        if !*stopped {
                            worker.wake.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    if !tick() {
                        break;
                    }
                }
                tracing::debug!("analysis thread exiting");
            });

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("failed to spawn analysis thread: {e}");
                None
            }
        };
        Self { shared, thread }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AnalysisHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
