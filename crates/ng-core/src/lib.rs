//! NeuroGraph core: spatially indexed tokens and a low-latency signal router.
//!
//! Tokens live at up to eight 3D coordinate spaces and are joined by typed
//! spring connections. A sharded bucket grid answers neighbor, range,
//! density and field queries per space. Incoming signals are classified onto
//! tokens through a two-tier path (a reflex table hit, or a novelty check
//! against the index) and fanned out to filter-matched subscribers.
//!
//! No I/O and no global state. The `ng` binary supplies transport.

pub mod analysis;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod filter;
pub mod graph;
pub mod index;
pub mod queue;
pub mod reflex;
pub mod router;
pub mod signal;
pub mod space;
pub mod stats;
pub mod subscription;
pub mod time;
pub mod token;

pub use analysis::{AnalysisHandle, AnalysisReport, Hotspot, find_hotspots};
pub use config::Config;
pub use connection::{Connection, ConnectionCategory, ConnectionType};
pub use error::{Error, Result};
pub use filter::{Filter, Pattern};
pub use graph::ConnectionGraph;
pub use index::{BucketKey, IndexConfig, IndexStats, Neighbor, SpatialIndex};
pub use queue::{BackpressurePolicy, IngestQueue, PushOutcome};
pub use reflex::{Reflex, ReflexTable, SignatureHasher};
pub use router::{EmitResult, Route, SignalRouter, WorkerReport};
pub use signal::{Signal, SignalEvent, normalize_event_type};
pub use space::CoordinateSpace;
pub use stats::{RouterStats, StatsSnapshot};
pub use subscription::{
    Callback, CallbackError, DispatchReport, SubscriptionId, SubscriptionInfo, SubscriptionRegistry,
};
pub use token::{EntityType, Token, TokenId};
