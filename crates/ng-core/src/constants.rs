/// Number of independent coordinate spaces (levels) a token can occupy.
pub const SPACE_COUNT: usize = 8;

/// Bound of the normalized coordinate spaces: [-NORMALIZED_BOUND, NORMALIZED_BOUND].
pub const NORMALIZED_BOUND: f32 = 1.0;

/// Fixed-point scale of `field_radius`: stored in hundredths.
pub const FIELD_RADIUS_SCALE: f32 = 100.0;

/// Fixed-point scale of `field_strength`: stored as a fraction of u16::MAX.
pub const FIELD_STRENGTH_SCALE: f32 = u16::MAX as f32;

/// Width of a priority bucket in the reflex signature.
pub const PRIORITY_BUCKET_WIDTH: u8 = 32;

/// Lock shards per coordinate space in the spatial index.
pub const BUCKET_SHARDS: usize = 64;

/// Lock shards of the authoritative token table.
pub const TOKEN_SHARDS: usize = 64;

/// Striped locks serializing slow-path classification of identical signals.
pub const CLASSIFY_STRIPES: usize = 256;

/// Above this many candidate buckets a range scan walks occupied buckets instead.
pub const MAX_CUBE_BUCKETS: u64 = 4096;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;
