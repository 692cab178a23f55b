use crate::space::CoordinateSpace;
use crate::subscription::SubscriptionId;
use crate::token::TokenId;

/// Every failure the core reports.
///
/// Validation errors are raised before any state changes. Not-found errors
/// are recoverable by the caller. Format errors only affect the single
/// decode call that produced them.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("coordinate {value} out of range [{min}, {max}] in space {space}")]
    OutOfRange {
        space: CoordinateSpace,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("invalid radius: {0}")]
    InvalidRadius(f64),

    #[error("invalid time step: {0}")]
    InvalidTimeStep(f64),

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("token not found: {0}")]
    TokenNotFound(TokenId),

    #[error("token {token} has no coordinates in space {space}")]
    MissingSpace {
        token: TokenId,
        space: CoordinateSpace,
    },

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("format error: {0}")]
    Format(String),

    #[error("token capacity exceeded ({0})")]
    CapacityExceeded(usize),

    #[error("ingestion queue full ({0})")]
    QueueFull(usize),

    #[error("ingestion queue closed")]
    QueueClosed,
}

impl Error {
    /// Unknown token, unknown subscription, or absent coordinate space.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TokenNotFound(_) | Self::MissingSpace { .. } | Self::SubscriptionNotFound(_)
        )
    }

    /// Rejected input that was never partially applied.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::OutOfRange { .. }
                | Self::InvalidRadius(_)
                | Self::InvalidTimeStep(_)
                | Self::InvalidSignal(_)
                | Self::Dimension { .. }
                | Self::InvalidFilter(_)
                | Self::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
