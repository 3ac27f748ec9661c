//! Error types for the stream cache.

use crate::types::{SequenceToken, StreamId};

/// Error type for cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The requested position was evicted; reading must restart at `low_water`.
    #[error("token {requested} on stream {stream} is below the low-water mark {low_water}")]
    TokenTooOld {
        stream: StreamId,
        requested: SequenceToken,
        low_water: SequenceToken,
    },

    /// Cache bounds contradict each other.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
