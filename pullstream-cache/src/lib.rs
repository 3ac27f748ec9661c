//! In-memory stream cache for pullstream.
//!
//! This crate provides the storage half of the pulling delivery engine: a
//! per-stream, append-only buffer of published items bounded by age and size.
//! Readers pull forward from a [`SequenceToken`] cursor; items that were
//! evicted from under a cursor are reported as [`Error::TokenTooOld`] so the
//! caller can surface the gap instead of silently skipping it.
//!
//! # Key Types
//!
//! - [`EventCache`] - Per-stream buffers with append, read-forward and eviction
//! - [`CacheConfig`] - Max age, min residency and capacity bounds
//! - [`Clock`] - Injectable monotonic time source
//! - [`StreamId`], [`SequenceToken`], [`CachedItem`], [`CacheBatch`]

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// Re-exports
pub use cache::EventCache;
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use types::{CacheBatch, CachedItem, SequenceToken, StreamId};
