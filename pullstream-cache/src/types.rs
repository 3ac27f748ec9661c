//! Core value types shared by the cache and its readers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Identifies one ordered item sequence: a namespace plus a unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    namespace: String,
    key: Uuid,
}

impl StreamId {
    /// Create a stream id from a namespace and key.
    pub fn new(namespace: impl Into<String>, key: Uuid) -> Self {
        Self {
            namespace: namespace.into(),
            key,
        }
    }

    /// Create a stream id with a fresh random key.
    pub fn random(namespace: impl Into<String>) -> Self {
        Self::new(namespace, Uuid::new_v4())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key(&self) -> Uuid {
        self.key
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// Position of an item within a stream.
///
/// Tokens are assigned densely from zero per stream, so `token.next()` is the
/// position of the item appended right after `token`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SequenceToken(pub u64);

impl SequenceToken {
    /// The position of the very first item of every stream.
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Number of positions between `self` and a later token.
    #[must_use]
    pub fn distance_to(self, later: Self) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A published item as held by the cache. Immutable after insertion.
#[derive(Debug)]
pub struct CachedItem<P> {
    pub stream: StreamId,
    pub payload: P,
    pub token: SequenceToken,
    pub enqueued_at: Instant,
}

/// A batch of items returned from a cache read, oldest first.
///
/// The batch owns shared handles to the items, so it can be iterated any
/// number of times after the cache has moved on.
#[derive(Debug)]
pub struct CacheBatch<P> {
    items: Vec<Arc<CachedItem<P>>>,
}

impl<P> CacheBatch<P> {
    pub(crate) fn new(items: Vec<Arc<CachedItem<P>>>) -> Self {
        Self { items }
    }

    /// Create an empty batch.
    #[must_use]
    pub fn empty() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn first_token(&self) -> Option<SequenceToken> {
        self.items.first().map(|item| item.token)
    }

    pub fn last_token(&self) -> Option<SequenceToken> {
        self.items.last().map(|item| item.token)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CachedItem<P>>> {
        self.items.iter()
    }
}

impl<P> IntoIterator for CacheBatch<P> {
    type Item = Arc<CachedItem<P>>;
    type IntoIter = std::vec::IntoIter<Arc<CachedItem<P>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_displays_namespace_and_key() {
        let id = StreamId::new("ns-1", Uuid::nil());
        assert_eq!(id.to_string(), "ns-1/00000000-0000-0000-0000-000000000000");
        assert_eq!(id.namespace(), "ns-1");
    }

    #[test]
    fn random_stream_ids_differ() {
        assert_ne!(StreamId::random("ns"), StreamId::random("ns"));
    }

    #[test]
    fn sequence_tokens_are_ordered() {
        let a = SequenceToken(4);
        assert!(a < a.next());
        assert_eq!(a.distance_to(SequenceToken(9)), 5);
        assert_eq!(SequenceToken(9).distance_to(a), 0);
    }
}
