//! Concurrency tests for EventCache
//!
//! - Concurrent appends to one stream get dense, unique tokens
//! - Readers keep their batch while eviction runs underneath them

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pullstream_cache::{CacheConfig, Clock, Error, EventCache, ManualClock, SequenceToken, StreamId};

fn cache(config: CacheConfig) -> (Arc<EventCache<u64>>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let cache = Arc::new(EventCache::new(config, clock.clone()).unwrap());
    (cache, clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_get_dense_unique_tokens() {
    let (cache, _clock) = cache(CacheConfig::default().with_max_items(None));
    let stream = StreamId::random("ns");

    let mut handles = Vec::new();
    for writer in 0..8_u64 {
        let cache = Arc::clone(&cache);
        let stream = stream.clone();
        handles.push(tokio::spawn(async move {
            let mut tokens = Vec::new();
            for i in 0..100 {
                tokens.push(cache.append(&stream, writer * 1000 + i).await);
            }
            tokens
        }));
    }

    let mut all = BTreeSet::new();
    for handle in handles {
        let tokens = handle.await.unwrap();
        // Each writer sees its own appends in order
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
        all.extend(tokens);
    }

    assert_eq!(all.len(), 800);
    assert_eq!(all.first(), Some(&SequenceToken(0)));
    assert_eq!(all.last(), Some(&SequenceToken(799)));
    assert_eq!(cache.high_water_mark(&stream).await, SequenceToken(800));
}

#[tokio::test]
async fn batch_survives_eviction() {
    let config = CacheConfig::default()
        .with_max_age(Duration::from_secs(10))
        .with_min_time(Duration::from_secs(1));
    let (cache, clock) = cache(config);
    let stream = StreamId::random("ns");
    cache.append_batch(&stream, vec![1, 2, 3]).await;

    let batch = cache.read_from(&stream, SequenceToken(0), 10).await.unwrap();
    clock.advance(Duration::from_secs(11));
    assert_eq!(cache.evict(clock.now()).await, 3);

    let payloads: Vec<u64> = batch.iter().map(|item| item.payload).collect();
    assert_eq!(payloads, vec![1, 2, 3]);

    let err = cache
        .read_from(&stream, SequenceToken(0), 10)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TokenTooOld {
            low_water: SequenceToken(3),
            ..
        }
    ));
}

#[tokio::test]
async fn capacity_overflow_is_bounded_by_min_residency() {
    let config = CacheConfig::default()
        .with_max_age(Duration::from_secs(60))
        .with_min_time(Duration::from_secs(5))
        .with_max_items(Some(2));
    let (cache, clock) = cache(config);
    let stream = StreamId::random("ns");

    // All young: the cap is exceeded rather than evicting them
    cache.append_batch(&stream, vec![1, 2, 3, 4]).await;
    assert_eq!(cache.len(&stream).await, 4);

    clock.advance(Duration::from_secs(5));
    cache.append(&stream, 5).await;

    assert_eq!(cache.len(&stream).await, 2);
    assert_eq!(cache.low_water_mark(&stream).await, SequenceToken(3));
}
