//! Cache eviction bounds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Age and size bounds for every stream buffer in an [`EventCache`](crate::EventCache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Items older than this may be evicted even if nobody consumed them.
    #[serde(default = "default_data_max_age_in_cache", with = "humantime_serde")]
    pub data_max_age_in_cache: Duration,

    /// Items younger than this are never evicted, not even under pressure.
    #[serde(default = "default_data_min_time_in_cache", with = "humantime_serde")]
    pub data_min_time_in_cache: Duration,

    /// Soft cap on buffered items per stream.
    #[serde(default = "default_max_items_per_stream")]
    pub max_items_per_stream: Option<usize>,
}

fn default_data_max_age_in_cache() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_data_min_time_in_cache() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_items_per_stream() -> Option<usize> {
    Some(4096)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_max_age_in_cache: default_data_max_age_in_cache(),
            data_min_time_in_cache: default_data_min_time_in_cache(),
            max_items_per_stream: default_max_items_per_stream(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn with_max_age(mut self, age: Duration) -> Self {
        self.data_max_age_in_cache = age;
        self
    }

    #[must_use]
    pub fn with_min_time(mut self, time: Duration) -> Self {
        self.data_min_time_in_cache = time;
        self
    }

    #[must_use]
    pub fn with_max_items(mut self, max_items: Option<usize>) -> Self {
        self.max_items_per_stream = max_items;
        self
    }

    /// Check that the bounds can all hold at once.
    pub fn validate(&self) -> Result<()> {
        if self.data_max_age_in_cache < self.data_min_time_in_cache {
            return Err(Error::InvalidConfig(format!(
                "data_max_age_in_cache ({:?}) must be >= data_min_time_in_cache ({:?})",
                self.data_max_age_in_cache, self.data_min_time_in_cache
            )));
        }
        if self.max_items_per_stream == Some(0) {
            return Err(Error::InvalidConfig(
                "max_items_per_stream must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_values() {
        let config = CacheConfig::default();

        assert_eq!(config.data_max_age_in_cache, Duration::from_secs(1800));
        assert_eq!(config.data_min_time_in_cache, Duration::from_secs(300));
        assert_eq!(config.max_items_per_stream, Some(4096));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn equal_bounds_are_valid() {
        let config = CacheConfig::default()
            .with_max_age(Duration::from_secs(20))
            .with_min_time(Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn max_age_below_min_time_is_rejected() {
        let config = CacheConfig::default()
            .with_max_age(Duration::from_secs(10))
            .with_min_time(Duration::from_secs(20));

        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(err.to_string().contains("data_max_age_in_cache"));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = CacheConfig::default().with_max_items(Some(0));
        assert!(config.validate().is_err());
    }
}
