//! Error types for pullstream-core

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::ConsumerId;
use pullstream_cache::StreamId;

/// Top-level error type for pullstream-core
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] pullstream_cache::Error),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Stream provider has shut down")]
    ShutDown,
}

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl From<pullstream_cache::Error> for ConfigError {
    fn from(error: pullstream_cache::Error) -> Self {
        match error {
            pullstream_cache::Error::InvalidConfig(message) => Self::Invalid(message),
            other => Self::Invalid(other.to_string()),
        }
    }
}

/// Errors from the subscription registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No subscription for consumer {consumer} on stream {stream}")]
    UnknownSubscription {
        stream: StreamId,
        consumer: ConsumerId,
    },
}

/// A consumer rejected or failed to acknowledge a pushed item
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Consumer push failed: {0}")]
pub struct PushError(pub String);

impl PushError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type alias for pullstream-core
pub type Result<T> = std::result::Result<T, StreamError>;
