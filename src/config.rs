//! Process configuration for the feed.

use crate::error::{FeedError, Result};
use std::time::Duration;

/// Feed configuration.
#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// Store connection string (directory path for file-backed stores).
    pub connection: String,

    /// Collection whose operation log is watched.
    pub collection: String,

    /// Delay between polls when the log has nothing new.
    /// Default: 500ms
    pub retry_delay: Duration,

    /// Max undelivered messages per subscriber before the oldest is dropped.
    /// Default: 256
    pub subscriber_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            connection: "./store".to_string(),
            collection: "posts".to_string(),
            retry_delay: Duration::from_millis(500),
            subscriber_capacity: 256,
        }
    }
}

impl FeedConfig {
    pub const ENV_CONNECTION: &'static str = "FEED_STORE_URL";
    pub const ENV_COLLECTION: &'static str = "FEED_COLLECTION";
    pub const ENV_RETRY_DELAY_MS: &'static str = "FEED_RETRY_DELAY_MS";
    pub const ENV_SUBSCRIBER_CAPACITY: &'static str = "FEED_SUBSCRIBER_CAPACITY";

    /// Load from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(connection) = lookup(Self::ENV_CONNECTION) {
            config.connection = connection;
        }
        if let Some(collection) = lookup(Self::ENV_COLLECTION) {
            config.collection = collection;
        }
        if let Some(raw) = lookup(Self::ENV_RETRY_DELAY_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                FeedError::Config(format!(
                    "{} must be milliseconds, got {:?}",
                    Self::ENV_RETRY_DELAY_MS,
                    raw
                ))
            })?;
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup(Self::ENV_SUBSCRIBER_CAPACITY) {
            config.subscriber_capacity = raw.trim().parse().map_err(|_| {
                FeedError::Config(format!(
                    "{} must be a positive integer, got {:?}",
                    Self::ENV_SUBSCRIBER_CAPACITY,
                    raw
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.connection.is_empty() {
            return Err(FeedError::Config("connection string is empty".into()));
        }
        if self.collection.is_empty() {
            return Err(FeedError::Config("collection name is empty".into()));
        }
        if self.retry_delay.is_zero() {
            return Err(FeedError::Config("retry delay must be non-zero".into()));
        }
        if self.subscriber_capacity == 0 {
            return Err(FeedError::Config("subscriber capacity must be at least 1".into()));
        }
        Ok(())
    }
}
