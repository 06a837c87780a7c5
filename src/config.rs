//! Runtime configuration for query execution and batch coordination.

use std::env;
use std::time::Duration;

/// Store-imposed ceiling on keys per `BatchGetItem` call
pub const MAX_READ_CHUNK: usize = 100;

/// Store-imposed ceiling on requests per `BatchWriteItem` call
pub const MAX_WRITE_CHUNK: usize = 25;

/// Default number of chunk calls kept in flight by the batch coordinator
pub const DEFAULT_BATCH_CONCURRENCY: usize = 10;

/// Retry configuration for DynamoDB operations
///
/// Backoff is exponential: `initial_delay * 2^attempt`, capped at `max_delay`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call
    pub max_retries: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Treat an error-free but empty result as retry-eligible
    ///
    /// Compensates for eventually consistent reads that have not caught up yet.
    /// Off unless explicitly enabled, since it also delays genuine
    /// "nothing matched" outcomes.
    pub retry_on_empty: bool,
}

impl RetryConfig {
    /// A policy that never retries
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
            retry_on_empty: false,
        }
    }

    /// Exponential backoff policy with the given retry budget
    pub const fn exponential(max_retries: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            retry_on_empty: false,
        }
    }

    /// Enable or disable the retry-on-empty policy
    #[must_use]
    pub const fn with_retry_on_empty(mut self, enabled: bool) -> Self {
        self.retry_on_empty = enabled;
        self
    }

    /// Default policy applied to unprocessed batch items
    pub const fn batch_default() -> Self {
        Self::exponential(2, Duration::from_millis(100), Duration::from_millis(2000))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::none()
    }
}

/// Handle-wide settings shared by every query and batch issued through a [`crate::Db`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbConfig {
    /// Per-call `Limit` used when a query does not set one
    pub default_page_size: Option<i32>,
    /// Retry policy wrapping query and scan terminals
    pub query_retry: RetryConfig,
    /// Retry policy for unprocessed batch items
    pub batch_retry: RetryConfig,
    /// Keys per `BatchGetItem` call, never above [`MAX_READ_CHUNK`]
    pub read_chunk_size: usize,
    /// Requests per `BatchWriteItem` call, never above [`MAX_WRITE_CHUNK`]
    pub write_chunk_size: usize,
    /// Chunk calls in flight at once
    pub batch_concurrency: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            default_page_size: None,
            query_retry: RetryConfig::none(),
            batch_retry: RetryConfig::batch_default(),
            read_chunk_size: MAX_READ_CHUNK,
            write_chunk_size: MAX_WRITE_CHUNK,
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
        }
    }
}

impl DbConfig {
    /// Create configuration from `DYNAMO_QUERY_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `DYNAMO_QUERY_PAGE_SIZE` | `default_page_size` |
    /// | `DYNAMO_QUERY_MAX_RETRIES` | `query_retry.max_retries` |
    /// | `DYNAMO_QUERY_RETRY_INITIAL_MS` | `query_retry.initial_delay` |
    /// | `DYNAMO_QUERY_RETRY_MAX_MS` | `query_retry.max_delay` |
    /// | `DYNAMO_QUERY_RETRY_ON_EMPTY` | `query_retry.retry_on_empty` |
    /// | `DYNAMO_QUERY_BATCH_MAX_RETRIES` | `batch_retry.max_retries` |
    /// | `DYNAMO_QUERY_READ_CHUNK` | `read_chunk_size` |
    /// | `DYNAMO_QUERY_WRITE_CHUNK` | `write_chunk_size` |
    /// | `DYNAMO_QUERY_BATCH_CONCURRENCY` | `batch_concurrency` |
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`DbConfig::from_env`], reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let query_retry = RetryConfig {
            max_retries: number("DYNAMO_QUERY_MAX_RETRIES")
                .map_or(defaults.query_retry.max_retries, |v| v as usize),
            initial_delay: number("DYNAMO_QUERY_RETRY_INITIAL_MS")
                .map_or(defaults.query_retry.initial_delay, Duration::from_millis),
            max_delay: number("DYNAMO_QUERY_RETRY_MAX_MS")
                .map_or(defaults.query_retry.max_delay, Duration::from_millis),
            retry_on_empty: lookup("DYNAMO_QUERY_RETRY_ON_EMPTY")
                .map_or(defaults.query_retry.retry_on_empty, |v| parse_bool(&v)),
        };

        let batch_retry = RetryConfig {
            max_retries: number("DYNAMO_QUERY_BATCH_MAX_RETRIES")
                .map_or(defaults.batch_retry.max_retries, |v| v as usize),
            ..defaults.batch_retry.clone()
        };

        Self {
            default_page_size: number("DYNAMO_QUERY_PAGE_SIZE")
                .and_then(|v| i32::try_from(v).ok())
                .filter(|v| *v > 0),
            query_retry,
            batch_retry,
            read_chunk_size: number("DYNAMO_QUERY_READ_CHUNK")
                .map_or(defaults.read_chunk_size, |v| v as usize),
            write_chunk_size: number("DYNAMO_QUERY_WRITE_CHUNK")
                .map_or(defaults.write_chunk_size, |v| v as usize),
            batch_concurrency: number("DYNAMO_QUERY_BATCH_CONCURRENCY")
                .map_or(defaults.batch_concurrency, |v| v as usize),
        }
        .clamped()
    }

    /// Clamp chunk sizes into `1..=ceiling` and concurrency to at least one
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.read_chunk_size = self.read_chunk_size.clamp(1, MAX_READ_CHUNK);
        self.write_chunk_size = self.write_chunk_size.clamp(1, MAX_WRITE_CHUNK);
        self.batch_concurrency = self.batch_concurrency.max(1);
        self
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim(),
        "1" | "true" | "yes" | "TRUE" | "YES" | "True"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.read_chunk_size, 100);
        assert_eq!(config.write_chunk_size, 25);
        assert_eq!(config.query_retry.max_retries, 0);
        assert!(!config.query_retry.retry_on_empty);
        assert_eq!(config.batch_retry.max_retries, 2);
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = DbConfig::from_lookup(lookup(&[
            ("DYNAMO_QUERY_PAGE_SIZE", "50"),
            ("DYNAMO_QUERY_MAX_RETRIES", "3"),
            ("DYNAMO_QUERY_RETRY_INITIAL_MS", "20"),
            ("DYNAMO_QUERY_RETRY_ON_EMPTY", "yes"),
            ("DYNAMO_QUERY_BATCH_MAX_RETRIES", "7"),
        ]));

        assert_eq!(config.default_page_size, Some(50));
        assert_eq!(config.query_retry.max_retries, 3);
        assert_eq!(config.query_retry.initial_delay, Duration::from_millis(20));
        assert!(config.query_retry.retry_on_empty);
        assert_eq!(config.batch_retry.max_retries, 7);
    }

    #[test]
    fn test_chunk_sizes_clamped_to_store_ceilings() {
        let config = DbConfig::from_lookup(lookup(&[
            ("DYNAMO_QUERY_READ_CHUNK", "500"),
            ("DYNAMO_QUERY_WRITE_CHUNK", "0"),
            ("DYNAMO_QUERY_BATCH_CONCURRENCY", "0"),
        ]));

        assert_eq!(config.read_chunk_size, MAX_READ_CHUNK);
        assert_eq!(config.write_chunk_size, 1);
        assert_eq!(config.batch_concurrency, 1);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = DbConfig::from_lookup(lookup(&[
            ("DYNAMO_QUERY_PAGE_SIZE", "lots"),
            ("DYNAMO_QUERY_MAX_RETRIES", "-1"),
        ]));
        assert_eq!(config, DbConfig::default());
    }
}
