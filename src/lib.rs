//! # DynamoDB Query Compilation
//!
//! A typed query layer for DynamoDB that turns fluent builder calls into wire
//! requests:
//! - Condition accumulation with deferred validation
//! - Automatic index selection between the base table and its secondary indexes
//! - Expression compilation with collision-free `#nN` / `:vN` placeholders
//! - Cursor pagination bound to the shape of the query that produced the cursor
//! - Parallel scans with per-segment fault isolation
//! - Batch reads and writes with chunking and unprocessed-item retry
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dynamo_query::{Db, DynamoTable, Error, IndexDescriptor};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct User {
//!     id: String,
//!     status: String,
//!     age: u32,
//! }
//!
//! impl DynamoTable for User {
//!     const TABLE: &'static str = "users";
//!     const PARTITION_KEY: &'static str = "id";
//!
//!     fn indexes() -> Vec<IndexDescriptor> {
//!         vec![IndexDescriptor::global("status-index", "status")]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let db = Db::from_env().await;
//!
//!     // Status equality selects status-index; the age bound becomes a filter
//!     let page = db
//!         .query::<User>()
//!         .eq("status", "active")
//!         .ge("age", 18)
//!         .limit(50)
//!         .all_paginated()
//!         .await?;
//!
//!     if let Some(cursor) = page.next_cursor {
//!         let _next = db
//!             .query::<User>()
//!             .eq("status", "active")
//!             .ge("age", 18)
//!             .cursor(cursor)
//!             .all_paginated()
//!             .await?;
//!     }
//!
//!     db.update::<User>()
//!         .partition_key("u1")
//!         .increment("age", 1)
//!         .condition_exists("id")
//!         .execute()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
#![deny(
    warnings,
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    deprecated,
    unknown_lints,
    unreachable_code,
    unused_mut
)]

mod error;
pub use error::Error;

/// Batch read/write coordination
pub mod batch;

/// Handle-wide configuration
pub mod config;

mod db;

/// Model-to-item conversion
pub mod marshal;

/// Conditions, index selection, expression compilation and execution
pub mod query;

mod retry;

/// Table and index metadata
pub mod schema;

/// Remote-call interface
pub mod transport;

// Re-export main types for convenience
pub use batch::{BatchGetOutput, BatchWriteOutput, UnprocessedBatch};
pub use config::{DbConfig, RetryConfig};
pub use db::Db;
pub use marshal::{Marshaler, SerdeMarshaler};
pub use query::{
    AccessPath, Operator, Paginated, ParallelScanOutput, Query, QueryPlan, RawExpression,
    SortOrder, UpdateBuilder,
};
pub use schema::{DynamoTable, IndexDescriptor, IndexKind, Key, Projection, SchemaCache, TableSchema};
pub use transport::{Item, Transport, TransportError};

// Re-export aws-config types for configuration
pub use aws_config::{
    BehaviorVersion, Region, SdkConfig, defaults,
    meta::region::{ProvideRegion, RegionProviderChain},
    timeout::TimeoutConfig,
};

// Re-export aws-types for advanced configuration
pub use aws_types::sdk_config::Builder as SdkConfigBuilder;

/// Load an SDK configuration with sensible defaults
///
/// It configures:
/// - Adaptive retry mode with 3 max attempts
/// - Exponential backoff starting at 1 second
/// - Connect timeout: 3 seconds
/// - Read timeout: 20 seconds
/// - Operation timeout: 60 seconds
/// - LocalStack support via AWS_PROFILE=localstack
///
/// The SDK's own retries sit below the query retry policy in [`RetryConfig`].
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() {
/// let config = dynamo_query::load_sdk_config().await;
/// let db = dynamo_query::Db::new(aws_sdk_dynamodb::Client::new(&config));
/// # }
/// ```
pub async fn load_sdk_config() -> SdkConfig {
    use aws_types::sdk_config::RetryConfig as SdkRetryConfig;
    use std::time::Duration;

    let timeout_config = TimeoutConfig::builder()
        .connect_timeout(Duration::from_secs(3))
        .read_timeout(Duration::from_secs(20))
        .operation_timeout(Duration::from_secs(60))
        .build();

    let mut loader = defaults(BehaviorVersion::latest())
        .retry_config(
            SdkRetryConfig::adaptive()
                .with_max_attempts(3)
                .with_initial_backoff(Duration::from_secs(1)),
        )
        .timeout_config(timeout_config);

    // Support LocalStack via AWS_PROFILE=localstack
    if std::env::var("AWS_PROFILE").unwrap_or_default() == "localstack" {
        loader = loader.endpoint_url("http://127.0.0.1:4566");
    }

    loader.load().await
}
