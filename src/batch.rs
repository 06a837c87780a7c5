//! Batch read/write coordination: chunking to the store's per-call ceilings
//! and bounded retry of the items the store leaves unprocessed.

use aws_sdk_dynamodb::types::ConsumedCapacity;
use futures_util::StreamExt;
use std::time::{Duration, Instant};
use tokio::time::{Instant as Deadline, sleep};
use tokio_stream as stream;
use tracing::{debug, error, warn};

use crate::Error;
use crate::config::{DbConfig, MAX_READ_CHUNK, MAX_WRITE_CHUNK};
use crate::query::ExpressionSet;
use crate::retry::{check_deadline, retry_delay};
use crate::transport::{BatchGetRequest, BatchWriteRequest, Item, Transport, TransportError, WriteOp};

/// Items or keys a batch could not apply within its retry budget
///
/// Carried by [`Error::PartialBatchFailure`]. Everything listed here was not
/// applied; everything else in the request was.
#[derive(Debug, Default)]
pub struct UnprocessedBatch {
    /// Puts not written
    pub puts: Vec<Item>,
    /// Delete keys not applied
    pub deletes: Vec<Item>,
    /// Keys not read
    pub keys: Vec<Item>,
    /// Items a partially failed read did retrieve
    pub retrieved: Vec<Item>,
    /// Calls made per item, first attempt included
    pub attempts: usize,
    /// Last transport fault seen while the batch ran, if any
    pub last_error: Option<TransportError>,
    /// Retries stopped because the caller's deadline passed
    pub deadline_elapsed: bool,
}

impl UnprocessedBatch {
    /// Number of writes and keys left unprocessed
    pub fn len(&self) -> usize {
        self.puts.len() + self.deletes.len() + self.keys.len()
    }

    /// Check if nothing was left unprocessed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Batch write output with retry metrics
#[must_use = "batch write results carry metrics that should be checked"]
#[derive(Debug)]
pub struct BatchWriteOutput {
    /// Writes applied
    pub processed: usize,
    /// Number of retry attempts made (0 means no retries needed)
    pub retry_count: usize,
    /// Total execution time including all retries
    pub total_duration: Duration,
    /// The capacity units consumed by every `BatchWriteItem` call
    pub consumed_capacity: Vec<ConsumedCapacity>,
}

/// Batch read output with retry metrics
#[must_use = "batch read results carry metrics that should be checked"]
#[derive(Debug)]
pub struct BatchGetOutput<T> {
    /// Items retrieved; keys with no stored item are simply absent
    pub items: Vec<T>,
    /// Number of retry attempts made (0 means no retries needed)
    pub retry_count: usize,
    /// Total execution time including all retries
    pub total_duration: Duration,
    /// The capacity units consumed by every `BatchGetItem` call
    pub consumed_capacity: Vec<ConsumedCapacity>,
}

/// Outcome of one pass over every pending chunk
struct Round<U> {
    unprocessed: Vec<U>,
    retrieved: Vec<Item>,
    consumed_capacity: Vec<ConsumedCapacity>,
    last_error: Option<TransportError>,
}

impl<U> Default for Round<U> {
    fn default() -> Self {
        Self {
            unprocessed: Vec::new(),
            retrieved: Vec::new(),
            consumed_capacity: Vec::new(),
            last_error: None,
        }
    }
}

fn concurrency(chunks: usize, config: &DbConfig) -> usize {
    chunks.min(config.batch_concurrency).max(1)
}

async fn write_round<C: Transport>(
    transport: &C,
    table: &str,
    operations: Vec<WriteOp>,
    config: &DbConfig,
) -> Round<WriteOp> {
    let chunk_size = config.write_chunk_size.clamp(1, MAX_WRITE_CHUNK);
    let chunks: Vec<Vec<WriteOp>> = operations.chunks(chunk_size).map(<[_]>::to_vec).collect();
    let concurrency = concurrency(chunks.len(), config);

    stream::iter(chunks.into_iter().map(|operations| async move {
        let request = BatchWriteRequest {
            table_name: table.to_string(),
            operations: operations.clone(),
        };
        (operations, transport.batch_write_item(request).await)
    }))
    .buffer_unordered(concurrency)
    .fold(Round::default(), |mut round, (operations, result)| async move {
        match result {
            Ok(response) => {
                round.unprocessed.extend(response.unprocessed);
                round.consumed_capacity.extend(response.consumed_capacity);
            }
            Err(e) => {
                // nothing in a failed call is known to be applied
                warn!(table, chunk = operations.len(), error = %e, "batch write chunk failed");
                round.unprocessed.extend(operations);
                round.last_error = Some(e);
            }
        }
        round
    })
    .await
}

async fn get_round<C: Transport>(
    transport: &C,
    template: &BatchGetRequest,
    keys: Vec<Item>,
    config: &DbConfig,
) -> Round<Item> {
    let chunk_size = config.read_chunk_size.clamp(1, MAX_READ_CHUNK);
    let chunks: Vec<Vec<Item>> = keys.chunks(chunk_size).map(<[_]>::to_vec).collect();
    let concurrency = concurrency(chunks.len(), config);

    stream::iter(chunks.into_iter().map(|keys| async move {
        let request = BatchGetRequest {
            keys: keys.clone(),
            ..template.clone()
        };
        (keys, transport.batch_get_item(request).await)
    }))
    .buffer_unordered(concurrency)
    .fold(Round::default(), |mut round, (keys, result)| async move {
        match result {
            Ok(response) => {
                round.retrieved.extend(response.items);
                round.unprocessed.extend(response.unprocessed_keys);
                round.consumed_capacity.extend(response.consumed_capacity);
            }
            Err(e) => {
                warn!(table = %template.table_name, chunk = keys.len(), error = %e, "batch get chunk failed");
                round.unprocessed.extend(keys);
                round.last_error = Some(e);
            }
        }
        round
    })
    .await
}

/// Write every operation, retrying unprocessed ones under `config.batch_retry`.
///
/// Fails with [`Error::PartialBatchFailure`] listing exactly the writes still
/// unprocessed once the retry budget is spent.
pub(crate) async fn write_all<C: Transport>(
    transport: &C,
    table: &str,
    operations: Vec<WriteOp>,
    config: &DbConfig,
    deadline: Option<Deadline>,
) -> Result<BatchWriteOutput, Error> {
    let start_time = Instant::now();
    let requested = operations.len();
    let retries = &config.batch_retry;

    let mut pending = operations;
    let mut retry_count = 0;
    let mut consumed_capacity = Vec::new();
    let mut last_error = None;
    let mut deadline_elapsed = false;

    while !pending.is_empty() {
        if let Err(e) = check_deadline(deadline, "BatchWriteItem", retry_count) {
            if retry_count == 0 {
                return Err(e);
            }
            deadline_elapsed = true;
            break;
        }
        let round = write_round(transport, table, pending, config).await;
        consumed_capacity.extend(round.consumed_capacity);
        if round.last_error.is_some() {
            last_error = round.last_error;
        }
        pending = round.unprocessed;

        if pending.is_empty() || retry_count >= retries.max_retries {
            break;
        }
        warn!(table, unprocessed = pending.len(), retry_count, "retrying unprocessed batch writes");
        sleep(retry_delay(retry_count, retries.initial_delay, retries.max_delay)).await;
        retry_count += 1;
    }

    if !pending.is_empty() {
        // a round cut short by the deadline was never sent
        let attempts = retry_count + usize::from(!deadline_elapsed);
        error!(
            table,
            unprocessed = pending.len(),
            attempts,
            deadline_elapsed,
            "batch write left items unprocessed"
        );
        let mut unprocessed = UnprocessedBatch {
            attempts,
            last_error,
            deadline_elapsed,
            ..UnprocessedBatch::default()
        };
        for operation in pending {
            match operation {
                WriteOp::Put(item) => unprocessed.puts.push(item),
                WriteOp::Delete(key) => unprocessed.deletes.push(key),
            }
        }
        return Err(Error::PartialBatchFailure(Box::new(unprocessed)));
    }

    debug!(table, requested, retry_count, "batch write complete");
    Ok(BatchWriteOutput {
        processed: requested,
        retry_count,
        total_duration: start_time.elapsed(),
        consumed_capacity,
    })
}

/// Read every key, retrying unprocessed ones under `config.batch_retry`
pub(crate) async fn get_all<C: Transport>(
    transport: &C,
    table: &str,
    keys: Vec<Item>,
    projection: Option<ExpressionSet>,
    consistent_read: bool,
    config: &DbConfig,
    deadline: Option<Deadline>,
) -> Result<BatchGetOutput<Item>, Error> {
    let start_time = Instant::now();
    let retries = &config.batch_retry;
    let template = BatchGetRequest {
        table_name: table.to_string(),
        keys: Vec::new(),
        projection_expression: projection.as_ref().map(|p| p.expression.clone()),
        expression_attribute_names: projection.map(|p| p.names).unwrap_or_default(),
        consistent_read,
    };

    let mut pending = keys;
    let mut items = Vec::with_capacity(pending.len());
    let mut retry_count = 0;
    let mut consumed_capacity = Vec::new();
    let mut last_error = None;
    let mut deadline_elapsed = false;

    while !pending.is_empty() {
        if let Err(e) = check_deadline(deadline, "BatchGetItem", retry_count) {
            if retry_count == 0 {
                return Err(e);
            }
            deadline_elapsed = true;
            break;
        }
        let round = get_round(transport, &template, pending, config).await;
        items.extend(round.retrieved);
        consumed_capacity.extend(round.consumed_capacity);
        if round.last_error.is_some() {
            last_error = round.last_error;
        }
        pending = round.unprocessed;

        if pending.is_empty() || retry_count >= retries.max_retries {
            break;
        }
        warn!(table, unprocessed = pending.len(), retry_count, "retrying unprocessed batch keys");
        sleep(retry_delay(retry_count, retries.initial_delay, retries.max_delay)).await;
        retry_count += 1;
    }

    if !pending.is_empty() {
        // a round cut short by the deadline was never sent
        let attempts = retry_count + usize::from(!deadline_elapsed);
        error!(
            table,
            unprocessed = pending.len(),
            attempts,
            deadline_elapsed,
            "batch get left keys unprocessed"
        );
        return Err(Error::PartialBatchFailure(Box::new(UnprocessedBatch {
            keys: pending,
            retrieved: items,
            attempts,
            last_error,
            deadline_elapsed,
            ..UnprocessedBatch::default()
        })));
    }

    debug!(table, items = items.len(), retry_count, "batch get complete");
    Ok(BatchGetOutput {
        items,
        retry_count,
        total_duration: start_time.elapsed(),
        consumed_capacity,
    })
}
