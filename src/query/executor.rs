use aws_sdk_dynamodb::types::Select;
use futures_util::FutureExt;
use futures_util::future::join_all;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::Error;
use crate::config::RetryConfig;
use crate::db::Db;
use crate::marshal::Marshaler;
use crate::query::builder::QuerySpec;
use crate::query::expression::CompiledExpressions;
use crate::retry;
use crate::transport::{GetItemRequest, Item, Page, QueryRequest, ScanRequest, Transport, TransportError};

/// Wire request for one compiled read, without paging state
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Key lookup
    Query(QueryRequest),
    /// Full read
    Scan(ScanRequest),
}

impl Request {
    /// Operation name used in errors and logs
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Query(_) => "Query",
            Request::Scan(_) => "Scan",
        }
    }

    async fn fetch<C: Transport>(
        &self,
        transport: &C,
        start_key: Option<Item>,
        limit: Option<i32>,
    ) -> Result<Page, TransportError> {
        match self {
            Request::Query(request) => {
                let mut request = request.clone();
                request.exclusive_start_key = start_key;
                request.limit = limit.or(request.limit);
                transport.query(request).await
            }
            Request::Scan(request) => fetch_scan(transport, request, start_key, limit).await,
        }
    }
}

async fn fetch_scan<C: Transport>(
    transport: &C,
    request: &ScanRequest,
    start_key: Option<Item>,
    limit: Option<i32>,
) -> Result<Page, TransportError> {
    let mut request = request.clone();
    request.exclusive_start_key = start_key;
    request.limit = limit.or(request.limit);
    transport.scan(request).await
}

/// Per-call `Limit` and overall item cap for a paged read
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PageLimits {
    per_call: Option<i32>,
    max_items: Option<usize>,
    /// Shrink `Limit` to what is still missing; only sound without a filter
    trim: bool,
}

impl PageLimits {
    fn next_call(&self, collected: usize) -> Option<i32> {
        let remaining = self
            .max_items
            .filter(|_| self.trim)
            .map(|max| i32::try_from(max.saturating_sub(collected)).unwrap_or(i32::MAX).max(1));
        match (self.per_call, remaining) {
            (Some(per_call), Some(remaining)) => Some(per_call.min(remaining)),
            (per_call, remaining) => per_call.or(remaining),
        }
    }
}

/// Read pages until the store reports no further key or enough items are collected
async fn drain<F, Fut>(
    operation: &'static str,
    deadline: Option<Instant>,
    mut start_key: Option<Item>,
    limits: PageLimits,
    mut fetch: F,
) -> Result<Vec<Item>, Error>
where
    F: FnMut(Option<Item>, Option<i32>) -> Fut,
    Fut: Future<Output = Result<Page, TransportError>>,
{
    let mut items = Vec::new();
    let mut calls = 0;

    loop {
        retry::check_deadline(deadline, operation, calls)?;
        let page = fetch(start_key.take(), limits.next_call(items.len())).await?;
        calls += 1;
        items.extend(page.items);

        if let Some(max) = limits.max_items {
            if items.len() >= max {
                items.truncate(max);
                break;
            }
        }
        // an empty key marks the end just like a missing one
        match page.last_evaluated_key {
            Some(key) if !key.is_empty() => start_key = Some(key),
            _ => break,
        }
    }

    debug!(operation, calls, items = items.len(), "read complete");
    Ok(items)
}

/// One compiled read bound to a handle, its retry policy and deadline
pub(crate) struct Execution<'db, C, M> {
    db: &'db Db<C, M>,
    spec: QuerySpec,
    request: Request,
    retry: RetryConfig,
    deadline: Option<Instant>,
}

impl<'db, C, M> Execution<'db, C, M>
where
    C: Transport,
    M: Marshaler,
{
    pub(crate) fn new(
        db: &'db Db<C, M>,
        spec: QuerySpec,
        expressions: &CompiledExpressions,
        retry: RetryConfig,
        deadline: Option<Instant>,
    ) -> Self {
        let request = spec.request(expressions, None);
        Self {
            db,
            spec,
            request,
            retry,
            deadline,
        }
    }

    pub(crate) fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    fn filtered(&self) -> bool {
        match &self.request {
            Request::Query(r) => r.filter_expression.is_some(),
            Request::Scan(r) => r.filter_expression.is_some(),
        }
    }

    fn limits(&self, max_items: Option<usize>) -> PageLimits {
        PageLimits {
            per_call: self.db.config().default_page_size,
            max_items,
            trim: !self.filtered(),
        }
    }

    /// Every matching item, up to `max_items`, under the retry policy
    pub(crate) async fn items(&self, max_items: Option<usize>) -> Result<Vec<Item>, Error> {
        let transport = self.db.transport();
        let request = &self.request;
        let limits = self.limits(max_items);
        let deadline = self.deadline;
        let start_key = &self.spec.start_key;
        let operation = request.operation();

        retry::run(&self.retry, deadline, operation, Vec::is_empty, move || {
            drain(
                operation,
                deadline,
                start_key.clone(),
                limits,
                move |start, limit| request.fetch(transport, start, limit),
            )
        })
        .await
    }

    /// A single page starting at the query's cursor
    pub(crate) async fn page(&self) -> Result<Page, Error> {
        let transport = self.db.transport();
        let request = &self.request;
        let start_key = &self.spec.start_key;
        let limit = self.spec.limit.or(self.db.config().default_page_size);
        let deadline = self.deadline;
        let operation = request.operation();

        retry::run(
            &self.retry,
            deadline,
            operation,
            |page: &Page| page.items.is_empty(),
            move || async move {
                request
                    .fetch(transport, start_key.clone(), limit)
                    .await
                    .map_err(Error::from)
            },
        )
        .await
    }

    /// Sum of `Count` over every page
    pub(crate) async fn count(&self, expressions: &CompiledExpressions) -> Result<usize, Error> {
        let transport = self.db.transport();
        let request = &self.spec.request(expressions, Some(Select::Count));
        let per_call = self.db.config().default_page_size;
        let deadline = self.deadline;
        let start_key = &self.spec.start_key;
        let operation = request.operation();

        retry::run(
            &self.retry,
            deadline,
            operation,
            |count: &usize| *count == 0,
            move || async move {
                let mut start_key = start_key.clone();
                let mut total = 0usize;
                let mut calls = 0;
                loop {
                    retry::check_deadline(deadline, operation, calls)?;
                    let page = request.fetch(transport, start_key.take(), per_call).await?;
                    calls += 1;
                    total += usize::try_from(page.count).unwrap_or_default();
                    match page.last_evaluated_key {
                        Some(key) if !key.is_empty() => start_key = Some(key),
                        _ => break,
                    }
                }
                Ok::<_, Error>(total)
            },
        )
        .await
    }

    /// Point read by full primary key
    pub(crate) async fn get(&self, key: Item, expressions: &CompiledExpressions) -> Result<Option<Item>, Error> {
        let transport = self.db.transport();
        let projection = expressions.projection.as_ref();
        let request = GetItemRequest {
            table_name: self.spec.plan.table.clone(),
            key,
            projection_expression: projection.map(|p| p.expression.clone()),
            expression_attribute_names: projection.map(|p| p.names.clone()).unwrap_or_default(),
            consistent_read: self.spec.consistent_read,
        };
        let request = &request;
        let deadline = self.deadline;

        debug!(table = %request.table_name, "full key given, reading with GetItem");
        retry::run(&self.retry, deadline, "GetItem", Option::is_none, move || async move {
            transport.get_item(request.clone()).await.map_err(Error::from)
        })
        .await
    }

    /// Parallel scan over `segments` workers
    pub(crate) async fn parallel(&self, segments: i32) -> Result<ParallelScanOutput<Item>, Error> {
        let template = match &self.request {
            Request::Scan(request) => request.clone(),
            Request::Query(_) => {
                return Err(Error::validation("parallel scan requested for a key lookup"));
            }
        };
        retry::check_deadline(self.deadline, "Scan", 0)?;

        let mut output = parallel_scan(
            Arc::clone(self.db.shared_transport()),
            template,
            segments,
            self.retry.clone(),
            self.deadline,
            self.db.config().default_page_size,
        )
        .await;

        if let Some(limit) = self.spec.limit {
            output.items.truncate(usize::try_from(limit).unwrap_or_default());
        }
        Ok(output)
    }
}

/// A segment that did not complete
#[derive(Debug)]
pub struct SegmentFailure {
    /// Zero-based segment index
    pub segment: i32,
    /// Why it failed
    pub error: Error,
}

/// Merged result of a parallel scan
///
/// Items are ordered by segment index, then by the order the store returned
/// them within the segment. Failed segments contribute no items.
#[must_use = "parallel scan results may contain failed segments that should be checked"]
#[derive(Debug)]
pub struct ParallelScanOutput<T> {
    /// Items from every completed segment
    pub items: Vec<T>,
    /// Segments that failed or panicked, in segment order
    pub failed_segments: Vec<SegmentFailure>,
    /// Number of segments scanned
    pub segments: i32,
}

impl<T> ParallelScanOutput<T> {
    /// Check if every segment completed
    pub fn is_complete(&self) -> bool {
        self.failed_segments.is_empty()
    }

    /// Items when every segment completed, otherwise the first segment's error
    pub fn into_result(self) -> Result<Vec<T>, Error> {
        match self.failed_segments.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(self.items),
        }
    }

    pub(crate) fn try_map_items<U>(
        self,
        f: impl FnOnce(Vec<T>) -> Result<Vec<U>, Error>,
    ) -> Result<ParallelScanOutput<U>, Error> {
        Ok(ParallelScanOutput {
            items: f(self.items)?,
            failed_segments: self.failed_segments,
            segments: self.segments,
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run one task per segment and merge their items in segment order.
///
/// Each worker's body runs behind an unwind boundary; a panic or error is
/// delivered on the results channel as that segment's outcome and never
/// cancels the other segments.
pub(crate) async fn parallel_scan<C: Transport>(
    transport: Arc<C>,
    template: ScanRequest,
    segments: i32,
    retry: RetryConfig,
    deadline: Option<Instant>,
    per_call: Option<i32>,
) -> ParallelScanOutput<Item> {
    let segments = segments.max(1);
    let (tx, mut rx) = mpsc::unbounded_channel::<(i32, Result<Vec<Item>, Error>)>();
    let mut handles = Vec::with_capacity(segments as usize);

    debug!(table = %template.table_name, segments, "starting parallel scan");

    for segment in 0..segments {
        let transport = Arc::clone(&transport);
        let tx = tx.clone();
        let retry = retry.clone();
        let mut request = template.clone();
        request.segment = Some(segment);
        request.total_segments = Some(segments);

        handles.push(tokio::spawn(async move {
            let transport: &C = &transport;
            let request = &request;
            let limits = PageLimits {
                per_call,
                ..PageLimits::default()
            };

            let body = retry::run(&retry, deadline, "Scan", Vec::is_empty, move || {
                drain("Scan", deadline, None, limits, move |start, limit| {
                    fetch_scan(transport, request, start, limit)
                })
            });

            let outcome = match AssertUnwindSafe(body).catch_unwind().await {
                Ok(Ok(items)) => Ok(items),
                Ok(Err(e @ Error::Timeout { .. })) => {
                    warn!(segment, "scan segment ran out of time");
                    Err(e)
                }
                Ok(Err(e)) => {
                    warn!(segment, error = %e, "scan segment failed");
                    Err(Error::ScanSegment {
                        segment,
                        source: Box::new(e),
                    })
                }
                Err(payload) => {
                    let message = panic_message(payload);
                    error!(segment, %message, "scan segment worker panicked");
                    Err(Error::SegmentPanic { segment, message })
                }
            };
            let _ = tx.send((segment, outcome));
        }));
    }
    drop(tx);

    // barrier: every worker has finished before anything is merged
    let joined = join_all(handles).await;

    let mut outcomes: Vec<Option<Result<Vec<Item>, Error>>> =
        (0..segments).map(|_| None).collect();
    while let Some((segment, outcome)) = rx.recv().await {
        if let Some(slot) = usize::try_from(segment).ok().and_then(|i| outcomes.get_mut(i)) {
            *slot = Some(outcome);
        }
    }

    let mut output = ParallelScanOutput {
        items: Vec::new(),
        failed_segments: Vec::new(),
        segments,
    };
    for (index, (outcome, join)) in outcomes.into_iter().zip(joined).enumerate() {
        let segment = index as i32;
        match outcome {
            Some(Ok(items)) => output.items.extend(items),
            Some(Err(error)) => output.failed_segments.push(SegmentFailure { segment, error }),
            None => {
                let message = match join {
                    Err(e) => e.to_string(),
                    Ok(()) => "worker exited without reporting".to_string(),
                };
                error!(segment, %message, "scan segment lost");
                output.failed_segments.push(SegmentFailure {
                    segment,
                    error: Error::SegmentPanic { segment, message },
                });
            }
        }
    }

    debug!(
        items = output.items.len(),
        failed = output.failed_segments.len(),
        "parallel scan merged"
    );
    output
}
