use aws_sdk_dynamodb::types::{AttributeValue, Select};
use serde::Serialize;
use std::fmt::Write as _;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::Error;
use crate::config::RetryConfig;
use crate::db::Db;
use crate::marshal::Marshaler;
use crate::query::condition::{ConditionSet, Operator, RawExpression};
use crate::query::cursor::{ShapeFingerprint, decode_cursor, encode_cursor};
use crate::query::executor::{Execution, ParallelScanOutput, Request};
use crate::query::expression::{CompiledExpressions, ExpressionCompiler};
use crate::query::selector::{IndexSelector, QueryPlan};
use crate::schema::{DynamoTable, IndexKind, TableSchema};
use crate::transport::{Item, QueryRequest, ScanRequest, Transport};

/// Sort direction over the sort key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SortOrder {
    /// Ascending
    #[default]
    Ascending,
    /// Descending
    Descending,
}

/// Fully validated description of one read, fixed before compilation
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySpec {
    /// Chosen index and the key/filter split
    pub plan: QueryPlan,
    /// Caller-written filter fragments, merged into the filter
    pub raw_filters: Vec<RawExpression>,
    /// Projected attribute paths; empty reads everything
    pub projection: Vec<String>,
    /// Sort direction
    pub order: SortOrder,
    /// Maximum number of items
    pub limit: Option<i32>,
    /// Where to resume, decoded from a cursor
    pub start_key: Option<Item>,
    /// Strongly consistent read
    pub consistent_read: bool,
    /// Parallel scan segments; only meaningful for scans
    pub segments: i32,
}

impl QuerySpec {
    /// Digest of everything that shapes the key space a cursor points into.
    ///
    /// Operand values, limits and read consistency are left out so a cursor
    /// stays valid for the same query asked again with different inputs.
    pub fn fingerprint(&self) -> ShapeFingerprint {
        let plan = &self.plan;
        let mut canonical = format!("{}|{}|{:?}", plan.table, plan.index.name, plan.access);
        for condition in &plan.key_conditions {
            let _ = write!(canonical, "|k:{}:{:?}", condition.field, condition.operator);
        }
        for condition in &plan.filter_conditions {
            let _ = write!(canonical, "|f:{}:{:?}", condition.field, condition.operator);
        }
        for raw in &self.raw_filters {
            let _ = write!(canonical, "|r:{}", raw.expression);
        }
        let _ = write!(
            canonical,
            "|p:{}|o:{:?}|s:{}",
            self.projection.join(","),
            self.order,
            self.segments
        );
        ShapeFingerprint::of(&canonical)
    }

    /// Render every expression with one shared placeholder allocator
    pub fn compile(&self) -> Result<CompiledExpressions, Error> {
        let mut compiler = ExpressionCompiler::new();
        let key_condition = compiler.conditions(&self.plan.key_conditions);
        let filter = compiler.conditions(&self.plan.filter_conditions);
        let projection = compiler.projection(&self.projection);
        let filter = compiler.merge_raw(filter, &self.raw_filters)?;

        Ok(CompiledExpressions {
            key_condition,
            filter,
            projection,
            ..CompiledExpressions::default()
        })
    }

    /// Wire request without paging state; `select` overrides the default selection
    pub fn request(&self, expressions: &CompiledExpressions, select: Option<Select>) -> Request {
        let select = select.unwrap_or_else(|| self.default_select());
        let filter_expression = expressions.filter.as_ref().map(|f| f.expression.clone());
        let projection_expression = expressions
            .projection
            .as_ref()
            .filter(|_| select == Select::SpecificAttributes)
            .map(|p| p.expression.clone());
        let table_name = self.plan.table.clone();
        let index_name = self.plan.index_name().map(str::to_string);

        if self.plan.is_scan() {
            Request::Scan(ScanRequest {
                table_name,
                index_name,
                filter_expression,
                projection_expression,
                expression_attribute_names: expressions.names(),
                expression_attribute_values: expressions.values(),
                consistent_read: self.consistent_read,
                select: Some(select),
                ..ScanRequest::default()
            })
        } else {
            Request::Query(QueryRequest {
                table_name,
                index_name,
                key_condition_expression: expressions
                    .key_condition
                    .as_ref()
                    .map(|k| k.expression.clone())
                    .unwrap_or_default(),
                filter_expression,
                projection_expression,
                expression_attribute_names: expressions.names(),
                expression_attribute_values: expressions.values(),
                scan_index_forward: self.order == SortOrder::Ascending,
                consistent_read: self.consistent_read,
                select: Some(select),
                ..QueryRequest::default()
            })
        }
    }

    fn default_select(&self) -> Select {
        if !self.projection.is_empty() {
            Select::SpecificAttributes
        } else if self.plan.index.is_base_table() {
            Select::AllAttributes
        } else {
            Select::AllProjectedAttributes
        }
    }

    /// Full primary key when the read can be served by `GetItem`
    pub(crate) fn point_key(&self) -> Option<Item> {
        let plan = &self.plan;
        if plan.is_scan()
            || !plan.index.is_base_table()
            || !plan.filter_conditions.is_empty()
            || !self.raw_filters.is_empty()
            || self.start_key.is_some()
        {
            return None;
        }

        let mut key = Item::with_capacity(2);
        for condition in &plan.key_conditions {
            if condition.operator != Operator::Eq {
                return None;
            }
            let _ = key.insert(condition.field.clone(), condition.values.first()?.clone());
        }
        match &plan.index.sort_key {
            Some(sort_key) if !key.contains_key(sort_key) => None,
            _ => Some(key),
        }
    }

    /// Whether the read fans out over several scan segments
    pub fn is_parallel(&self) -> bool {
        self.plan.is_scan() && self.segments > 1
    }
}

/// One page of results and where to continue
#[derive(Debug, Clone)]
pub struct Paginated<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Items returned after filtering
    pub count: i32,
    /// Items evaluated before filtering
    pub scanned_count: i32,
    /// Cursor for the next page, `None` when exhausted
    pub next_cursor: Option<String>,
    /// Whether another page exists
    pub has_more: bool,
}

/// Dry-run output: the plan, its expressions and the request that would be sent
#[derive(Debug, Clone)]
pub struct CompiledRequest {
    /// Access path
    pub plan: QueryPlan,
    /// Rendered expressions
    pub expressions: CompiledExpressions,
    /// Wire request
    pub request: Request,
}

/// Fluent read builder for one model type.
///
/// Every setter consumes and returns the builder. The first invalid call is
/// recorded and later calls leave the builder untouched; the error surfaces
/// from whichever terminal method runs.
///
/// ```rust,no_run
/// # use dynamo_query::{Db, DynamoTable, Error};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Serialize, Deserialize)]
/// # struct User { id: String, status: String, age: u32 }
/// # impl DynamoTable for User {
/// #     const TABLE: &'static str = "users";
/// #     const PARTITION_KEY: &'static str = "id";
/// # }
/// # async fn example(db: Db) -> Result<(), Error> {
/// let adults: Vec<User> = db
///     .query::<User>()
///     .eq("status", "active")
///     .ge("age", 18)
///     .all()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Query<'db, T, C = aws_sdk_dynamodb::Client, M = crate::SerdeMarshaler> {
    db: &'db Db<C, M>,
    schema: Option<Arc<TableSchema>>,
    conditions: ConditionSet,
    projection: Vec<String>,
    index: Option<String>,
    order: SortOrder,
    limit: Option<i32>,
    cursor: Option<String>,
    consistent_read: bool,
    force_scan: bool,
    segments: i32,
    retry: RetryConfig,
    deadline: Option<Instant>,
    _marker: PhantomData<fn() -> T>,
}

impl<'db, T, C, M> Query<'db, T, C, M>
where
    T: DynamoTable,
    C: Transport,
    M: Marshaler,
{
    pub(crate) fn new(db: &'db Db<C, M>) -> Self {
        let mut conditions = ConditionSet::new();
        let schema = match db.schema::<T>() {
            Ok(schema) => Some(schema),
            Err(e) => {
                let _ = conditions.fail(e);
                None
            }
        };

        Self {
            db,
            schema,
            conditions,
            projection: Vec::new(),
            index: None,
            order: SortOrder::Ascending,
            limit: None,
            cursor: None,
            consistent_read: false,
            force_scan: false,
            segments: 1,
            retry: db.config().query_retry.clone(),
            deadline: None,
            _marker: PhantomData,
        }
    }

    /// Error recorded so far, if any
    pub fn error(&self) -> Option<&Error> {
        self.conditions.error()
    }

    fn failed(&self) -> bool {
        self.conditions.error().is_some()
    }

    fn fail(mut self, error: Error) -> Self {
        let _ = self.conditions.fail(error);
        self
    }

    fn known_field(&mut self, field: &str) -> bool {
        let Some(schema) = &self.schema else {
            return false;
        };
        if schema.has_attribute(field) {
            return true;
        }
        let error = Error::validation(format!(
            "unknown attribute '{field}' on table '{}'",
            schema.table
        ));
        let _ = self.conditions.fail(error);
        false
    }

    fn encode<V: Serialize>(&mut self, value: &V) -> Option<AttributeValue> {
        match self.db.marshaler().encode_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                let _ = self.conditions.fail(e);
                None
            }
        }
    }

    fn push(mut self, field: &str, operator: Operator, values: Vec<AttributeValue>) -> Self {
        if !self.failed() && self.known_field(field) {
            let _ = self.conditions.append(field, operator, values);
        }
        self
    }

    fn push_value<V: Serialize>(mut self, field: &str, operator: Operator, value: V) -> Self {
        if self.failed() {
            return self;
        }
        match self.encode(&value) {
            Some(value) => self.push(field, operator, vec![value]),
            None => self,
        }
    }

    /// `field = value`
    pub fn eq<V: Serialize>(self, field: &str, value: V) -> Self {
        self.push_value(field, Operator::Eq, value)
    }

    /// `field <> value`
    pub fn ne<V: Serialize>(self, field: &str, value: V) -> Self {
        self.push_value(field, Operator::Ne, value)
    }

    /// `field < value`
    pub fn lt<V: Serialize>(self, field: &str, value: V) -> Self {
        self.push_value(field, Operator::Lt, value)
    }

    /// `field <= value`
    pub fn le<V: Serialize>(self, field: &str, value: V) -> Self {
        self.push_value(field, Operator::Le, value)
    }

    /// `field > value`
    pub fn gt<V: Serialize>(self, field: &str, value: V) -> Self {
        self.push_value(field, Operator::Gt, value)
    }

    /// `field >= value`
    pub fn ge<V: Serialize>(self, field: &str, value: V) -> Self {
        self.push_value(field, Operator::Ge, value)
    }

    /// Single-operand comparison with an explicit operator
    pub fn compare<V: Serialize>(self, field: &str, operator: Operator, value: V) -> Self {
        self.push_value(field, operator, value)
    }

    /// `field BETWEEN low AND high`
    pub fn between<V: Serialize>(mut self, field: &str, low: V, high: V) -> Self {
        if self.failed() {
            return self;
        }
        let (Some(low), Some(high)) = (self.encode(&low), self.encode(&high)) else {
            return self;
        };
        self.push(field, Operator::Between, vec![low, high])
    }

    /// `field IN (values...)`
    pub fn is_in<V, I>(mut self, field: &str, values: I) -> Self
    where
        V: Serialize,
        I: IntoIterator<Item = V>,
    {
        if self.failed() {
            return self;
        }
        let mut encoded = Vec::new();
        for value in values {
            match self.encode(&value) {
                Some(value) => encoded.push(value),
                None => return self,
            }
        }
        self.push(field, Operator::In, encoded)
    }

    /// `begins_with(field, prefix)`
    pub fn begins_with(self, field: &str, prefix: &str) -> Self {
        self.push(field, Operator::BeginsWith, vec![AttributeValue::S(prefix.to_string())])
    }

    /// `contains(field, value)`
    pub fn contains<V: Serialize>(self, field: &str, value: V) -> Self {
        self.push_value(field, Operator::Contains, value)
    }

    /// `attribute_exists(field)`
    pub fn attribute_exists(self, field: &str) -> Self {
        self.push(field, Operator::AttributeExists, Vec::new())
    }

    /// `attribute_not_exists(field)`
    pub fn attribute_not_exists(self, field: &str) -> Self {
        self.push(field, Operator::AttributeNotExists, Vec::new())
    }

    /// Condition with a textual operator such as `"="`, `">="`, `"BETWEEN"` or `"begins_with"`.
    ///
    /// `BETWEEN` and `IN` take their operands as a list value; the existence
    /// operators take `()`.
    pub fn condition<V: Serialize>(mut self, field: &str, operator: &str, value: V) -> Self {
        if self.failed() {
            return self;
        }
        let operator = match operator.parse::<Operator>() {
            Ok(operator) => operator,
            Err(e) => return self.fail(e),
        };
        let Some(value) = self.encode(&value) else {
            return self;
        };

        let values = match (operator, value) {
            (Operator::Between | Operator::In, AttributeValue::L(values)) => values,
            (Operator::AttributeExists | Operator::AttributeNotExists, AttributeValue::Null(_)) => {
                Vec::new()
            }
            (_, value) => vec![value],
        };
        self.push(field, operator, values)
    }

    /// AND a caller-written filter fragment onto the filter expression
    pub fn raw_filter(mut self, raw: RawExpression) -> Self {
        let _ = self.conditions.append_raw(raw);
        self
    }

    /// Read only these attribute paths; an empty list reads everything again
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.failed() {
            return self;
        }
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        for field in &fields {
            if !self.known_field(field) {
                return self;
            }
        }
        self.projection = fields;
        self
    }

    /// Read this index instead of choosing one
    pub fn index(mut self, name: &str) -> Self {
        if self.failed() {
            return self;
        }
        self.index = Some(name.to_string());
        self
    }

    /// Sort direction
    pub fn order(mut self, order: SortOrder) -> Self {
        if self.failed() {
            return self;
        }
        self.order = order;
        self
    }

    /// Stop after `limit` items
    pub fn limit(mut self, limit: i32) -> Self {
        if self.failed() {
            return self;
        }
        if limit <= 0 {
            return self.fail(Error::validation(format!("limit must be positive, got {limit}")));
        }
        self.limit = Some(limit);
        self
    }

    /// Resume from a cursor returned by [`Query::all_paginated`]; empty means start over
    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        if self.failed() {
            return self;
        }
        let cursor = cursor.into();
        self.cursor = (!cursor.is_empty()).then_some(cursor);
        self
    }

    /// Strongly consistent read
    pub fn consistent_read(mut self, consistent: bool) -> Self {
        if self.failed() {
            return self;
        }
        self.consistent_read = consistent;
        self
    }

    /// Override the handle's query retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        if self.failed() {
            return self;
        }
        self.retry = retry;
        self
    }

    /// No request is sent once `deadline` has passed
    pub fn deadline(mut self, deadline: Instant) -> Self {
        if self.failed() {
            return self;
        }
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline(deadline)
    }

    /// Scan in `segments` parallel workers when the read becomes a scan
    pub fn segments(mut self, segments: i32) -> Self {
        if self.failed() {
            return self;
        }
        if segments < 1 {
            return self.fail(Error::validation(format!(
                "segment count must be at least 1, got {segments}"
            )));
        }
        self.segments = segments;
        self
    }

    /// Scan even if an index could serve the conditions
    pub fn scan(mut self) -> Self {
        if self.failed() {
            return self;
        }
        self.force_scan = true;
        self
    }

    /// Validate and plan without compiling
    pub fn build(self) -> Result<QuerySpec, Error> {
        let (conditions, raw_filters) = self.conditions.into_parts()?;
        let schema = self
            .schema
            .ok_or_else(|| Error::validation("no schema registered for query"))?;

        let selector = IndexSelector::new(&schema);
        let index = self.index.as_deref();
        let plan = if self.force_scan {
            selector.scan(&conditions, index)?
        } else {
            selector.select(&conditions, index, &self.projection)?
        };

        if self.consistent_read && plan.index.kind == IndexKind::Global {
            return Err(Error::validation(format!(
                "consistent reads are not supported on global index '{}'",
                plan.index.name
            )));
        }

        let segments = if plan.is_scan() { self.segments } else { 1 };
        let mut spec = QuerySpec {
            plan,
            raw_filters,
            projection: self.projection,
            order: self.order,
            limit: self.limit,
            start_key: None,
            consistent_read: self.consistent_read,
            segments,
        };

        if let Some(cursor) = &self.cursor {
            if spec.is_parallel() {
                return Err(Error::validation(
                    "a cursor cannot resume a parallel scan",
                ));
            }
            spec.start_key = Some(decode_cursor(cursor, &spec.fingerprint())?);
        }
        Ok(spec)
    }

    /// Index selection only
    pub fn plan(self) -> Result<QueryPlan, Error> {
        Ok(self.build()?.plan)
    }

    /// Plan and render without sending anything
    pub fn compile(self) -> Result<CompiledRequest, Error> {
        let spec = self.build()?;
        let expressions = spec.compile()?;
        let request = spec.request(&expressions, None);
        Ok(CompiledRequest {
            plan: spec.plan,
            expressions,
            request,
        })
    }

    fn prepare(self) -> Result<(Execution<'db, C, M>, CompiledExpressions), Error> {
        let db = self.db;
        let retry = self.retry.clone();
        let deadline = self.deadline;
        let spec = self.build()?;
        let expressions = spec.compile()?;
        let execution = Execution::new(db, spec, &expressions, retry, deadline);
        Ok((execution, expressions))
    }

    /// Every matching item, honouring the limit
    pub async fn all(self) -> Result<Vec<T>, Error> {
        let db = self.db;
        let (execution, _) = self.prepare()?;

        let items = if execution.spec().is_parallel() {
            let segments = execution.spec().segments;
            execution.parallel(segments).await?.into_result()?
        } else {
            let max_items = execution.spec().limit.and_then(|l| usize::try_from(l).ok());
            execution.items(max_items).await?
        };
        db.marshaler().decode_all(items)
    }

    /// First matching item; a full primary key equality reads with `GetItem`
    pub async fn first(self) -> Result<Option<T>, Error> {
        let db = self.db;
        let (execution, expressions) = self.prepare()?;

        let item = match execution.spec().point_key() {
            Some(key) => execution.get(key, &expressions).await?,
            None => execution.items(Some(1)).await?.into_iter().next(),
        };
        item.map(|item| db.marshaler().decode(item)).transpose()
    }

    /// Number of matching items, summed over every page
    pub async fn count(mut self) -> Result<usize, Error> {
        self.projection.clear();
        let (execution, expressions) = self.prepare()?;
        execution.count(&expressions).await
    }

    /// One page and a cursor for the next
    pub async fn all_paginated(self) -> Result<Paginated<T>, Error> {
        let db = self.db;
        let (execution, _) = self.prepare()?;
        if execution.spec().is_parallel() {
            return Err(Error::validation(
                "a parallel scan cannot be paginated; use scan_all_segments",
            ));
        }

        let page = execution.page().await?;
        let next_cursor = match &page.last_evaluated_key {
            Some(key) if !key.is_empty() => {
                Some(encode_cursor(key, &execution.spec().fingerprint())?)
            }
            _ => None,
        };

        Ok(Paginated {
            items: db.marshaler().decode_all(page.items)?,
            count: page.count,
            scanned_count: page.scanned_count,
            has_more: next_cursor.is_some(),
            next_cursor,
        })
    }

    /// Scan the table in `segments` parallel workers.
    ///
    /// Failed segments are reported in the output next to the items of the
    /// segments that completed.
    pub async fn scan_all_segments(self, segments: i32) -> Result<ParallelScanOutput<T>, Error> {
        let db = self.db;
        let (execution, _) = self.scan().segments(segments).prepare()?;
        execution
            .parallel(segments)
            .await?
            .try_map_items(|items| db.marshaler().decode_all(items))
    }
}

impl<T, C, M> std::fmt::Debug for Query<'_, T, C, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.schema.as_ref().map(|s| s.table.as_str()))
            .field("conditions", &self.conditions)
            .field("projection", &self.projection)
            .field("index", &self.index)
            .field("limit", &self.limit)
            .field("segments", &self.segments)
            .finish_non_exhaustive()
    }
}
