/// Test helpers and fixtures for query integration tests
///
/// This module provides a scripted in-memory transport and the models used
/// across all integration tests.
pub mod fixtures;

pub use aws_sdk_dynamodb::types::AttributeValue;
pub use dynamo_query::transport::{
    BatchGetRequest, BatchGetResponse, BatchWriteRequest, BatchWriteResponse, GetItemRequest,
    Page, QueryRequest, ScanRequest, UpdateItemRequest, UpdateItemResponse, WriteOp,
};
pub use dynamo_query::{Db, DbConfig, DynamoTable, Error, Item, RetryConfig, Transport, TransportError};
pub use serde::{Deserialize, Serialize};

// Re-export common fixtures
pub use fixtures::{Order, User};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Scripted outcome of one `Query` or `Scan` call
#[allow(dead_code)]
pub enum Scripted {
    Page(Page),
    Fail(&'static str),
}

/// In-memory transport that records every request and replays scripted responses
///
/// - `Query`/`Scan`: scripted pages in order, then an empty final page
/// - parallel `Scan`: one item `{Id: "seg-N"}` per segment unless scripted
///   to fail or panic
/// - `BatchWriteItem`: per call, the last `k` operations come back unprocessed
/// - `BatchGetItem`: keys are echoed back as items, minus `k` unprocessed
#[derive(Default)]
pub struct MockTransport {
    pub queries: Mutex<Vec<QueryRequest>>,
    pub scans: Mutex<Vec<ScanRequest>>,
    pub gets: Mutex<Vec<GetItemRequest>>,
    pub batch_gets: Mutex<Vec<BatchGetRequest>>,
    pub batch_writes: Mutex<Vec<BatchWriteRequest>>,
    pub updates: Mutex<Vec<UpdateItemRequest>>,
    query_script: Mutex<VecDeque<Scripted>>,
    scan_script: Mutex<VecDeque<Scripted>>,
    failing_segments: Mutex<HashSet<i32>>,
    panicking_segments: Mutex<HashSet<i32>>,
    stored_item: Mutex<Option<Item>>,
    write_unprocessed: Mutex<VecDeque<usize>>,
    get_unprocessed: Mutex<VecDeque<usize>>,
    write_failures: Mutex<VecDeque<bool>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_query(&self, outcome: Scripted) -> &Self {
        self.query_script.lock().unwrap().push_back(outcome);
        self
    }

    pub fn push_scan(&self, outcome: Scripted) -> &Self {
        self.scan_script.lock().unwrap().push_back(outcome);
        self
    }

    pub fn fail_segment(&self, segment: i32) -> &Self {
        let _ = self.failing_segments.lock().unwrap().insert(segment);
        self
    }

    pub fn panic_segment(&self, segment: i32) -> &Self {
        let _ = self.panicking_segments.lock().unwrap().insert(segment);
        self
    }

    pub fn store_item(&self, item: Item) -> &Self {
        *self.stored_item.lock().unwrap() = Some(item);
        self
    }

    /// Unprocessed counts for successive `BatchWriteItem` calls
    pub fn script_write_unprocessed(&self, counts: &[usize]) -> &Self {
        self.write_unprocessed.lock().unwrap().extend(counts);
        self
    }

    /// Unprocessed counts for successive `BatchGetItem` calls
    pub fn script_get_unprocessed(&self, counts: &[usize]) -> &Self {
        self.get_unprocessed.lock().unwrap().extend(counts);
        self
    }

    /// Whether successive `BatchWriteItem` calls fail outright
    pub fn script_write_failures(&self, failures: &[bool]) -> &Self {
        self.write_failures.lock().unwrap().extend(failures);
        self
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub fn scan_count(&self) -> usize {
        self.scans.lock().unwrap().len()
    }

    fn next_page(script: &Mutex<VecDeque<Scripted>>, operation: &'static str) -> Result<Page, TransportError> {
        match script.lock().unwrap().pop_front() {
            Some(Scripted::Page(page)) => Ok(page),
            Some(Scripted::Fail(message)) => Err(TransportError::new(operation, message)),
            None => Ok(Page::default()),
        }
    }
}

impl Transport for MockTransport {
    async fn query(&self, request: QueryRequest) -> Result<Page, TransportError> {
        self.queries.lock().unwrap().push(request);
        Self::next_page(&self.query_script, "Query")
    }

    async fn scan(&self, request: ScanRequest) -> Result<Page, TransportError> {
        let segment = request.segment;
        self.scans.lock().unwrap().push(request);

        let Some(segment) = segment else {
            return Self::next_page(&self.scan_script, "Scan");
        };
        let panics = self.panicking_segments.lock().unwrap().contains(&segment);
        if panics {
            panic!("segment {segment} exploded");
        }
        if self.failing_segments.lock().unwrap().contains(&segment) {
            return Err(TransportError::new("Scan", format!("segment {segment} throttled")));
        }
        Ok(Page {
            items: vec![item(&[("Id", s(&format!("seg-{segment}")))])],
            count: 1,
            scanned_count: 1,
            last_evaluated_key: None,
        })
    }

    async fn get_item(&self, request: GetItemRequest) -> Result<Option<Item>, TransportError> {
        self.gets.lock().unwrap().push(request);
        Ok(self.stored_item.lock().unwrap().clone())
    }

    async fn batch_get_item(&self, request: BatchGetRequest) -> Result<BatchGetResponse, TransportError> {
        let unprocessed = self
            .get_unprocessed
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(0)
            .min(request.keys.len());
        let mut keys = request.keys.clone();
        self.batch_gets.lock().unwrap().push(request);

        let unprocessed_keys = keys.split_off(keys.len() - unprocessed);
        let items = keys
            .into_iter()
            .map(|mut key| {
                let _ = key.insert("Name".to_string(), s("fetched"));
                key
            })
            .collect();
        Ok(BatchGetResponse {
            items,
            unprocessed_keys,
            consumed_capacity: Vec::new(),
        })
    }

    async fn batch_write_item(&self, request: BatchWriteRequest) -> Result<BatchWriteResponse, TransportError> {
        let fails = self.write_failures.lock().unwrap().pop_front().unwrap_or(false);
        let unprocessed = self
            .write_unprocessed
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(0)
            .min(request.operations.len());
        let mut operations = request.operations.clone();
        self.batch_writes.lock().unwrap().push(request);

        if fails {
            return Err(TransportError::new("BatchWriteItem", "ProvisionedThroughputExceeded"));
        }
        Ok(BatchWriteResponse {
            unprocessed: operations.split_off(operations.len() - unprocessed),
            consumed_capacity: Vec::new(),
        })
    }

    async fn update_item(&self, request: UpdateItemRequest) -> Result<UpdateItemResponse, TransportError> {
        self.updates.lock().unwrap().push(request);
        Ok(UpdateItemResponse {
            attributes: self.stored_item.lock().unwrap().clone(),
        })
    }
}

/// Handle over a fresh mock transport, returning both
pub fn mock_db() -> (Db<MockTransport>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    (Db::from_arc(Arc::clone(&transport)), transport)
}

/// Handle over a fresh mock transport with `config`
#[allow(dead_code)]
pub fn mock_db_with(config: DbConfig) -> (Db<MockTransport>, Arc<MockTransport>) {
    let (db, transport) = mock_db();
    (db.with_config(config), transport)
}

pub fn s(value: &str) -> AttributeValue {
    AttributeValue::S(value.to_string())
}

#[allow(dead_code)]
pub fn n(value: i64) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

pub fn item(pairs: &[(&str, AttributeValue)]) -> Item {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect::<HashMap<_, _>>()
}

#[allow(dead_code)]
pub fn page(items: Vec<Item>, last_evaluated_key: Option<Item>) -> Page {
    let count = items.len() as i32;
    Page {
        items,
        count,
        scanned_count: count,
        last_evaluated_key,
    }
}

/// Users `u0..u{count}` with a status and an age
#[allow(dead_code)]
pub fn users(count: usize) -> Vec<User> {
    (0..count)
        .map(|i| User {
            id: format!("u{i}"),
            status: "active".into(),
            age: 20 + i as u32,
            name: format!("user {i}"),
            tags: Vec::new(),
        })
        .collect()
}
