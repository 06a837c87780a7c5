/// Batch coordination tests
///
/// Chunk sizes, unprocessed-item retry, chunk failures and the partial
/// failure report, all against the scripted transport.
mod helpers;
use dynamo_query::Key;
use helpers::*;
use std::time::Duration;
use tokio::time::Instant;

fn user_keys(count: usize) -> Vec<Key> {
    (0..count).map(|i| Key::string(format!("u{i}"))).collect()
}

fn chunk_sizes(requests: &[BatchWriteRequest]) -> Vec<usize> {
    let mut sizes: Vec<usize> = requests.iter().map(|r| r.operations.len()).collect();
    sizes.sort_unstable();
    sizes
}

/// 30 puts go out as one full chunk of 25 and one of 5
#[tokio::test]
async fn test_batch_create_chunks_at_25() {
    let (db, transport) = mock_db();

    let output = db.batch_create(users(30)).await.unwrap();

    assert_eq!(output.processed, 30);
    assert_eq!(output.retry_count, 0);
    let writes = transport.batch_writes.lock().unwrap();
    assert_eq!(chunk_sizes(&writes), [5, 25]);
    assert!(writes.iter().all(|w| w.table_name == "tests_users"));
}

/// A smaller configured chunk size is honoured
#[tokio::test]
async fn test_configured_write_chunk_size() {
    let (db, transport) = mock_db_with(DbConfig {
        write_chunk_size: 10,
        ..DbConfig::default()
    });

    let _ = db.batch_create(users(30)).await.unwrap();
    assert_eq!(chunk_sizes(&transport.batch_writes.lock().unwrap()), [10, 10, 10]);
}

/// Only the unprocessed writes are sent again
#[tokio::test(start_paused = true)]
async fn test_unprocessed_writes_retried() {
    let (db, transport) = mock_db();
    transport.script_write_unprocessed(&[3, 0]);

    let output = db.batch_create(users(10)).await.unwrap();

    assert_eq!(output.processed, 10);
    assert_eq!(output.retry_count, 1);
    let writes = transport.batch_writes.lock().unwrap();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].operations.len(), 3);
    assert_eq!(writes[1].operations, writes[0].operations[7..]);
}

/// Exhausted retries report exactly what is still unprocessed
#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_partial_failure() {
    let (db, transport) = mock_db();
    transport.script_write_unprocessed(&[4, 2, 1]);

    let err = db.batch_create(users(10)).await.unwrap_err();

    assert!(err.is_partial_batch_failure());
    let unprocessed = err.unprocessed().unwrap();
    assert_eq!(unprocessed.len(), 1);
    assert_eq!(unprocessed.puts.len(), 1);
    assert_eq!(unprocessed.puts[0]["Id"], s("u9"));
    assert!(unprocessed.deletes.is_empty());
    assert_eq!(unprocessed.attempts, 3);
    assert!(unprocessed.last_error.is_none());
    assert_eq!(transport.batch_writes.lock().unwrap().len(), 3);
}

/// Unprocessed deletes are reported as deletes
#[tokio::test(start_paused = true)]
async fn test_partial_failure_separates_puts_and_deletes() {
    let (db, transport) = mock_db();
    transport.script_write_unprocessed(&[2, 2, 2]);

    let err = db
        .batch_write::<User>(users(2), vec![Key::string("gone-1"), Key::string("gone-2")])
        .await
        .unwrap_err();

    let unprocessed = err.unprocessed().unwrap();
    assert!(unprocessed.puts.is_empty());
    assert_eq!(unprocessed.deletes.len(), 2);
    assert_eq!(unprocessed.deletes[0], item(&[("Id", s("gone-1"))]));
}

/// A chunk whose call failed is retried as a whole
#[tokio::test(start_paused = true)]
async fn test_failed_chunk_counts_as_unprocessed() {
    let (db, transport) = mock_db();
    transport.script_write_failures(&[true]);

    let output = db.batch_create(users(5)).await.unwrap();
    assert_eq!(output.retry_count, 1);

    let writes = transport.batch_writes.lock().unwrap();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].operations, writes[1].operations);
}

/// A chunk that never succeeds keeps the transport fault in the report
#[tokio::test(start_paused = true)]
async fn test_failed_chunk_exhaustion_keeps_last_error() {
    let (db, transport) = mock_db();
    transport.script_write_failures(&[true, true, true]);

    let err = db.batch_create(users(4)).await.unwrap_err();

    let unprocessed = err.unprocessed().unwrap();
    assert_eq!(unprocessed.puts.len(), 4);
    let last_error = unprocessed.last_error.as_ref().unwrap();
    assert!(last_error.to_string().contains("ProvisionedThroughputExceeded"));
}

/// Keys are read 100 per call
#[tokio::test]
async fn test_batch_get_chunks_at_100() {
    let (db, transport) = mock_db();

    let output = db.batch_get::<User>(user_keys(150), &[]).await.unwrap();

    assert_eq!(output.items.len(), 150);
    assert!(output.items.iter().all(|u| u.name == "fetched"));
    let gets = transport.batch_gets.lock().unwrap();
    let mut sizes: Vec<usize> = gets.iter().map(|g| g.keys.len()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, [50, 100]);
    assert!(gets.iter().all(|g| g.projection_expression.is_none()));
}

/// Unprocessed keys are read again and the projection travels with them
#[tokio::test(start_paused = true)]
async fn test_batch_get_retries_unprocessed_keys() {
    let (db, transport) = mock_db();
    transport.script_get_unprocessed(&[2, 0]);

    let output = db.batch_get::<User>(user_keys(5), &["Id", "Name"]).await.unwrap();

    assert_eq!(output.items.len(), 5);
    assert_eq!(output.retry_count, 1);

    let gets = transport.batch_gets.lock().unwrap();
    assert_eq!(gets.len(), 2);
    assert_eq!(gets[1].keys, gets[0].keys[3..]);
    for get in gets.iter() {
        assert_eq!(get.projection_expression.as_deref(), Some("#n0, #n1"));
        assert_eq!(get.expression_attribute_names["#n1"], "Name");
    }
}

/// Keys still unread after the budget come back with what was retrieved
#[tokio::test(start_paused = true)]
async fn test_batch_get_partial_failure() {
    let (db, transport) = mock_db();
    transport.script_get_unprocessed(&[1, 1, 1]);

    let err = db.batch_get::<User>(user_keys(3), &[]).await.unwrap_err();

    let unprocessed = err.unprocessed().unwrap();
    assert_eq!(unprocessed.keys, vec![item(&[("Id", s("u2"))])]);
    assert_eq!(unprocessed.retrieved.len(), 2);
    assert_eq!(unprocessed.attempts, 3);
}

/// A key missing the table's sort key is refused before anything is sent
#[tokio::test]
async fn test_delete_key_requires_sort_key() {
    let (db, transport) = mock_db();

    let err = db
        .batch_delete::<Order>(vec![Key::string("c1")])
        .await
        .unwrap_err();
    assert!(err.is_validation_error());
    assert!(err.to_string().contains("placed_at"));

    let output = db
        .batch_delete::<Order>(vec![Key::string("c1").with_sort(s("2024-01-01"))])
        .await
        .unwrap();
    assert_eq!(output.processed, 1);
    let writes = transport.batch_writes.lock().unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(
        writes[0].operations[0],
        WriteOp::Delete(item(&[("customer", s("c1")), ("placed_at", s("2024-01-01"))]))
    );
}

/// Nothing to do means no calls
#[tokio::test]
async fn test_empty_batch_sends_nothing() {
    let (db, transport) = mock_db();

    let output = db.batch_create(Vec::<User>::new()).await.unwrap();
    assert_eq!(output.processed, 0);
    assert!(transport.batch_writes.lock().unwrap().is_empty());

    let output = db.batch_get::<User>(Vec::new(), &[]).await.unwrap();
    assert!(output.items.is_empty());
    assert!(transport.batch_gets.lock().unwrap().is_empty());
}

/// An elapsed deadline sends nothing and reports a timeout
#[tokio::test(start_paused = true)]
async fn test_batch_deadline_before_first_call() {
    let (db, transport) = mock_db();
    let deadline = Some(Instant::now());

    let err = db
        .batch_write_before::<User>(users(3), Vec::new(), deadline)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(transport.batch_writes.lock().unwrap().is_empty());

    let err = db
        .batch_get_before::<User>(user_keys(3), &[], deadline)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(transport.batch_gets.lock().unwrap().is_empty());
}

/// A deadline passing during backoff stops retries and keeps the remainder
#[tokio::test(start_paused = true)]
async fn test_batch_deadline_during_backoff() {
    let (db, transport) = mock_db();
    transport.script_write_unprocessed(&[3, 3, 3]);

    // first backoff is 100ms
    let deadline = Some(Instant::now() + Duration::from_millis(50));
    let err = db
        .batch_write_before::<User>(users(10), Vec::new(), deadline)
        .await
        .unwrap_err();

    let unprocessed = err.unprocessed().unwrap();
    assert!(unprocessed.deadline_elapsed);
    assert_eq!(unprocessed.attempts, 1);
    assert_eq!(unprocessed.puts.len(), 3);
    assert_eq!(unprocessed.puts[2]["Id"], s("u9"));
    assert_eq!(transport.batch_writes.lock().unwrap().len(), 1);

    transport.script_get_unprocessed(&[2, 2, 2]);
    let deadline = Some(Instant::now() + Duration::from_millis(50));
    let err = db
        .batch_get_before::<User>(user_keys(5), &[], deadline)
        .await
        .unwrap_err();
    let unprocessed = err.unprocessed().unwrap();
    assert!(unprocessed.deadline_elapsed);
    assert_eq!(unprocessed.keys.len(), 2);
    assert_eq!(unprocessed.retrieved.len(), 3);
    assert_eq!(transport.batch_gets.lock().unwrap().len(), 1);
}
