//! The network-facing seam: request/response shapes and the [`Transport`] trait.

use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::{
    AttributeValue, ConsumedCapacity, DeleteRequest, KeysAndAttributes, PutRequest,
    ReturnConsumedCapacity, ReturnValue, Select, WriteRequest,
};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;

/// A stored item or primary key: attribute name to typed value
pub type Item = HashMap<String, AttributeValue>;

/// Fault reported by the store or the network layer
///
/// Carries the underlying error unchanged.
#[derive(Debug)]
pub struct TransportError {
    /// Operation that failed, e.g. `Query`
    pub operation: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl TransportError {
    /// Wrap an underlying fault
    pub fn new(
        operation: &'static str,
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            operation,
            source: source.into(),
        }
    }

    /// The underlying fault
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.source.as_ref()
    }

    /// Take the underlying fault
    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync + 'static> {
        self.source
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DynamoDB {} error: {}", self.operation, self.source)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Compiled `Query` call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryRequest {
    /// Table name
    pub table_name: String,
    /// Secondary index, `None` for the base table
    pub index_name: Option<String>,
    /// Key condition expression
    pub key_condition_expression: String,
    /// Filter expression
    pub filter_expression: Option<String>,
    /// Projection expression
    pub projection_expression: Option<String>,
    /// Name placeholders for every expression in the request
    pub expression_attribute_names: HashMap<String, String>,
    /// Value placeholders for every expression in the request
    pub expression_attribute_values: HashMap<String, AttributeValue>,
    /// Ascending when true
    pub scan_index_forward: bool,
    /// Items evaluated per call
    pub limit: Option<i32>,
    /// Resume point
    pub exclusive_start_key: Option<Item>,
    /// Strongly consistent read
    pub consistent_read: bool,
    /// Attributes or count to return
    pub select: Option<Select>,
}

/// Compiled `Scan` call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanRequest {
    /// Table name
    pub table_name: String,
    /// Secondary index, `None` for the base table
    pub index_name: Option<String>,
    /// Filter expression
    pub filter_expression: Option<String>,
    /// Projection expression
    pub projection_expression: Option<String>,
    /// Name placeholders for every expression in the request
    pub expression_attribute_names: HashMap<String, String>,
    /// Value placeholders for every expression in the request
    pub expression_attribute_values: HashMap<String, AttributeValue>,
    /// Items evaluated per call
    pub limit: Option<i32>,
    /// Resume point
    pub exclusive_start_key: Option<Item>,
    /// Strongly consistent read
    pub consistent_read: bool,
    /// Attributes or count to return
    pub select: Option<Select>,
    /// Zero-based segment of a parallel scan
    pub segment: Option<i32>,
    /// Segment count of a parallel scan
    pub total_segments: Option<i32>,
}

/// Compiled `GetItem` call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetItemRequest {
    /// Table name
    pub table_name: String,
    /// Full primary key
    pub key: Item,
    /// Projection expression
    pub projection_expression: Option<String>,
    /// Name placeholders used by the projection
    pub expression_attribute_names: HashMap<String, String>,
    /// Strongly consistent read
    pub consistent_read: bool,
}

/// One `BatchGetItem` chunk
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchGetRequest {
    /// Table name
    pub table_name: String,
    /// Keys to read, at most 100
    pub keys: Vec<Item>,
    /// Projection expression
    pub projection_expression: Option<String>,
    /// Name placeholders used by the projection
    pub expression_attribute_names: HashMap<String, String>,
    /// Strongly consistent read
    pub consistent_read: bool,
}

/// One write inside a `BatchWriteItem` chunk
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Put a full item
    Put(Item),
    /// Delete by primary key
    Delete(Item),
}

/// One `BatchWriteItem` chunk
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchWriteRequest {
    /// Table name
    pub table_name: String,
    /// Writes, at most 25
    pub operations: Vec<WriteOp>,
}

/// Compiled `UpdateItem` call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateItemRequest {
    /// Table name
    pub table_name: String,
    /// Full primary key
    pub key: Item,
    /// Update expression
    pub update_expression: String,
    /// Condition the stored item must satisfy
    pub condition_expression: Option<String>,
    /// Name placeholders for both expressions
    pub expression_attribute_names: HashMap<String, String>,
    /// Value placeholders for both expressions
    pub expression_attribute_values: HashMap<String, AttributeValue>,
    /// Return the item as it is after the update
    pub return_all_new: bool,
}

/// One page of a `Query` or `Scan`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    /// Items on this page
    pub items: Vec<Item>,
    /// Items matching after filtering
    pub count: i32,
    /// Items evaluated before filtering
    pub scanned_count: i32,
    /// Where the next page starts, `None` when exhausted
    pub last_evaluated_key: Option<Item>,
}

/// Result of one `BatchGetItem` chunk
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchGetResponse {
    /// Items read
    pub items: Vec<Item>,
    /// Keys the store declined to process
    pub unprocessed_keys: Vec<Item>,
    /// Capacity consumed by the call
    pub consumed_capacity: Vec<ConsumedCapacity>,
}

/// Result of one `BatchWriteItem` chunk
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchWriteResponse {
    /// Writes the store declined to process
    pub unprocessed: Vec<WriteOp>,
    /// Capacity consumed by the call
    pub consumed_capacity: Vec<ConsumedCapacity>,
}

/// Result of `UpdateItem`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateItemResponse {
    /// Updated item when requested
    pub attributes: Option<Item>,
}

/// Minimal remote-call interface to DynamoDB
///
/// The only network-facing dependency of the crate. Implemented for
/// [`aws_sdk_dynamodb::Client`]; tests supply scripted implementations.
pub trait Transport: Send + Sync + 'static {
    /// Run one `Query` page
    fn query(&self, request: QueryRequest)
    -> impl Future<Output = Result<Page, TransportError>> + Send;

    /// Run one `Scan` page
    fn scan(&self, request: ScanRequest) -> impl Future<Output = Result<Page, TransportError>> + Send;

    /// Read one item by key
    fn get_item(
        &self,
        request: GetItemRequest,
    ) -> impl Future<Output = Result<Option<Item>, TransportError>> + Send;

    /// Read one chunk of keys
    fn batch_get_item(
        &self,
        request: BatchGetRequest,
    ) -> impl Future<Output = Result<BatchGetResponse, TransportError>> + Send;

    /// Apply one chunk of writes
    fn batch_write_item(
        &self,
        request: BatchWriteRequest,
    ) -> impl Future<Output = Result<BatchWriteResponse, TransportError>> + Send;

    /// Apply an update expression to one item
    fn update_item(
        &self,
        request: UpdateItemRequest,
    ) -> impl Future<Output = Result<UpdateItemResponse, TransportError>> + Send;
}

fn sdk_error<E>(operation: &'static str) -> impl FnOnce(E) -> TransportError
where
    aws_sdk_dynamodb::Error: From<E>,
{
    move |e| TransportError::new(operation, aws_sdk_dynamodb::Error::from(e))
}

/// DynamoDB rejects empty placeholder maps
fn non_empty<V>(map: HashMap<String, V>) -> Option<HashMap<String, V>> {
    (!map.is_empty()).then_some(map)
}

impl Transport for Client {
    async fn query(&self, request: QueryRequest) -> Result<Page, TransportError> {
        let output = self
            .query()
            .table_name(request.table_name)
            .set_index_name(request.index_name)
            .key_condition_expression(request.key_condition_expression)
            .set_filter_expression(request.filter_expression)
            .set_projection_expression(request.projection_expression)
            .set_expression_attribute_names(non_empty(request.expression_attribute_names))
            .set_expression_attribute_values(non_empty(request.expression_attribute_values))
            .scan_index_forward(request.scan_index_forward)
            .set_limit(request.limit)
            .set_exclusive_start_key(request.exclusive_start_key)
            .consistent_read(request.consistent_read)
            .set_select(request.select)
            .send()
            .await
            .map_err(sdk_error("Query"))?;

        Ok(Page {
            items: output.items.unwrap_or_default(),
            count: output.count,
            scanned_count: output.scanned_count,
            last_evaluated_key: output.last_evaluated_key.filter(|key| !key.is_empty()),
        })
    }

    async fn scan(&self, request: ScanRequest) -> Result<Page, TransportError> {
        let output = self
            .scan()
            .table_name(request.table_name)
            .set_index_name(request.index_name)
            .set_filter_expression(request.filter_expression)
            .set_projection_expression(request.projection_expression)
            .set_expression_attribute_names(non_empty(request.expression_attribute_names))
            .set_expression_attribute_values(non_empty(request.expression_attribute_values))
            .set_limit(request.limit)
            .set_exclusive_start_key(request.exclusive_start_key)
            .consistent_read(request.consistent_read)
            .set_select(request.select)
            .set_segment(request.segment)
            .set_total_segments(request.total_segments)
            .send()
            .await
            .map_err(sdk_error("Scan"))?;

        Ok(Page {
            items: output.items.unwrap_or_default(),
            count: output.count,
            scanned_count: output.scanned_count,
            last_evaluated_key: output.last_evaluated_key.filter(|key| !key.is_empty()),
        })
    }

    async fn get_item(&self, request: GetItemRequest) -> Result<Option<Item>, TransportError> {
        let output = self
            .get_item()
            .table_name(request.table_name)
            .set_key(Some(request.key))
            .set_projection_expression(request.projection_expression)
            .set_expression_attribute_names(non_empty(request.expression_attribute_names))
            .consistent_read(request.consistent_read)
            .send()
            .await
            .map_err(sdk_error("GetItem"))?;

        Ok(output.item)
    }

    async fn batch_get_item(
        &self,
        request: BatchGetRequest,
    ) -> Result<BatchGetResponse, TransportError> {
        let keys_and_attributes = KeysAndAttributes::builder()
            .set_keys(Some(request.keys))
            .set_projection_expression(request.projection_expression)
            .set_expression_attribute_names(non_empty(request.expression_attribute_names))
            .consistent_read(request.consistent_read)
            .build()
            .map_err(|e| TransportError::new("BatchGetItem", e))?;

        let output = self
            .batch_get_item()
            .request_items(request.table_name, keys_and_attributes)
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .send()
            .await
            .map_err(sdk_error("BatchGetItem"))?;

        let items = output
            .responses
            .unwrap_or_default()
            .into_values()
            .flatten()
            .collect();
        let unprocessed_keys = output
            .unprocessed_keys
            .unwrap_or_default()
            .into_values()
            .flat_map(|keys_and_attributes| keys_and_attributes.keys)
            .collect();

        Ok(BatchGetResponse {
            items,
            unprocessed_keys,
            consumed_capacity: output.consumed_capacity.unwrap_or_default(),
        })
    }

    async fn batch_write_item(
        &self,
        request: BatchWriteRequest,
    ) -> Result<BatchWriteResponse, TransportError> {
        let mut write_ops = Vec::with_capacity(request.operations.len());
        for operation in request.operations {
            let write_request = match operation {
                WriteOp::Put(item) => WriteRequest::builder()
                    .set_put_request(Some(
                        PutRequest::builder()
                            .set_item(Some(item))
                            .build()
                            .map_err(|e| TransportError::new("BatchWriteItem", e))?,
                    ))
                    .build(),
                WriteOp::Delete(key) => WriteRequest::builder()
                    .set_delete_request(Some(
                        DeleteRequest::builder()
                            .set_key(Some(key))
                            .build()
                            .map_err(|e| TransportError::new("BatchWriteItem", e))?,
                    ))
                    .build(),
            };
            write_ops.push(write_request);
        }

        let output = self
            .batch_write_item()
            .request_items(request.table_name, write_ops)
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .send()
            .await
            .map_err(sdk_error("BatchWriteItem"))?;

        let mut unprocessed = Vec::new();
        for requests in output.unprocessed_items.unwrap_or_default().into_values() {
            for request in requests {
                if let Some(put_request) = request.put_request {
                    unprocessed.push(WriteOp::Put(put_request.item));
                }
                if let Some(delete_request) = request.delete_request {
                    unprocessed.push(WriteOp::Delete(delete_request.key));
                }
            }
        }

        Ok(BatchWriteResponse {
            unprocessed,
            consumed_capacity: output.consumed_capacity.unwrap_or_default(),
        })
    }

    async fn update_item(
        &self,
        request: UpdateItemRequest,
    ) -> Result<UpdateItemResponse, TransportError> {
        let return_values = if request.return_all_new {
            ReturnValue::AllNew
        } else {
            ReturnValue::None
        };

        let output = self
            .update_item()
            .table_name(request.table_name)
            .set_key(Some(request.key))
            .update_expression(request.update_expression)
            .set_condition_expression(request.condition_expression)
            .set_expression_attribute_names(non_empty(request.expression_attribute_names))
            .set_expression_attribute_values(non_empty(request.expression_attribute_values))
            .return_values(return_values)
            .send()
            .await
            .map_err(sdk_error("UpdateItem"))?;

        Ok(UpdateItemResponse {
            attributes: output.attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty() {
        assert!(non_empty::<String>(HashMap::new()).is_none());
        let mut names = HashMap::new();
        let _ = names.insert("#n0".to_string(), "status".to_string());
        assert_eq!(non_empty(names).unwrap().len(), 1);
    }

    #[test]
    fn test_transport_error_display_and_source() {
        let err = TransportError::new("BatchWriteItem", "ThrottlingException");
        assert_eq!(
            err.to_string(),
            "DynamoDB BatchWriteItem error: ThrottlingException"
        );
        assert!(StdError::source(&err).is_some());
        assert_eq!(err.inner().to_string(), "ThrottlingException");
    }
}
