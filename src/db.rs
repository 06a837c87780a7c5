use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::Error;
use crate::batch::{self, BatchGetOutput, BatchWriteOutput};
use crate::config::DbConfig;
use crate::marshal::{Marshaler, SerdeMarshaler};
use crate::query::{ExpressionCompiler, Query, UpdateBuilder};
use crate::schema::{DynamoTable, Key, SchemaCache, TableSchema};
use crate::transport::{Transport, WriteOp};

/// Entry point for queries, updates and batches against DynamoDB.
///
/// Owns the transport, the marshaler, the schema cache and the handle-wide
/// [`DbConfig`]. Cloning is cheap and clones share all four.
///
/// ```rust,no_run
/// use dynamo_query::{Db, Error};
///
/// # async fn example() -> Result<(), Error> {
/// let db = Db::from_env().await;
/// # Ok(())
/// # }
/// ```
pub struct Db<C = aws_sdk_dynamodb::Client, M = SerdeMarshaler> {
    transport: Arc<C>,
    marshaler: Arc<M>,
    schemas: Arc<SchemaCache>,
    config: Arc<DbConfig>,
}

impl Db {
    /// Handle over an SDK client built by [`crate::load_sdk_config`], configured from `DYNAMO_QUERY_*`
    pub async fn from_env() -> Self {
        let sdk_config = crate::load_sdk_config().await;
        Db::new(aws_sdk_dynamodb::Client::new(&sdk_config)).with_config(DbConfig::from_env())
    }
}

impl<C: Transport> Db<C, SerdeMarshaler> {
    /// Handle over `transport` with default configuration
    pub fn new(transport: C) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    /// Handle over a shared transport
    pub fn from_arc(transport: Arc<C>) -> Self {
        Self {
            transport,
            marshaler: Arc::new(SerdeMarshaler),
            schemas: Arc::new(SchemaCache::new()),
            config: Arc::new(DbConfig::default()),
        }
    }
}

impl<C, M> Db<C, M>
where
    C: Transport,
    M: Marshaler,
{
    /// Swap the marshaler
    pub fn with_marshaler<N: Marshaler>(self, marshaler: N) -> Db<C, N> {
        Db {
            transport: self.transport,
            marshaler: Arc::new(marshaler),
            schemas: self.schemas,
            config: self.config,
        }
    }

    /// Replace the configuration; chunk sizes are clamped to the store ceilings
    #[must_use]
    pub fn with_config(mut self, config: DbConfig) -> Self {
        self.config = Arc::new(config.clamped());
        self
    }

    /// Share a schema cache with other handles
    #[must_use]
    pub fn with_schema_cache(mut self, schemas: Arc<SchemaCache>) -> Self {
        self.schemas = schemas;
        self
    }

    /// Underlying transport
    pub fn transport(&self) -> &C {
        &self.transport
    }

    pub(crate) fn shared_transport(&self) -> &Arc<C> {
        &self.transport
    }

    /// Marshaler
    pub fn marshaler(&self) -> &M {
        &self.marshaler
    }

    /// Configuration
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Schema cache
    pub fn schemas(&self) -> &Arc<SchemaCache> {
        &self.schemas
    }

    /// Validated schema of `T`, described on first use
    pub fn schema<T: DynamoTable>(&self) -> Result<Arc<TableSchema>, Error> {
        self.schemas.schema_for::<T>()
    }

    /// Start a read of `T`
    pub fn query<T: DynamoTable>(&self) -> Query<'_, T, C, M> {
        Query::new(self)
    }

    /// Start an update of one `T`
    pub fn update<T: DynamoTable>(&self) -> UpdateBuilder<'_, T, C, M> {
        UpdateBuilder::new(self)
    }

    /// Read items by key in chunks of at most 100, retrying unprocessed keys.
    ///
    /// `projection` limits the attributes read; empty reads everything.
    pub async fn batch_get<T: DynamoTable>(
        &self,
        keys: Vec<Key>,
        projection: &[&str],
    ) -> Result<BatchGetOutput<T>, Error> {
        self.batch_get_before::<T>(keys, projection, None).await
    }

    /// [`Db::batch_get`] that sends nothing once `deadline` has passed.
    ///
    /// An elapsed deadline before the first call is [`Error::Timeout`]; later it
    /// ends the retries with [`Error::PartialBatchFailure`] listing the unread keys.
    pub async fn batch_get_before<T: DynamoTable>(
        &self,
        keys: Vec<Key>,
        projection: &[&str],
        deadline: Option<Instant>,
    ) -> Result<BatchGetOutput<T>, Error> {
        let schema = self.schema::<T>()?;
        let keys = keys
            .iter()
            .map(|key| key.to_item(&schema))
            .collect::<Result<Vec<_>, _>>()?;
        let projection: Vec<String> = projection.iter().map(|p| p.to_string()).collect();
        let projection = ExpressionCompiler::new().projection(&projection);

        let output = batch::get_all(
            self.transport(),
            &schema.table,
            keys,
            projection,
            false,
            &self.config,
            deadline,
        )
        .await?;

        Ok(BatchGetOutput {
            items: self.marshaler.decode_all(output.items)?,
            retry_count: output.retry_count,
            total_duration: output.total_duration,
            consumed_capacity: output.consumed_capacity,
        })
    }

    /// Put `puts` and delete `deletes` in chunks of at most 25, retrying unprocessed writes
    pub async fn batch_write<T: DynamoTable>(
        &self,
        puts: Vec<T>,
        deletes: Vec<Key>,
    ) -> Result<BatchWriteOutput, Error> {
        self.batch_write_before::<T>(puts, deletes, None).await
    }

    /// [`Db::batch_write`] that sends nothing once `deadline` has passed.
    ///
    /// An elapsed deadline before the first call is [`Error::Timeout`]; later it
    /// ends the retries with [`Error::PartialBatchFailure`] listing the unapplied writes.
    pub async fn batch_write_before<T: DynamoTable>(
        &self,
        puts: Vec<T>,
        deletes: Vec<Key>,
        deadline: Option<Instant>,
    ) -> Result<BatchWriteOutput, Error> {
        let schema = self.schema::<T>()?;
        let mut operations = Vec::with_capacity(puts.len() + deletes.len());
        for item in &puts {
            operations.push(WriteOp::Put(self.marshaler.encode(item)?));
        }
        for key in &deletes {
            operations.push(WriteOp::Delete(key.to_item(&schema)?));
        }

        batch::write_all(self.transport(), &schema.table, operations, &self.config, deadline).await
    }

    /// Put every item
    pub async fn batch_create<T: DynamoTable>(&self, items: Vec<T>) -> Result<BatchWriteOutput, Error> {
        self.batch_write::<T>(items, Vec::new()).await
    }

    /// Delete every key
    pub async fn batch_delete<T: DynamoTable>(&self, keys: Vec<Key>) -> Result<BatchWriteOutput, Error> {
        self.batch_write::<T>(Vec::new(), keys).await
    }
}

impl<C, M> Clone for Db<C, M> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            marshaler: Arc::clone(&self.marshaler),
            schemas: Arc::clone(&self.schemas),
            config: Arc::clone(&self.config),
        }
    }
}

impl<C, M> fmt::Debug for Db<C, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("schemas", &self.schemas.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
