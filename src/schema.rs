//! Table metadata: key schema, secondary indexes and the per-type schema cache.

use aws_sdk_dynamodb::types::AttributeValue;
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use std::any::TypeId;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::Error;
use crate::transport::Item;

/// Kind of secondary index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// The base table's own key schema
    Primary,
    /// Global secondary index
    Global,
    /// Local secondary index (same partition key as the table)
    Local,
}

/// Attributes copied into an index
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Projection {
    /// Every attribute
    All,
    /// Table and index key attributes only
    KeysOnly,
    /// Key attributes plus the listed attributes
    Include(Vec<String>),
}

/// Key schema of the base table or one of its secondary indexes
///
/// An empty `name` denotes the base table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDescriptor {
    /// Index name, empty for the base table
    pub name: String,
    /// Index kind
    pub kind: IndexKind,
    /// Partition key attribute
    pub partition_key: String,
    /// Sort key attribute, if any
    pub sort_key: Option<String>,
    /// Projected attributes
    pub projection: Projection,
}

impl IndexDescriptor {
    /// Global secondary index projecting all attributes
    pub fn global(name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IndexKind::Global,
            partition_key: partition_key.into(),
            sort_key: None,
            projection: Projection::All,
        }
    }

    /// Local secondary index projecting all attributes
    pub fn local(name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            kind: IndexKind::Local,
            ..Self::global(name, partition_key)
        }
    }

    /// Set the sort key attribute
    #[must_use]
    pub fn with_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }

    /// Set the projection
    #[must_use]
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Whether this descriptor is the base table
    pub fn is_base_table(&self) -> bool {
        self.name.is_empty()
    }

    /// Index name to send on the wire, `None` for the base table
    pub fn wire_name(&self) -> Option<&str> {
        (!self.is_base_table()).then_some(self.name.as_str())
    }

    /// Whether `attribute` (a top-level attribute name) is readable from this index
    ///
    /// Table key attributes are always projected.
    pub fn projects(&self, attribute: &str, table_keys: &[&str]) -> bool {
        if table_keys.contains(&attribute)
            || self.partition_key == attribute
            || self.sort_key.as_deref() == Some(attribute)
        {
            return true;
        }
        match &self.projection {
            Projection::All => true,
            Projection::KeysOnly => false,
            Projection::Include(attributes) => attributes.iter().any(|a| a == attribute),
        }
    }
}

/// Immutable description of one model's table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name
    pub table: String,
    /// Partition key attribute
    pub partition_key: String,
    /// Sort key attribute, if any
    pub sort_key: Option<String>,
    /// Known top-level attributes; empty means "not declared" and disables field checks
    pub attributes: Vec<String>,
    /// Secondary indexes in registration order
    pub indexes: Vec<IndexDescriptor>,
}

impl TableSchema {
    /// Schema with the given table name and partition key
    pub fn new(table: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            partition_key: partition_key.into(),
            sort_key: None,
            attributes: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Set the sort key attribute
    #[must_use]
    pub fn with_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }

    /// Declare the model's attributes
    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Register a secondary index
    #[must_use]
    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    /// Reject ambiguous key schemas
    pub fn validate(&self) -> Result<(), Error> {
        if self.table.is_empty() {
            return Err(Error::validation("table name cannot be empty"));
        }
        check_key_schema(&self.table, &self.partition_key, self.sort_key.as_deref())?;

        let mut seen = HashSet::new();
        for index in &self.indexes {
            if index.name.is_empty() {
                return Err(Error::validation(format!(
                    "table '{}' has a secondary index without a name",
                    self.table
                )));
            }
            if !seen.insert(index.name.as_str()) {
                return Err(Error::validation(format!(
                    "table '{}' registers index '{}' more than once",
                    self.table, index.name
                )));
            }
            check_key_schema(&index.name, &index.partition_key, index.sort_key.as_deref())?;
            if index.kind == IndexKind::Local && index.partition_key != self.partition_key {
                return Err(Error::validation(format!(
                    "local index '{}' must share the table partition key '{}'",
                    index.name, self.partition_key
                )));
            }
        }
        Ok(())
    }

    /// The base table's key schema as an index descriptor
    pub fn base_index(&self) -> IndexDescriptor {
        IndexDescriptor {
            name: String::new(),
            kind: IndexKind::Primary,
            partition_key: self.partition_key.clone(),
            sort_key: self.sort_key.clone(),
            projection: Projection::All,
        }
    }

    /// Look up a secondary index by name
    pub fn index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|index| index.name == name)
    }

    /// Table key attribute names
    pub fn key_attributes(&self) -> Vec<&str> {
        std::iter::once(self.partition_key.as_str())
            .chain(self.sort_key.as_deref())
            .collect()
    }

    /// Whether a (possibly nested) attribute path names a known attribute
    pub fn has_attribute(&self, path: &str) -> bool {
        let root = root_attribute(path);
        if root.is_empty() {
            return false;
        }
        if self.attributes.is_empty() {
            return true;
        }
        self.attributes.iter().any(|a| a == root)
            || self.key_attributes().contains(&root)
            || self.indexes.iter().any(|index| {
                index.partition_key == root || index.sort_key.as_deref() == Some(root)
            })
    }
}

fn check_key_schema(owner: &str, partition_key: &str, sort_key: Option<&str>) -> Result<(), Error> {
    if partition_key.is_empty() {
        return Err(Error::validation(format!(
            "'{owner}' has an empty partition key"
        )));
    }
    match sort_key {
        Some("") => Err(Error::validation(format!("'{owner}' has an empty sort key"))),
        Some(sort_key) if sort_key == partition_key => Err(Error::validation(format!(
            "'{owner}' uses '{sort_key}' as both partition and sort key"
        ))),
        _ => Ok(()),
    }
}

/// Top-level attribute of a document path: `address.city` -> `address`, `tags[0]` -> `tags`
pub(crate) fn root_attribute(path: &str) -> &str {
    path.split(['.', '[']).next().unwrap_or(path)
}

/// Primary key value of one item
#[derive(Clone, Debug, PartialEq)]
pub struct Key {
    /// Partition key value
    pub partition: AttributeValue,
    /// Sort key value, required when the table has a sort key
    pub sort: Option<AttributeValue>,
}

impl Key {
    /// Key with only a partition value
    pub fn new(partition: AttributeValue) -> Self {
        Self {
            partition,
            sort: None,
        }
    }

    /// Key with a string partition value
    pub fn string(partition: impl Into<String>) -> Self {
        Self::new(AttributeValue::S(partition.into()))
    }

    /// Set the sort key value
    #[must_use]
    pub fn with_sort(mut self, sort: AttributeValue) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Render as a wire key, checking it against the table's key schema
    pub fn to_item(&self, schema: &TableSchema) -> Result<Item, Error> {
        let mut item = Item::with_capacity(2);
        let _ = item.insert(schema.partition_key.clone(), self.partition.clone());
        match (&schema.sort_key, &self.sort) {
            (Some(name), Some(value)) => {
                let _ = item.insert(name.clone(), value.clone());
            }
            (Some(name), None) => {
                return Err(Error::validation(format!(
                    "table '{}' requires sort key '{name}'",
                    schema.table
                )));
            }
            (None, Some(_)) => {
                return Err(Error::validation(format!(
                    "table '{}' has no sort key",
                    schema.table
                )));
            }
            (None, None) => {}
        }
        Ok(item)
    }
}

/// Generic table trait
///
/// Describes a model's table once; the description is cached per type by
/// [`SchemaCache`] and only read afterwards.
///
/// # Example
///
/// ```rust
/// use dynamo_query::{DynamoTable, IndexDescriptor};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct User {
///     id: String,
///     status: String,
///     age: u32,
/// }
///
/// impl DynamoTable for User {
///     const TABLE: &'static str = "users";
///     const PARTITION_KEY: &'static str = "id";
///     const ATTRIBUTES: &'static [&'static str] = &["id", "status", "age"];
///
///     fn indexes() -> Vec<IndexDescriptor> {
///         vec![IndexDescriptor::global("status-index", "status")]
///     }
/// }
/// ```
pub trait DynamoTable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of table to retrieve
    const TABLE: &'static str;

    /// Partition key of the table
    const PARTITION_KEY: &'static str;

    /// Sort key of the table
    const SORT_KEY: Option<&'static str> = None;

    /// Top-level attributes conditions may reference; empty disables the check
    const ATTRIBUTES: &'static [&'static str] = &[];

    /// Secondary indexes in registration order
    fn indexes() -> Vec<IndexDescriptor> {
        Vec::new()
    }

    /// Full table description
    fn describe() -> TableSchema {
        let mut schema = TableSchema::new(Self::TABLE, Self::PARTITION_KEY)
            .with_attributes(Self::ATTRIBUTES.iter().copied());
        schema.sort_key = Self::SORT_KEY.map(str::to_string);
        schema.indexes = Self::indexes();
        schema
    }
}

/// Lazily populated, process-lifetime map from model type to its table schema
///
/// Share one cache between handles by cloning the `Arc` it lives in.
#[derive(Debug, Default)]
pub struct SchemaCache {
    schemas: DashMap<TypeId, Arc<TableSchema>>,
}

impl SchemaCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema for `T`, describing and validating it on first use
    ///
    /// Concurrent first uses may both describe `T`; the first insert wins and
    /// every caller observes the same `Arc`.
    pub fn schema_for<T: DynamoTable>(&self) -> Result<Arc<TableSchema>, Error> {
        let id = TypeId::of::<T>();
        if let Some(schema) = self.schemas.get(&id) {
            return Ok(Arc::clone(schema.value()));
        }

        let schema = T::describe();
        schema.validate()?;
        debug!(table = %schema.table, indexes = schema.indexes.len(), "registered table schema");

        let entry = self.schemas.entry(id).or_insert_with(|| Arc::new(schema));
        Ok(Arc::clone(entry.value()))
    }

    /// Number of cached schemas
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Whether nothing has been cached yet
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Order {
        customer: String,
        placed_at: String,
    }

    impl DynamoTable for Order {
        const TABLE: &'static str = "orders";
        const PARTITION_KEY: &'static str = "customer";
        const SORT_KEY: Option<&'static str> = Some("placed_at");
        const ATTRIBUTES: &'static [&'static str] = &["customer", "placed_at", "total"];

        fn indexes() -> Vec<IndexDescriptor> {
            vec![
                IndexDescriptor::global("by-status", "status")
                    .with_sort_key("placed_at")
                    .with_projection(Projection::KeysOnly),
            ]
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Broken;

    impl DynamoTable for Broken {
        const TABLE: &'static str = "broken";
        const PARTITION_KEY: &'static str = "id";
        const SORT_KEY: Option<&'static str> = Some("id");
    }

    #[test]
    fn test_describe_from_constants() {
        let schema = Order::describe();
        assert_eq!(schema.table, "orders");
        assert_eq!(schema.key_attributes(), vec!["customer", "placed_at"]);
        assert_eq!(schema.indexes.len(), 1);
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_ambiguous_keys() {
        assert!(Broken::describe().validate().unwrap_err().is_validation_error());

        let duplicate = TableSchema::new("t", "pk")
            .with_index(IndexDescriptor::global("gsi", "a"))
            .with_index(IndexDescriptor::global("gsi", "b"));
        assert!(duplicate.validate().is_err());

        let unnamed = TableSchema::new("t", "pk").with_index(IndexDescriptor::global("", "a"));
        assert!(unnamed.validate().is_err());

        let local = TableSchema::new("t", "pk").with_index(IndexDescriptor::local("lsi", "other"));
        assert!(local.validate().is_err());
    }

    #[test]
    fn test_has_attribute_uses_path_root() {
        let schema = Order::describe();
        assert!(schema.has_attribute("total"));
        assert!(schema.has_attribute("customer.name"));
        assert!(schema.has_attribute("status"));
        assert!(!schema.has_attribute("colour"));
        assert!(!schema.has_attribute(""));

        let open = TableSchema::new("t", "pk");
        assert!(open.has_attribute("anything"));
    }

    #[test]
    fn test_projects() {
        let index = IndexDescriptor::global("gsi", "status")
            .with_projection(Projection::Include(vec!["total".into()]));
        let keys = ["customer", "placed_at"];
        assert!(index.projects("status", &keys));
        assert!(index.projects("customer", &keys));
        assert!(index.projects("total", &keys));
        assert!(!index.projects("notes", &keys));
    }

    #[test]
    fn test_key_to_item_checks_sort_key() {
        let schema = Order::describe();
        assert!(Key::string("c1").to_item(&schema).is_err());

        let item = Key::string("c1")
            .with_sort(AttributeValue::S("2024-01-01".into()))
            .to_item(&schema)
            .unwrap();
        assert_eq!(item.len(), 2);
        assert_eq!(item["placed_at"], AttributeValue::S("2024-01-01".into()));
    }

    #[test]
    fn test_cache_populates_once() {
        let cache = SchemaCache::new();
        let first = cache.schema_for::<Order>().unwrap();
        let second = cache.schema_for::<Order>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        assert!(cache.schema_for::<Broken>().is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_root_attribute() {
        assert_eq!(root_attribute("a.b.c"), "a");
        assert_eq!(root_attribute("tags[3]"), "tags");
        assert_eq!(root_attribute("plain"), "plain");
    }
}
