/// Common test fixtures and data structures
///
/// Defines reusable models implementing `DynamoTable` for use across
/// multiple test files.
use super::{Deserialize, DynamoTable, Serialize};
use dynamo_query::{IndexDescriptor, Projection};

/// Account keyed by id, with a status index and a status/age index
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub age: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DynamoTable for User {
    const TABLE: &'static str = "tests_users";
    const PARTITION_KEY: &'static str = "Id";
    const ATTRIBUTES: &'static [&'static str] = &["Id", "Status", "Age", "Name", "Tags", "Email", "Profile"];

    fn indexes() -> Vec<IndexDescriptor> {
        vec![
            IndexDescriptor::global("status-index", "Status"),
            IndexDescriptor::global("email-index", "Email").with_projection(Projection::KeysOnly),
        ]
    }
}

/// Order keyed by customer and placement time, with a local total index
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
pub struct Order {
    pub customer: String,
    pub placed_at: String,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub items: Vec<String>,
}

impl DynamoTable for Order {
    const TABLE: &'static str = "tests_orders";
    const PARTITION_KEY: &'static str = "customer";
    const SORT_KEY: Option<&'static str> = Some("placed_at");

    fn indexes() -> Vec<IndexDescriptor> {
        vec![IndexDescriptor::local("by-total", "customer").with_sort_key("total")]
    }
}
