use tracing::{debug, warn};

use crate::Error;
use crate::query::condition::{Condition, Operator};
use crate::schema::{IndexDescriptor, IndexKind, Projection, TableSchema, root_attribute};

/// How a plan reaches its items
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessPath {
    /// Key lookup with `Query`
    Query,
    /// Full read with `Scan`
    Scan,
}

/// Outcome of index selection for one request
#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    /// Table name
    pub table: String,
    /// Index read; the base table when its name is empty
    pub index: IndexDescriptor,
    /// Query or scan
    pub access: AccessPath,
    /// Conditions served by the index key schema
    pub key_conditions: Vec<Condition>,
    /// Conditions the store applies after reading
    pub filter_conditions: Vec<Condition>,
    /// No partition-key equality was usable, so every item is read
    pub full_scan: bool,
}

impl QueryPlan {
    /// Whether the plan reads with `Scan`
    pub fn is_scan(&self) -> bool {
        self.access == AccessPath::Scan
    }

    /// Wire index name, `None` for the base table
    pub fn index_name(&self) -> Option<&str> {
        self.index.wire_name()
    }
}

/// Chooses between the base table and its secondary indexes
#[derive(Debug, Clone, Copy)]
pub struct IndexSelector<'a> {
    schema: &'a TableSchema,
}

impl<'a> IndexSelector<'a> {
    /// Selector over one table's key schemas
    pub fn new(schema: &'a TableSchema) -> Self {
        Self { schema }
    }

    /// Pick the most specific index for `conditions`.
    ///
    /// `explicit_index` restricts the choice to that index (scanned if it cannot
    /// be queried). `projection` lists the attributes the caller reads; empty
    /// means all of them.
    pub fn select(
        &self,
        conditions: &[Condition],
        explicit_index: Option<&str>,
        projection: &[String],
    ) -> Result<QueryPlan, Error> {
        let candidates = match explicit_index {
            Some(name) => vec![self.named(name)?],
            None => std::iter::once(self.schema.base_index())
                .chain(self.schema.indexes.iter().cloned())
                .collect::<Vec<_>>(),
        };

        // key match first, then projection coverage; ties keep the earlier
        // candidate: base table, then registration order
        let mut best: Option<((u8, bool), IndexDescriptor)> = None;
        for candidate in candidates.iter() {
            let key_score = score(candidate, conditions);
            if key_score == 0 {
                continue;
            }
            let rank = (key_score, self.covers(candidate, conditions, projection));
            if best.as_ref().is_none_or(|(best_rank, _)| rank > *best_rank) {
                best = Some((rank, candidate.clone()));
            }
        }

        let plan = match best {
            Some((_, index)) => {
                let (key_conditions, filter_conditions) = split_key_conditions(&index, conditions);
                QueryPlan {
                    table: self.schema.table.clone(),
                    index,
                    access: AccessPath::Query,
                    key_conditions,
                    filter_conditions,
                    full_scan: false,
                }
            }
            None => {
                let index = candidates
                    .into_iter()
                    .next()
                    .filter(|_| explicit_index.is_some())
                    .unwrap_or_else(|| self.schema.base_index());
                warn!(
                    table = %self.schema.table,
                    index = index.wire_name().unwrap_or(""),
                    conditions = conditions.len(),
                    "no partition key equality, falling back to full scan"
                );
                QueryPlan {
                    table: self.schema.table.clone(),
                    index,
                    access: AccessPath::Scan,
                    key_conditions: Vec::new(),
                    filter_conditions: conditions.to_vec(),
                    full_scan: true,
                }
            }
        };

        debug!(
            table = %plan.table,
            index = plan.index_name().unwrap_or(""),
            access = ?plan.access,
            key_conditions = plan.key_conditions.len(),
            filter_conditions = plan.filter_conditions.len(),
            "selected access path"
        );
        Ok(plan)
    }

    /// Scan plan over the base table with every condition as a filter
    pub fn scan(&self, conditions: &[Condition], explicit_index: Option<&str>) -> Result<QueryPlan, Error> {
        let index = match explicit_index {
            Some(name) => self.named(name)?,
            None => self.schema.base_index(),
        };
        Ok(QueryPlan {
            table: self.schema.table.clone(),
            index,
            access: AccessPath::Scan,
            key_conditions: Vec::new(),
            filter_conditions: conditions.to_vec(),
            full_scan: true,
        })
    }

    fn named(&self, name: &str) -> Result<IndexDescriptor, Error> {
        self.schema.index(name).cloned().ok_or_else(|| {
            Error::validation(format!(
                "table '{}' has no index named '{name}'",
                self.schema.table
            ))
        })
    }

    /// Whether an index projects every attribute the request touches
    ///
    /// Local indexes fetch missing attributes from the table, so they always cover.
    /// An index that does not cover is still usable; it only loses ties.
    fn covers(&self, index: &IndexDescriptor, conditions: &[Condition], projection: &[String]) -> bool {
        if index.kind == IndexKind::Local {
            return true;
        }
        let table_keys = self.schema.key_attributes();
        if projection.is_empty() {
            return matches!(index.projection, Projection::All);
        }
        conditions
            .iter()
            .map(|c| c.field.as_str())
            .chain(projection.iter().map(String::as_str))
            .all(|field| index.projects(root_attribute(field), &table_keys))
    }
}

/// 0: unusable, 1: partition key equality, 2: plus a usable sort key condition
fn score(index: &IndexDescriptor, conditions: &[Condition]) -> u8 {
    if partition_condition(index, conditions).is_none() {
        return 0;
    }
    if sort_condition(index, conditions).is_some() {
        2
    } else {
        1
    }
}

fn partition_condition(index: &IndexDescriptor, conditions: &[Condition]) -> Option<usize> {
    conditions
        .iter()
        .position(|c| c.field == index.partition_key && c.operator == Operator::Eq)
}

fn sort_condition(index: &IndexDescriptor, conditions: &[Condition]) -> Option<usize> {
    let sort_key = index.sort_key.as_deref()?;
    conditions
        .iter()
        .position(|c| c.field == sort_key && c.operator.is_sort_key_operator())
}

fn split_key_conditions(
    index: &IndexDescriptor,
    conditions: &[Condition],
) -> (Vec<Condition>, Vec<Condition>) {
    let partition = partition_condition(index, conditions);
    let sort = sort_condition(index, conditions);

    let mut key_conditions = Vec::with_capacity(2);
    let mut filter_conditions = Vec::new();
    for (position, condition) in conditions.iter().enumerate() {
        if Some(position) == partition || Some(position) == sort {
            key_conditions.push(condition.clone());
        } else {
            filter_conditions.push(condition.clone());
        }
    }
    // partition key first
    key_conditions.sort_by_key(|c| c.field != index.partition_key);
    (key_conditions, filter_conditions)
}
