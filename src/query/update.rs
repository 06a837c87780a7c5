use aws_sdk_dynamodb::types::AttributeValue;
use serde::Serialize;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::Error;
use crate::db::Db;
use crate::marshal::Marshaler;
use crate::query::condition::{ConditionSet, Operator, RawExpression};
use crate::query::expression::{CompiledExpressions, ExpressionCompiler, ExpressionSet};
use crate::retry;
use crate::schema::{DynamoTable, Key, TableSchema, root_attribute};
use crate::transport::{Transport, UpdateItemRequest};

#[derive(Clone, Debug)]
enum Action {
    Set(String, AttributeValue),
    SetIfNotExists(String, AttributeValue),
    Increment(String, AttributeValue),
    Decrement(String, AttributeValue),
    Append(String, AttributeValue),
    Prepend(String, AttributeValue),
    Remove(String),
    Add(String, AttributeValue),
    Delete(String, AttributeValue),
}

impl Action {
    fn path(&self) -> &str {
        match self {
            Action::Set(path, _)
            | Action::SetIfNotExists(path, _)
            | Action::Increment(path, _)
            | Action::Decrement(path, _)
            | Action::Append(path, _)
            | Action::Prepend(path, _)
            | Action::Remove(path)
            | Action::Add(path, _)
            | Action::Delete(path, _) => path,
        }
    }
}

/// Fluent `UpdateItem` builder for one model type.
///
/// Clauses render in the order `SET`, `REMOVE`, `ADD`, `DELETE`. Like
/// [`crate::Query`], the first invalid call is recorded and reported by
/// [`UpdateBuilder::execute`] or [`UpdateBuilder::compile`].
pub struct UpdateBuilder<'db, T, C = aws_sdk_dynamodb::Client, M = crate::SerdeMarshaler> {
    db: &'db Db<C, M>,
    schema: Option<Arc<TableSchema>>,
    partition: Option<AttributeValue>,
    sort: Option<AttributeValue>,
    actions: Vec<Action>,
    conditions: ConditionSet,
    deadline: Option<Instant>,
    _marker: PhantomData<fn() -> T>,
}

impl<'db, T, C, M> UpdateBuilder<'db, T, C, M>
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
            partition: None,
            sort: None,
            actions: Vec::new(),
            conditions,
            deadline: None,
            _marker: PhantomData,
        }
    }

    fn failed(&self) -> bool {
        self.conditions.error().is_some()
    }

    fn fail(mut self, error: Error) -> Self {
        let _ = self.conditions.fail(error);
        self
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

    fn check_field(&self, field: &str) -> Result<(), Error> {
        let Some(schema) = &self.schema else {
            return Ok(());
        };
        if !schema.has_attribute(field) {
            return Err(Error::validation(format!(
                "unknown attribute '{field}' on table '{}'",
                schema.table
            )));
        }
        Ok(())
    }

    fn action(mut self, path: &str, action: Action) -> Self {
        if self.failed() {
            return self;
        }
        if let Err(e) = self.check_field(path) {
            return self.fail(e);
        }
        self.actions.push(action);
        self
    }

    fn valued<V: Serialize>(mut self, path: &str, value: V, make: fn(String, AttributeValue) -> Action) -> Self {
        if self.failed() {
            return self;
        }
        match self.encode(&value) {
            Some(value) => self.action(path, make(path.to_string(), value)),
            None => self,
        }
    }

    /// Like [`Self::valued`], with list operands turned into sets
    fn set_valued<V: Serialize>(mut self, path: &str, value: V, make: fn(String, AttributeValue) -> Action) -> Self {
        if self.failed() {
            return self;
        }
        let Some(value) = self.encode(&value) else {
            return self;
        };
        match into_set(value) {
            Ok(value) => self.action(path, make(path.to_string(), value)),
            Err(e) => self.fail(e),
        }
    }

    /// Partition key of the item to update
    pub fn partition_key<V: Serialize>(mut self, value: V) -> Self {
        if self.failed() {
            return self;
        }
        if let Some(value) = self.encode(&value) {
            self.partition = Some(value);
        }
        self
    }

    /// Sort key of the item to update
    pub fn sort_key<V: Serialize>(mut self, value: V) -> Self {
        if self.failed() {
            return self;
        }
        if let Some(value) = self.encode(&value) {
            self.sort = Some(value);
        }
        self
    }

    /// Both key values at once
    pub fn key(mut self, key: Key) -> Self {
        if self.failed() {
            return self;
        }
        self.partition = Some(key.partition);
        self.sort = key.sort;
        self
    }

    /// `SET path = value`
    pub fn set<V: Serialize>(self, path: &str, value: V) -> Self {
        self.valued(path, value, Action::Set)
    }

    /// `SET path = if_not_exists(path, value)`
    pub fn set_if_not_exists<V: Serialize>(self, path: &str, value: V) -> Self {
        self.valued(path, value, Action::SetIfNotExists)
    }

    /// `ADD path value` for numbers and sets; a list of strings, numbers or
    /// binaries is sent as the matching set type
    pub fn add<V: Serialize>(self, path: &str, value: V) -> Self {
        self.set_valued(path, value, Action::Add)
    }

    /// `SET path = path + by`
    pub fn increment<V: Serialize>(self, path: &str, by: V) -> Self {
        self.valued(path, by, Action::Increment)
    }

    /// `SET path = path - by`
    pub fn decrement<V: Serialize>(self, path: &str, by: V) -> Self {
        self.valued(path, by, Action::Decrement)
    }

    /// `REMOVE path`
    pub fn remove(self, path: &str) -> Self {
        self.action(path, Action::Remove(path.to_string()))
    }

    /// `DELETE path values` removing elements from a set
    pub fn delete<V: Serialize>(self, path: &str, values: V) -> Self {
        self.set_valued(path, values, Action::Delete)
    }

    /// `SET path = list_append(path, values)`
    pub fn append_to_list<V: Serialize>(self, path: &str, values: Vec<V>) -> Self {
        self.valued(path, values, Action::Append)
    }

    /// `SET path = list_append(values, path)`
    pub fn prepend_to_list<V: Serialize>(self, path: &str, values: Vec<V>) -> Self {
        self.valued(path, values, Action::Prepend)
    }

    /// Only apply the update when `field <operator> value` holds for the stored item
    pub fn condition<V: Serialize>(mut self, field: &str, operator: Operator, value: V) -> Self {
        if self.failed() {
            return self;
        }
        if let Err(e) = self.check_field(field) {
            return self.fail(e);
        }
        if let Some(value) = self.encode(&value) {
            let _ = self.conditions.append(field, operator, vec![value]);
        }
        self
    }

    /// Only apply the update when `field` exists
    pub fn condition_exists(mut self, field: &str) -> Self {
        let _ = self
            .conditions
            .append(field, Operator::AttributeExists, Vec::new());
        self
    }

    /// Only apply the update when `field` does not exist
    pub fn condition_not_exists(mut self, field: &str) -> Self {
        let _ = self
            .conditions
            .append(field, Operator::AttributeNotExists, Vec::new());
        self
    }

    /// AND a caller-written fragment onto the condition expression
    pub fn condition_expression(mut self, raw: RawExpression) -> Self {
        let _ = self.conditions.append_raw(raw);
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

    /// Validate and render the request without sending it
    pub fn compile(self) -> Result<UpdateItemRequest, Error> {
        let (conditions, raw) = self.conditions.into_parts()?;
        let schema = self
            .schema
            .ok_or_else(|| Error::validation("no schema registered for update"))?;

        if self.actions.is_empty() {
            return Err(Error::validation("update has no actions"));
        }
        let partition = self.partition.ok_or_else(|| {
            Error::validation(format!(
                "update on '{}' requires partition key '{}'",
                schema.table, schema.partition_key
            ))
        })?;
        let key = Key {
            partition,
            sort: self.sort,
        }
        .to_item(&schema)?;

        let key_attributes = schema.key_attributes();
        let mut seen = HashSet::new();
        for action in &self.actions {
            let path = action.path();
            if key_attributes.contains(&root_attribute(path)) {
                return Err(Error::validation(format!(
                    "key attribute '{path}' cannot be updated"
                )));
            }
            if !seen.insert(path) {
                return Err(Error::validation(format!(
                    "attribute '{path}' is updated more than once"
                )));
            }
        }

        let mut compiler = ExpressionCompiler::new();
        let update = render_actions(&mut compiler, &self.actions);
        let condition = compiler.conditions(&conditions);
        let condition = compiler.merge_raw(condition, &raw)?;
        let expressions = CompiledExpressions {
            update: Some(update),
            condition,
            ..CompiledExpressions::default()
        };

        Ok(UpdateItemRequest {
            table_name: schema.table.clone(),
            key,
            update_expression: expressions
                .update
                .as_ref()
                .map(|u| u.expression.clone())
                .unwrap_or_default(),
            condition_expression: expressions.condition.as_ref().map(|c| c.expression.clone()),
            expression_attribute_names: expressions.names(),
            expression_attribute_values: expressions.values(),
            return_all_new: true,
        })
    }

    /// Apply the update and return the item as stored afterwards
    pub async fn execute(self) -> Result<Option<T>, Error> {
        let db = self.db;
        let deadline = self.deadline;
        let request = self.compile()?;

        retry::check_deadline(deadline, "UpdateItem", 0)?;
        debug!(
            table = %request.table_name,
            update = %request.update_expression,
            conditional = request.condition_expression.is_some(),
            "updating item"
        );
        let response = db.transport().update_item(request).await?;
        response
            .attributes
            .map(|item| db.marshaler().decode(item))
            .transpose()
    }
}

impl<T, C, M> std::fmt::Debug for UpdateBuilder<'_, T, C, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBuilder")
            .field("table", &self.schema.as_ref().map(|s| s.table.as_str()))
            .field("actions", &self.actions)
            .field("conditions", &self.conditions)
            .finish_non_exhaustive()
    }
}

/// Turn a homogeneous list of strings, numbers or binaries into a set.
///
/// Other values pass through untouched; an empty list has no set form.
fn into_set(value: AttributeValue) -> Result<AttributeValue, Error> {
    let AttributeValue::L(values) = value else {
        return Ok(value);
    };
    let Some(first) = values.first() else {
        return Err(Error::validation("set operand cannot be empty"));
    };

    let mismatch = || Error::validation("set operand must hold only strings, only numbers or only binaries");
    match first {
        AttributeValue::S(_) => values
            .into_iter()
            .map(|v| match v {
                AttributeValue::S(s) => Ok(s),
                _ => Err(mismatch()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(AttributeValue::Ss),
        AttributeValue::N(_) => values
            .into_iter()
            .map(|v| match v {
                AttributeValue::N(n) => Ok(n),
                _ => Err(mismatch()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(AttributeValue::Ns),
        AttributeValue::B(_) => values
            .into_iter()
            .map(|v| match v {
                AttributeValue::B(b) => Ok(b),
                _ => Err(mismatch()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(AttributeValue::Bs),
        _ => Err(mismatch()),
    }
}

fn render_actions(compiler: &mut ExpressionCompiler, actions: &[Action]) -> ExpressionSet {
    let mut set = ExpressionSet::default();
    let mut sets = Vec::new();
    let mut removes = Vec::new();
    let mut adds = Vec::new();
    let mut deletes = Vec::new();

    for action in actions {
        let path = compiler.path(action.path(), &mut set);
        match action {
            Action::Set(_, value) => {
                let value = compiler.value(value.clone(), &mut set);
                sets.push(format!("{path} = {value}"));
            }
            Action::SetIfNotExists(_, value) => {
                let value = compiler.value(value.clone(), &mut set);
                sets.push(format!("{path} = if_not_exists({path}, {value})"));
            }
            Action::Increment(_, value) => {
                let value = compiler.value(value.clone(), &mut set);
                sets.push(format!("{path} = {path} + {value}"));
            }
            Action::Decrement(_, value) => {
                let value = compiler.value(value.clone(), &mut set);
                sets.push(format!("{path} = {path} - {value}"));
            }
            Action::Append(_, value) => {
                let value = compiler.value(value.clone(), &mut set);
                sets.push(format!("{path} = list_append({path}, {value})"));
            }
            Action::Prepend(_, value) => {
                let value = compiler.value(value.clone(), &mut set);
                sets.push(format!("{path} = list_append({value}, {path})"));
            }
            Action::Remove(_) => removes.push(path),
            Action::Add(_, value) => {
                let value = compiler.value(value.clone(), &mut set);
                adds.push(format!("{path} {value}"));
            }
            Action::Delete(_, value) => {
                let value = compiler.value(value.clone(), &mut set);
                deletes.push(format!("{path} {value}"));
            }
        }
    }

    let clauses: Vec<String> = [("SET", sets), ("REMOVE", removes), ("ADD", adds), ("DELETE", deletes)]
        .into_iter()
        .filter(|(_, parts)| !parts.is_empty())
        .map(|(keyword, parts)| format!("{keyword} {}", parts.join(", ")))
        .collect();
    set.expression = clauses.join(" ");
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: i64) -> AttributeValue {
        AttributeValue::N(v.to_string())
    }

    #[test]
    fn test_clause_order_and_forms() {
        let mut compiler = ExpressionCompiler::new();
        let set = render_actions(
            &mut compiler,
            &[
                Action::Delete("tags".into(), AttributeValue::Ss(vec!["old".into()])),
                Action::Add("visits".into(), n(1)),
                Action::Remove("nickname".into()),
                Action::Increment("score".into(), n(5)),
                Action::SetIfNotExists("created".into(), n(0)),
                Action::Prepend("history".into(), AttributeValue::L(vec![n(9)])),
            ],
        );
        assert_eq!(
            set.expression,
            "SET #n3 = #n3 + :v2, #n4 = if_not_exists(#n4, :v3), #n5 = list_append(:v4, #n5) \
             REMOVE #n2 ADD #n1 :v1 DELETE #n0 :v0"
        );
        assert_eq!(set.names.len(), 6);
        assert_eq!(set.values.len(), 5);
    }

    #[test]
    fn test_into_set() {
        let list = |items: Vec<AttributeValue>| AttributeValue::L(items);
        let s = |v: &str| AttributeValue::S(v.to_string());

        assert_eq!(
            into_set(list(vec![s("a"), s("b")])).unwrap(),
            AttributeValue::Ss(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            into_set(list(vec![n(1), n(2)])).unwrap(),
            AttributeValue::Ns(vec!["1".into(), "2".into()])
        );
        assert_eq!(into_set(n(5)).unwrap(), n(5));
        assert!(into_set(list(vec![])).is_err());
        assert!(into_set(list(vec![s("a"), n(1)])).is_err());
    }

    #[test]
    fn test_decrement_and_append() {
        let mut compiler = ExpressionCompiler::new();
        let set = render_actions(
            &mut compiler,
            &[
                Action::Decrement("stock".into(), n(2)),
                Action::Append("log".into(), AttributeValue::L(vec![])),
                Action::Set("profile.city".into(), AttributeValue::S("Oslo".into())),
            ],
        );
        assert_eq!(
            set.expression,
            "SET #n0 = #n0 - :v0, #n1 = list_append(#n1, :v1), #n2.#n3 = :v2"
        );
    }
}
