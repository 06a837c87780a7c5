use aws_sdk_dynamodb::types::AttributeValue;
use std::collections::{HashMap, HashSet};

use crate::Error;
use crate::query::condition::{Condition, Operator, RawExpression};

/// One compiled expression with the placeholders it references
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExpressionSet {
    /// Expression text
    pub expression: String,
    /// Name placeholders (`#nN` -> attribute)
    pub names: HashMap<String, String>,
    /// Value placeholders (`:vN` -> value)
    pub values: HashMap<String, AttributeValue>,
}

impl ExpressionSet {
    fn absorb(&mut self, raw: &RawExpression) {
        self.names
            .extend(raw.names.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.values
            .extend(raw.values.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Every expression of one request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompiledExpressions {
    /// `KeyConditionExpression`
    pub key_condition: Option<ExpressionSet>,
    /// `FilterExpression`
    pub filter: Option<ExpressionSet>,
    /// `ProjectionExpression`
    pub projection: Option<ExpressionSet>,
    /// `UpdateExpression`
    pub update: Option<ExpressionSet>,
    /// `ConditionExpression`
    pub condition: Option<ExpressionSet>,
}

impl CompiledExpressions {
    fn sets(&self) -> impl Iterator<Item = &ExpressionSet> {
        [
            &self.key_condition,
            &self.filter,
            &self.projection,
            &self.update,
            &self.condition,
        ]
        .into_iter()
        .flatten()
    }

    /// Name placeholders of every expression, merged
    pub fn names(&self) -> HashMap<String, String> {
        self.sets()
            .flat_map(|set| set.names.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    /// Value placeholders of every expression, merged
    pub fn values(&self) -> HashMap<String, AttributeValue> {
        self.sets()
            .flat_map(|set| set.values.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}

/// Renders conditions, projections and updates with collision-free placeholders.
///
/// One compiler serves one request, so every expression category of that
/// request draws from the same counters: `#nN` for names and `:vN` for
/// values. An attribute name keeps its placeholder for the whole request;
/// every operand gets a fresh one. Raw fragments are merged after generated
/// expressions and may not reuse any placeholder already issued.
#[derive(Debug, Default)]
pub struct ExpressionCompiler {
    next_name: usize,
    next_value: usize,
    name_placeholders: HashMap<String, String>,
    issued: HashSet<String>,
}

impl ExpressionCompiler {
    /// Fresh compiler for one request
    pub fn new() -> Self {
        Self::default()
    }

    /// Conjunction of `conditions`, `None` when there are none
    pub fn conditions(&mut self, conditions: &[Condition]) -> Option<ExpressionSet> {
        if conditions.is_empty() {
            return None;
        }
        let mut set = ExpressionSet::default();
        let rendered: Vec<String> = conditions
            .iter()
            .map(|condition| self.condition(condition, &mut set))
            .collect();
        set.expression = rendered.join(" AND ");
        Some(set)
    }

    /// Projection list, `None` when every attribute is wanted
    pub fn projection(&mut self, fields: &[String]) -> Option<ExpressionSet> {
        if fields.is_empty() {
            return None;
        }
        let mut set = ExpressionSet::default();
        let rendered: Vec<String> = fields.iter().map(|f| self.path(f, &mut set)).collect();
        set.expression = rendered.join(", ");
        Some(set)
    }

    /// AND raw fragments onto `generated`.
    ///
    /// A single part is emitted bare; several parts are each parenthesised,
    /// fragments first: `(raw) AND (generated)`.
    pub fn merge_raw(
        &mut self,
        generated: Option<ExpressionSet>,
        raw: &[RawExpression],
    ) -> Result<Option<ExpressionSet>, Error> {
        if raw.is_empty() {
            return Ok(generated);
        }

        let mut merged = ExpressionSet::default();
        let mut parts = Vec::with_capacity(raw.len() + 1);
        for fragment in raw {
            fragment.validate()?;
            for key in fragment.names.keys().chain(fragment.values.keys()) {
                if self.issued.contains(key) {
                    return Err(Error::PlaceholderCollision {
                        placeholder: key.clone(),
                    });
                }
            }
            if let Some(unused) = fragment.unused_placeholder() {
                return Err(Error::validation(format!(
                    "raw expression declares unused placeholder '{unused}'"
                )));
            }
            self.issued
                .extend(fragment.names.keys().chain(fragment.values.keys()).cloned());
            merged.absorb(fragment);
            parts.push(fragment.expression.clone());
        }

        if let Some(generated) = generated {
            merged.names.extend(generated.names);
            merged.values.extend(generated.values);
            parts.push(generated.expression);
        }

        merged.expression = if parts.len() == 1 {
            parts.remove(0)
        } else {
            parts
                .iter()
                .map(|part| format!("({part})"))
                .collect::<Vec<_>>()
                .join(" AND ")
        };
        Ok(Some(merged))
    }

    fn condition(&mut self, condition: &Condition, set: &mut ExpressionSet) -> String {
        let name = self.path(&condition.field, set);
        let values: Vec<String> = condition
            .values
            .iter()
            .map(|value| self.value(value.clone(), set))
            .collect();

        match condition.operator {
            Operator::Eq
            | Operator::Ne
            | Operator::Lt
            | Operator::Le
            | Operator::Gt
            | Operator::Ge => format!("{name} {} {}", condition.operator, values[0]),
            Operator::Between => format!("{name} BETWEEN {} AND {}", values[0], values[1]),
            Operator::In => format!("{name} IN ({})", values.join(", ")),
            Operator::BeginsWith | Operator::Contains => {
                format!("{}({name}, {})", condition.operator, values[0])
            }
            Operator::AttributeExists | Operator::AttributeNotExists => {
                format!("{}({name})", condition.operator)
            }
        }
    }

    /// Placeholder path for `a.b[2].c`: `#n0.#n1[2].#n2`
    pub(crate) fn path(&mut self, path: &str, set: &mut ExpressionSet) -> String {
        path.split('.')
            .map(|segment| {
                let (name, index) = match segment.find('[') {
                    Some(at) => segment.split_at(at),
                    None => (segment, ""),
                };
                format!("{}{index}", self.name(name, set))
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    fn name(&mut self, attribute: &str, set: &mut ExpressionSet) -> String {
        let placeholder = match self.name_placeholders.get(attribute) {
            Some(placeholder) => placeholder.clone(),
            None => {
                let placeholder = format!("#n{}", self.next_name);
                self.next_name += 1;
                let _ = self
                    .name_placeholders
                    .insert(attribute.to_string(), placeholder.clone());
                let _ = self.issued.insert(placeholder.clone());
                placeholder
            }
        };
        let _ = set.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    pub(crate) fn value(&mut self, value: AttributeValue, set: &mut ExpressionSet) -> String {
        let placeholder = format!(":v{}", self.next_value);
        self.next_value += 1;
        let _ = self.issued.insert(placeholder.clone());
        let _ = set.values.insert(placeholder.clone(), value);
        placeholder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::condition::placeholder_tokens;

    fn s(v: &str) -> AttributeValue {
        AttributeValue::S(v.to_string())
    }

    fn n(v: i64) -> AttributeValue {
        AttributeValue::N(v.to_string())
    }

    fn assert_closed(set: &ExpressionSet) {
        let referenced: HashSet<String> = placeholder_tokens(&set.expression)
            .into_iter()
            .map(str::to_string)
            .collect();
        let declared: HashSet<String> = set.names.keys().chain(set.values.keys()).cloned().collect();
        assert_eq!(referenced, declared, "expression: {}", set.expression);
    }

    #[test]
    fn test_key_and_filter_share_counters() {
        let mut compiler = ExpressionCompiler::new();
        let key = compiler.conditions(&[Condition::eq("Status", s("active"))]).unwrap();
        let filter = compiler
            .conditions(&[Condition::new("Age", Operator::Ge, vec![n(18)]).unwrap()])
            .unwrap();

        assert_eq!(key.expression, "#n0 = :v0");
        assert_eq!(key.names["#n0"], "Status");
        assert_eq!(key.values[":v0"], s("active"));
        assert_eq!(filter.expression, "#n1 >= :v1");
        assert_eq!(filter.names["#n1"], "Age");
        assert_eq!(filter.values[":v1"], n(18));
    }

    #[test]
    fn test_operator_rendering() {
        let mut compiler = ExpressionCompiler::new();
        let set = compiler
            .conditions(&[
                Condition::new("a", Operator::Between, vec![n(1), n(5)]).unwrap(),
                Condition::new("b", Operator::In, vec![s("x"), s("y")]).unwrap(),
                Condition::new("c", Operator::BeginsWith, vec![s("pre")]).unwrap(),
                Condition::new("d", Operator::Contains, vec![s("tag")]).unwrap(),
                Condition::new("e", Operator::AttributeNotExists, vec![]).unwrap(),
                Condition::new("f", Operator::Ne, vec![n(0)]).unwrap(),
            ])
            .unwrap();

        assert_eq!(
            set.expression,
            "#n0 BETWEEN :v0 AND :v1 AND #n1 IN (:v2, :v3) AND begins_with(#n2, :v4) \
             AND contains(#n3, :v5) AND attribute_not_exists(#n4) AND #n5 <> :v6"
        );
        assert_closed(&set);
    }

    #[test]
    fn test_repeated_name_reuses_placeholder() {
        let mut compiler = ExpressionCompiler::new();
        let set = compiler
            .conditions(&[
                Condition::new("age", Operator::Gt, vec![n(1)]).unwrap(),
                Condition::new("age", Operator::Lt, vec![n(9)]).unwrap(),
            ])
            .unwrap();
        assert_eq!(set.expression, "#n0 > :v0 AND #n0 < :v1");
        assert_eq!(set.names.len(), 1);
        assert_closed(&set);
    }

    #[test]
    fn test_nested_paths() {
        let mut compiler = ExpressionCompiler::new();
        let set = compiler
            .projection(&["address.city".to_string(), "tags[2]".to_string(), "address".to_string()])
            .unwrap();
        assert_eq!(set.expression, "#n0.#n1, #n2[2], #n0");
        assert_eq!(set.names["#n1"], "city");
        assert_closed(&set);
    }

    #[test]
    fn test_raw_fragment_merged_first() {
        let mut compiler = ExpressionCompiler::new();
        let generated = compiler.conditions(&[Condition::eq("Name", s("alice"))]);
        let merged = compiler
            .merge_raw(generated, &[RawExpression::new("attribute_exists(id)")])
            .unwrap()
            .unwrap();
        assert_eq!(merged.expression, "(attribute_exists(id)) AND (#n0 = :v0)");
        assert_closed(&merged);
    }

    #[test]
    fn test_raw_fragment_alone_is_bare() {
        let mut compiler = ExpressionCompiler::new();
        let raw = RawExpression::new("#st = :st")
            .with_name("#st", "status")
            .with_value(":st", s("on"));
        let merged = compiler.merge_raw(None, &[raw]).unwrap().unwrap();
        assert_eq!(merged.expression, "#st = :st");
        assert_closed(&merged);
    }

    #[test]
    fn test_raw_fragment_collision() {
        let mut compiler = ExpressionCompiler::new();
        let _ = compiler.conditions(&[Condition::eq("id", s("u1"))]);
        let generated = compiler.conditions(&[Condition::eq("Name", s("alice"))]);
        let raw = RawExpression::new("attribute_exists(id)").with_value(":v1", s("x"));

        match compiler.merge_raw(generated, &[raw]).unwrap_err() {
            Error::PlaceholderCollision { placeholder } => assert_eq!(placeholder, ":v1"),
            other => panic!("expected collision, got {other}"),
        }
    }

    #[test]
    fn test_same_fragment_twice_collides() {
        let mut compiler = ExpressionCompiler::new();
        let raw = RawExpression::new("#x = :x")
            .with_name("#x", "kind")
            .with_value(":x", s("a"));
        let err = compiler.merge_raw(None, &[raw.clone(), raw]).unwrap_err();
        assert!(matches!(err, Error::PlaceholderCollision { .. }));
    }

    #[test]
    fn test_unused_raw_placeholder_rejected() {
        let mut compiler = ExpressionCompiler::new();
        let raw = RawExpression::new("attribute_exists(id)").with_value(":free", s("x"));
        let err = compiler.merge_raw(None, &[raw]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_merged_maps() {
        let mut compiler = ExpressionCompiler::new();
        let compiled = CompiledExpressions {
            key_condition: compiler.conditions(&[Condition::eq("pk", s("a"))]),
            filter: compiler.conditions(&[Condition::eq("pk", s("b"))]),
            projection: compiler.projection(&["pk".to_string(), "other".to_string()]),
            ..CompiledExpressions::default()
        };
        let names = compiled.names();
        assert_eq!(names.len(), 2);
        assert_eq!(names["#n0"], "pk");
        assert_eq!(compiled.values().len(), 2);
    }
}
