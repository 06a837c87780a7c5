use aws_sdk_dynamodb::types::AttributeValue;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Largest operand list DynamoDB accepts for `IN`
pub const MAX_IN_OPERANDS: usize = 100;

/// Condition operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `BETWEEN a AND b`
    Between,
    /// `IN (a, b, ...)`
    In,
    /// `begins_with(path, prefix)`
    BeginsWith,
    /// `contains(path, operand)`
    Contains,
    /// `attribute_exists(path)`
    AttributeExists,
    /// `attribute_not_exists(path)`
    AttributeNotExists,
}

impl Operator {
    /// Whether a sort key condition with this operator can go into a key condition
    pub fn is_sort_key_operator(self) -> bool {
        matches!(
            self,
            Operator::Eq
                | Operator::Lt
                | Operator::Le
                | Operator::Gt
                | Operator::Ge
                | Operator::Between
                | Operator::BeginsWith
        )
    }

    fn check_operands(self, field: &str, count: usize) -> Result<(), Error> {
        let ok = match self {
            Operator::AttributeExists | Operator::AttributeNotExists => count == 0,
            Operator::Between => count == 2,
            Operator::In => (1..=MAX_IN_OPERANDS).contains(&count),
            _ => count == 1,
        };
        if ok {
            return Ok(());
        }
        let expected = match self {
            Operator::AttributeExists | Operator::AttributeNotExists => "no operands".to_string(),
            Operator::Between => "exactly 2 operands".to_string(),
            Operator::In => format!("between 1 and {MAX_IN_OPERANDS} operands"),
            _ => "exactly 1 operand".to_string(),
        };
        Err(Error::validation(format!(
            "{self} on '{field}' takes {expected}, got {count}"
        )))
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        let op = match normalized.as_str() {
            "" => return Err(Error::validation("operator cannot be empty")),
            "=" | "EQ" => Operator::Eq,
            "<>" | "!=" | "NE" => Operator::Ne,
            "<" | "LT" => Operator::Lt,
            "<=" | "LE" => Operator::Le,
            ">" | "GT" => Operator::Gt,
            ">=" | "GE" => Operator::Ge,
            "BETWEEN" => Operator::Between,
            "IN" => Operator::In,
            "BEGINS_WITH" => Operator::BeginsWith,
            "CONTAINS" => Operator::Contains,
            "EXISTS" | "ATTRIBUTE_EXISTS" => Operator::AttributeExists,
            "NOT_EXISTS" | "ATTRIBUTE_NOT_EXISTS" => Operator::AttributeNotExists,
            _ => return Err(Error::validation(format!("unsupported operator '{s}'"))),
        };
        Ok(op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Between => "BETWEEN",
            Operator::In => "IN",
            Operator::BeginsWith => "begins_with",
            Operator::Contains => "contains",
            Operator::AttributeExists => "attribute_exists",
            Operator::AttributeNotExists => "attribute_not_exists",
        };
        f.write_str(s)
    }
}

/// One predicate: `field <operator> values`
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    /// Attribute path, possibly nested (`address.city`, `tags[0]`)
    pub field: String,
    /// Operator
    pub operator: Operator,
    /// Operands, count fixed by the operator
    pub values: Vec<AttributeValue>,
}

impl Condition {
    /// Build a condition, checking the operand count
    pub fn new(
        field: impl Into<String>,
        operator: Operator,
        values: Vec<AttributeValue>,
    ) -> Result<Self, Error> {
        let field = field.into();
        if field.trim().is_empty() {
            return Err(Error::validation("condition field cannot be empty"));
        }
        operator.check_operands(&field, values.len())?;
        Ok(Self {
            field,
            operator,
            values,
        })
    }

    /// Equality condition
    pub fn eq(field: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            field: field.into(),
            operator: Operator::Eq,
            values: vec![value],
        }
    }
}

/// Caller-written expression fragment with its own placeholder maps
///
/// Merged into the compiled expression with `AND`. Every `#name` and `:value`
/// token in the text must be declared in the maps, and every declared
/// placeholder must appear in the text (checked when the fragment is merged).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawExpression {
    /// Expression text
    pub expression: String,
    /// Name placeholders (`#x` -> attribute)
    pub names: HashMap<String, String>,
    /// Value placeholders (`:x` -> value)
    pub values: HashMap<String, AttributeValue>,
}

impl RawExpression {
    /// Fragment without placeholders
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            ..Self::default()
        }
    }

    /// Declare a name placeholder
    #[must_use]
    pub fn with_name(mut self, placeholder: impl Into<String>, attribute: impl Into<String>) -> Self {
        let _ = self.names.insert(placeholder.into(), attribute.into());
        self
    }

    /// Declare a value placeholder
    #[must_use]
    pub fn with_value(mut self, placeholder: impl Into<String>, value: AttributeValue) -> Self {
        let _ = self.values.insert(placeholder.into(), value);
        self
    }

    /// Check the text and the maps agree
    pub fn validate(&self) -> Result<(), Error> {
        if self.expression.trim().is_empty() {
            return Err(Error::validation("raw expression cannot be empty"));
        }

        let tokens = placeholder_tokens(&self.expression);
        for token in &tokens {
            let declared = if token.starts_with('#') {
                self.names.contains_key(*token)
            } else {
                self.values.contains_key(*token)
            };
            if !declared {
                return Err(Error::validation(format!(
                    "raw expression uses undeclared placeholder '{token}'"
                )));
            }
        }

        if let Some(key) = self.names.keys().find(|k| !k.starts_with('#')) {
            return Err(Error::validation(format!(
                "name placeholder '{key}' must start with '#'"
            )));
        }
        if let Some(key) = self.values.keys().find(|k| !k.starts_with(':')) {
            return Err(Error::validation(format!(
                "value placeholder '{key}' must start with ':'"
            )));
        }
        Ok(())
    }

    /// A declared placeholder the text never references
    pub(crate) fn unused_placeholder(&self) -> Option<&str> {
        let tokens = placeholder_tokens(&self.expression);
        self.names
            .keys()
            .chain(self.values.keys())
            .map(String::as_str)
            .find(|key| !tokens.contains(key))
    }
}

/// Every `#word` and `:word` token in an expression
pub(crate) fn placeholder_tokens(expression: &str) -> HashSet<&str> {
    let bytes = expression.as_bytes();
    let mut tokens = HashSet::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'#' || bytes[i] == b':' {
            let start = i;
            i += 1;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            if i > start + 1 {
                let _ = tokens.insert(&expression[start..i]);
            }
        } else {
            i += 1;
        }
    }
    tokens
}

/// Accumulate-only predicate set
///
/// Appends are conjoined. The first invalid append is recorded and every
/// later append becomes a no-op; the recorded error surfaces from
/// [`ConditionSet::into_parts`].
#[derive(Debug, Default)]
pub struct ConditionSet {
    conditions: Vec<Condition>,
    raw_filters: Vec<RawExpression>,
    error: Option<Error>,
}

impl ConditionSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a condition
    pub fn append(
        &mut self,
        field: &str,
        operator: Operator,
        values: Vec<AttributeValue>,
    ) -> &mut Self {
        if self.error.is_none() {
            match Condition::new(field, operator, values) {
                Ok(condition) => self.conditions.push(condition),
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    /// Append a condition with a textual operator (`"="`, `"GE"`, `"begins_with"`, ...)
    pub fn append_str(
        &mut self,
        field: &str,
        operator: &str,
        values: Vec<AttributeValue>,
    ) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        match operator.parse::<Operator>() {
            Ok(operator) => self.append(field, operator, values),
            Err(e) => self.fail(e),
        }
    }

    /// Append a raw filter fragment
    pub fn append_raw(&mut self, raw: RawExpression) -> &mut Self {
        if self.error.is_none() {
            match raw.validate() {
                Ok(()) => self.raw_filters.push(raw),
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    /// Record an error found outside the set, keeping the first one
    pub fn fail(&mut self, error: Error) -> &mut Self {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self
    }

    /// Recorded error, if any
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Conditions in insertion order
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Raw fragments in insertion order
    pub fn raw_filters(&self) -> &[RawExpression] {
        &self.raw_filters
    }

    /// Number of conditions and raw fragments
    pub fn len(&self) -> usize {
        self.conditions.len() + self.raw_filters.len()
    }

    /// Whether nothing was appended
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Conditions and raw fragments, or the recorded error
    pub fn into_parts(self) -> Result<(Vec<Condition>, Vec<RawExpression>), Error> {
        match self.error {
            Some(e) => Err(e),
            None => Ok((self.conditions, self.raw_filters)),
        }
    }
}
