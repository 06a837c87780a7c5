mod builder;
mod condition;
mod cursor;
mod executor;
mod expression;
mod selector;
mod update;

pub use builder::{CompiledRequest, Paginated, Query, QuerySpec, SortOrder};
pub use condition::{Condition, ConditionSet, MAX_IN_OPERANDS, Operator, RawExpression};
pub use cursor::{CURSOR_VERSION, ShapeFingerprint, decode_cursor, encode_cursor};
pub use executor::{ParallelScanOutput, Request, SegmentFailure};
pub use expression::{CompiledExpressions, ExpressionCompiler, ExpressionSet};
pub use selector::{AccessPath, IndexSelector, QueryPlan};
pub use update::UpdateBuilder;
