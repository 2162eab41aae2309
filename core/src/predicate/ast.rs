//! Filter predicates and field mutations for set-based updates and deletes.
//!
//! Callers build these through the typed builder (`col("age").gt(30)`) or the
//! textual language in `parsing`. Nothing here knows about SQL; the store
//! backends translate or evaluate the tree.

use std::{fmt, ops::Not, sync::Arc};

use crate::{record::Row, value::SqlValue};

/// Comparison operators usable in a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    /// Equality operator (==)
    Eq,
    /// Inequality operator (!=)
    Ne,
    /// Greater than operator (>)
    Gt,
    /// Greater than or equal to operator (>=)
    Gte,
    /// Less than operator (<)
    Lt,
    /// Less than or equal to operator (<=)
    Lte,
}

impl ComparisonOperator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "=",
            ComparisonOperator::Ne => "<>",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Gte => ">=",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    /// Logical AND operator (&&)
    And,
    /// Logical OR operator (||)
    Or,
}

/// Right hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(SqlValue),
    /// Another column of the same row.
    Column(String),
}

/// A filter the application can only evaluate in process, e.g. a Rust closure.
/// It exists so callers get a clear error instead of a silent full-table scan.
#[derive(Clone)]
pub struct ClientSideFilter {
    pub description: String,
    pub filter: Arc<dyn Fn(&Row) -> bool + Send + Sync>,
}

impl fmt::Debug for ClientSideFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSideFilter").field("description", &self.description).finish()
    }
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Compare { column: String, operator: ComparisonOperator, operand: Operand },
    IsNull(String),
    IsNotNull(String),
    In { column: String, values: Vec<SqlValue> },
    /// SQL LIKE with `%` and `_` wildcards.
    Like { column: String, pattern: String },
    Logical { left: Box<Predicate>, operator: LogicalOperator, right: Box<Predicate> },
    Not(Box<Predicate>),
    ClientSide(ClientSideFilter),
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::Logical {
            left: Box::new(self),
            operator: LogicalOperator::And,
            right: Box::new(other),
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Logical {
            left: Box::new(self),
            operator: LogicalOperator::Or,
            right: Box::new(other),
        }
    }

    pub fn client_side<F>(description: impl Into<String>, filter: F) -> Predicate
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        Predicate::ClientSide(ClientSideFilter {
            description: description.into(),
            filter: Arc::new(filter),
        })
    }

    /// Every column the predicate reads, in visiting order.
    pub fn columns(&self) -> Vec<&str> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Compare { column, operand, .. } => {
                out.push(column);
                if let Operand::Column(other) = operand {
                    out.push(other);
                }
            }
            Predicate::IsNull(column) | Predicate::IsNotNull(column) => out.push(column),
            Predicate::In { column, .. } | Predicate::Like { column, .. } => out.push(column),
            Predicate::Logical { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Predicate::Not(inner) => inner.collect_columns(out),
            Predicate::ClientSide(_) => {}
        }
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}

/// Starts a predicate on `name`.
pub fn col(name: impl Into<String>) -> ColumnRef {
    ColumnRef { name: name.into() }
}

#[derive(Debug, Clone)]
pub struct ColumnRef {
    name: String,
}

impl ColumnRef {
    fn compare(self, operator: ComparisonOperator, value: impl Into<SqlValue>) -> Predicate {
        Predicate::Compare { column: self.name, operator, operand: Operand::Value(value.into()) }
    }

    pub fn eq(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Eq, value)
    }

    pub fn ne(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Ne, value)
    }

    pub fn gt(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Gt, value)
    }

    pub fn gte(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Gte, value)
    }

    pub fn lt(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Lt, value)
    }

    pub fn lte(self, value: impl Into<SqlValue>) -> Predicate {
        self.compare(ComparisonOperator::Lte, value)
    }

    /// Compares against another column of the same row.
    pub fn cmp_column(self, operator: ComparisonOperator, other: impl Into<String>) -> Predicate {
        Predicate::Compare { column: self.name, operator, operand: Operand::Column(other.into()) }
    }

    pub fn is_null(self) -> Predicate {
        Predicate::IsNull(self.name)
    }

    pub fn is_not_null(self) -> Predicate {
        Predicate::IsNotNull(self.name)
    }

    pub fn is_in<I, V>(self, values: I) -> Predicate
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        Predicate::In { column: self.name, values: values.into_iter().map(Into::into).collect() }
    }

    pub fn like(self, pattern: impl Into<String>) -> Predicate {
        Predicate::Like { column: self.name, pattern: pattern.into() }
    }
}

/// Computes a new column value in process; never translatable to the store.
#[derive(Clone)]
pub struct ClientSideValue {
    pub description: String,
    pub compute: Arc<dyn Fn(&Row) -> SqlValue + Send + Sync>,
}

impl fmt::Debug for ClientSideValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSideValue").field("description", &self.description).finish()
    }
}

/// How an assigned column gets its new value.
#[derive(Debug, Clone)]
pub enum SetAction {
    Set(SqlValue),
    /// Add to the stored value.
    Add(SqlValue),
    /// Subtract from the stored value.
    Subtract(SqlValue),
    /// Keep the larger of the stored and given value.
    Max(SqlValue),
    /// Keep the smaller of the stored and given value.
    Min(SqlValue),
    /// Copy another column of the same row.
    CopyColumn(String),
    ClientSide(ClientSideValue),
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub column: String,
    pub action: SetAction,
}

/// Ordered list of column assignments applied to every matching row.
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    assignments: Vec<Assignment>,
}

impl Mutation {
    pub fn new() -> Self {
        Mutation { assignments: vec![] }
    }

    fn push(mut self, column: impl Into<String>, action: SetAction) -> Self {
        self.assignments.push(Assignment { column: column.into(), action });
        self
    }

    pub fn set(self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(column, SetAction::Set(value.into()))
    }

    pub fn set_null(self, column: impl Into<String>) -> Self {
        self.push(column, SetAction::Set(SqlValue::Null))
    }

    pub fn add(self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(column, SetAction::Add(value.into()))
    }

    pub fn subtract(self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(column, SetAction::Subtract(value.into()))
    }

    pub fn max(self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(column, SetAction::Max(value.into()))
    }

    pub fn min(self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(column, SetAction::Min(value.into()))
    }

    pub fn copy_column(self, column: impl Into<String>, source: impl Into<String>) -> Self {
        self.push(column, SetAction::CopyColumn(source.into()))
    }

    pub fn client_side<F>(self, column: impl Into<String>, description: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&Row) -> SqlValue + Send + Sync + 'static,
    {
        self.push(
            column,
            SetAction::ClientSide(ClientSideValue {
                description: description.into(),
                compute: Arc::new(compute),
            }),
        )
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub(crate) fn from_assignments(assignments: Vec<Assignment>) -> Self {
        Mutation { assignments }
    }
}
