//! In-process evaluation of predicates and mutations against a `Row`.
//!
//! Used by the in-memory store. Semantics follow SQL: comparisons involving
//! NULL are unknown, and a row only matches when the predicate is known true.

use std::cmp::Ordering;

use thiserror::Error;

use super::ast::{
    ComparisonOperator, LogicalOperator, Mutation, Operand, Predicate, SetAction,
};
use crate::{
    record::Row,
    schema::TableSchema,
    value::{CoerceError, SqlType, SqlValue},
};

#[derive(Debug, Error, PartialEq)]
pub enum EvaluationError {
    #[error("Value out of range for column {0}")]
    OutOfRange(String),

    #[error("Column {column}: {cause}")]
    Incompatible { column: String, cause: CoerceError },

    #[error("Column {0} does not exist")]
    UnknownColumn(String),
}

/// Three-valued evaluation: `None` is SQL's UNKNOWN.
pub fn evaluate(predicate: &Predicate, row: &Row) -> Option<bool> {
    match predicate {
        Predicate::Compare { column, operator, operand } => {
            let left = row.value(column).unwrap_or(&SqlValue::Null);
            let right = match operand {
                Operand::Value(value) => value,
                Operand::Column(other) => row.value(other).unwrap_or(&SqlValue::Null),
            };
            let ordering = left.compare(right)?;
            Some(match operator {
                ComparisonOperator::Eq => ordering == Ordering::Equal,
                ComparisonOperator::Ne => ordering != Ordering::Equal,
                ComparisonOperator::Gt => ordering == Ordering::Greater,
                ComparisonOperator::Gte => ordering != Ordering::Less,
                ComparisonOperator::Lt => ordering == Ordering::Less,
                ComparisonOperator::Lte => ordering != Ordering::Greater,
            })
        }
        Predicate::IsNull(column) => Some(row.value(column).is_none_or(SqlValue::is_null)),
        Predicate::IsNotNull(column) => Some(row.value(column).is_some_and(|v| !v.is_null())),
        Predicate::In { column, values } => {
            let value = row.value(column).filter(|v| !v.is_null())?;
            let mut unknown = false;
            for candidate in values {
                match value.compare(candidate) {
                    Some(Ordering::Equal) => return Some(true),
                    Some(_) => {}
                    None => unknown = true,
                }
            }
            if unknown {
                None
            } else {
                Some(false)
            }
        }
        Predicate::Like { column, pattern } => match row.value(column) {
            Some(SqlValue::Text(text)) => Some(like_matches(text, pattern)),
            _ => None,
        },
        Predicate::Logical { left, operator, right } => {
            let left = evaluate(left, row);
            match operator {
                LogicalOperator::And => {
                    if left == Some(false) {
                        return Some(false);
                    }
                    match (left, evaluate(right, row)) {
                        (_, Some(false)) => Some(false),
                        (Some(true), Some(true)) => Some(true),
                        _ => None,
                    }
                }
                LogicalOperator::Or => {
                    if left == Some(true) {
                        return Some(true);
                    }
                    match (left, evaluate(right, row)) {
                        (_, Some(true)) => Some(true),
                        (Some(false), Some(false)) => Some(false),
                        _ => None,
                    }
                }
            }
        }
        Predicate::Not(inner) => evaluate(inner, row).map(|v| !v),
        Predicate::ClientSide(filter) => Some((filter.filter)(row)),
    }
}

pub fn matches(predicate: &Predicate, row: &Row) -> bool {
    evaluate(predicate, row) == Some(true)
}

/// SQL LIKE: `%` matches any run of characters, `_` exactly one, `\` escapes.
pub fn like_matches(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    // positions in `pattern` reachable after consuming a prefix of `text`
    let mut states = vec![0usize];
    let advance_wildcards = |states: &mut Vec<usize>| {
        let mut i = 0;
        while i < states.len() {
            let p = states[i];
            if pattern.get(p) == Some(&'%') && !states.contains(&(p + 1)) {
                states.push(p + 1);
            }
            i += 1;
        }
    };
    advance_wildcards(&mut states);

    for c in text {
        let mut next = Vec::new();
        for &p in &states {
            match pattern.get(p) {
                Some('%') => next.push(p),
                Some('_') => next.push(p + 1),
                Some('\\') if pattern.get(p + 1) == Some(&c) => next.push(p + 2),
                Some(&expected) if expected == c && expected != '\\' => next.push(p + 1),
                _ => {}
            }
        }
        next.sort_unstable();
        next.dedup();
        advance_wildcards(&mut next);
        if next.is_empty() {
            return false;
        }
        states = next;
    }

    states.contains(&pattern.len())
}

fn checked_arithmetic(
    column: &str,
    current: &SqlValue,
    operand: &SqlValue,
    subtract: bool,
) -> Result<SqlValue, EvaluationError> {
    let out_of_range = || EvaluationError::OutOfRange(column.to_string());

    let operand = match current.sql_type() {
        Some(target) => operand
            .coerce(target)
            .map_err(|cause| EvaluationError::Incompatible { column: column.to_string(), cause })?,
        None => return Ok(SqlValue::Null),
    };

    let result = match (current, &operand) {
        (_, SqlValue::Null) => SqlValue::Null,
        (SqlValue::Int(a), SqlValue::Int(b)) => {
            SqlValue::Int(if subtract { a.checked_sub(*b) } else { a.checked_add(*b) }.ok_or_else(out_of_range)?)
        }
        (SqlValue::BigInt(a), SqlValue::BigInt(b)) => {
            SqlValue::BigInt(if subtract { a.checked_sub(*b) } else { a.checked_add(*b) }.ok_or_else(out_of_range)?)
        }
        (SqlValue::Numeric(a), SqlValue::Numeric(b)) => {
            SqlValue::Numeric(if subtract { a.checked_sub(*b) } else { a.checked_add(*b) }.ok_or_else(out_of_range)?)
        }
        (SqlValue::Double(a), SqlValue::Double(b)) => {
            let v = if subtract { a - b } else { a + b };
            if v.is_infinite() {
                return Err(out_of_range());
            }
            SqlValue::Double(v)
        }
        (current, _) => {
            return Err(EvaluationError::Incompatible {
                column: column.to_string(),
                cause: CoerceError { value: current.to_string(), expected: SqlType::Numeric },
            })
        }
    };

    Ok(result)
}

// GREATEST/LEAST ignore NULL arguments
fn extreme(current: &SqlValue, candidate: &SqlValue, wanted: Ordering) -> SqlValue {
    match (current.is_null(), candidate.is_null()) {
        (true, _) => candidate.clone(),
        (_, true) => current.clone(),
        _ if candidate.compare(current) == Some(wanted) => candidate.clone(),
        _ => current.clone(),
    }
}

/// Applies `mutation` to a copy of `row`. Every assignment sees the values the
/// row had before the update, as a SQL `SET` list does.
pub fn apply_mutation(
    mutation: &Mutation,
    row: &Row,
    table: &TableSchema,
) -> Result<Row, EvaluationError> {
    let mut updated = row.clone();

    for assignment in mutation.assignments() {
        let column = &assignment.column;
        let definition =
            table.find_column(column).ok_or_else(|| EvaluationError::UnknownColumn(column.clone()))?;
        let current = row.value(column).cloned().unwrap_or_default();

        let value = match &assignment.action {
            SetAction::Set(value) => value.clone(),
            SetAction::Add(value) => checked_arithmetic(column, &current, value, false)?,
            SetAction::Subtract(value) => checked_arithmetic(column, &current, value, true)?,
            SetAction::Max(value) => extreme(&current, value, Ordering::Greater),
            SetAction::Min(value) => extreme(&current, value, Ordering::Less),
            SetAction::CopyColumn(source) => row.value(source).cloned().unwrap_or_default(),
            SetAction::ClientSide(client) => (client.compute)(row),
        };

        let value = value.coerce(definition.sql_type).map_err(|cause| match value {
            SqlValue::Int(_) | SqlValue::BigInt(_) | SqlValue::Numeric(_) | SqlValue::Double(_)
                if definition.sql_type.is_numeric() =>
            {
                EvaluationError::OutOfRange(column.clone())
            }
            _ => EvaluationError::Incompatible { column: column.clone(), cause },
        })?;
        updated.insert(column.clone(), value);
    }

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::ast::col;

    fn user() -> Row {
        Row::new()
            .with("id", 1i64)
            .with("name", "alice")
            .with("visits", 3)
            .with("is_active", true)
            .with("note", SqlValue::Null)
    }

    fn table() -> TableSchema {
        TableSchema::new("users", "id")
            .column("name", SqlType::Text)
            .column("visits", SqlType::Integer)
            .column("is_active", SqlType::Bool)
            .nullable_column("note", SqlType::Text)
    }

    #[test]
    fn test_comparisons() {
        let row = user();
        assert!(matches(&col("visits").gt(2), &row));
        assert!(matches(&col("visits").lte(3i64), &row));
        assert!(!matches(&col("visits").ne(3), &row));
        assert!(matches(&col("name").eq("alice").and(col("is_active").eq(true)), &row));
    }

    #[test]
    fn test_null_is_unknown() {
        let row = user();
        assert_eq!(evaluate(&col("note").eq("x"), &row), None);
        assert_eq!(evaluate(&!col("note").eq("x"), &row), None);
        assert!(matches(&col("note").is_null(), &row));
        assert!(!matches(&col("missing").is_not_null(), &row));
    }

    #[test]
    fn test_three_valued_logic() {
        let row = user();
        let unknown = col("note").eq("x");
        assert_eq!(evaluate(&unknown.clone().or(col("visits").eq(3)), &row), Some(true));
        assert_eq!(evaluate(&unknown.clone().and(col("visits").eq(4)), &row), Some(false));
        assert_eq!(evaluate(&unknown.and(col("visits").eq(3)), &row), None);
    }

    #[test]
    fn test_in_list() {
        let row = user();
        assert!(matches(&col("visits").is_in([1, 3]), &row));
        assert!(!matches(&col("visits").is_in([1, 2]), &row));
        assert_eq!(evaluate(&col("visits").is_in([SqlValue::Int(1), SqlValue::Null]), &row), None);
    }

    #[test]
    fn test_like_patterns() {
        assert!(like_matches("alice@x.io", "%@x.io"));
        assert!(like_matches("alice", "a_i%"));
        assert!(like_matches("", "%"));
        assert!(!like_matches("alice", "bob%"));
        assert!(!like_matches("alice", "alic"));
        assert!(like_matches("100%", "100\\%"));
        assert!(!like_matches("1000", "100\\%"));
    }

    #[test]
    fn test_apply_mutation_uses_old_values() {
        let mutation = Mutation::new().add("visits", 2).set("is_active", false).copy_column("note", "name");
        let updated = apply_mutation(&mutation, &user(), &table()).unwrap();

        assert_eq!(updated.value("visits"), Some(&SqlValue::Int(5)));
        assert_eq!(updated.value("is_active"), Some(&SqlValue::Bool(false)));
        assert_eq!(updated.value("note"), Some(&SqlValue::from("alice")));
    }

    #[test]
    fn test_greatest_and_least_ignore_null() {
        let row = user();
        let updated = apply_mutation(&Mutation::new().max("visits", 10).min("note", "a"), &row, &table()).unwrap();
        assert_eq!(updated.value("visits"), Some(&SqlValue::Int(10)));
        assert_eq!(updated.value("note"), Some(&SqlValue::from("a")));
    }

    #[test]
    fn test_arithmetic_overflow() {
        let row = user().with("visits", i32::MAX);
        let err = apply_mutation(&Mutation::new().add("visits", 1), &row, &table()).unwrap_err();
        assert_eq!(err, EvaluationError::OutOfRange("visits".to_string()));
    }

    #[test]
    fn test_arithmetic_on_null_stays_null() {
        let row = user().with("visits", SqlValue::Null);
        let updated = apply_mutation(&Mutation::new().subtract("visits", 1), &row, &table()).unwrap();
        assert_eq!(updated.value("visits"), Some(&SqlValue::Null));
    }
}
