mod ast;
pub mod evaluation;
mod parsing;

use std::collections::HashSet;

pub use ast::{
    col, Assignment, ClientSideFilter, ClientSideValue, ColumnRef, ComparisonOperator,
    LogicalOperator, Mutation, Operand, Predicate, SetAction,
};
pub use parsing::{parse, parse_value, ParsePredicateError};
use thiserror::Error;

use crate::{
    schema::TableSchema,
    value::{CoerceError, SqlType, SqlValue},
};

#[derive(Debug, Error, PartialEq)]
pub enum PredicateError {
    #[error("Column {column} does not exist on table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Column {column}: {cause}")]
    TypeMismatch { column: String, cause: CoerceError },

    #[error("{0}")]
    Unsupported(String),
}

impl PredicateError {
    /// True when the expression can never be run by the store, as opposed to
    /// not matching the table's shape.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, PredicateError::Unsupported(_))
    }
}

fn column_type(table: &TableSchema, column: &str) -> Result<SqlType, PredicateError> {
    table.find_column(column).map(|c| c.sql_type).ok_or_else(|| PredicateError::UnknownColumn {
        table: table.name.clone(),
        column: column.to_string(),
    })
}

fn coerce_to(column: &str, value: &SqlValue, target: SqlType) -> Result<SqlValue, PredicateError> {
    value
        .coerce(target)
        .map_err(|cause| PredicateError::TypeMismatch { column: column.to_string(), cause })
}

fn comparable(left: SqlType, right: SqlType) -> bool {
    left == right || (left.is_numeric() && right.is_numeric())
}

/// Checks `predicate` against `table` and returns a copy whose literals carry
/// the exact type of the column they are compared with.
pub fn resolve_predicate(
    predicate: &Predicate,
    table: &TableSchema,
) -> Result<Predicate, PredicateError> {
    let resolved = match predicate {
        Predicate::Compare { column, operator, operand } => {
            let sql_type = column_type(table, column)?;
            let operand = match operand {
                Operand::Value(value) => Operand::Value(coerce_to(column, value, sql_type)?),
                Operand::Column(other) => {
                    let other_type = column_type(table, other)?;
                    if !comparable(sql_type, other_type) {
                        return Err(PredicateError::TypeMismatch {
                            column: other.clone(),
                            cause: CoerceError { value: other.clone(), expected: sql_type },
                        });
                    }
                    Operand::Column(other.clone())
                }
            };
            Predicate::Compare { column: column.clone(), operator: *operator, operand }
        }
        Predicate::IsNull(column) => {
            column_type(table, column)?;
            Predicate::IsNull(column.clone())
        }
        Predicate::IsNotNull(column) => {
            column_type(table, column)?;
            Predicate::IsNotNull(column.clone())
        }
        Predicate::In { column, values } => {
            let sql_type = column_type(table, column)?;
            let values =
                values.iter().map(|v| coerce_to(column, v, sql_type)).collect::<Result<_, _>>()?;
            Predicate::In { column: column.clone(), values }
        }
        Predicate::Like { column, pattern } => {
            let sql_type = column_type(table, column)?;
            if !sql_type.is_textual() {
                return Err(PredicateError::Unsupported(format!(
                    "LIKE needs a text column, {} is {}",
                    column, sql_type
                )));
            }
            Predicate::Like { column: column.clone(), pattern: pattern.clone() }
        }
        Predicate::Logical { left, operator, right } => Predicate::Logical {
            left: Box::new(resolve_predicate(left, table)?),
            operator: *operator,
            right: Box::new(resolve_predicate(right, table)?),
        },
        Predicate::Not(inner) => Predicate::Not(Box::new(resolve_predicate(inner, table)?)),
        Predicate::ClientSide(filter) => {
            return Err(PredicateError::Unsupported(format!(
                "client-side filter '{}' can not be translated to the store",
                filter.description
            )))
        }
    };

    Ok(resolved)
}

/// Checks `mutation` against `table`, coercing assigned values to column types.
pub fn resolve_mutation(mutation: &Mutation, table: &TableSchema) -> Result<Mutation, PredicateError> {
    if mutation.is_empty() {
        return Err(PredicateError::Unsupported("mutation assigns no columns".to_string()));
    }

    let mut seen = HashSet::new();
    let mut assignments = Vec::with_capacity(mutation.assignments().len());

    for Assignment { column, action } in mutation.assignments() {
        let sql_type = column_type(table, column)?;

        if *column == table.primary_key {
            return Err(PredicateError::Unsupported(format!(
                "primary key {} can not be assigned",
                column
            )));
        }
        if !seen.insert(column.as_str()) {
            return Err(PredicateError::Unsupported(format!(
                "column {} is assigned more than once",
                column
            )));
        }

        let action = match action {
            SetAction::Set(value) => SetAction::Set(coerce_to(column, value, sql_type)?),
            SetAction::Add(_) | SetAction::Subtract(_) if !sql_type.is_numeric() => {
                return Err(PredicateError::Unsupported(format!(
                    "arithmetic needs a numeric column, {} is {}",
                    column, sql_type
                )))
            }
            SetAction::Add(value) => SetAction::Add(coerce_to(column, value, sql_type)?),
            SetAction::Subtract(value) => SetAction::Subtract(coerce_to(column, value, sql_type)?),
            SetAction::Max(_) | SetAction::Min(_) if sql_type == SqlType::Jsonb => {
                return Err(PredicateError::Unsupported(format!(
                    "GREATEST/LEAST is not defined for json column {}",
                    column
                )))
            }
            SetAction::Max(value) => SetAction::Max(coerce_to(column, value, sql_type)?),
            SetAction::Min(value) => SetAction::Min(coerce_to(column, value, sql_type)?),
            SetAction::CopyColumn(source) => {
                let source_type = column_type(table, source)?;
                if !comparable(sql_type, source_type) {
                    return Err(PredicateError::TypeMismatch {
                        column: column.clone(),
                        cause: CoerceError { value: source.clone(), expected: sql_type },
                    });
                }
                SetAction::CopyColumn(source.clone())
            }
            SetAction::ClientSide(value) => {
                return Err(PredicateError::Unsupported(format!(
                    "client-side value '{}' for column {} can not be translated to the store",
                    value.description, column
                )))
            }
        };

        assignments.push(Assignment { column: column.clone(), action });
    }

    Ok(Mutation::from_assignments(assignments))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableSchema {
        TableSchema::new("users", "id")
            .column("name", SqlType::Text)
            .column("visits", SqlType::Integer)
            .column("is_active", SqlType::Bool)
            .nullable_column("last_login", SqlType::TimestampTz)
            .nullable_column("attributes", SqlType::Jsonb)
    }

    #[test]
    fn test_literals_take_column_types() {
        let parsed = parse("visits > 3 && last_login < '2024-01-01T00:00:00Z'").unwrap();
        let resolved = resolve_predicate(&parsed, &users()).unwrap();

        match resolved {
            Predicate::Logical { left, right, .. } => {
                assert!(matches!(
                    *left,
                    Predicate::Compare { operand: Operand::Value(SqlValue::Int(3)), .. }
                ));
                assert!(matches!(
                    *right,
                    Predicate::Compare { operand: Operand::Value(SqlValue::Timestamp(_)), .. }
                ));
            }
            other => panic!("unexpected predicate {:?}", other),
        }
    }

    #[test]
    fn test_unknown_column_and_bad_literal() {
        assert!(matches!(
            resolve_predicate(&col("nope").eq(1), &users()),
            Err(PredicateError::UnknownColumn { .. })
        ));
        assert!(matches!(
            resolve_predicate(&col("visits").eq("many"), &users()),
            Err(PredicateError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_client_side_filter_is_unsupported() {
        let predicate = col("visits").gt(1).and(Predicate::client_side("is_vip", |_| true));
        let err = resolve_predicate(&predicate, &users()).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_like_needs_text() {
        let err = resolve_predicate(&col("visits").like("1%"), &users()).unwrap_err();
        assert!(err.is_unsupported());
        assert!(resolve_predicate(&col("name").like("a%"), &users()).is_ok());
    }

    #[test]
    fn test_mutation_rules() {
        let table = users();
        assert!(resolve_mutation(&Mutation::new(), &table).unwrap_err().is_unsupported());
        assert!(resolve_mutation(&Mutation::new().set("id", 5), &table).unwrap_err().is_unsupported());
        assert!(resolve_mutation(&Mutation::new().add("name", 1), &table).unwrap_err().is_unsupported());
        assert!(resolve_mutation(&Mutation::new().max("attributes", 1), &table).unwrap_err().is_unsupported());
        assert!(resolve_mutation(&Mutation::new().set("visits", 1).set("visits", 2), &table)
            .unwrap_err()
            .is_unsupported());
        assert!(resolve_mutation(
            &Mutation::new().client_side("name", "upper", |_| SqlValue::Null),
            &table
        )
        .unwrap_err()
        .is_unsupported());
        assert!(matches!(
            resolve_mutation(&Mutation::new().copy_column("visits", "name"), &table),
            Err(PredicateError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_mutation_values_are_coerced() {
        let resolved = resolve_mutation(&Mutation::new().add("visits", 1i64).set_null("last_login"), &users())
            .unwrap();
        assert!(matches!(resolved.assignments()[0].action, SetAction::Add(SqlValue::Int(1))));
        assert!(matches!(resolved.assignments()[1].action, SetAction::Set(SqlValue::Null)));
    }
}
