//! SQL generation for the Postgres bulk store.
//!
//! Chunk writes go through a per-session staging table: rows are binary-copied
//! into it and applied with one set-based statement. The target table is always
//! aliased `am`, the staging table `tp`.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use tokio_postgres::types::ToSql;

use crate::{
    error::StoreError,
    predicate::{Assignment, LogicalOperator, Mutation, Operand, Predicate, SetAction},
    schema::ColumnDefinition,
    value::SqlValue,
};

pub const RESERVED_KEYWORDS: &[&str] = &[
    "all", "and", "as", "by", "check", "column", "default", "desc", "from", "group", "key", "index",
    "limit", "not", "null", "offset", "or", "order", "primary", "select", "table", "to", "user",
    "where",
];

/// Ordinal column of every staging table.
pub const ORDINAL_COLUMN: &str = "__ord";

/// Quotes an identifier if it's a reserved keyword or not a plain lowercase name.
#[inline]
pub fn quote_identifier(name: &str) -> String {
    let plain = name.chars().next().is_some_and(|c| c.is_ascii_lowercase() || c == '_') &&
        name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if plain && !RESERVED_KEYWORDS.contains(&name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Formats a table name, handling schema.table format.
pub fn format_table_name(table_name: &str) -> String {
    if table_name.contains('.') {
        let parts: Vec<&str> = table_name.split('.').collect();
        if parts.len() == 2 {
            let schema = parts[0].trim_matches('"');
            let table = parts[1].trim_matches('"');
            format!("\"{}\".\"{}\"", schema, table)
        } else {
            table_name.to_string()
        }
    } else {
        quote_identifier(table_name.trim_matches('"'))
    }
}

fn column_list(columns: &[&str], prefix: Option<&str>) -> String {
    columns
        .iter()
        .map(|col| match prefix {
            Some(prefix) => format!("{}.{}", prefix, quote_identifier(col)),
            None => quote_identifier(col),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_condition(key_columns: &[&str]) -> String {
    key_columns
        .iter()
        .map(|col| format!("am.{} = tp.{}", quote_identifier(col), quote_identifier(col)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Staging tables live for the session and are reused by every chunk with the
/// same layout, so the name is derived from the target and its staged columns.
pub fn staging_table_name(table_name: &str, purpose: &str, columns: &[ColumnDefinition]) -> String {
    let mut hasher = DefaultHasher::new();
    table_name.hash(&mut hasher);
    for column in columns {
        column.name.hash(&mut hasher);
        column.sql_type.as_str().hash(&mut hasher);
    }
    format!("rbulk_{}_{:016x}", purpose, hasher.finish())
}

/// Builds `CREATE TEMP TABLE IF NOT EXISTS` for a staging table.
pub fn build_create_staging_table(stage: &str, columns: &[ColumnDefinition], with_ordinal: bool) -> String {
    let mut definitions = Vec::with_capacity(columns.len() + 1);
    if with_ordinal {
        definitions.push(format!("{} BIGINT NOT NULL", ORDINAL_COLUMN));
    }
    definitions.extend(
        columns.iter().map(|c| format!("{} {}", quote_identifier(&c.name), c.sql_type.as_str())),
    );

    format!("CREATE TEMP TABLE IF NOT EXISTS {} ({})", stage, definitions.join(", "))
}

pub fn build_copy_statement(stage: &str, columns: &[&str], with_ordinal: bool) -> String {
    let mut names = Vec::with_capacity(columns.len() + 1);
    if with_ordinal {
        names.push(ORDINAL_COLUMN.to_string());
    }
    names.extend(columns.iter().map(|c| quote_identifier(c)));

    format!("COPY {} ({}) FROM STDIN WITH (FORMAT binary)", stage, names.join(", "))
}

/// `INSERT ... SELECT` from the staging table, in record order.
pub fn build_insert_body(
    formatted_table_name: &str,
    stage: &str,
    all_columns: &[&str],
    returning: Option<&str>,
) -> String {
    let mut query = format!(
        "INSERT INTO {} ({})\nSELECT {}\nFROM {} tp\nORDER BY tp.{}",
        formatted_table_name,
        column_list(all_columns, None),
        column_list(all_columns, Some("tp")),
        stage,
        ORDINAL_COLUMN
    );
    if let Some(returning) = returning {
        query.push_str(&format!("\nRETURNING {}", quote_identifier(returning)));
    }
    query
}

/// Inserts the staged rows that match no stored row on `merge_key`.
pub fn build_merge_insert_body(
    formatted_table_name: &str,
    stage: &str,
    all_columns: &[&str],
    merge_key: &[&str],
    returning: Option<&str>,
) -> String {
    let mut query = format!(
        "INSERT INTO {table} ({columns})\nSELECT {tp_columns}\nFROM {stage} tp\nWHERE NOT EXISTS (SELECT 1 FROM {table} am WHERE {join})\nORDER BY tp.{ordinal}",
        table = formatted_table_name,
        columns = column_list(all_columns, None),
        tp_columns = column_list(all_columns, Some("tp")),
        stage = stage,
        join = join_condition(merge_key),
        ordinal = ORDINAL_COLUMN
    );
    if let Some(returning) = returning {
        query.push_str(&format!("\nRETURNING {}", quote_identifier(returning)));
    }
    query
}

/// Overwrites `set_columns` on every stored row joined to a staged row and
/// returns the ordinals (and the stored key, when given) of the matched rows.
pub fn build_update_from_stage(
    formatted_table_name: &str,
    stage: &str,
    key_columns: &[&str],
    set_columns: &[&str],
    returning_key: Option<&str>,
) -> String {
    let set_clauses = set_columns
        .iter()
        .map(|col| format!("{} = tp.{}", quote_identifier(col), quote_identifier(col)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut query = format!(
        "UPDATE {} am\nSET {}\nFROM {} tp\nWHERE {}\nRETURNING tp.{}",
        formatted_table_name,
        set_clauses,
        stage,
        join_condition(key_columns),
        ORDINAL_COLUMN
    );
    if let Some(key) = returning_key {
        query.push_str(&format!(", am.{}", quote_identifier(key)));
    }
    query
}

/// Finds the stored rows a staged row matches without touching them.
pub fn build_matched_select(
    formatted_table_name: &str,
    stage: &str,
    key_columns: &[&str],
    returning_key: Option<&str>,
) -> String {
    let mut query = format!("SELECT tp.{}", ORDINAL_COLUMN);
    if let Some(key) = returning_key {
        query.push_str(&format!(", am.{}", quote_identifier(key)));
    }
    query.push_str(&format!(
        "\nFROM {} tp\nJOIN {} am ON {}",
        stage,
        formatted_table_name,
        join_condition(key_columns)
    ));
    query
}

pub fn build_delete_using_stage(formatted_table_name: &str, stage: &str, key_columns: &[&str]) -> String {
    format!(
        "DELETE FROM {} am\nUSING {} tp\nWHERE {}",
        formatted_table_name,
        stage,
        join_condition(key_columns)
    )
}

/// Deletes every row in scope whose merge key was not staged into `key_stage`.
pub fn build_delete_missing(
    formatted_table_name: &str,
    key_stage: &str,
    merge_key: &[&str],
    scope_condition: Option<&str>,
) -> String {
    let mut conditions = Vec::with_capacity(2);
    if let Some(scope) = scope_condition {
        conditions.push(format!("({})", scope));
    }
    conditions.push(format!(
        "NOT EXISTS (SELECT 1 FROM {} tp WHERE {})",
        key_stage,
        join_condition(merge_key)
    ));

    format!("DELETE FROM {} am\nWHERE {}", formatted_table_name, conditions.join("\n  AND "))
}

/// Bind parameters collected while rendering a statement.
#[derive(Debug, Default)]
pub struct Parameters {
    values: Vec<SqlValue>,
}

impl Parameters {
    pub fn new() -> Self {
        Parameters { values: vec![] }
    }

    /// Registers `value` and returns its placeholder.
    pub fn push(&mut self, value: SqlValue) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn as_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
    }
}

fn untranslatable(what: &str) -> StoreError {
    StoreError::SchemaMismatch(format!("{} can not be translated to SQL", what))
}

fn qualified(column: &str, qualifier: Option<&str>) -> String {
    match qualifier {
        Some(qualifier) => format!("{}.{}", qualifier, quote_identifier(column)),
        None => quote_identifier(column),
    }
}

/// Renders a predicate as a parameterized SQL condition.
pub fn build_condition(
    predicate: &Predicate,
    qualifier: Option<&str>,
    params: &mut Parameters,
) -> Result<String, StoreError> {
    let sql = match predicate {
        Predicate::Compare { column, operator, operand } => {
            let right = match operand {
                Operand::Value(value) => params.push(value.clone()),
                Operand::Column(other) => qualified(other, qualifier),
            };
            format!("{} {} {}", qualified(column, qualifier), operator.as_sql(), right)
        }
        Predicate::IsNull(column) => format!("{} IS NULL", qualified(column, qualifier)),
        Predicate::IsNotNull(column) => format!("{} IS NOT NULL", qualified(column, qualifier)),
        Predicate::In { values, .. } if values.is_empty() => "FALSE".to_string(),
        Predicate::In { column, values } => {
            let placeholders =
                values.iter().map(|v| params.push(v.clone())).collect::<Vec<_>>().join(", ");
            format!("{} IN ({})", qualified(column, qualifier), placeholders)
        }
        Predicate::Like { column, pattern } => {
            format!("{} LIKE {}", qualified(column, qualifier), params.push(SqlValue::from(pattern.as_str())))
        }
        Predicate::Logical { left, operator, right } => {
            let left_sql = build_condition(left, qualifier, params)?;
            let right_sql = build_condition(right, qualifier, params)?;
            let op_sql = match operator {
                LogicalOperator::And => "AND",
                LogicalOperator::Or => "OR",
            };
            format!("({} {} {})", left_sql, op_sql, right_sql)
        }
        Predicate::Not(inner) => format!("NOT ({})", build_condition(inner, qualifier, params)?),
        Predicate::ClientSide(filter) => return Err(untranslatable(&filter.description)),
    };

    Ok(sql)
}

/// Builds SET clauses for a mutation.
pub fn build_set_clause(assignment: &Assignment, params: &mut Parameters) -> Result<String, StoreError> {
    let column_name = quote_identifier(&assignment.column);

    let clause = match &assignment.action {
        SetAction::Set(value) => format!("{} = {}", column_name, params.push(value.clone())),
        SetAction::Add(value) => {
            format!("{} = {} + {}", column_name, column_name, params.push(value.clone()))
        }
        SetAction::Subtract(value) => {
            format!("{} = {} - {}", column_name, column_name, params.push(value.clone()))
        }
        SetAction::Max(value) => {
            format!("{} = GREATEST({}, {})", column_name, column_name, params.push(value.clone()))
        }
        SetAction::Min(value) => {
            format!("{} = LEAST({}, {})", column_name, column_name, params.push(value.clone()))
        }
        SetAction::CopyColumn(source) => format!("{} = {}", column_name, quote_identifier(source)),
        SetAction::ClientSide(value) => return Err(untranslatable(&value.description)),
    };

    Ok(clause)
}

pub fn build_update_where(
    formatted_table_name: &str,
    predicate: &Predicate,
    mutation: &Mutation,
) -> Result<(String, Parameters), StoreError> {
    let mut params = Parameters::new();
    let set_clauses = mutation
        .assignments()
        .iter()
        .map(|assignment| build_set_clause(assignment, &mut params))
        .collect::<Result<Vec<_>, _>>()?;
    let condition = build_condition(predicate, None, &mut params)?;

    let query =
        format!("UPDATE {}\nSET {}\nWHERE {}", formatted_table_name, set_clauses.join(", "), condition);
    Ok((query, params))
}

pub fn build_delete_where(
    formatted_table_name: &str,
    predicate: &Predicate,
) -> Result<(String, Parameters), StoreError> {
    let mut params = Parameters::new();
    let condition = build_condition(predicate, None, &mut params)?;
    Ok((format!("DELETE FROM {}\nWHERE {}", formatted_table_name, condition), params))
}

/// Containment query for `keys`, each a tuple over `key_columns`.
pub fn build_select_in(
    formatted_table_name: &str,
    columns: &[&str],
    key_columns: &[&str],
    keys: &[Vec<SqlValue>],
    order_by: Option<&str>,
) -> (String, Parameters) {
    let mut params = Parameters::new();

    let tuples = keys
        .iter()
        .map(|key| {
            let placeholders = key.iter().map(|v| params.push(v.clone())).collect::<Vec<_>>().join(", ");
            if key_columns.len() == 1 {
                placeholders
            } else {
                format!("({})", placeholders)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    let target = if key_columns.len() == 1 {
        quote_identifier(key_columns[0])
    } else {
        format!("({})", column_list(key_columns, None))
    };

    let mut query = format!(
        "SELECT {}\nFROM {}\nWHERE {} IN ({})",
        column_list(columns, None),
        formatted_table_name,
        target,
        tuples
    );
    if let Some(order_by) = order_by {
        query.push_str(&format!("\nORDER BY {}", quote_identifier(order_by)));
    }

    (query, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{predicate::col, value::SqlType};

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("email"), "email");
        assert_eq!(quote_identifier("user"), "\"user\"");
        assert_eq!(quote_identifier("lastLogin"), "\"lastLogin\"");
        assert_eq!(format_table_name("public.users"), "\"public\".\"users\"");
        assert_eq!(format_table_name("users"), "users");
    }

    #[test]
    fn test_staging_table_is_stable_per_layout() {
        let a = vec![ColumnDefinition { name: "code".to_string(), sql_type: SqlType::Text, nullable: false }];
        let mut b = a.clone();
        b[0].sql_type = SqlType::Bigint;

        assert_eq!(staging_table_name("users", "stage", &a), staging_table_name("users", "stage", &a));
        assert_ne!(staging_table_name("users", "stage", &a), staging_table_name("users", "stage", &b));
        assert_eq!(
            build_create_staging_table("s", &a, true),
            "CREATE TEMP TABLE IF NOT EXISTS s (__ord BIGINT NOT NULL, code TEXT)"
        );
        assert_eq!(
            build_copy_statement("s", &["code"], true),
            "COPY s (__ord, code) FROM STDIN WITH (FORMAT binary)"
        );
    }

    #[test]
    fn test_insert_returns_generated_keys_in_order() {
        assert_eq!(
            build_insert_body("users", "s", &["code", "email"], Some("id")),
            "INSERT INTO users (code, email)\nSELECT tp.code, tp.email\nFROM s tp\nORDER BY tp.__ord\nRETURNING id"
        );
    }

    #[test]
    fn test_merge_statements() {
        assert_eq!(
            build_update_from_stage("users", "s", &["code", "email"], &["name"], Some("id")),
            "UPDATE users am\nSET name = tp.name\nFROM s tp\nWHERE am.code = tp.code AND am.email = tp.email\nRETURNING tp.__ord, am.id"
        );
        assert_eq!(
            build_merge_insert_body("users", "s", &["code", "name"], &["code"], None),
            "INSERT INTO users (code, name)\nSELECT tp.code, tp.name\nFROM s tp\nWHERE NOT EXISTS (SELECT 1 FROM users am WHERE am.code = tp.code)\nORDER BY tp.__ord"
        );
        assert_eq!(
            build_matched_select("users", "s", &["code"], None),
            "SELECT tp.__ord\nFROM s tp\nJOIN users am ON am.code = tp.code"
        );
    }

    #[test]
    fn test_delete_statements() {
        assert_eq!(
            build_delete_using_stage("users", "s", &["id"]),
            "DELETE FROM users am\nUSING s tp\nWHERE am.id = tp.id"
        );
        assert_eq!(
            build_delete_missing("users", "k", &["code"], Some("tenant = $1")),
            "DELETE FROM users am\nWHERE (tenant = $1)\n  AND NOT EXISTS (SELECT 1 FROM k tp WHERE am.code = tp.code)"
        );
    }

    #[test]
    fn test_update_where_is_parameterized() {
        let predicate = col("is_active").eq(true).and(col("last_login").lt(10));
        let mutation = Mutation::new().set("is_active", false).add("visits", 1).max("score", 5);

        let (query, params) = build_update_where("users", &predicate, &mutation).unwrap();

        assert_eq!(
            query,
            "UPDATE users\nSET is_active = $1, visits = visits + $2, score = GREATEST(score, $3)\nWHERE (is_active = $4 AND last_login < $5)"
        );
        assert_eq!(params.len(), 5);
        assert_eq!(params.values()[3], SqlValue::Bool(true));
    }

    #[test]
    fn test_delete_where_handles_null_like_and_in() {
        let predicate = col("name").is_null().or(!col("email").like("%@x.io")).or(col("id").is_in([1, 2]));

        let (query, params) = build_delete_where("users", &predicate).unwrap();

        assert_eq!(
            query,
            "DELETE FROM users\nWHERE ((name IS NULL OR NOT (email LIKE $1)) OR id IN ($2, $3))"
        );
        assert_eq!(params.len(), 3);

        let (query, params) = build_delete_where("users", &col("id").is_in(Vec::<i64>::new())).unwrap();
        assert_eq!(query, "DELETE FROM users\nWHERE FALSE");
        assert!(params.is_empty());
    }

    #[test]
    fn test_client_side_predicate_is_rejected() {
        let predicate = Predicate::client_side("is_vip", |_| true);
        assert!(build_delete_where("users", &predicate).is_err());
    }

    #[test]
    fn test_select_in() {
        let keys = vec![vec![SqlValue::from("a")], vec![SqlValue::from("b")]];
        let (query, params) = build_select_in("users", &["id", "code"], &["code"], &keys, Some("id"));
        assert_eq!(query, "SELECT id, code\nFROM users\nWHERE code IN ($1, $2)\nORDER BY id");
        assert_eq!(params.len(), 2);

        let keys = vec![vec![SqlValue::from("a"), SqlValue::from("a@x.io")]];
        let (query, _) = build_select_in("users", &["id"], &["code", "email"], &keys, None);
        assert_eq!(query, "SELECT id\nFROM users\nWHERE (code, email) IN (($1, $2))");
    }
}
