use bytes::BytesMut;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use tokio_postgres::{
    types::{to_sql_checked, IsNull, ToSql, Type as PgType},
    Row as PgRow,
};

use crate::{
    record::Row,
    schema::ColumnDefinition,
    value::{SqlType, SqlValue},
};

/// Postgres wire type used when binary-copying a column of `sql_type`.
pub fn to_pg_type(sql_type: SqlType) -> PgType {
    match sql_type {
        SqlType::Bool => PgType::BOOL,
        SqlType::Integer => PgType::INT4,
        SqlType::Bigint => PgType::INT8,
        SqlType::Double => PgType::FLOAT8,
        SqlType::Numeric => PgType::NUMERIC,
        SqlType::Text => PgType::TEXT,
        SqlType::Bytea => PgType::BYTEA,
        SqlType::TimestampTz => PgType::TIMESTAMPTZ,
        SqlType::Jsonb => PgType::JSONB,
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &PgType,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(value) => bool::to_sql(value, ty, out),
            // the server decides parameter types, integers follow it
            SqlValue::Int(value) if *ty == PgType::INT8 => i64::to_sql(&i64::from(*value), ty, out),
            SqlValue::Int(value) if *ty == PgType::NUMERIC => Decimal::to_sql(&Decimal::from(*value), ty, out),
            SqlValue::Int(value) if *ty == PgType::FLOAT8 => f64::to_sql(&f64::from(*value), ty, out),
            SqlValue::Int(value) => i32::to_sql(value, ty, out),
            SqlValue::BigInt(value) if *ty == PgType::INT4 => i32::to_sql(&i32::try_from(*value)?, ty, out),
            SqlValue::BigInt(value) if *ty == PgType::NUMERIC => {
                Decimal::to_sql(&Decimal::from(*value), ty, out)
            }
            SqlValue::BigInt(value) if *ty == PgType::FLOAT8 => f64::to_sql(&(*value as f64), ty, out),
            SqlValue::BigInt(value) => i64::to_sql(value, ty, out),
            SqlValue::Double(value) => f64::to_sql(value, ty, out),
            SqlValue::Numeric(value) => Decimal::to_sql(value, ty, out),
            SqlValue::Text(value) => String::to_sql(value, ty, out),
            SqlValue::Bytea(value) => <&[u8] as ToSql>::to_sql(&value.as_slice(), ty, out),
            SqlValue::Timestamp(value) => DateTime::<Utc>::to_sql(value, ty, out),
            SqlValue::Json(value) => JsonValue::to_sql(value, ty, out),
        }
    }

    fn accepts(_ty: &PgType) -> bool {
        true // We accept all types
    }

    to_sql_checked!();
}

/// Reads column `index` of a Postgres row as `sql_type`.
pub fn read_value(row: &PgRow, index: usize, sql_type: SqlType) -> Result<SqlValue, tokio_postgres::Error> {
    let value = match sql_type {
        SqlType::Bool => row.try_get::<_, Option<bool>>(index)?.into(),
        SqlType::Integer => row.try_get::<_, Option<i32>>(index)?.into(),
        SqlType::Bigint => row.try_get::<_, Option<i64>>(index)?.into(),
        SqlType::Double => row.try_get::<_, Option<f64>>(index)?.into(),
        SqlType::Numeric => row.try_get::<_, Option<Decimal>>(index)?.into(),
        SqlType::Text => row.try_get::<_, Option<String>>(index)?.into(),
        SqlType::Bytea => row.try_get::<_, Option<Vec<u8>>>(index)?.into(),
        SqlType::TimestampTz => row.try_get::<_, Option<DateTime<Utc>>>(index)?.into(),
        SqlType::Jsonb => match row.try_get::<_, Option<JsonValue>>(index)? {
            Some(value) => SqlValue::Json(value),
            None => SqlValue::Null,
        },
    };
    Ok(value)
}

/// Maps a selected Postgres row onto the table's columns.
pub fn read_row(row: &PgRow, columns: &[ColumnDefinition]) -> Result<Row, tokio_postgres::Error> {
    let mut result = Row::new();
    for (index, column) in columns.iter().enumerate() {
        result.insert(column.name.clone(), read_value(row, index, column.sql_type)?);
    }
    Ok(result)
}
