use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};

use crate::{
    schema::TableSchema,
    value::{CoerceError, SqlValue},
};

/// An application entity the engine can stage.
///
/// The engine only reads column values; the single write is the store
/// generated primary key handed back after an insert.
pub trait Record: Send + Sync {
    /// Value of `column`, `None` when the record does not carry it.
    fn get(&self, column: &str) -> Option<SqlValue>;

    fn set_generated_key(&mut self, column: &str, key: i64);
}

/// A loosely typed record keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: BTreeMap<String, SqlValue>,
}

impl Row {
    pub fn new() -> Self {
        Row { values: BTreeMap::new() }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn value(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    pub fn value_mut(&mut self, column: &str) -> Option<&mut SqlValue> {
        self.values.get_mut(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &SqlValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Builds a row from a JSON object, typing each field by its column.
    /// Fields the table does not declare are kept out of the row.
    pub fn from_json(table: &TableSchema, object: &Map<String, JsonValue>) -> Result<Row, CoerceError> {
        let mut row = Row::new();
        for column in &table.columns {
            if let Some(value) = object.get(&column.name) {
                row.insert(column.name.clone(), SqlValue::from_json(value, column.sql_type)?);
            }
        }
        Ok(row)
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.values.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
    }
}

impl Record for Row {
    fn get(&self, column: &str) -> Option<SqlValue> {
        self.values.get(column).cloned()
    }

    fn set_generated_key(&mut self, column: &str, key: i64) {
        self.values.insert(column.to_string(), SqlValue::BigInt(key));
    }
}

impl<K: Into<String>, V: Into<SqlValue>> FromIterator<(K, V)> for Row {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Row { values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::value::SqlType;

    #[test]
    fn test_generated_key_is_written_back() {
        let mut row = Row::new().with("name", "x");
        assert_eq!(row.get("id"), None);

        row.set_generated_key("id", 42);

        assert_eq!(row.get("id"), Some(SqlValue::BigInt(42)));
        assert_eq!(row.get("name"), Some(SqlValue::from("x")));
    }

    #[test]
    fn test_row_from_json_types_fields() {
        let table = TableSchema::new("users", "id")
            .column("code", SqlType::Text)
            .column("visits", SqlType::Integer);
        let object = json!({"code": "A-1", "visits": 3, "ignored": true});

        let row = Row::from_json(&table, object.as_object().unwrap()).unwrap();

        assert_eq!(row.len(), 2);
        assert_eq!(row.value("visits"), Some(&SqlValue::Int(3)));
        assert_eq!(row.to_json(), json!({"code": "A-1", "visits": 3}));
    }
}
