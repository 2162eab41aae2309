use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::value::SqlType;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SchemaError {
    #[error("Table {0} has no columns")]
    NoColumns(String),

    #[error("Table {0} declares column {1} more than once")]
    DuplicateColumn(String, String),

    #[error("Primary key column {1} is not a column of table {0}")]
    UnknownPrimaryKey(String, String),

    #[error("Generated primary key {1} on table {0} must be INTEGER or BIGINT")]
    GeneratedKeyNotInteger(String, String),

    #[error("Merge key column {1} is not a column of table {0}")]
    UnknownMergeKey(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub sql_type: SqlType,

    #[serde(default)]
    pub nullable: bool,
}

fn default_generated_key() -> bool {
    true
}

/// Shape of a target table: its columns, the surrogate key the store assigns
/// and the business key used to match incoming records on merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name, optionally `schema.table`.
    pub name: String,

    pub columns: Vec<ColumnDefinition>,

    pub primary_key: String,

    /// When true the store assigns the primary key on insert and it is never staged.
    #[serde(default = "default_generated_key")]
    pub generated_key: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_key: Vec<String>,
}

impl TableSchema {
    /// Starts a table with a store-generated `BIGINT` primary key.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        let primary_key = primary_key.into();
        TableSchema {
            name: name.into(),
            columns: vec![ColumnDefinition {
                name: primary_key.clone(),
                sql_type: SqlType::Bigint,
                nullable: false,
            }],
            primary_key,
            generated_key: true,
            merge_key: vec![],
        }
    }

    pub fn column(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.columns.push(ColumnDefinition { name: name.into(), sql_type, nullable: false });
        self
    }

    pub fn nullable_column(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.columns.push(ColumnDefinition { name: name.into(), sql_type, nullable: true });
        self
    }

    pub fn merge_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merge_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the primary key as caller supplied instead of store generated.
    pub fn with_supplied_key(mut self) -> Self {
        self.generated_key = false;
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_column(&self) -> Option<&ColumnDefinition> {
        self.find_column(&self.primary_key)
    }

    /// Columns carrying record data, the primary key excluded when the store generates it.
    pub fn data_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(move |c| !(self.generated_key && c.name == self.primary_key))
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateColumn(self.name.clone(), column.name.clone()));
            }
        }

        let primary_key = self
            .primary_key_column()
            .ok_or_else(|| SchemaError::UnknownPrimaryKey(self.name.clone(), self.primary_key.clone()))?;

        if self.generated_key && !matches!(primary_key.sql_type, SqlType::Bigint | SqlType::Integer)
        {
            return Err(SchemaError::GeneratedKeyNotInteger(
                self.name.clone(),
                self.primary_key.clone(),
            ));
        }

        if let Some(unknown) = self.merge_key.iter().find(|c| self.find_column(c).is_none()) {
            return Err(SchemaError::UnknownMergeKey(self.name.clone(), unknown.clone()));
        }

        Ok(())
    }
}
