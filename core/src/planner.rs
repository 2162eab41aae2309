//! Turns a batch of records into typed, chunked rows ready for staging.
//!
//! Planning never touches the store: duplicate keys and records that do not fit
//! the table are rejected here, before the first round-trip.

use std::collections::{hash_map::Entry, HashMap};

use crate::{
    config::ConfigError,
    error::BulkError,
    operation::{OperationDescriptor, OperationKind},
    record::Record,
    schema::{ColumnDefinition, TableSchema},
    value::SqlValue,
};

/// One record, typed into staged column order.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    /// Position of the record in the caller's batch.
    pub ordinal: usize,
    pub values: Vec<SqlValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    /// Ordinal of the first row in the chunk.
    pub offset: usize,
    pub rows: Vec<StagedRow>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub operation: OperationKind,
    /// Columns staged for every row, in order.
    pub columns: Vec<ColumnDefinition>,
    /// Primary key column when the operation matches by surrogate key.
    pub key_column: Option<String>,
    /// Columns matching records to stored rows on Merge and Synchronize.
    pub merge_key: Vec<String>,
    /// Columns overwritten on a match.
    pub update_columns: Vec<String>,
    pub return_generated_keys: bool,
    pub chunks: Vec<Chunk>,
    /// Every merge key of the batch, kept for the Synchronize delete.
    pub batch_keys: Vec<Vec<SqlValue>>,
}

impl BatchPlan {
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn total_rows(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    /// Merge key values of a staged row.
    pub fn merge_key_of(&self, row: &StagedRow) -> Vec<SqlValue> {
        self.merge_key
            .iter()
            .filter_map(|column| self.column_index(column).map(|i| row.values[i].clone()))
            .collect()
    }

    /// Surrogate key of a staged row, for Update and Delete plans.
    pub fn key_of<'a>(&self, row: &'a StagedRow) -> Option<&'a SqlValue> {
        let index = self.column_index(self.key_column.as_deref()?)?;
        row.values.get(index)
    }
}

fn format_key(key: &[SqlValue]) -> String {
    if key.len() == 1 {
        key[0].to_string()
    } else {
        format!("({})", key.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))
    }
}

struct Layout {
    columns: Vec<ColumnDefinition>,
    key_column: Option<String>,
    merge_key: Vec<String>,
    update_columns: Vec<String>,
}

fn resolve_layout(table: &TableSchema, descriptor: &OperationDescriptor) -> Result<Layout, BulkError> {
    let operation = descriptor.kind();
    let mismatch = |cause: String| BulkError::schema_mismatch(operation, None, cause);

    table.validate().map_err(|e| mismatch(e.to_string()))?;

    let check_columns = |columns: &[String]| -> Result<(), BulkError> {
        for column in columns {
            if table.find_column(column).is_none() {
                return Err(mismatch(format!(
                    "column {} does not exist on table {}",
                    column, table.name
                )));
            }
            if *column == table.primary_key {
                return Err(mismatch(format!("primary key {} can not be overwritten", column)));
            }
        }
        Ok(())
    };

    let data_columns: Vec<ColumnDefinition> = table.data_columns().cloned().collect();
    let non_key_columns = |exclude: &[String]| -> Vec<String> {
        data_columns
            .iter()
            .map(|c| c.name.clone())
            .filter(|name| *name != table.primary_key && !exclude.contains(name))
            .collect()
    };

    let layout = match operation {
        OperationKind::Insert => Layout {
            columns: data_columns.clone(),
            key_column: None,
            merge_key: vec![],
            update_columns: vec![],
        },
        OperationKind::Update => {
            let update_columns = match descriptor.update_columns() {
                Some(columns) => {
                    check_columns(columns)?;
                    columns.to_vec()
                }
                None => non_key_columns(&[]),
            };
            if update_columns.is_empty() {
                return Err(mismatch(format!("update of {} has no columns to set", table.name)));
            }

            let mut columns: Vec<ColumnDefinition> = table.primary_key_column().cloned().into_iter().collect();
            columns.extend(update_columns.iter().filter_map(|c| table.find_column(c)).cloned());

            Layout {
                columns,
                key_column: Some(table.primary_key.clone()),
                merge_key: vec![],
                update_columns,
            }
        }
        OperationKind::Delete => Layout {
            columns: table.primary_key_column().cloned().into_iter().collect(),
            key_column: Some(table.primary_key.clone()),
            merge_key: vec![],
            update_columns: vec![],
        },
        OperationKind::Merge | OperationKind::Synchronize => {
            let merge_key = descriptor.merge_key().unwrap_or(table.merge_key.as_slice()).to_vec();
            if merge_key.is_empty() {
                return Err(mismatch(format!("table {} declares no merge key", table.name)));
            }
            for column in &merge_key {
                if !data_columns.iter().any(|c| c.name == *column) {
                    return Err(mismatch(format!(
                        "merge key column {} is not a data column of {}",
                        column, table.name
                    )));
                }
            }

            let update_columns = match descriptor.update_columns() {
                Some(columns) => {
                    check_columns(columns)?;
                    columns.to_vec()
                }
                None => non_key_columns(&merge_key),
            };

            Layout { columns: data_columns.clone(), key_column: None, merge_key, update_columns }
        }
        OperationKind::UpdateWhere | OperationKind::DeleteWhere | OperationKind::WhereIn => {
            return Err(mismatch(format!("{} is not a batch operation", operation)))
        }
    };

    Ok(layout)
}

/// Splits `records` into chunks of at most `chunk_size` rows, preserving order.
pub fn plan<R: Record>(
    records: &[R],
    table: &TableSchema,
    descriptor: &OperationDescriptor,
    chunk_size: usize,
) -> Result<BatchPlan, BulkError> {
    let operation = descriptor.kind();
    if chunk_size == 0 {
        return Err(BulkError::invalid_config(Some(operation), ConfigError::ChunkSizeZero));
    }

    let layout = resolve_layout(table, descriptor)?;

    let merge_key_positions: Vec<usize> = layout
        .merge_key
        .iter()
        .filter_map(|column| layout.columns.iter().position(|c| c.name == *column))
        .collect();
    let key_position =
        layout.key_column.as_ref().and_then(|key| layout.columns.iter().position(|c| c.name == *key));
    // Delete is idempotent, a repeated key is harmless
    let reject_duplicate_keys = operation != OperationKind::Delete;

    let mut seen: HashMap<Vec<SqlValue>, usize> = HashMap::new();
    let mut batch_keys = Vec::new();
    let mut chunks: Vec<Chunk> = Vec::with_capacity(records.len().div_ceil(chunk_size));

    for (ordinal, record) in records.iter().enumerate() {
        let chunk_index = ordinal / chunk_size;
        let mismatch = |cause: String| BulkError::schema_mismatch(operation, Some(chunk_index), cause);

        let mut values = Vec::with_capacity(layout.columns.len());
        for column in &layout.columns {
            let value = match record.get(&column.name) {
                Some(value) => value.coerce(column.sql_type).map_err(|e| {
                    mismatch(format!("record {} column {}: {}", ordinal, column.name, e))
                })?,
                None if column.nullable => SqlValue::Null,
                None => {
                    return Err(mismatch(format!("record {} has no value for column {}", ordinal, column.name)))
                }
            };
            values.push(value);
        }

        let key: Option<Vec<SqlValue>> = if !merge_key_positions.is_empty() {
            Some(merge_key_positions.iter().map(|&i| values[i].clone()).collect())
        } else {
            key_position.map(|i| vec![values[i].clone()])
        };

        if let Some(key) = key {
            if key.iter().any(SqlValue::is_null) {
                return Err(mismatch(format!("record {} has a null key {}", ordinal, format_key(&key))));
            }

            if reject_duplicate_keys {
                match seen.entry(key.clone()) {
                    Entry::Occupied(first) => {
                        return Err(BulkError::DuplicateKey {
                            operation,
                            chunk: chunk_index,
                            key: format_key(&key),
                            first: *first.get(),
                            second: ordinal,
                        })
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(ordinal);
                    }
                }
            }

            if operation == OperationKind::Synchronize {
                batch_keys.push(key);
            }
        }

        if chunk_index == chunks.len() {
            let capacity = chunk_size.min(records.len() - ordinal);
            chunks.push(Chunk { index: chunk_index, offset: ordinal, rows: Vec::with_capacity(capacity) });
        }
        if let Some(chunk) = chunks.last_mut() {
            chunk.rows.push(StagedRow { ordinal, values });
        }
    }

    Ok(BatchPlan {
        operation,
        columns: layout.columns,
        key_column: layout.key_column,
        merge_key: layout.merge_key,
        update_columns: layout.update_columns,
        return_generated_keys: table.generated_key &&
            descriptor.return_generated_keys() &&
            matches!(operation, OperationKind::Insert | OperationKind::Merge | OperationKind::Synchronize),
        chunks,
        batch_keys,
    })
}
