//! Lazy `WHERE key IN (...)` lookups over arbitrarily large key sets.
//!
//! Keys are split into sub-batches that fit the store's bind parameter limit.
//! Each sub-batch is one query, issued only when the stream is polled that far.

use std::{collections::HashSet, sync::Arc};

use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use tracing::debug;

use crate::{
    database::{BulkConnection, BulkStore},
    error::{BulkError, StoreError},
    operation::OperationKind,
    record::Row,
    schema::TableSchema,
    value::{compare_nulls_last, SqlValue},
};

/// Rows produced by a containment query, fetched one sub-batch at a time.
pub type RowStream = BoxStream<'static, Result<Row, BulkError>>;

/// Validated containment query, ready to be turned into a stream.
#[derive(Debug, Clone)]
pub(crate) struct Containment {
    pub(crate) table: TableSchema,
    pub(crate) key_columns: Vec<String>,
    pub(crate) batches: Vec<Vec<Vec<SqlValue>>>,
    pub(crate) order_by: Option<String>,
}

impl Containment {
    /// Types every key against the table, drops tuples that can never match
    /// (any NULL component) and removes repeats, keeping first-seen order.
    pub(crate) fn prepare(
        table: &TableSchema,
        key_columns: Vec<String>,
        keys: Vec<Vec<SqlValue>>,
        order_by: Option<&str>,
        max_parameters: usize,
    ) -> Result<Self, BulkError> {
        let mismatch = |cause: String| BulkError::schema_mismatch(OperationKind::WhereIn, None, cause);

        if key_columns.is_empty() {
            return Err(mismatch("containment needs at least one key column".to_string()));
        }

        let mut key_types = Vec::with_capacity(key_columns.len());
        for column in &key_columns {
            let definition = table.find_column(column).ok_or_else(|| {
                mismatch(format!("column {} does not exist on table {}", column, table.name))
            })?;
            key_types.push(definition.sql_type);
        }

        if let Some(column) = order_by {
            if table.find_column(column).is_none() {
                return Err(mismatch(format!("can not order by unknown column {}", column)));
            }
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for key in keys {
            if key.len() != key_columns.len() {
                return Err(mismatch(format!(
                    "key has {} values but {} key columns were given",
                    key.len(),
                    key_columns.len()
                )));
            }
            if key.iter().any(SqlValue::is_null) {
                continue;
            }

            let typed = key
                .iter()
                .zip(&key_types)
                .zip(&key_columns)
                .map(|((value, sql_type), column)| {
                    value.coerce(*sql_type).map_err(|e| mismatch(format!("column {}: {}", column, e)))
                })
                .collect::<Result<Vec<_>, _>>()?;

            if seen.insert(typed.clone()) {
                unique.push(typed);
            }
        }

        let per_batch = (max_parameters / key_columns.len()).max(1);
        let batches = unique.chunks(per_batch).map(<[_]>::to_vec).collect();

        Ok(Containment {
            table: table.clone(),
            key_columns,
            batches,
            order_by: order_by.map(str::to_string),
        })
    }

    /// Number of queries the stream issues when fully consumed.
    pub(crate) fn query_count(&self) -> usize {
        self.batches.len()
    }

    /// Rows whose key is one of the prepared keys. The first poll checks out
    /// a connection, so an empty key set never touches the store.
    pub(crate) fn into_stream<S: BulkStore>(self, store: Arc<S>) -> RowStream {
        // more than one query means the store can not sort for us
        let sort_locally = self.order_by.is_some() && self.batches.len() > 1;

        let cursor = Cursor {
            store,
            conn: None,
            table: self.table,
            key_columns: self.key_columns,
            order_by: self.order_by,
            batches: self.batches.into_iter(),
            sort_locally,
        };

        stream::try_unfold(cursor, |mut cursor| async move {
            let rows = match cursor.next_rows().await? {
                Some(rows) => rows,
                None => return Ok::<_, BulkError>(None),
            };
            Ok(Some((stream::iter(rows.into_iter().map(Ok)), cursor)))
        })
        .try_flatten()
        .boxed()
    }
}

struct Cursor<S: BulkStore> {
    store: Arc<S>,
    conn: Option<S::Connection>,
    table: TableSchema,
    key_columns: Vec<String>,
    order_by: Option<String>,
    batches: std::vec::IntoIter<Vec<Vec<SqlValue>>>,
    sort_locally: bool,
}

impl<S: BulkStore> Cursor<S> {
    fn error(error: StoreError) -> BulkError {
        BulkError::from_store(OperationKind::WhereIn, None, error)
    }

    async fn query(&mut self, keys: &[Vec<SqlValue>], order_by: Option<&str>) -> Result<Vec<Row>, BulkError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.store.connect().await.map_err(Self::error)?,
        };
        let conn = self.conn.insert(conn);

        debug!("where_in on {} with {} keys", self.table.name, keys.len());
        conn.select_in(&self.table, &self.key_columns, keys, order_by).await.map_err(Self::error)
    }

    async fn next_rows(&mut self) -> Result<Option<Vec<Row>>, BulkError> {
        if !self.sort_locally {
            let Some(keys) = self.batches.next() else { return Ok(None) };
            let order_by = self.order_by.clone();
            return self.query(&keys, order_by.as_deref()).await.map(Some);
        }

        // a sorted result spanning several queries is buffered once, in full
        let mut rows = Vec::new();
        while let Some(keys) = self.batches.next() {
            rows.extend(self.query(&keys, None).await?);
        }
        if rows.is_empty() {
            return Ok(None);
        }

        if let Some(column) = self.order_by.as_deref() {
            rows.sort_by(|a, b| compare_nulls_last(a.value(column), b.value(column)));
        }
        Ok(Some(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SqlType;

    fn users() -> TableSchema {
        TableSchema::new("users", "id").column("code", SqlType::Text).column("team", SqlType::Integer)
    }

    #[test]
    fn test_prepare_dedupes_and_coerces() {
        let keys = vec![
            vec![SqlValue::from("a")],
            vec![SqlValue::from("b")],
            vec![SqlValue::from("a")],
            vec![SqlValue::Null],
        ];
        let containment = Containment::prepare(&users(), vec!["code".to_string()], keys, None, 100).unwrap();

        assert_eq!(containment.batches, vec![vec![vec![SqlValue::from("a")], vec![SqlValue::from("b")]]]);
    }

    #[test]
    fn test_batches_respect_parameter_limit() {
        let keys = (0..10).map(|i| vec![SqlValue::BigInt(i), SqlValue::Int(1)]).collect();
        let containment = Containment::prepare(
            &users(),
            vec!["id".to_string(), "team".to_string()],
            keys,
            None,
            6,
        )
        .unwrap();

        // three tuples of two values fit in six parameters
        assert_eq!(containment.query_count(), 4);
        assert_eq!(containment.batches[3].len(), 1);
    }

    #[test]
    fn test_prepare_rejects_bad_keys() {
        let unknown = Containment::prepare(&users(), vec!["nope".to_string()], vec![], None, 10);
        assert!(matches!(unknown, Err(BulkError::SchemaMismatch { .. })));

        let arity = Containment::prepare(
            &users(),
            vec!["code".to_string()],
            vec![vec![SqlValue::from("a"), SqlValue::from("b")]],
            None,
            10,
        );
        assert!(matches!(arity, Err(BulkError::SchemaMismatch { .. })));

        let typed = Containment::prepare(
            &users(),
            vec!["team".to_string()],
            vec![vec![SqlValue::from("seven")]],
            None,
            10,
        );
        assert!(matches!(typed, Err(BulkError::SchemaMismatch { .. })));
    }
}
