use std::collections::HashSet;

use async_trait::async_trait;
use bb8::PooledConnection;
use bytes::Bytes;
use futures::pin_mut;
use tokio::runtime::Handle;
use tokio_postgres::{
    binary_copy::BinaryCopyInWriter,
    types::{ToSql, Type as PgType},
    CopyInSink, Row as PgRow,
};
use tracing::{debug, error, warn};

use super::{
    classify_error,
    client::PostgresConnectionManagerTls,
    query_builder::{
        build_condition, build_copy_statement, build_create_staging_table, build_delete_missing,
        build_delete_using_stage, build_delete_where, build_insert_body, build_matched_select,
        build_merge_insert_body, build_select_in, build_update_from_stage, build_update_where,
        format_table_name, staging_table_name, Parameters,
    },
    sql_type_wrapper::{read_row, read_value, to_pg_type},
};
use crate::{
    database::{BulkConnection, ChunkOutcome},
    error::StoreError,
    operation::OperationKind,
    planner::{BatchPlan, Chunk},
    predicate::{Mutation, Predicate},
    record::Row,
    schema::{ColumnDefinition, TableSchema},
    value::{SqlType, SqlValue},
};

type ToSqlRow<'a> = Vec<&'a (dyn ToSql + Sync)>;

type PooledClient = PooledConnection<'static, PostgresConnectionManagerTls>;

/// A pooled Postgres session owned by one operation or chunk.
///
/// Dropped while a transaction is open (the owning future was cancelled or
/// timed out), the session is rolled back before it goes back to the pool.
pub struct PostgresConnection {
    conn: Option<PooledClient>,
    in_transaction: bool,
}

impl PostgresConnection {
    pub(crate) async fn new(conn: PooledClient, statement_timeout_ms: Option<u64>) -> Result<Self, StoreError> {
        let connection = PostgresConnection { conn: Some(conn), in_transaction: false };
        if let Some(timeout_ms) = statement_timeout_ms {
            connection.batch_execute(&format!("SET statement_timeout = {}", timeout_ms)).await?;
        }
        Ok(connection)
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn client(&self) -> Result<&PooledClient, StoreError> {
        self.conn.as_ref().ok_or_else(|| StoreError::Unavailable("connection already released".to_string()))
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), StoreError> {
        debug!("Executing: {}", sql);
        self.client()?.batch_execute(sql).await.map_err(|e| {
            error!("Statement failed: {} - {}", sql, e);
            classify_error(&e)
        })
    }

    async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, StoreError> {
        debug!("Executing: {}", sql);
        self.client()?.execute(sql, params).await.map_err(|e| {
            error!("Statement failed: {} - {}", sql, e);
            classify_error(&e)
        })
    }

    async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<PgRow>, StoreError> {
        debug!("Querying: {}", sql);
        self.client()?.query(sql, params).await.map_err(|e| {
            error!("Query failed: {} - {}", sql, e);
            classify_error(&e)
        })
    }

    /// Binary-copies `rows` into `stage` after clearing it.
    async fn copy_into_stage(
        &self,
        stage: &str,
        columns: &[ColumnDefinition],
        with_ordinal: bool,
        rows: &[ToSqlRow<'_>],
    ) -> Result<u64, StoreError> {
        self.batch_execute(&format!(
            "{};\nTRUNCATE {}",
            build_create_staging_table(stage, columns, with_ordinal),
            stage
        ))
        .await?;

        let column_names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let mut column_types: Vec<PgType> = Vec::with_capacity(columns.len() + 1);
        if with_ordinal {
            column_types.push(PgType::INT8);
        }
        column_types.extend(columns.iter().map(|c| to_pg_type(c.sql_type)));

        let stmt = build_copy_statement(stage, &column_names, with_ordinal);
        debug!("Bulk copy statement: {}", stmt);

        let sink: CopyInSink<Bytes> = self.client()?.copy_in(&stmt).await.map_err(|e| classify_error(&e))?;

        let writer = BinaryCopyInWriter::new(sink, &column_types);
        pin_mut!(writer);

        for row in rows {
            writer.as_mut().write(row).await.map_err(|e| {
                error!("Failed to copy row into {}: {}", stage, e);
                classify_error(&e)
            })?;
        }

        writer.finish().await.map_err(|e| classify_error(&e))
    }

    async fn stage_chunk(&self, table: &TableSchema, plan: &BatchPlan, chunk: &Chunk) -> Result<String, StoreError> {
        let stage = staging_table_name(&table.name, "stage", &plan.columns);

        let ordinals: Vec<SqlValue> =
            chunk.rows.iter().map(|row| SqlValue::BigInt(row.ordinal as i64)).collect();
        let rows: Vec<ToSqlRow<'_>> = chunk
            .rows
            .iter()
            .zip(&ordinals)
            .map(|(row, ordinal)| {
                let mut params: ToSqlRow<'_> = Vec::with_capacity(row.values.len() + 1);
                params.push(ordinal);
                params.extend(row.values.iter().map(|v| v as &(dyn ToSql + Sync)));
                params
            })
            .collect();

        self.copy_into_stage(&stage, &plan.columns, true, &rows).await?;
        Ok(stage)
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        let Some(conn) = self.conn.take() else { return };

        match Handle::try_current() {
            Ok(handle) => {
                warn!("Postgres connection released inside a transaction, rolling back");
                // the pooled connection is only returned once the task ends
                handle.spawn(async move {
                    if let Err(e) = conn.batch_execute("ROLLBACK").await {
                        error!("Rollback of abandoned transaction failed: {}", e);
                    }
                });
            }
            Err(_) => error!("Postgres connection released inside a transaction without a runtime to roll it back"),
        }
    }
}

/// Pairs generated keys with the ordinals of the rows that produced them.
///
/// Rows are inserted in ordinal order, so the sequence hands out keys in that
/// order too. `RETURNING` order is not relied on.
fn pair_generated_keys(
    ordinals: &[usize],
    mut keys: Vec<i64>,
    table: &TableSchema,
) -> Result<Vec<(usize, i64)>, StoreError> {
    if keys.len() != ordinals.len() {
        return Err(StoreError::Unavailable(format!(
            "insert into {} returned {} keys for {} rows",
            table.name,
            keys.len(),
            ordinals.len()
        )));
    }
    keys.sort_unstable();
    Ok(ordinals.iter().copied().zip(keys).collect())
}

fn read_ordinal(row: &PgRow) -> Result<usize, StoreError> {
    let ordinal: i64 = row.try_get(0).map_err(|e| classify_error(&e))?;
    usize::try_from(ordinal).map_err(|e| StoreError::SchemaMismatch(e.to_string()))
}

fn read_key(row: &PgRow, index: usize, table: &TableSchema) -> Result<i64, StoreError> {
    let sql_type = table.primary_key_column().map(|c| c.sql_type).unwrap_or(SqlType::Bigint);
    read_value(row, index, sql_type)
        .map_err(|e| classify_error(&e))?
        .as_i64()
        .ok_or_else(|| StoreError::SchemaMismatch(format!("primary key {} is not an integer", table.primary_key)))
}

#[async_trait]
impl BulkConnection for PostgresConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        // set first, BEGIN may reach the server even if this future is dropped
        self.in_transaction = true;
        self.batch_execute("BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let committed = self.batch_execute("COMMIT").await;
        self.in_transaction = false;
        committed
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let rolled_back = self.batch_execute("ROLLBACK").await;
        self.in_transaction = false;
        rolled_back
    }

    async fn write_chunk(
        &mut self,
        table: &TableSchema,
        plan: &BatchPlan,
        chunk: &Chunk,
    ) -> Result<ChunkOutcome, StoreError> {
        let stage = self.stage_chunk(table, plan, chunk).await?;
        let table_name = format_table_name(&table.name);
        let columns = plan.column_names();
        let returning = plan.return_generated_keys.then_some(table.primary_key.as_str());

        let mut outcome = ChunkOutcome::default();

        match plan.operation {
            OperationKind::Insert => {
                let sql = build_insert_body(&table_name, &stage, &columns, returning);
                if returning.is_some() {
                    let rows = self.query(&sql, &[]).await?;
                    let keys = rows.iter().map(|row| read_key(row, 0, table)).collect::<Result<Vec<_>, _>>()?;
                    let ordinals: Vec<usize> = chunk.rows.iter().map(|r| r.ordinal).collect();
                    outcome.generated_keys = pair_generated_keys(&ordinals, keys, table)?;
                    outcome.inserted = rows.len() as u64;
                } else {
                    outcome.inserted = self.execute(&sql, &[]).await?;
                }
            }
            OperationKind::Update => {
                let set_columns: Vec<&str> = plan.update_columns.iter().map(String::as_str).collect();
                let sql = build_update_from_stage(
                    &table_name,
                    &stage,
                    &[table.primary_key.as_str()],
                    &set_columns,
                    None,
                );
                let rows = self.query(&sql, &[]).await?;
                let matched = rows.iter().map(read_ordinal).collect::<Result<HashSet<_>, _>>()?;

                outcome.updated = rows.len() as u64;
                outcome.missing =
                    chunk.rows.iter().map(|r| r.ordinal).filter(|o| !matched.contains(o)).collect();
            }
            OperationKind::Delete => {
                let sql = build_delete_using_stage(&table_name, &stage, &[table.primary_key.as_str()]);
                outcome.deleted = self.execute(&sql, &[]).await?;
            }
            OperationKind::Merge | OperationKind::Synchronize => {
                let merge_key: Vec<&str> = plan.merge_key.iter().map(String::as_str).collect();
                let set_columns: Vec<&str> = plan.update_columns.iter().map(String::as_str).collect();

                let matched_rows = if !set_columns.is_empty() {
                    let sql = build_update_from_stage(&table_name, &stage, &merge_key, &set_columns, returning);
                    let rows = self.query(&sql, &[]).await?;
                    outcome.updated = rows.len() as u64;
                    rows
                } else if returning.is_some() {
                    self.query(&build_matched_select(&table_name, &stage, &merge_key, returning), &[]).await?
                } else {
                    vec![]
                };

                let mut matched = HashSet::with_capacity(matched_rows.len());
                for row in &matched_rows {
                    let ordinal = read_ordinal(row)?;
                    matched.insert(ordinal);
                    if returning.is_some() {
                        outcome.generated_keys.push((ordinal, read_key(row, 1, table)?));
                    }
                }

                let sql = build_merge_insert_body(&table_name, &stage, &columns, &merge_key, returning);
                if returning.is_some() {
                    let rows = self.query(&sql, &[]).await?;
                    let unmatched: Vec<usize> =
                        chunk.rows.iter().map(|r| r.ordinal).filter(|o| !matched.contains(o)).collect();

                    if unmatched.len() == rows.len() {
                        let keys =
                            rows.iter().map(|row| read_key(row, 0, table)).collect::<Result<Vec<_>, _>>()?;
                        outcome.generated_keys.extend(pair_generated_keys(&unmatched, keys, table)?);
                    } else {
                        warn!(
                            "Merge into {} inserted {} rows for {} unmatched records, generated keys not mapped",
                            table.name,
                            rows.len(),
                            unmatched.len()
                        );
                    }
                    outcome.inserted = rows.len() as u64;
                } else {
                    outcome.inserted = self.execute(&sql, &[]).await?;
                }
            }
            other => {
                return Err(StoreError::SchemaMismatch(format!("{} is not a chunk operation", other)))
            }
        }

        Ok(outcome)
    }

    async fn delete_missing(
        &mut self,
        table: &TableSchema,
        merge_key: &[String],
        keys: &[Vec<SqlValue>],
        scope: Option<&Predicate>,
    ) -> Result<u64, StoreError> {
        let key_columns: Vec<ColumnDefinition> = merge_key
            .iter()
            .map(|name| {
                table.find_column(name).cloned().ok_or_else(|| {
                    StoreError::SchemaMismatch(format!("merge key column {} does not exist", name))
                })
            })
            .collect::<Result<_, _>>()?;

        let key_stage = staging_table_name(&table.name, "keys", &key_columns);
        let rows: Vec<ToSqlRow<'_>> =
            keys.iter().map(|key| key.iter().map(|v| v as &(dyn ToSql + Sync)).collect()).collect();
        self.copy_into_stage(&key_stage, &key_columns, false, &rows).await?;

        let mut params = Parameters::new();
        let scope_condition = scope.map(|p| build_condition(p, Some("am"), &mut params)).transpose()?;
        let merge_key: Vec<&str> = merge_key.iter().map(String::as_str).collect();
        let sql = build_delete_missing(
            &format_table_name(&table.name),
            &key_stage,
            &merge_key,
            scope_condition.as_deref(),
        );

        self.execute(&sql, &params.as_refs()).await
    }

    async fn update_where(
        &mut self,
        table: &TableSchema,
        predicate: &Predicate,
        mutation: &Mutation,
    ) -> Result<u64, StoreError> {
        let (sql, params) = build_update_where(&format_table_name(&table.name), predicate, mutation)?;
        self.execute(&sql, &params.as_refs()).await
    }

    async fn delete_where(&mut self, table: &TableSchema, predicate: &Predicate) -> Result<u64, StoreError> {
        let (sql, params) = build_delete_where(&format_table_name(&table.name), predicate)?;
        self.execute(&sql, &params.as_refs()).await
    }

    async fn select_in(
        &mut self,
        table: &TableSchema,
        key_columns: &[String],
        keys: &[Vec<SqlValue>],
        order_by: Option<&str>,
    ) -> Result<Vec<Row>, StoreError> {
        let columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        let key_columns: Vec<&str> = key_columns.iter().map(String::as_str).collect();
        let (sql, params) =
            build_select_in(&format_table_name(&table.name), &columns, &key_columns, keys, order_by);

        let rows = self.query(&sql, &params.as_refs()).await?;
        rows.iter().map(|row| read_row(row, &table.columns).map_err(|e| classify_error(&e))).collect()
    }
}
