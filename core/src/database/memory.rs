//! An in-process store with the same observable semantics as the Postgres one.
//!
//! Transactions are serializable: `begin` takes the store lock and keeps it
//! until `commit` or `rollback`, restoring a snapshot on rollback. Outside a
//! transaction every statement locks, applies and releases on its own.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    database::{BulkConnection, BulkStore, ChunkOutcome},
    error::StoreError,
    operation::OperationKind,
    planner::{BatchPlan, Chunk},
    predicate::{
        evaluation::{apply_mutation, matches, EvaluationError},
        Mutation, Predicate,
    },
    record::Row,
    schema::TableSchema,
    value::{compare_nulls_last, SqlValue},
};

const DEFAULT_MAX_CONNECTIONS: usize = 10;

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    /// Rows by primary key.
    rows: BTreeMap<SqlValue, Row>,
    next_key: i64,
}

impl MemoryTable {
    fn new(schema: TableSchema) -> Self {
        MemoryTable { schema, rows: BTreeMap::new(), next_key: 1 }
    }

    fn check_columns<'a>(&self, columns: impl IntoIterator<Item = &'a str>) -> Result<(), StoreError> {
        for column in columns {
            if self.schema.find_column(column).is_none() {
                return Err(StoreError::SchemaMismatch(format!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    column, self.schema.name
                )));
            }
        }
        Ok(())
    }

    fn check_not_null(&self, row: &Row) -> Result<(), StoreError> {
        for column in self.schema.columns.iter().filter(|c| !c.nullable) {
            if row.value(&column.name).is_none_or(SqlValue::is_null) {
                return Err(StoreError::ConstraintViolation(format!(
                    "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                    column.name, self.schema.name
                )));
            }
        }
        Ok(())
    }

    fn primary_key_of(&self, row: &Row) -> Option<SqlValue> {
        row.value(&self.schema.primary_key).filter(|v| !v.is_null()).cloned()
    }

    /// Inserts `row`, assigning a key when the table generates them.
    fn insert(&mut self, mut row: Row) -> Result<SqlValue, StoreError> {
        if self.schema.generated_key {
            let key_type = self.schema.primary_key_column().map(|c| c.sql_type);
            let key = match key_type {
                Some(sql_type) => SqlValue::BigInt(self.next_key)
                    .coerce(sql_type)
                    .map_err(|e| StoreError::ConstraintViolation(e.to_string()))?,
                None => SqlValue::BigInt(self.next_key),
            };
            self.next_key += 1;
            row.insert(self.schema.primary_key.clone(), key);
        }

        self.check_not_null(&row)?;
        let key = self.primary_key_of(&row).ok_or_else(|| {
            StoreError::ConstraintViolation(format!("primary key of \"{}\" is null", self.schema.name))
        })?;
        if self.rows.contains_key(&key) {
            return Err(StoreError::ConstraintViolation(format!(
                "duplicate key value violates unique constraint \"{}_pkey\": {}",
                self.schema.name, key
            )));
        }

        self.rows.insert(key.clone(), row);
        Ok(key)
    }

    fn key_tuple(row: &Row, columns: &[String]) -> Option<Vec<SqlValue>> {
        columns.iter().map(|c| row.value(c).filter(|v| !v.is_null()).cloned()).collect()
    }
}

fn staged_row(plan: &BatchPlan, values: &[SqlValue]) -> Row {
    plan.columns.iter().zip(values).map(|(c, v)| (c.name.clone(), v.clone())).collect()
}

fn key_as_i64(key: &SqlValue) -> Result<i64, StoreError> {
    key.as_i64().ok_or_else(|| StoreError::SchemaMismatch(format!("primary key {} is not an integer", key)))
}

fn evaluation_error(error: EvaluationError) -> StoreError {
    match error {
        EvaluationError::OutOfRange(_) => StoreError::ConstraintViolation(error.to_string()),
        EvaluationError::Incompatible { .. } | EvaluationError::UnknownColumn(_) => {
            StoreError::SchemaMismatch(error.to_string())
        }
    }
}

fn apply_chunk(table: &mut MemoryTable, plan: &BatchPlan, chunk: &Chunk) -> Result<ChunkOutcome, StoreError> {
    table.check_columns(plan.columns.iter().map(|c| c.name.as_str()))?;
    table.check_columns(plan.update_columns.iter().map(String::as_str))?;

    let mut outcome = ChunkOutcome::default();

    match plan.operation {
        OperationKind::Insert => {
            for staged in &chunk.rows {
                let key = table.insert(staged_row(plan, &staged.values))?;
                if plan.return_generated_keys {
                    outcome.generated_keys.push((staged.ordinal, key_as_i64(&key)?));
                }
                outcome.inserted += 1;
            }
        }
        OperationKind::Update => {
            for staged in &chunk.rows {
                let key = plan.key_of(staged).cloned().unwrap_or_default();
                let incoming = staged_row(plan, &staged.values);
                let Some(stored) = table.rows.get(&key) else {
                    outcome.missing.push(staged.ordinal);
                    continue;
                };

                let mut updated = stored.clone();
                for column in &plan.update_columns {
                    updated.insert(column.clone(), incoming.value(column).cloned().unwrap_or_default());
                }
                table.check_not_null(&updated)?;
                table.rows.insert(key, updated);
                outcome.updated += 1;
            }
        }
        OperationKind::Delete => {
            for staged in &chunk.rows {
                if let Some(key) = plan.key_of(staged) {
                    if table.rows.remove(key).is_some() {
                        outcome.deleted += 1;
                    }
                }
            }
        }
        OperationKind::Merge | OperationKind::Synchronize => {
            table.check_columns(plan.merge_key.iter().map(String::as_str))?;

            let mut index: HashMap<Vec<SqlValue>, Vec<SqlValue>> = HashMap::new();
            for (key, row) in &table.rows {
                if let Some(tuple) = MemoryTable::key_tuple(row, &plan.merge_key) {
                    index.entry(tuple).or_default().push(key.clone());
                }
            }

            let mut unmatched = Vec::new();
            for staged in &chunk.rows {
                let incoming = staged_row(plan, &staged.values);
                let tuple = plan.merge_key_of(staged);

                let Some(keys) = index.get(&tuple) else {
                    unmatched.push((staged.ordinal, incoming));
                    continue;
                };

                for key in keys {
                    if !plan.update_columns.is_empty() {
                        let Some(stored) = table.rows.get(key) else { continue };
                        let mut updated = stored.clone();
                        for column in &plan.update_columns {
                            updated.insert(column.clone(), incoming.value(column).cloned().unwrap_or_default());
                        }
                        table.check_not_null(&updated)?;
                        table.rows.insert(key.clone(), updated);
                        outcome.updated += 1;
                    }
                    if plan.return_generated_keys {
                        outcome.generated_keys.push((staged.ordinal, key_as_i64(key)?));
                    }
                }
            }

            for (ordinal, row) in unmatched {
                let key = table.insert(row)?;
                if plan.return_generated_keys {
                    outcome.generated_keys.push((ordinal, key_as_i64(&key)?));
                }
                outcome.inserted += 1;
            }
        }
        other => {
            return Err(StoreError::SchemaMismatch(format!("{} is not a chunk operation", other)))
        }
    }

    Ok(outcome)
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
}

/// Store calls a test can hook a cancellation onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Write,
    Commit,
}

#[derive(Debug, Default)]
struct MemoryStats {
    connections: AtomicUsize,
    queries: AtomicUsize,
    writes: AtomicUsize,
    commits: AtomicUsize,
    /// 1-based index of the chunk write that fails, 0 for none.
    fail_write_at: AtomicUsize,
    /// 1-based index of the chunk write that never completes, 0 for none.
    stall_write_at: AtomicUsize,
    cancellations: Mutex<Vec<(StoreEvent, usize, CancellationToken)>>,
}

impl MemoryStats {
    fn count(&self, event: StoreEvent) -> usize {
        match event {
            StoreEvent::Write => self.writes.load(AtomicOrdering::SeqCst),
            StoreEvent::Commit => self.commits.load(AtomicOrdering::SeqCst),
        }
    }

    /// Fires every cancellation registered for the `nth` occurrence of `event`.
    async fn reached(&self, event: StoreEvent, nth: usize) {
        let mut cancellations = self.cancellations.lock().await;
        cancellations.retain(|(on, at, token)| {
            if *on == event && *at == nth {
                debug!("Cancelling after {:?} {}", event, nth);
                token.cancel();
                return false;
            }
            true
        });
    }
}

/// Reference store used by tests and dry runs.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    stats: Arc<MemoryStats>,
    max_connections: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Arc::new(Mutex::new(MemoryState::default())),
            stats: Arc::new(MemoryStats::default()),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Registers (or replaces) a table.
    pub async fn create_table(&self, schema: &TableSchema) {
        let mut state = self.state.lock().await;
        state.tables.insert(schema.name.clone(), MemoryTable::new(schema.clone()));
    }

    /// Every stored row of `table`, in primary key order.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.rows.values().cloned().collect()).unwrap_or_default()
    }

    pub fn connections(&self) -> usize {
        self.stats.connections.load(AtomicOrdering::SeqCst)
    }

    /// Statements issued so far, across all connections.
    pub fn queries(&self) -> usize {
        self.stats.queries.load(AtomicOrdering::SeqCst)
    }

    /// Chunk writes issued so far.
    pub fn writes(&self) -> usize {
        self.stats.writes.load(AtomicOrdering::SeqCst)
    }

    /// Transactions committed so far.
    pub fn commits(&self) -> usize {
        self.stats.commits.load(AtomicOrdering::SeqCst)
    }

    /// Makes the `nth` chunk write from now on (1-based) fail as if the
    /// connection dropped.
    pub fn fail_nth_write(&self, nth: usize) {
        let base = self.writes();
        self.stats.fail_write_at.store(base + nth, AtomicOrdering::SeqCst);
    }

    /// Makes the `nth` chunk write from now on apply its changes and then
    /// never return, leaving its transaction open until the caller gives up.
    pub fn stall_nth_write(&self, nth: usize) {
        let base = self.writes();
        self.stats.stall_write_at.store(base + nth, AtomicOrdering::SeqCst);
    }

    /// Cancels `token` right after the `nth` `event` from now on (1-based)
    /// has completed.
    pub async fn cancel_after(&self, event: StoreEvent, nth: usize, token: CancellationToken) {
        let at = self.stats.count(event) + nth;
        self.stats.cancellations.lock().await.push((event, at, token));
    }
}

#[async_trait]
impl BulkStore for MemoryStore {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        self.stats.connections.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            transaction: None,
        })
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }
}

struct OpenTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    snapshot: MemoryState,
}

pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    stats: Arc<MemoryStats>,
    transaction: Option<OpenTransaction>,
}

impl MemoryConnection {
    /// Runs one statement against `table`. The statement sees a copy of the
    /// table that only replaces the stored one when it succeeds.
    async fn statement<T, F>(&mut self, table: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut MemoryTable) -> Result<T, StoreError> + Send,
    {
        self.stats.queries.fetch_add(1, AtomicOrdering::SeqCst);

        let missing = || StoreError::SchemaMismatch(format!("relation \"{}\" does not exist", table));

        match self.transaction.as_mut() {
            Some(open) => {
                let current = open.guard.tables.get(table).ok_or_else(missing)?;
                let mut working = current.clone();
                let result = f(&mut working)?;
                open.guard.tables.insert(table.to_string(), working);
                Ok(result)
            }
            None => {
                let mut state = self.state.lock().await;
                let current = state.tables.get(table).ok_or_else(missing)?;
                let mut working = current.clone();
                let result = f(&mut working)?;
                state.tables.insert(table.to_string(), working);
                Ok(result)
            }
        }
    }
}

impl Drop for MemoryConnection {
    // a connection that goes away mid-transaction rolls back
    fn drop(&mut self) {
        if let Some(mut open) = self.transaction.take() {
            *open.guard = std::mem::take(&mut open.snapshot);
        }
    }
}

#[async_trait]
impl BulkConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.transaction.is_some() {
            return Err(StoreError::SchemaMismatch("transaction already in progress".to_string()));
        }
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        self.transaction = Some(OpenTransaction { guard, snapshot });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.transaction.take().is_some() {
            let commit = self.stats.commits.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.stats.reached(StoreEvent::Commit, commit).await;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(mut open) = self.transaction.take() {
            debug!("Rolling back memory transaction");
            *open.guard = std::mem::take(&mut open.snapshot);
        }
        Ok(())
    }

    async fn write_chunk(
        &mut self,
        table: &TableSchema,
        plan: &BatchPlan,
        chunk: &Chunk,
    ) -> Result<ChunkOutcome, StoreError> {
        let write = self.stats.writes.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        if self.stats.fail_write_at.load(AtomicOrdering::SeqCst) == write {
            self.stats.queries.fetch_add(1, AtomicOrdering::SeqCst);
            return Err(StoreError::Unavailable(format!(
                "connection closed while writing chunk {}",
                chunk.index
            )));
        }

        let outcome = self.statement(&table.name, |stored| apply_chunk(stored, plan, chunk)).await?;
        self.stats.reached(StoreEvent::Write, write).await;

        if self.stats.stall_write_at.load(AtomicOrdering::SeqCst) == write {
            debug!("Stalling chunk {} write", chunk.index);
            std::future::pending::<()>().await;
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
        let keep: HashSet<&Vec<SqlValue>> = keys.iter().collect();

        self.statement(&table.name, |stored| {
            stored.check_columns(merge_key.iter().map(String::as_str))?;

            let doomed: Vec<SqlValue> = stored
                .rows
                .iter()
                .filter(|(_, row)| scope.is_none_or(|p| matches(p, row)))
                .filter(|(_, row)| {
                    MemoryTable::key_tuple(row, merge_key).is_none_or(|tuple| !keep.contains(&tuple))
                })
                .map(|(key, _)| key.clone())
                .collect();

            for key in &doomed {
                stored.rows.remove(key);
            }
            Ok(doomed.len() as u64)
        })
        .await
    }

    async fn update_where(
        &mut self,
        table: &TableSchema,
        predicate: &Predicate,
        mutation: &Mutation,
    ) -> Result<u64, StoreError> {
        self.statement(&table.name, |stored| {
            stored.check_columns(predicate.columns())?;

            let mut affected = 0;
            let keys: Vec<SqlValue> =
                stored.rows.iter().filter(|(_, row)| matches(predicate, row)).map(|(k, _)| k.clone()).collect();

            for key in keys {
                let Some(row) = stored.rows.get(&key) else { continue };
                let updated = apply_mutation(mutation, row, &stored.schema).map_err(evaluation_error)?;
                stored.check_not_null(&updated)?;
                stored.rows.insert(key, updated);
                affected += 1;
            }
            Ok(affected)
        })
        .await
    }

    async fn delete_where(&mut self, table: &TableSchema, predicate: &Predicate) -> Result<u64, StoreError> {
        self.statement(&table.name, |stored| {
            stored.check_columns(predicate.columns())?;

            let before = stored.rows.len();
            stored.rows.retain(|_, row| !matches(predicate, row));
            Ok((before - stored.rows.len()) as u64)
        })
        .await
    }

    async fn select_in(
        &mut self,
        table: &TableSchema,
        key_columns: &[String],
        keys: &[Vec<SqlValue>],
        order_by: Option<&str>,
    ) -> Result<Vec<Row>, StoreError> {
        let wanted: HashSet<&Vec<SqlValue>> = keys.iter().collect();

        self.statement(&table.name, |stored| {
            stored.check_columns(key_columns.iter().map(String::as_str))?;
            stored.check_columns(order_by)?;

            let mut rows: Vec<Row> = stored
                .rows
                .values()
                .filter(|row| {
                    MemoryTable::key_tuple(row, key_columns).is_some_and(|tuple| wanted.contains(&tuple))
                })
                .cloned()
                .collect();

            if let Some(column) = order_by {
                rows.sort_by(|a, b| compare_nulls_last(a.value(column), b.value(column)));
            }
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        operation::OperationDescriptor, planner::plan, predicate::col, value::SqlType,
    };

    fn users() -> TableSchema {
        TableSchema::new("users", "id")
            .column("code", SqlType::Text)
            .nullable_column("name", SqlType::Text)
            .merge_key(["code"])
    }

    async fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_table(&users()).await;
        store
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_keys() {
        let store = store().await;
        let records = vec![Row::new().with("code", "a"), Row::new().with("code", "b")];
        let plan = plan(&records, &users(), &OperationDescriptor::insert(), 10).unwrap();

        let mut conn = store.connect().await.unwrap();
        let outcome = conn.write_chunk(&users(), &plan, &plan.chunks[0]).await.unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.generated_keys, vec![(0, 1), (1, 2)]);
        assert_eq!(store.rows("users").await[1].value("id"), Some(&SqlValue::BigInt(2)));
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let store = store().await;
        let records = vec![Row::new().with("code", "a")];
        let plan = plan(&records, &users(), &OperationDescriptor::insert(), 10).unwrap();

        let mut conn = store.connect().await.unwrap();
        conn.begin().await.unwrap();
        conn.write_chunk(&users(), &plan, &plan.chunks[0]).await.unwrap();
        conn.rollback().await.unwrap();

        assert!(store.rows("users").await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_statement_leaves_table_untouched() {
        let table = users().with_supplied_key();
        let store = MemoryStore::new();
        store.create_table(&table).await;
        let records = vec![Row::new().with("id", 1i64).with("code", "a"), Row::new().with("id", 1i64).with("code", "b")];
        let descriptor = OperationDescriptor::insert();
        let plan = plan(&records, &table, &descriptor, 10).unwrap();

        let mut conn = store.connect().await.unwrap();
        let err = conn.write_chunk(&table, &plan, &plan.chunks[0]).await.unwrap_err();

        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        assert!(store.rows("users").await.is_empty());
    }

    #[tokio::test]
    async fn test_not_null_is_enforced() {
        let store = store().await;
        let records = vec![Row::new().with("code", SqlValue::Null)];
        let plan = plan(&records, &users(), &OperationDescriptor::insert(), 10).unwrap();

        let mut conn = store.connect().await.unwrap();
        let err = conn.write_chunk(&users(), &plan, &plan.chunks[0]).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();
        let err = conn.delete_where(&users(), &col("code").eq("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = store().await;
        let records = vec![Row::new().with("code", "a")];
        let plan = plan(&records, &users(), &OperationDescriptor::insert(), 10).unwrap();
        store.fail_nth_write(1);

        let mut conn = store.connect().await.unwrap();
        let err = conn.write_chunk(&users(), &plan, &plan.chunks[0]).await.unwrap_err();

        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(conn.write_chunk(&users(), &plan, &plan.chunks[0]).await.is_ok());
    }
}
