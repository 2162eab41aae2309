use std::{sync::Arc, time::Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::{BulkConfig, ConfigError},
    containment::{Containment, RowStream},
    database::{BulkConnection, BulkStore},
    error::BulkError,
    executor::Executor,
    helpers::format_duration,
    operation::{BulkSummary, OperationDescriptor, OperationKind},
    planner::plan,
    predicate::{resolve_mutation, resolve_predicate, Mutation, Predicate},
    record::Record,
    schema::TableSchema,
    value::SqlValue,
};

/// Entry point for bulk writes, predicate writes and containment reads.
///
/// Holds no connection of its own: every call checks connections out of the
/// store for as long as it needs them.
pub struct BulkEngine<S: BulkStore> {
    store: Arc<S>,
    config: BulkConfig,
}

impl<S: BulkStore> Clone for BulkEngine<S> {
    fn clone(&self) -> Self {
        BulkEngine { store: Arc::clone(&self.store), config: self.config.clone() }
    }
}

fn check_pool<S: BulkStore>(
    store: &S,
    config: &BulkConfig,
    operation: Option<OperationKind>,
) -> Result<(), BulkError> {
    let pool = store.max_connections();
    if config.max_parallel_chunks() > pool {
        return Err(BulkError::invalid_config(
            operation,
            ConfigError::ParallelismExceedsPool { parallel: config.max_parallel_chunks(), pool },
        ));
    }
    Ok(())
}

impl<S: BulkStore> BulkEngine<S> {
    pub fn new(store: S, config: BulkConfig) -> Result<Self, BulkError> {
        Self::shared(Arc::new(store), config)
    }

    pub fn shared(store: Arc<S>, config: BulkConfig) -> Result<Self, BulkError> {
        check_pool(store.as_ref(), &config, None)?;
        Ok(BulkEngine { store, config })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Runs `descriptor` over `records` with the engine's configuration.
    pub async fn execute<R: Record>(
        &self,
        table: &TableSchema,
        descriptor: &OperationDescriptor,
        records: &mut [R],
    ) -> Result<BulkSummary, BulkError> {
        self.execute_with(table, descriptor, records, &self.config, &CancellationToken::new()).await
    }

    /// Runs `descriptor` over `records` with per-call options.
    ///
    /// Generated keys are written back onto `records` once the transaction
    /// that produced them has committed, so on failure records from committed
    /// chunks carry keys and the rest do not.
    pub async fn execute_with<R: Record>(
        &self,
        table: &TableSchema,
        descriptor: &OperationDescriptor,
        records: &mut [R],
        config: &BulkConfig,
        cancel: &CancellationToken,
    ) -> Result<BulkSummary, BulkError> {
        let operation = descriptor.kind();
        check_pool(self.store.as_ref(), config, Some(operation))?;

        let plan = plan(records, table, descriptor, config.chunk_size())?;
        let scope = descriptor
            .synchronize_scope()
            .map(|scope| resolve_predicate(scope, table))
            .transpose()
            .map_err(|e| BulkError::from_predicate(operation, e))?;

        debug!(
            "{} of {} records into {} planned as {} chunks",
            operation,
            records.len(),
            table.name,
            plan.chunks.len()
        );

        let primary_key = table.primary_key.as_str();
        let summary = Executor::new(self.store.as_ref(), table, &plan, config, cancel)
            .run(scope.as_ref(), |ordinal, key| {
                if let Some(record) = records.get_mut(ordinal) {
                    record.set_generated_key(primary_key, key);
                }
            })
            .await?;

        info!("{} on {} - {}", operation, table.name, summary);
        Ok(summary)
    }

    /// Applies `mutation` to every stored row matching `predicate` in one statement.
    pub async fn update_where(
        &self,
        table: &TableSchema,
        predicate: &Predicate,
        mutation: &Mutation,
    ) -> Result<u64, BulkError> {
        let operation = OperationKind::UpdateWhere;
        table.validate().map_err(|e| BulkError::schema_mismatch(operation, None, e.to_string()))?;

        let predicate =
            resolve_predicate(predicate, table).map_err(|e| BulkError::from_predicate(operation, e))?;
        let mutation =
            resolve_mutation(mutation, table).map_err(|e| BulkError::from_predicate(operation, e))?;

        let started = Instant::now();
        let mut conn =
            self.store.connect().await.map_err(|e| BulkError::from_store(operation, None, e))?;
        let affected = conn
            .update_where(table, &predicate, &mutation)
            .await
            .map_err(|e| BulkError::from_store(operation, None, e))?;

        info!(
            "{} on {} - affected {} rows - took {}",
            operation,
            table.name,
            affected,
            format_duration(started.elapsed())
        );
        Ok(affected)
    }

    /// Deletes every stored row matching `predicate` in one statement.
    pub async fn delete_where(&self, table: &TableSchema, predicate: &Predicate) -> Result<u64, BulkError> {
        let operation = OperationKind::DeleteWhere;
        table.validate().map_err(|e| BulkError::schema_mismatch(operation, None, e.to_string()))?;

        let predicate =
            resolve_predicate(predicate, table).map_err(|e| BulkError::from_predicate(operation, e))?;

        let started = Instant::now();
        let mut conn =
            self.store.connect().await.map_err(|e| BulkError::from_store(operation, None, e))?;
        let affected = conn
            .delete_where(table, &predicate)
            .await
            .map_err(|e| BulkError::from_store(operation, None, e))?;

        info!(
            "{} on {} - affected {} rows - took {}",
            operation,
            table.name,
            affected,
            format_duration(started.elapsed())
        );
        Ok(affected)
    }

    /// Rows of `table` whose `column` is one of `values`.
    ///
    /// Nothing is queried until the stream is polled, and an empty `values`
    /// never queries at all.
    pub fn where_in<I, V>(
        &self,
        table: &TableSchema,
        column: &str,
        values: I,
        order_by: Option<&str>,
    ) -> Result<RowStream, BulkError>
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        let keys = values.into_iter().map(|v| vec![v.into()]).collect();
        self.where_in_tuples(table, &[column], keys, order_by)
    }

    /// Rows of `table` whose `columns` tuple is one of `keys`.
    pub fn where_in_tuples(
        &self,
        table: &TableSchema,
        columns: &[&str],
        keys: Vec<Vec<SqlValue>>,
        order_by: Option<&str>,
    ) -> Result<RowStream, BulkError> {
        let containment = Containment::prepare(
            table,
            columns.iter().map(|c| c.to_string()).collect(),
            keys,
            order_by,
            self.config.max_parameters(),
        )?;

        debug!(
            "{} on {} prepared as {} queries",
            OperationKind::WhereIn,
            table.name,
            containment.query_count()
        );

        Ok(containment.into_stream(Arc::clone(&self.store)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{DateTime, Duration, Utc};
    use futures::TryStreamExt;

    use super::*;
    use crate::{
        config::TransactionScope,
        database::memory::{MemoryStore, StoreEvent},
        predicate::col,
        record::Row,
        value::SqlType,
    };

    fn customers() -> TableSchema {
        TableSchema::new("customers", "id")
            .column("code", SqlType::Bigint)
            .nullable_column("name", SqlType::Text)
            .nullable_column("team", SqlType::Integer)
            .merge_key(["code"])
    }

    fn customer(code: i64, name: &str) -> Row {
        Row::new().with("code", code).with("name", name)
    }

    async fn engine_with(config: BulkConfig) -> (BulkEngine<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        store.create_table(&customers()).await;
        (BulkEngine::new(store.clone(), config).unwrap(), store)
    }

    async fn engine() -> (BulkEngine<MemoryStore>, MemoryStore) {
        engine_with(BulkConfig::default()).await
    }

    async fn stored(store: &MemoryStore) -> Vec<(i64, Option<String>)> {
        store
            .rows("customers")
            .await
            .iter()
            .map(|row| {
                let code = row.value("code").and_then(SqlValue::as_i64).unwrap();
                let name = match row.value("name") {
                    Some(SqlValue::Text(name)) => Some(name.clone()),
                    _ => None,
                };
                (code, name)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_insert_1500_records_in_two_chunks() {
        let (engine, store) = engine().await;
        let mut records: Vec<Row> = (0..1500).map(|i| customer(i, "x")).collect();

        let summary = engine.execute(&customers(), &OperationDescriptor::insert(), &mut records).await.unwrap();

        assert_eq!(summary.rows_affected(), 1500);
        assert_eq!(summary.inserted(), 1500);
        assert_eq!(summary.chunks(), 2);
        assert_eq!(store.writes(), 2);

        let keys: BTreeSet<i64> =
            records.iter().map(|r| r.value("id").and_then(SqlValue::as_i64).unwrap()).collect();
        assert_eq!(keys.len(), 1500);
        assert_eq!(records[0].value("id"), Some(&SqlValue::BigInt(1)));
        assert_eq!(records[1499].value("id"), Some(&SqlValue::BigInt(1500)));
    }

    #[tokio::test]
    async fn test_merge_updates_and_inserts() {
        let (engine, store) = engine().await;
        engine
            .execute(&customers(), &OperationDescriptor::insert(), &mut [customer(1, "old")])
            .await
            .unwrap();

        let mut records = vec![customer(1, "x"), customer(2, "y")];
        let summary = engine.execute(&customers(), &OperationDescriptor::merge(), &mut records).await.unwrap();

        assert_eq!(summary.rows_affected(), 2);
        assert_eq!(summary.updated(), 1);
        assert_eq!(summary.inserted(), 1);
        assert_eq!(stored(&store).await, vec![(1, Some("x".to_string())), (2, Some("y".to_string()))]);
        // the matched record receives the key of the row it merged into
        assert_eq!(records[0].value("id"), Some(&SqlValue::BigInt(1)));
        assert_eq!(records[1].value("id"), Some(&SqlValue::BigInt(2)));
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let (engine, store) = engine().await;
        let batch: Vec<Row> = (0..25).map(|i| customer(i, &format!("name-{}", i))).collect();

        engine.execute(&customers(), &OperationDescriptor::merge(), &mut batch.clone()).await.unwrap();
        let first = store.rows("customers").await;

        engine.execute(&customers(), &OperationDescriptor::merge(), &mut batch.clone()).await.unwrap();
        assert_eq!(store.rows("customers").await, first);
    }

    #[tokio::test]
    async fn test_merge_without_update_columns_only_inserts() {
        let (engine, store) = engine().await;
        engine
            .execute(&customers(), &OperationDescriptor::insert(), &mut [customer(1, "old")])
            .await
            .unwrap();

        let descriptor = OperationDescriptor::merge().with_update_columns(Vec::<String>::new());
        let summary = engine
            .execute(&customers(), &descriptor, &mut [customer(1, "new"), customer(2, "y")])
            .await
            .unwrap();

        assert_eq!(summary.rows_affected(), 1);
        assert_eq!(stored(&store).await, vec![(1, Some("old".to_string())), (2, Some("y".to_string()))]);
    }

    #[tokio::test]
    async fn test_synchronize_leaves_exactly_the_batch() {
        let (engine, store) = engine().await;
        let mut seed: Vec<Row> = (1..=5).map(|i| customer(i, "seed")).collect();
        engine.execute(&customers(), &OperationDescriptor::insert(), &mut seed).await.unwrap();

        let mut batch = vec![customer(2, "b"), customer(3, "c"), customer(6, "f")];
        let summary =
            engine.execute(&customers(), &OperationDescriptor::synchronize(), &mut batch).await.unwrap();

        assert_eq!(summary.updated(), 2);
        assert_eq!(summary.inserted(), 1);
        assert_eq!(summary.deleted(), 3);
        let codes: Vec<i64> = stored(&store).await.into_iter().map(|(code, _)| code).collect();
        assert_eq!(codes, vec![2, 3, 6]);
    }

    #[tokio::test]
    async fn test_synchronize_only_deletes_within_scope() {
        let (engine, store) = engine().await;
        let mut seed = vec![
            customer(1, "a").with("team", 1),
            customer(2, "b").with("team", 1),
            customer(3, "c").with("team", 2),
        ];
        engine.execute(&customers(), &OperationDescriptor::insert(), &mut seed).await.unwrap();

        let descriptor = OperationDescriptor::synchronize().with_scope(col("team").eq(1));
        let summary = engine
            .execute(&customers(), &descriptor, &mut [customer(1, "a").with("team", 1)])
            .await
            .unwrap();

        assert_eq!(summary.deleted(), 1);
        let codes: Vec<i64> = stored(&store).await.into_iter().map(|(code, _)| code).collect();
        assert_eq!(codes, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_merge_key_fails_before_any_io() {
        let (engine, store) = engine().await;
        let mut records = vec![customer(1, "a"), customer(1, "b")];

        let err = engine.execute(&customers(), &OperationDescriptor::merge(), &mut records).await.unwrap_err();

        assert!(matches!(err, BulkError::DuplicateKey { first: 0, second: 1, chunk: 0, .. }));
        assert_eq!(store.connections(), 0);
        assert_eq!(store.queries(), 0);
    }

    #[tokio::test]
    async fn test_update_missing_row_in_autocommit_is_recorded() {
        let config = BulkConfig::builder().use_transaction(false).build().unwrap();
        let (engine, store) = engine_with(config).await;
        let mut seed = vec![customer(1, "a")];
        engine.execute(&customers(), &OperationDescriptor::insert(), &mut seed).await.unwrap();

        let mut updates = vec![customer(1, "renamed").with("id", 1i64), customer(2, "ghost").with("id", 99i64)];
        let summary = engine.execute(&customers(), &OperationDescriptor::update(), &mut updates).await.unwrap();

        assert_eq!(summary.updated(), 1);
        assert_eq!(summary.not_found(), &[1]);
        assert_eq!(stored(&store).await, vec![(1, Some("renamed".to_string()))]);
    }

    #[tokio::test]
    async fn test_update_missing_row_rolls_back_its_chunk() {
        let (engine, store) = engine().await;
        let mut seed = vec![customer(1, "a")];
        engine.execute(&customers(), &OperationDescriptor::insert(), &mut seed).await.unwrap();

        let mut updates = vec![customer(1, "renamed").with("id", 1i64), customer(2, "ghost").with("id", 99i64)];
        let err = engine.execute(&customers(), &OperationDescriptor::update(), &mut updates).await.unwrap_err();

        assert!(matches!(err, BulkError::NotFound { chunk: 0, ref records, .. } if records == &[1]));
        assert_eq!(stored(&store).await, vec![(1, Some("a".to_string()))]);
    }

    #[tokio::test]
    async fn test_delete_skips_absent_rows() {
        let (engine, store) = engine().await;
        let mut seed = vec![customer(1, "a"), customer(2, "b")];
        engine.execute(&customers(), &OperationDescriptor::insert(), &mut seed).await.unwrap();

        let mut deletes = vec![Row::new().with("id", 1i64), Row::new().with("id", 1i64), Row::new().with("id", 42i64)];
        let summary = engine.execute(&customers(), &OperationDescriptor::delete(), &mut deletes).await.unwrap();

        assert_eq!(summary.deleted(), 1);
        assert_eq!(stored(&store).await, vec![(2, Some("b".to_string()))]);
    }

    #[tokio::test]
    async fn test_failed_chunk_keeps_earlier_commits() {
        let config = BulkConfig::builder().chunk_size(10).build().unwrap();
        let (engine, store) = engine_with(config).await;
        let mut records: Vec<Row> = (0..30).map(|i| customer(i, "x")).collect();
        store.fail_nth_write(2);

        let err = engine.execute(&customers(), &OperationDescriptor::insert(), &mut records).await.unwrap_err();

        assert!(matches!(err, BulkError::StoreUnavailable { chunk: Some(1), .. }));
        assert!(err.is_retryable());
        assert_eq!(store.rows("customers").await.len(), 10);
        // the third chunk never started
        assert_eq!(store.writes(), 2);
        assert!(records[..10].iter().all(|r| r.value("id").is_some()));
        assert!(records[10..].iter().all(|r| r.value("id").is_none()));
    }

    #[tokio::test]
    async fn test_batch_scope_rolls_back_everything() {
        let config = BulkConfig::builder()
            .chunk_size(10)
            .transaction_scope(TransactionScope::Batch)
            .build()
            .unwrap();
        let (engine, store) = engine_with(config).await;
        let mut records: Vec<Row> = (0..30).map(|i| customer(i, "x")).collect();
        store.fail_nth_write(3);

        let err = engine.execute(&customers(), &OperationDescriptor::insert(), &mut records).await.unwrap_err();

        assert!(matches!(err, BulkError::StoreUnavailable { chunk: Some(2), .. }));
        assert!(store.rows("customers").await.is_empty());
        assert!(records.iter().all(|r| r.value("id").is_none()));
    }

    #[tokio::test]
    async fn test_batch_scope_writes_keys_after_commit() {
        let config = BulkConfig::builder()
            .chunk_size(10)
            .transaction_scope(TransactionScope::Batch)
            .build()
            .unwrap();
        let (engine, store) = engine_with(config).await;
        let mut records: Vec<Row> = (0..25).map(|i| customer(i, "x")).collect();

        let summary = engine.execute(&customers(), &OperationDescriptor::insert(), &mut records).await.unwrap();

        assert_eq!(summary.chunks(), 3);
        assert_eq!(store.connections(), 1);
        assert!(records.iter().all(|r| r.value("id").is_some()));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_chunk() {
        let (engine, store) = engine().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .execute_with(
                &customers(),
                &OperationDescriptor::insert(),
                &mut [customer(1, "a")],
                &BulkConfig::default(),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BulkError::Cancelled { chunk: Some(0), .. }));
        assert_eq!(store.connections(), 0);
        assert!(store.rows("customers").await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_a_commit_keeps_that_chunk() {
        let config = BulkConfig::builder().chunk_size(2).build().unwrap();
        let (engine, store) = engine_with(config.clone()).await;
        let mut records: Vec<Row> = (0..5).map(|i| customer(i, "x")).collect();
        let cancel = CancellationToken::new();
        store.cancel_after(StoreEvent::Commit, 1, cancel.clone()).await;

        let err = engine
            .execute_with(&customers(), &OperationDescriptor::insert(), &mut records, &config, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BulkError::Cancelled { operation: OperationKind::Insert, chunk: Some(1) }));
        assert_eq!(stored(&store).await, vec![(0, Some("x".to_string())), (1, Some("x".to_string()))]);
        assert_eq!(store.writes(), 1);
        assert!(records[..2].iter().all(|r| r.value("id").is_some()));
        assert!(records[2..].iter().all(|r| r.value("id").is_none()));
    }

    #[tokio::test]
    async fn test_cancel_before_commit_rolls_back_that_chunk() {
        let config = BulkConfig::builder().chunk_size(2).build().unwrap();
        let (engine, store) = engine_with(config.clone()).await;
        let mut records: Vec<Row> = (0..5).map(|i| customer(i, "x")).collect();
        let cancel = CancellationToken::new();
        // the second chunk is written, then cancelled before it commits
        store.cancel_after(StoreEvent::Write, 2, cancel.clone()).await;

        let err = engine
            .execute_with(&customers(), &OperationDescriptor::insert(), &mut records, &config, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BulkError::Cancelled { chunk: Some(1), .. }));
        assert_eq!(store.writes(), 2);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.rows("customers").await.len(), 2);
        assert!(records[..2].iter().all(|r| r.value("id").is_some()));
        assert!(records[2..].iter().all(|r| r.value("id").is_none()));
    }

    #[tokio::test]
    async fn test_dropped_execute_rolls_back_its_open_chunk() {
        let config = BulkConfig::builder().chunk_size(2).build().unwrap();
        let (engine, store) = engine_with(config).await;
        let mut records: Vec<Row> = (0..5).map(|i| customer(i, "x")).collect();
        store.stall_nth_write(2);

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            engine.execute(&customers(), &OperationDescriptor::insert(), &mut records),
        )
        .await;

        assert!(timed_out.is_err());
        assert_eq!(store.rows("customers").await.len(), 2);

        // the connection left behind holds no lock and no half-written chunk
        let summary = engine
            .execute(&customers(), &OperationDescriptor::insert(), &mut [customer(9, "y")])
            .await
            .unwrap();
        assert_eq!(summary.inserted(), 1);
        assert_eq!(
            stored(&store).await,
            vec![(0, Some("x".to_string())), (1, Some("x".to_string())), (9, Some("y".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_parallel_chunks_write_everything() {
        let config = BulkConfig::builder().chunk_size(10).max_parallel_chunks(4).build().unwrap();
        let (engine, store) = engine_with(config).await;
        let mut records: Vec<Row> = (0..100).map(|i| customer(i, "x")).collect();

        let summary = engine.execute(&customers(), &OperationDescriptor::insert(), &mut records).await.unwrap();

        assert_eq!(summary.rows_affected(), 100);
        assert_eq!(summary.chunks(), 10);
        assert_eq!(store.rows("customers").await.len(), 100);
        let keys: BTreeSet<i64> =
            records.iter().map(|r| r.value("id").and_then(SqlValue::as_i64).unwrap()).collect();
        assert_eq!(keys.len(), 100);
    }

    #[tokio::test]
    async fn test_parallelism_beyond_pool_is_rejected() {
        let store = MemoryStore::new().with_max_connections(2);
        let config = BulkConfig::builder().max_parallel_chunks(4).build().unwrap();

        let err = BulkEngine::new(store, config).err().unwrap();

        assert!(matches!(
            err,
            BulkError::InvalidConfig {
                operation: None,
                source: ConfigError::ParallelismExceedsPool { parallel: 4, pool: 2 }
            }
        ));
    }

    fn accounts() -> TableSchema {
        TableSchema::new("accounts", "id")
            .column("is_active", SqlType::Bool)
            .column("last_login", SqlType::TimestampTz)
            .column("visits", SqlType::Integer)
    }

    fn account(active: bool, last_login: DateTime<Utc>) -> Row {
        Row::new().with("is_active", active).with("last_login", last_login).with("visits", 1)
    }

    #[tokio::test]
    async fn test_update_where_is_idempotent() {
        let store = MemoryStore::new();
        store.create_table(&accounts()).await;
        let engine = BulkEngine::new(store.clone(), BulkConfig::default()).unwrap();

        let cutoff = Utc::now() - Duration::days(30);
        let stale = cutoff - Duration::days(1);
        let fresh = cutoff + Duration::days(1);
        let mut seed: Vec<Row> = (0..10).map(|_| account(true, stale)).collect();
        seed.extend((0..5).map(|_| account(true, fresh)));
        seed.extend((0..3).map(|_| account(false, stale)));
        engine.execute(&accounts(), &OperationDescriptor::insert(), &mut seed).await.unwrap();

        let predicate = col("is_active").eq(true).and(col("last_login").lt(cutoff));
        let mutation = Mutation::new().set("is_active", false);

        assert_eq!(engine.update_where(&accounts(), &predicate, &mutation).await.unwrap(), 10);
        assert_eq!(engine.update_where(&accounts(), &predicate, &mutation).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_where_overflow_is_a_constraint_violation() {
        let store = MemoryStore::new();
        store.create_table(&accounts()).await;
        let engine = BulkEngine::new(store.clone(), BulkConfig::default()).unwrap();
        engine
            .execute(&accounts(), &OperationDescriptor::insert(), &mut [account(true, Utc::now())])
            .await
            .unwrap();

        let err = engine
            .update_where(&accounts(), &col("is_active").eq(true), &Mutation::new().add("visits", i32::MAX))
            .await
            .unwrap_err();

        assert!(matches!(err, BulkError::ConstraintViolation { operation: OperationKind::UpdateWhere, .. }));
        assert_eq!(store.rows("accounts").await[0].value("visits"), Some(&SqlValue::Int(1)));
    }

    #[tokio::test]
    async fn test_client_side_predicate_is_rejected_before_io() {
        let (engine, store) = engine().await;
        let predicate = Predicate::client_side("name looks odd", |row: &Row| row.value("name").is_some());

        let err = engine.delete_where(&customers(), &predicate).await.unwrap_err();

        assert!(matches!(err, BulkError::UnsupportedPredicate { operation: OperationKind::DeleteWhere, .. }));
        assert_eq!(store.connections(), 0);
    }

    #[tokio::test]
    async fn test_delete_where_twice() {
        let (engine, store) = engine().await;
        let mut seed: Vec<Row> = (0..6).map(|i| customer(i, if i % 2 == 0 { "even" } else { "odd" })).collect();
        engine.execute(&customers(), &OperationDescriptor::insert(), &mut seed).await.unwrap();

        let predicate = col("name").eq("odd");
        assert_eq!(engine.delete_where(&customers(), &predicate).await.unwrap(), 3);
        assert_eq!(engine.delete_where(&customers(), &predicate).await.unwrap(), 0);
        assert_eq!(store.rows("customers").await.len(), 3);
    }

    #[tokio::test]
    async fn test_where_in_with_no_keys_never_queries() {
        let (engine, store) = engine().await;

        let rows: Vec<Row> = engine
            .where_in(&customers(), "code", Vec::<i64>::new(), None)
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert!(rows.is_empty());
        assert_eq!(store.connections(), 0);
        assert_eq!(store.queries(), 0);
    }

    #[tokio::test]
    async fn test_where_in_spans_sub_batches() {
        let config = BulkConfig::builder().max_parameters(2).build().unwrap();
        let (engine, store) = engine_with(config).await;
        let mut seed: Vec<Row> = (0..10).map(|i| customer(i, &format!("n{}", 9 - i))).collect();
        engine.execute(&customers(), &OperationDescriptor::insert(), &mut seed).await.unwrap();
        let before = store.queries();

        let stream = engine.where_in(&customers(), "code", [7i64, 1, 3, 5, 3, 42], Some("name")).unwrap();
        // nothing runs until the stream is polled
        assert_eq!(store.queries(), before);

        let rows: Vec<Row> = stream.try_collect().await.unwrap();
        let codes: Vec<i64> = rows.iter().map(|r| r.value("code").and_then(SqlValue::as_i64).unwrap()).collect();

        assert_eq!(codes, vec![7, 5, 3, 1]);
        assert_eq!(store.queries() - before, 3);
    }

    #[tokio::test]
    async fn test_where_in_tuples() {
        let (engine, _store) = engine().await;
        let mut seed = vec![
            customer(1, "a").with("team", 1),
            customer(2, "a").with("team", 2),
            customer(3, "b").with("team", 1),
        ];
        engine.execute(&customers(), &OperationDescriptor::insert(), &mut seed).await.unwrap();

        let keys = vec![vec![SqlValue::from("a"), SqlValue::Int(2)], vec![SqlValue::from("b"), SqlValue::Int(1)]];
        let rows: Vec<Row> = engine
            .where_in_tuples(&customers(), &["name", "team"], keys, Some("code"))
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let codes: Vec<i64> = rows.iter().map(|r| r.value("code").and_then(SqlValue::as_i64).unwrap()).collect();
        assert_eq!(codes, vec![2, 3]);
    }
}
