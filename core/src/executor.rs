//! Runs a [`BatchPlan`] against a store.
//!
//! How far a transaction reaches is decided by [`BulkConfig`]: every chunk on
//! its own, one transaction for the whole batch, or plain autocommit.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    config::BulkConfig,
    database::{BulkConnection, BulkStore, ChunkOutcome},
    error::{BulkError, StoreError},
    operation::{BulkSummary, OperationKind},
    planner::{BatchPlan, Chunk},
    predicate::Predicate,
    schema::TableSchema,
};

async fn rollback<C: BulkConnection>(conn: &mut C, operation: OperationKind, chunk: Option<usize>) {
    match chunk {
        Some(chunk) => warn!("Rolling back {} chunk {}", operation, chunk),
        None => warn!("Rolling back {}", operation),
    }
    if let Err(e) = conn.rollback().await {
        error!("Rollback of {} failed: {}", operation, e);
    }
}

pub(crate) struct Executor<'a, S: BulkStore> {
    store: &'a S,
    table: &'a TableSchema,
    plan: &'a BatchPlan,
    config: &'a BulkConfig,
    cancel: &'a CancellationToken,
}

impl<'a, S: BulkStore> Executor<'a, S> {
    pub(crate) fn new(
        store: &'a S,
        table: &'a TableSchema,
        plan: &'a BatchPlan,
        config: &'a BulkConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Executor { store, table, plan, config, cancel }
    }

    fn operation(&self) -> OperationKind {
        self.plan.operation
    }

    fn store_error(&self, chunk: Option<usize>, error: StoreError) -> BulkError {
        error!("{} on {} failed: {}", self.operation(), self.table.name, error);
        BulkError::from_store(self.operation(), chunk, error)
    }

    fn cancelled(&self, chunk: Option<usize>) -> Result<(), BulkError> {
        if self.cancel.is_cancelled() {
            return Err(BulkError::Cancelled { operation: self.operation(), chunk });
        }
        Ok(())
    }

    /// Executes every chunk and hands each generated key to `write_back` once
    /// the transaction that produced it has committed.
    pub(crate) async fn run<F>(
        &self,
        scope: Option<&Predicate>,
        mut write_back: F,
    ) -> Result<BulkSummary, BulkError>
    where
        F: FnMut(usize, i64) + Send,
    {
        let started = Instant::now();

        let totals = if self.config.spans_batch() {
            let totals = self.run_in_one_transaction(scope).await?;
            for &(ordinal, key) in &totals.generated_keys {
                write_back(ordinal, key);
            }
            totals
        } else {
            let mut totals = self.run_chunks(&mut write_back).await?;
            if self.operation() == OperationKind::Synchronize {
                totals.deleted += self.delete_missing(scope).await?;
            }
            totals
        };

        Ok(BulkSummary::new(
            self.operation(),
            totals.inserted,
            totals.updated,
            totals.deleted,
            self.plan.chunks.len(),
            totals.missing,
            started.elapsed(),
        ))
    }

    /// Writes one chunk on `conn`, failing when an atomic write left Update
    /// records unmatched.
    async fn write_checked(
        &self,
        conn: &mut S::Connection,
        chunk: &Chunk,
    ) -> Result<ChunkOutcome, BulkError> {
        debug!(
            "{} chunk {} of {} ({} rows) on {}",
            self.operation(),
            chunk.index + 1,
            self.plan.chunks.len(),
            chunk.len(),
            self.table.name
        );

        let outcome = conn
            .write_chunk(self.table, self.plan, chunk)
            .await
            .map_err(|e| self.store_error(Some(chunk.index), e))?;

        if self.config.chunk_atomic() && !outcome.missing.is_empty() {
            return Err(BulkError::NotFound {
                operation: self.operation(),
                chunk: chunk.index,
                records: outcome.missing,
            });
        }

        Ok(outcome)
    }

    /// One chunk on its own connection, inside its own transaction unless the
    /// config asks for autocommit.
    async fn run_chunk(&self, chunk: &Chunk) -> Result<ChunkOutcome, BulkError> {
        let at = Some(chunk.index);
        self.cancelled(at)?;

        let mut conn = self.store.connect().await.map_err(|e| self.store_error(at, e))?;

        if !self.config.chunk_atomic() {
            return self.write_checked(&mut conn, chunk).await;
        }

        conn.begin().await.map_err(|e| self.store_error(at, e))?;

        let written = match self.write_checked(&mut conn, chunk).await {
            Ok(outcome) => self.cancelled(at).map(|_| outcome),
            Err(e) => Err(e),
        };

        match written {
            Ok(outcome) => {
                conn.commit().await.map_err(|e| self.store_error(at, e))?;
                Ok(outcome)
            }
            Err(e) => {
                rollback(&mut conn, self.operation(), at).await;
                Err(e)
            }
        }
    }

    /// Drives chunks through at most `max_parallel_chunks` connections. After
    /// the first failure no further chunk starts, chunks already running are
    /// drained and the first failure is returned.
    async fn run_chunks<F>(&self, write_back: &mut F) -> Result<ChunkOutcome, BulkError>
    where
        F: FnMut(usize, i64) + Send,
    {
        let halted = AtomicBool::new(false);
        let halted = &halted;

        let mut results = stream::iter(&self.plan.chunks)
            .map(|chunk| async move {
                if halted.load(Ordering::SeqCst) {
                    return None;
                }
                Some(self.run_chunk(chunk).await)
            })
            .buffer_unordered(self.config.max_parallel_chunks());

        let mut totals = ChunkOutcome::default();
        let mut failure = None;

        while let Some(result) = results.next().await {
            match result {
                Some(Ok(outcome)) => {
                    for &(ordinal, key) in &outcome.generated_keys {
                        write_back(ordinal, key);
                    }
                    totals.absorb(outcome);
                }
                Some(Err(e)) => {
                    halted.store(true, Ordering::SeqCst);
                    match failure {
                        None => failure = Some(e),
                        Some(_) => debug!("Further chunk failure while draining: {}", e),
                    }
                }
                None => {}
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(totals),
        }
    }

    async fn delete_missing(&self, scope: Option<&Predicate>) -> Result<u64, BulkError> {
        self.cancelled(None)?;

        let mut conn = self.store.connect().await.map_err(|e| self.store_error(None, e))?;
        let deleted = conn
            .delete_missing(self.table, &self.plan.merge_key, &self.plan.batch_keys, scope)
            .await
            .map_err(|e| self.store_error(None, e))?;

        self.log_deleted(deleted);
        Ok(deleted)
    }

    fn log_deleted(&self, deleted: u64) {
        if deleted > 0 {
            warn!(
                "synchronize removed {} rows from {} whose merge key was not in the batch",
                deleted, self.table.name
            );
        }
    }

    async fn run_in_one_transaction(
        &self,
        scope: Option<&Predicate>,
    ) -> Result<ChunkOutcome, BulkError> {
        self.cancelled(self.plan.chunks.first().map(|c| c.index))?;

        let mut conn = self.store.connect().await.map_err(|e| self.store_error(None, e))?;
        conn.begin().await.map_err(|e| self.store_error(None, e))?;

        let written = match self.write_all(&mut conn, scope).await {
            Ok(totals) => self.cancelled(None).map(|_| totals),
            Err(e) => Err(e),
        };

        match written {
            Ok(totals) => {
                conn.commit().await.map_err(|e| self.store_error(None, e))?;
                if self.operation() == OperationKind::Synchronize {
                    self.log_deleted(totals.deleted);
                }
                Ok(totals)
            }
            Err(e) => {
                rollback(&mut conn, self.operation(), None).await;
                Err(e)
            }
        }
    }

    async fn write_all(
        &self,
        conn: &mut S::Connection,
        scope: Option<&Predicate>,
    ) -> Result<ChunkOutcome, BulkError> {
        let mut totals = ChunkOutcome::default();

        for chunk in &self.plan.chunks {
            self.cancelled(Some(chunk.index))?;
            totals.absorb(self.write_checked(conn, chunk).await?);
        }

        if self.operation() == OperationKind::Synchronize {
            totals.deleted += conn
                .delete_missing(self.table, &self.plan.merge_key, &self.plan.batch_keys, scope)
                .await
                .map_err(|e| self.store_error(None, e))?;
        }

        Ok(totals)
    }
}
