//! The boundary between the engine and a backing store.
//!
//! A store hands out connections; everything that touches rows happens on a
//! connection so one operation, or one chunk of it, owns its session for as
//! long as its transaction is open.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::{
    error::StoreError,
    planner::{BatchPlan, Chunk},
    predicate::{Mutation, Predicate},
    record::Row,
    schema::TableSchema,
    value::SqlValue,
};

/// What one chunk write did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    /// `(record ordinal, primary key)` for every row the store assigned or matched a key for.
    pub generated_keys: Vec<(usize, i64)>,
    /// Ordinals of Update records that matched no stored row.
    pub missing: Vec<usize>,
}

impl ChunkOutcome {
    pub fn rows_affected(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }

    /// Folds the outcome of another chunk into this one.
    pub fn absorb(&mut self, other: ChunkOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.generated_keys.extend(other.generated_keys);
        self.missing.extend(other.missing);
    }
}

#[async_trait]
pub trait BulkStore: Send + Sync + 'static {
    type Connection: BulkConnection + 'static;

    /// Checks out a connection for exclusive use.
    async fn connect(&self) -> Result<Self::Connection, StoreError>;

    /// Upper bound on connections handed out at once.
    fn max_connections(&self) -> usize;
}

#[async_trait]
pub trait BulkConnection: Send {
    async fn begin(&mut self) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Applies one planned chunk with a set-based statement.
    async fn write_chunk(
        &mut self,
        table: &TableSchema,
        plan: &BatchPlan,
        chunk: &Chunk,
    ) -> Result<ChunkOutcome, StoreError>;

    /// Deletes every row within `scope` whose `merge_key` is not among `keys`.
    async fn delete_missing(
        &mut self,
        table: &TableSchema,
        merge_key: &[String],
        keys: &[Vec<SqlValue>],
        scope: Option<&Predicate>,
    ) -> Result<u64, StoreError>;

    async fn update_where(
        &mut self,
        table: &TableSchema,
        predicate: &Predicate,
        mutation: &Mutation,
    ) -> Result<u64, StoreError>;

    async fn delete_where(&mut self, table: &TableSchema, predicate: &Predicate) -> Result<u64, StoreError>;

    /// Rows whose `key_columns` tuple is one of `keys`.
    async fn select_in(
        &mut self,
        table: &TableSchema,
        key_columns: &[String],
        keys: &[Vec<SqlValue>],
        order_by: Option<&str>,
    ) -> Result<Vec<Row>, StoreError>;
}
