use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{helpers::format_duration, predicate::Predicate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Merge,
    Synchronize,
    UpdateWhere,
    DeleteWhere,
    WhereIn,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Merge => "merge",
            OperationKind::Synchronize => "synchronize",
            OperationKind::UpdateWhere => "update_where",
            OperationKind::DeleteWhere => "delete_where",
            OperationKind::WhereIn => "where_in",
        }
    }

    /// Matches incoming records to stored rows by merge key.
    pub fn uses_merge_key(&self) -> bool {
        matches!(self, OperationKind::Merge | OperationKind::Synchronize)
    }

    /// Matches incoming records to stored rows by surrogate key.
    pub fn uses_surrogate_key(&self) -> bool {
        matches!(self, OperationKind::Update | OperationKind::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a batch execute should do with its records.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    kind: OperationKind,
    merge_key: Option<Vec<String>>,
    update_columns: Option<Vec<String>>,
    synchronize_scope: Option<Predicate>,
    return_generated_keys: bool,
}

impl OperationDescriptor {
    fn new(kind: OperationKind) -> Self {
        OperationDescriptor {
            kind,
            merge_key: None,
            update_columns: None,
            synchronize_scope: None,
            return_generated_keys: true,
        }
    }

    pub fn insert() -> Self {
        Self::new(OperationKind::Insert)
    }

    pub fn update() -> Self {
        Self::new(OperationKind::Update)
    }

    pub fn delete() -> Self {
        Self::new(OperationKind::Delete)
    }

    /// Upsert by the table's declared merge key.
    pub fn merge() -> Self {
        Self::new(OperationKind::Merge)
    }

    /// Upsert by an explicit merge key, overriding the table's.
    pub fn merge_on<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut descriptor = Self::new(OperationKind::Merge);
        descriptor.merge_key = Some(columns.into_iter().map(Into::into).collect());
        descriptor
    }

    /// Upsert, then delete every stored row whose merge key is not in the batch.
    pub fn synchronize() -> Self {
        Self::new(OperationKind::Synchronize)
    }

    pub fn synchronize_on<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut descriptor = Self::new(OperationKind::Synchronize);
        descriptor.merge_key = Some(columns.into_iter().map(Into::into).collect());
        descriptor
    }

    /// Columns overwritten when a record matches a stored row. An empty list
    /// turns Merge into insert-if-absent.
    pub fn with_update_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts the rows Synchronize may delete.
    pub fn with_scope(mut self, scope: Predicate) -> Self {
        self.synchronize_scope = Some(scope);
        self
    }

    pub fn without_generated_keys(mut self) -> Self {
        self.return_generated_keys = false;
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn merge_key(&self) -> Option<&[String]> {
        self.merge_key.as_deref()
    }

    pub fn update_columns(&self) -> Option<&[String]> {
        self.update_columns.as_deref()
    }

    pub fn synchronize_scope(&self) -> Option<&Predicate> {
        self.synchronize_scope.as_ref()
    }

    pub fn return_generated_keys(&self) -> bool {
        self.return_generated_keys
    }
}

/// Outcome of one bulk operation. Built once the last chunk has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkSummary {
    operation: OperationKind,
    inserted: u64,
    updated: u64,
    deleted: u64,
    chunks: usize,
    not_found: Vec<usize>,
    elapsed: Duration,
}

impl BulkSummary {
    pub(crate) fn new(
        operation: OperationKind,
        inserted: u64,
        updated: u64,
        deleted: u64,
        chunks: usize,
        mut not_found: Vec<usize>,
        elapsed: Duration,
    ) -> Self {
        not_found.sort_unstable();
        BulkSummary { operation, inserted, updated, deleted, chunks, not_found, elapsed }
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn rows_affected(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub fn updated(&self) -> u64 {
        self.updated
    }

    pub fn deleted(&self) -> u64 {
        self.deleted
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Indexes of Update records that matched no stored row (autocommit mode only).
    pub fn not_found(&self) -> &[usize] {
        &self.not_found
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl fmt::Display for BulkSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} affected {} rows ({} inserted, {} updated, {} deleted) in {} chunks - took {}",
            self.operation,
            self.rows_affected(),
            self.inserted,
            self.updated,
            self.deleted,
            self.chunks,
            format_duration(self.elapsed)
        )?;
        if !self.not_found.is_empty() {
            write!(f, ", {} records not found", self.not_found.len())?;
        }
        Ok(())
    }
}
