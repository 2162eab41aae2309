use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Postgres accepts at most 65535 bind parameters per statement.
pub const DEFAULT_MAX_PARAMETERS: usize = 65535;

/// How far a transaction reaches when `use_transaction` is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionScope {
    /// Every chunk commits on its own.
    #[default]
    Chunk,
    /// One transaction for the whole batch.
    Batch,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("chunk_size must be greater than 0")]
    ChunkSizeZero,

    #[error("max_parallel_chunks must be at least 1")]
    ParallelismZero,

    #[error("max_parameters must be greater than 0")]
    MaxParametersZero,

    #[error("transaction_scope batch requires use_transaction")]
    BatchScopeWithoutTransaction,

    #[error("transaction_scope batch runs on one connection, max_parallel_chunks is {0}")]
    BatchScopeWithParallelism(usize),

    #[error("max_parallel_chunks {parallel} exceeds the store pool size {pool}")]
    ParallelismExceedsPool { parallel: usize, pool: usize },
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_use_transaction() -> bool {
    true
}

fn default_max_parallel_chunks() -> usize {
    1
}

fn default_max_parameters() -> usize {
    DEFAULT_MAX_PARAMETERS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawBulkConfig {
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,

    #[serde(default = "default_use_transaction")]
    use_transaction: bool,

    #[serde(default)]
    transaction_scope: TransactionScope,

    #[serde(default = "default_max_parallel_chunks")]
    max_parallel_chunks: usize,

    #[serde(default = "default_max_parameters")]
    max_parameters: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    statement_timeout_ms: Option<u64>,
}

/// Tunables for bulk operations. Always valid once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBulkConfig", into = "RawBulkConfig")]
pub struct BulkConfig {
    chunk_size: usize,
    use_transaction: bool,
    transaction_scope: TransactionScope,
    max_parallel_chunks: usize,
    max_parameters: usize,
    statement_timeout_ms: Option<u64>,
}

impl Default for BulkConfig {
    fn default() -> Self {
        BulkConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            use_transaction: true,
            transaction_scope: TransactionScope::Chunk,
            max_parallel_chunks: 1,
            max_parameters: DEFAULT_MAX_PARAMETERS,
            statement_timeout_ms: None,
        }
    }
}

impl BulkConfig {
    pub fn builder() -> BulkConfigBuilder {
        BulkConfigBuilder { config: BulkConfig::default() }
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ChunkSizeZero);
        }
        if self.max_parallel_chunks == 0 {
            return Err(ConfigError::ParallelismZero);
        }
        if self.max_parameters == 0 {
            return Err(ConfigError::MaxParametersZero);
        }
        if self.transaction_scope == TransactionScope::Batch {
            if !self.use_transaction {
                return Err(ConfigError::BatchScopeWithoutTransaction);
            }
            if self.max_parallel_chunks > 1 {
                return Err(ConfigError::BatchScopeWithParallelism(self.max_parallel_chunks));
            }
        }
        Ok(self)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn use_transaction(&self) -> bool {
        self.use_transaction
    }

    pub fn transaction_scope(&self) -> TransactionScope {
        self.transaction_scope
    }

    pub fn max_parallel_chunks(&self) -> usize {
        self.max_parallel_chunks
    }

    pub fn max_parameters(&self) -> usize {
        self.max_parameters
    }

    pub fn statement_timeout_ms(&self) -> Option<u64> {
        self.statement_timeout_ms
    }

    /// One transaction spans every chunk.
    pub fn spans_batch(&self) -> bool {
        self.use_transaction && self.transaction_scope == TransactionScope::Batch
    }

    /// Each chunk runs in its own transaction.
    pub fn chunk_atomic(&self) -> bool {
        self.use_transaction && self.transaction_scope == TransactionScope::Chunk
    }

    /// Copy of this config with per call overrides applied, validated again.
    pub fn to_builder(&self) -> BulkConfigBuilder {
        BulkConfigBuilder { config: self.clone() }
    }
}

impl TryFrom<RawBulkConfig> for BulkConfig {
    type Error = ConfigError;

    fn try_from(raw: RawBulkConfig) -> Result<Self, Self::Error> {
        BulkConfig {
            chunk_size: raw.chunk_size,
            use_transaction: raw.use_transaction,
            transaction_scope: raw.transaction_scope,
            max_parallel_chunks: raw.max_parallel_chunks,
            max_parameters: raw.max_parameters,
            statement_timeout_ms: raw.statement_timeout_ms,
        }
        .validate()
    }
}

impl From<BulkConfig> for RawBulkConfig {
    fn from(config: BulkConfig) -> Self {
        RawBulkConfig {
            chunk_size: config.chunk_size,
            use_transaction: config.use_transaction,
            transaction_scope: config.transaction_scope,
            max_parallel_chunks: config.max_parallel_chunks,
            max_parameters: config.max_parameters,
            statement_timeout_ms: config.statement_timeout_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkConfigBuilder {
    config: BulkConfig,
}

impl BulkConfigBuilder {
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.chunk_size = chunk_size;
        self
    }

    pub fn use_transaction(mut self, use_transaction: bool) -> Self {
        self.config.use_transaction = use_transaction;
        self
    }

    pub fn transaction_scope(mut self, scope: TransactionScope) -> Self {
        self.config.transaction_scope = scope;
        self
    }

    pub fn max_parallel_chunks(mut self, max_parallel_chunks: usize) -> Self {
        self.config.max_parallel_chunks = max_parallel_chunks;
        self
    }

    pub fn max_parameters(mut self, max_parameters: usize) -> Self {
        self.config.max_parameters = max_parameters;
        self
    }

    pub fn statement_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.config.statement_timeout_ms = timeout_ms;
        self
    }

    pub fn build(self) -> Result<BulkConfig, ConfigError> {
        self.config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BulkConfig::default();
        assert_eq!(config.chunk_size(), 1000);
        assert!(config.use_transaction());
        assert_eq!(config.max_parallel_chunks(), 1);
        assert!(config.chunk_atomic());
        assert!(!config.spans_batch());
    }

    #[test]
    fn test_builder_validation() {
        assert_eq!(BulkConfig::builder().chunk_size(0).build(), Err(ConfigError::ChunkSizeZero));
        assert_eq!(
            BulkConfig::builder().max_parallel_chunks(0).build(),
            Err(ConfigError::ParallelismZero)
        );
        assert_eq!(
            BulkConfig::builder()
                .use_transaction(false)
                .transaction_scope(TransactionScope::Batch)
                .build(),
            Err(ConfigError::BatchScopeWithoutTransaction)
        );
        assert_eq!(
            BulkConfig::builder()
                .transaction_scope(TransactionScope::Batch)
                .max_parallel_chunks(4)
                .build(),
            Err(ConfigError::BatchScopeWithParallelism(4))
        );
        assert!(BulkConfig::builder().use_transaction(false).max_parallel_chunks(4).build().is_ok());
    }

    #[test]
    fn test_yaml_with_defaults() {
        let config: BulkConfig = serde_yaml::from_str("chunk_size: 250\ntransaction_scope: batch\n").unwrap();
        assert_eq!(config.chunk_size(), 250);
        assert!(config.spans_batch());
        assert_eq!(config.max_parameters(), DEFAULT_MAX_PARAMETERS);
    }

    #[test]
    fn test_yaml_is_validated() {
        let result: Result<BulkConfig, _> = serde_yaml::from_str("chunk_size: 0\n");
        assert!(result.unwrap_err().to_string().contains("chunk_size must be greater than 0"));
    }
}
