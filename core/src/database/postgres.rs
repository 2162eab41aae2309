pub mod client;
mod connection;
pub mod query_builder;
pub mod sql_type_wrapper;

use async_trait::async_trait;
use bb8::RunError;
pub use connection::PostgresConnection;
use tokio_postgres::{error::SqlState, Error as PgError};
use tracing::error;

use self::client::{PostgresClient, PostgresClientOptions, PostgresConnectionError};
use crate::{database::BulkStore, error::StoreError};

/// Maps a Postgres failure onto the store error taxonomy by SQLSTATE class.
pub fn classify_error(error: &PgError) -> StoreError {
    let message = match error.as_db_error() {
        Some(db_error) => db_error.to_string(),
        None => error.to_string(),
    };

    let Some(code) = error.code() else {
        return StoreError::Unavailable(message);
    };

    let state = code.code();
    if state.starts_with("23") ||
        *code == SqlState::NUMERIC_VALUE_OUT_OF_RANGE ||
        *code == SqlState::STRING_DATA_RIGHT_TRUNCATION
    {
        StoreError::ConstraintViolation(message)
    } else if state.starts_with("42") || state.starts_with("22") {
        StoreError::SchemaMismatch(message)
    } else {
        StoreError::Unavailable(message)
    }
}

pub(crate) fn classify_pool_error(error: RunError<PgError>) -> StoreError {
    match error {
        RunError::User(e) => classify_error(&e),
        RunError::TimedOut => {
            StoreError::Unavailable("timed out waiting for a pooled connection".to_string())
        }
    }
}

/// Bulk store backed by a pooled Postgres database.
pub struct PostgresStore {
    client: PostgresClient,
    statement_timeout_ms: Option<u64>,
}

impl PostgresStore {
    pub async fn new(options: PostgresClientOptions) -> Result<Self, PostgresConnectionError> {
        let client = PostgresClient::new(options).await?;
        Ok(PostgresStore { client, statement_timeout_ms: None })
    }

    /// Applies `statement_timeout` to every connection handed out.
    pub fn with_statement_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.statement_timeout_ms = timeout_ms;
        self
    }
}

#[async_trait]
impl BulkStore for PostgresStore {
    type Connection = PostgresConnection;

    async fn connect(&self) -> Result<PostgresConnection, StoreError> {
        let conn = self.client.get_owned().await.map_err(|e| {
            error!("Failed to get a postgres connection: {}", e);
            classify_pool_error(e)
        })?;

        PostgresConnection::new(conn, self.statement_timeout_ms).await
    }

    fn max_connections(&self) -> usize {
        self.client.pool_size() as usize
    }
}
