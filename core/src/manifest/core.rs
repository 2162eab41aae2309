use serde::{Deserialize, Serialize};

use crate::{
    config::BulkConfig,
    database::postgres::client::{PostgresClientOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_POOL_SIZE},
    schema::TableSchema,
};

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DatabaseDetails {
    /// Falls back to `DATABASE_URL` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for DatabaseDetails {
    fn default() -> Self {
        DatabaseDetails {
            url: None,
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl DatabaseDetails {
    pub fn client_options(&self) -> PostgresClientOptions {
        PostgresClientOptions {
            url: self.url.clone(),
            pool_size: self.pool_size,
            connect_timeout: std::time::Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub database: DatabaseDetails,

    #[serde(default)]
    pub bulk: BulkConfig,

    #[serde(default)]
    pub tables: Vec<TableSchema>,
}

impl Manifest {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|table| table.name == name)
    }
}
