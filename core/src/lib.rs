// public
pub mod config;
pub mod database;
pub mod error;
pub mod manifest;
pub mod operation;
pub mod planner;
pub mod predicate;
pub mod record;
pub mod schema;
pub mod value;

mod containment;
pub use containment::RowStream;

mod engine;
pub use engine::BulkEngine;

mod executor;

mod helpers;
pub use helpers::{format_duration, load_env_from_project_path};

mod logger;
pub use logger::{setup_info_logger, setup_logger};

pub use config::{BulkConfig, BulkConfigBuilder, TransactionScope};
pub use database::{
    memory::{MemoryStore, StoreEvent},
    postgres::{
        client::{PostgresClientOptions, PostgresConnectionError},
        PostgresStore,
    },
    BulkConnection, BulkStore, ChunkOutcome,
};
pub use error::{BulkError, StoreError};
pub use operation::{BulkSummary, OperationDescriptor, OperationKind};
pub use predicate::{col, Mutation, Predicate};
pub use record::{Record, Row};
pub use schema::{ColumnDefinition, TableSchema};
pub use value::{SqlType, SqlValue};

// export 3rd party dependencies
pub use async_trait::async_trait;
pub use futures::{StreamExt, TryStreamExt};
pub use tokio_util::sync::CancellationToken;
pub use tracing::level_filters::LevelFilter;
