pub mod execute;
pub mod predicate_write;
pub mod where_in;

use std::error::Error;

use rbulk::{
    manifest::core::Manifest,
    predicate::{parse, Predicate},
    BulkConfig, BulkEngine, PostgresStore, TableSchema,
};

use crate::console::print_error_message;

pub fn find_table(manifest: &Manifest, name: &str) -> Result<TableSchema, String> {
    manifest.table(name).cloned().ok_or_else(|| {
        let error = format!("Table {} is not declared in the rbulk.yaml", name);
        print_error_message(&error);
        error
    })
}

pub fn parse_predicate(text: &str) -> Result<Predicate, String> {
    parse(text).map_err(|e| {
        let error = format!("Could not parse predicate '{}': {}", text, e);
        print_error_message(&error);
        error
    })
}

pub async fn connect_engine(
    manifest: &Manifest,
    config: BulkConfig,
) -> Result<BulkEngine<PostgresStore>, Box<dyn Error>> {
    let store = PostgresStore::new(manifest.database.client_options())
        .await
        .map_err(|e| {
            print_error_message(&format!("Could not connect to Postgres, make sure your connection string is mapping in the .env correctly: trace: {}", e));
            e
        })?
        .with_statement_timeout(config.statement_timeout_ms());

    let engine = BulkEngine::new(store, config).map_err(|e| {
        print_error_message(&format!("Invalid bulk configuration: {}", e));
        e
    })?;

    Ok(engine)
}
