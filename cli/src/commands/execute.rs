use std::{error::Error, path::Path};

use rbulk::{
    BulkConfig, CancellationToken, OperationDescriptor, Row, TableSchema, TransactionScope,
};
use serde_json::Value as JsonValue;

use crate::{
    cli_interface::Mode,
    commands::{connect_engine, find_table, parse_predicate},
    console::{
        print_error_message, print_success_message, print_warn_message, prompt_for_confirmation,
    },
    rbulk_yaml::load_rbulk_yaml,
};

pub struct ExecuteDetails {
    pub table: String,
    pub mode: Mode,
    pub records: String,
    pub merge_key: Vec<String>,
    pub update_columns: Vec<String>,
    pub scope: Option<String>,
    pub chunk_size: Option<usize>,
    pub no_transaction: bool,
    pub batch_transaction: bool,
    pub parallel: Option<usize>,
    pub output: Option<String>,
    pub yes: bool,
}

fn read_records(table: &TableSchema, path: &Path) -> Result<Vec<Row>, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Could not read records file {}: {}", path.display(), e))?;
    let document: JsonValue = serde_json::from_str(&contents)
        .map_err(|e| format!("Records file {} is not valid JSON: {}", path.display(), e))?;

    let JsonValue::Array(items) = document else {
        return Err(format!("Records file {} must hold a JSON array", path.display()));
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let object = item
                .as_object()
                .ok_or_else(|| format!("Record {} is not a JSON object", index))?;
            Row::from_json(table, object).map_err(|e| format!("Record {}: {}", index, e))
        })
        .collect()
}

fn build_descriptor(details: &ExecuteDetails) -> Result<OperationDescriptor, String> {
    let descriptor = match (details.mode, details.merge_key.is_empty()) {
        (Mode::Insert, _) => OperationDescriptor::insert(),
        (Mode::Update, _) => OperationDescriptor::update(),
        (Mode::Delete, _) => OperationDescriptor::delete(),
        (Mode::Merge, true) => OperationDescriptor::merge(),
        (Mode::Merge, false) => OperationDescriptor::merge_on(details.merge_key.clone()),
        (Mode::Synchronize, true) => OperationDescriptor::synchronize(),
        (Mode::Synchronize, false) => OperationDescriptor::synchronize_on(details.merge_key.clone()),
    };

    let descriptor = if details.update_columns.is_empty() {
        descriptor
    } else {
        descriptor.with_update_columns(details.update_columns.clone())
    };

    match &details.scope {
        Some(scope) if details.mode == Mode::Synchronize => {
            Ok(descriptor.with_scope(parse_predicate(scope)?))
        }
        Some(_) => Err("--scope only applies to synchronize".to_string()),
        None => Ok(descriptor),
    }
}

fn build_config(base: &BulkConfig, details: &ExecuteDetails) -> Result<BulkConfig, String> {
    let mut builder = base.to_builder();
    if let Some(chunk_size) = details.chunk_size {
        builder = builder.chunk_size(chunk_size);
    }
    if details.no_transaction {
        builder = builder.use_transaction(false).transaction_scope(TransactionScope::Chunk);
    }
    if details.batch_transaction {
        builder = builder.use_transaction(true).transaction_scope(TransactionScope::Batch);
    }
    if let Some(parallel) = details.parallel {
        builder = builder.max_parallel_chunks(parallel);
    }
    builder.build().map_err(|e| format!("Invalid bulk configuration: {}", e))
}

pub async fn handle_execute_command(
    project_path: &Path,
    details: ExecuteDetails,
) -> Result<(), Box<dyn Error>> {
    let manifest = load_rbulk_yaml(project_path)?;
    let table = find_table(&manifest, &details.table)?;

    let (descriptor, config) = build_descriptor(&details)
        .and_then(|descriptor| Ok((descriptor, build_config(&manifest.bulk, &details)?)))
        .map_err(|e| {
            print_error_message(&e);
            e
        })?;

    let mut records = read_records(&table, &project_path.join(&details.records)).map_err(|e| {
        print_error_message(&e);
        e
    })?;

    if details.mode == Mode::Synchronize && !details.yes {
        print_warn_message(&format!(
            "synchronize deletes every row of {} whose merge key is not among the {} records.",
            table.name,
            records.len()
        ));
        if !prompt_for_confirmation("Are you sure you wish to continue?")? {
            print_warn_message("Nothing was written.");
            return Ok(());
        }
    }

    let engine = connect_engine(&manifest, config.clone()).await?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let summary = engine
        .execute_with(&table, &descriptor, &mut records, &config, &cancel)
        .await
        .map_err(|e| {
            print_error_message(&format!("{}", e));
            if e.is_retryable() {
                print_warn_message("The failure is transient, chunks before the failing one are committed.");
            }
            e
        })?;

    print_success_message(&summary.to_string());
    for index in summary.not_found() {
        print_warn_message(&format!("Record {} matched no stored row", index));
    }

    if let Some(output) = details.output {
        let rows: Vec<JsonValue> = records.iter().map(Row::to_json).collect();
        let json = serde_json::to_string_pretty(&rows)?;
        tokio::fs::write(project_path.join(&output), json).await?;
        print_success_message(&format!("Wrote {} records to {}", rows.len(), output));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rbulk::{OperationKind, SqlType};

    use super::*;

    fn details(mode: Mode) -> ExecuteDetails {
        ExecuteDetails {
            table: "customers".to_string(),
            mode,
            records: "records.json".to_string(),
            merge_key: vec![],
            update_columns: vec![],
            scope: None,
            chunk_size: None,
            no_transaction: false,
            batch_transaction: false,
            parallel: None,
            output: None,
            yes: false,
        }
    }

    #[test]
    fn test_descriptor_from_flags() {
        let mut merge = details(Mode::Synchronize);
        merge.merge_key = vec!["code".to_string()];
        merge.scope = Some("team == 1".to_string());

        let descriptor = build_descriptor(&merge).unwrap();
        assert_eq!(descriptor.kind(), OperationKind::Synchronize);
        assert_eq!(descriptor.merge_key(), Some(&["code".to_string()][..]));
        assert!(descriptor.synchronize_scope().is_some());

        let mut insert = details(Mode::Insert);
        insert.scope = Some("team == 1".to_string());
        assert!(build_descriptor(&insert).is_err());
    }

    #[test]
    fn test_config_overrides() {
        let mut flags = details(Mode::Insert);
        flags.chunk_size = Some(10);
        flags.no_transaction = true;
        flags.parallel = Some(4);

        let config = build_config(&BulkConfig::default(), &flags).unwrap();
        assert_eq!(config.chunk_size(), 10);
        assert!(!config.use_transaction());
        assert_eq!(config.max_parallel_chunks(), 4);

        let mut batch = details(Mode::Insert);
        batch.batch_transaction = true;
        batch.parallel = Some(2);
        assert!(build_config(&BulkConfig::default(), &batch).is_err());
    }

    #[test]
    fn test_read_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, r#"[{"code": "A-1", "visits": 2}, {"code": "A-2"}]"#).unwrap();

        let table = TableSchema::new("customers", "id")
            .column("code", SqlType::Text)
            .nullable_column("visits", SqlType::Integer);
        let rows = read_records(&table, &path).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value("visits"), Some(&rbulk::SqlValue::Int(2)));

        std::fs::write(&path, r#"{"code": "A-1"}"#).unwrap();
        assert!(read_records(&table, &path).is_err());
    }
}
