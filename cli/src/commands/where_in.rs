use std::{error::Error, path::Path};

use rbulk::{predicate::parse_value, SqlValue, TryStreamExt};

use crate::{
    commands::{connect_engine, find_table},
    console::{print_error_message, print_success_message},
    rbulk_yaml::load_rbulk_yaml,
};

/// Splits each `--values` item into one value per key column.
fn parse_keys(columns: usize, values: &[String]) -> Result<Vec<Vec<SqlValue>>, String> {
    values
        .iter()
        .map(|item| {
            let parts: Vec<&str> =
                if columns == 1 { vec![item.as_str()] } else { item.split(':').collect() };
            if parts.len() != columns {
                return Err(format!("'{}' needs {} values separated by ':'", item, columns));
            }
            parts
                .into_iter()
                .map(|part| parse_value(part).map_err(|e| format!("'{}': {}", item, e)))
                .collect()
        })
        .collect()
}

pub async fn handle_where_in_command(
    project_path: &Path,
    table: &str,
    columns: &[String],
    values: &[String],
    order_by: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let manifest = load_rbulk_yaml(project_path)?;
    let table = find_table(&manifest, table)?;
    let keys = parse_keys(columns.len(), values).map_err(|e| {
        print_error_message(&e);
        e
    })?;

    let engine = connect_engine(&manifest, manifest.bulk.clone()).await?;
    let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
    let mut rows = engine.where_in_tuples(&table, &columns, keys, order_by).map_err(|e| {
        print_error_message(&e.to_string());
        e
    })?;

    let mut count = 0;
    while let Some(row) = rows.try_next().await.map_err(|e| {
        print_error_message(&e.to_string());
        e
    })? {
        println!("{}", row.to_json());
        count += 1;
    }

    print_success_message(&format!("Found {} rows in {}", count, table.name));
    Ok(())
}
