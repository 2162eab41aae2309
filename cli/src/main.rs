mod cli_interface;
mod commands;
mod console;
mod rbulk_yaml;

use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use rbulk::{load_env_from_project_path, setup_info_logger};

use crate::{
    cli_interface::{Commands, CLI},
    commands::{
        execute::{handle_execute_command, ExecuteDetails},
        predicate_write::{handle_delete_where_command, handle_update_where_command},
        where_in::handle_where_in_command,
    },
    console::print_error_message,
};

fn resolve_path(override_path: &Option<String>) -> Result<PathBuf, String> {
    match override_path {
        Some(path) => {
            let path = PathBuf::from_str(path).map_err(|_| "Invalid path provided.".to_string())?;
            Ok(path)
        }
        None => {
            Ok(std::env::current_dir().map_err(|_| "Failed to get current directory.".to_string())?)
        }
    }
}

fn prepare_project(path: &Option<String>) -> Result<PathBuf, String> {
    let resolved_path = resolve_path(path).map_err(|e| {
        print_error_message(&e);
        e
    })?;
    load_env_from_project_path(&resolved_path);
    Ok(resolved_path)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CLI::parse();
    setup_info_logger();

    match cli.command {
        Commands::Execute {
            table,
            mode,
            records,
            merge_key,
            update_columns,
            scope,
            chunk_size,
            no_transaction,
            batch_transaction,
            parallel,
            output,
            yes,
            path,
        } => {
            let resolved_path = prepare_project(&path)?;
            let details = ExecuteDetails {
                table,
                mode,
                records,
                merge_key,
                update_columns,
                scope,
                chunk_size,
                no_transaction,
                batch_transaction,
                parallel,
                output,
                yes,
            };
            handle_execute_command(&resolved_path, details).await
        }
        Commands::UpdateWhere { table, predicate, set, path } => {
            let resolved_path = prepare_project(&path)?;
            handle_update_where_command(&resolved_path, &table, &predicate, &set).await
        }
        Commands::DeleteWhere { table, predicate, yes, path } => {
            let resolved_path = prepare_project(&path)?;
            handle_delete_where_command(&resolved_path, &table, &predicate, yes).await
        }
        Commands::WhereIn { table, column, values, order_by, path } => {
            let resolved_path = prepare_project(&path)?;
            handle_where_in_command(&resolved_path, &table, &column, &values, order_by.as_deref())
                .await
        }
    }
}
