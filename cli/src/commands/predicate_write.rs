use std::{error::Error, path::Path};

use rbulk::{predicate::parse_value, Mutation, SqlValue};

use crate::{
    commands::{connect_engine, find_table, parse_predicate},
    console::{
        print_error_message, print_success_message, print_warn_message, prompt_for_confirmation,
    },
    rbulk_yaml::load_rbulk_yaml,
};

#[derive(Debug, PartialEq)]
enum Assignment {
    Set(String, SqlValue),
    Add(String, SqlValue),
    Subtract(String, SqlValue),
}

fn parse_assignment(text: &str) -> Result<Assignment, String> {
    let (column, value, build): (&str, &str, fn(String, SqlValue) -> Assignment) =
        if let Some((column, value)) = text.split_once("+=") {
            (column, value, Assignment::Add)
        } else if let Some((column, value)) = text.split_once("-=") {
            (column, value, Assignment::Subtract)
        } else if let Some((column, value)) = text.split_once('=') {
            (column, value, Assignment::Set)
        } else {
            return Err(format!("'{}' is not column=value", text));
        };

    let column = column.trim();
    if column.is_empty() {
        return Err(format!("'{}' names no column", text));
    }

    let value = parse_value(value.trim()).map_err(|e| format!("'{}': {}", text, e))?;
    Ok(build(column.to_string(), value))
}

fn build_mutation(assignments: &[String]) -> Result<Mutation, String> {
    assignments.iter().try_fold(Mutation::new(), |mutation, text| {
        Ok(match parse_assignment(text)? {
            Assignment::Set(column, value) => mutation.set(column, value),
            Assignment::Add(column, value) => mutation.add(column, value),
            Assignment::Subtract(column, value) => mutation.subtract(column, value),
        })
    })
}

pub async fn handle_update_where_command(
    project_path: &Path,
    table: &str,
    predicate: &str,
    assignments: &[String],
) -> Result<(), Box<dyn Error>> {
    let manifest = load_rbulk_yaml(project_path)?;
    let table = find_table(&manifest, table)?;
    let predicate = parse_predicate(predicate)?;
    let mutation = build_mutation(assignments).map_err(|e| {
        print_error_message(&e);
        e
    })?;

    let engine = connect_engine(&manifest, manifest.bulk.clone()).await?;
    let affected = engine.update_where(&table, &predicate, &mutation).await.map_err(|e| {
        print_error_message(&e.to_string());
        e
    })?;

    print_success_message(&format!("Updated {} rows in {}", affected, table.name));
    Ok(())
}

pub async fn handle_delete_where_command(
    project_path: &Path,
    table: &str,
    predicate: &str,
    yes: bool,
) -> Result<(), Box<dyn Error>> {
    let manifest = load_rbulk_yaml(project_path)?;
    let table = find_table(&manifest, table)?;
    let parsed = parse_predicate(predicate)?;

    if !yes {
        print_warn_message(&format!(
            "This will delete every row of {} matching: {}",
            table.name, predicate
        ));
        print_warn_message("This operation can not be reverted. Make sure you know what you are doing.");
        if !prompt_for_confirmation("Are you sure you wish to delete these rows?")? {
            print_warn_message("Nothing was deleted.");
            return Ok(());
        }
    }

    let engine = connect_engine(&manifest, manifest.bulk.clone()).await?;
    let affected = engine.delete_where(&table, &parsed).await.map_err(|e| {
        print_error_message(&e.to_string());
        e
    })?;

    print_success_message(&format!("Deleted {} rows from {}", affected, table.name));
    Ok(())
}
