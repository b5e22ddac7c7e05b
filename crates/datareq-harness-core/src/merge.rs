//! Merge strategies for applying connector output to a target table.
//!
//! - **REPLACE_ALL** drops every existing row, then appends.
//! - **APPEND** always appends.
//! - **UPSERT_BY_KEY** indexes existing rows by the trimmed text of the key
//!   columns. A matching row is updated column-by-column (columns the
//!   incoming row does not carry are kept); otherwise the row is appended.
//!   Incoming rows missing a key value are skipped with a warning.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::models::{cell_text, MergeStrategy, Row, Table};

/// Apply `rows` to `table`, returning non-fatal warnings.
pub fn apply_rows(
    table: &mut Table,
    rows: Vec<Row>,
    strategy: MergeStrategy,
    keys: &[String],
) -> Result<Vec<String>, EngineError> {
    match strategy {
        MergeStrategy::ReplaceAll => {
            table.rows.clear();
            rows.into_iter().for_each(|r| table.push_row(r));
            Ok(Vec::new())
        }
        MergeStrategy::Append => {
            rows.into_iter().for_each(|r| table.push_row(r));
            Ok(Vec::new())
        }
        MergeStrategy::UpsertByKey => upsert(table, rows, keys),
    }
}

fn key_of(row: &Row, keys: &[String]) -> Option<Vec<String>> {
    let parts: Vec<String> = keys.iter().map(|k| cell_text(row, k)).collect();
    if parts.iter().any(|p| p.is_empty()) {
        None
    } else {
        Some(parts)
    }
}

fn upsert(table: &mut Table, rows: Vec<Row>, keys: &[String]) -> Result<Vec<String>, EngineError> {
    let keys: Vec<String> = keys
        .iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    if keys.is_empty() {
        return Err(EngineError::config("UPSERT_BY_KEY requires upsert_keys"));
    }

    let mut warnings = Vec::new();
    if !table.columns.is_empty() {
        for k in &keys {
            if !table.has_column(k) {
                warnings.push(format!("upsert key column '{}' not in table; adding it", k));
                table.ensure_column(k);
            }
        }
    }

    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    for (i, row) in table.rows.iter().enumerate() {
        if let Some(k) = key_of(row, &keys) {
            index.entry(k).or_insert(i);
        }
    }

    for (n, row) in rows.into_iter().enumerate() {
        let Some(k) = key_of(&row, &keys) else {
            warnings.push(format!(
                "row {} skipped: missing upsert key ({})",
                n + 1,
                keys.join(", ")
            ));
            continue;
        };
        match index.get(&k) {
            Some(&i) => {
                for col in row.keys() {
                    table.ensure_column(col);
                }
                let target = &mut table.rows[i];
                for (col, v) in row {
                    target.insert(col, v);
                }
            }
            None => {
                index.insert(k, table.rows.len());
                table.push_row(row);
            }
        }
    }
    Ok(warnings)
}
