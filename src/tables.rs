//! Direct access to case tables (`drq table show|import`).
//!
//! Import is how a case is seeded (LOCATION, a hand-written catalog) or a
//! target table is corrected by hand. The evidence index is append-only
//! and cannot be imported; an imported catalog is validated first.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use datareq_harness_core::catalog::RequestCatalog;
use datareq_harness_core::models::{cell_text, Table, EVIDENCE_TABLE, REQUESTS_TABLE};
use datareq_harness_core::store::CaseStore;

use crate::config::Config;
use crate::sqlite_store::SqliteCaseStore;

/// Parse a table from JSON: an array of row objects, or
/// `{"columns": [...], "rows": [...]}` to pin the column order.
pub fn table_from_json(value: Value) -> Result<Table> {
    let (columns, rows) = match value {
        Value::Array(rows) => (Vec::new(), rows),
        Value::Object(mut obj) => {
            let columns = match obj.remove("columns") {
                Some(Value::Array(cols)) => cols
                    .into_iter()
                    .map(|c| match c {
                        Value::String(s) => Ok(s),
                        other => bail!("column names must be strings, got {}", other),
                    })
                    .collect::<Result<Vec<_>>>()?,
                Some(other) => bail!("'columns' must be an array, got {}", other),
                None => Vec::new(),
            };
            match obj.remove("rows") {
                Some(Value::Array(rows)) => (columns, rows),
                _ => bail!("expected a 'rows' array"),
            }
        }
        _ => bail!("expected a JSON array of rows or an object with 'rows'"),
    };

    let mut table = Table::with_columns(columns);
    for (i, row) in rows.into_iter().enumerate() {
        match row {
            Value::Object(map) => table.push_row(map),
            other => bail!("row {} is not an object: {}", i + 1, other),
        }
    }
    Ok(table)
}

/// Replace table `name` in the store with `table`. Returns the row count.
pub async fn import_table(store: &dyn CaseStore, name: &str, table: Table) -> Result<usize> {
    if name == EVIDENCE_TABLE {
        bail!("{} is append-only and cannot be imported", EVIDENCE_TABLE);
    }
    let mut snapshot = store.load().await?;
    let count = if name == REQUESTS_TABLE {
        let catalog = RequestCatalog::from_table(&table)?;
        catalog.save(&mut snapshot);
        catalog.len()
    } else {
        let n = table.len();
        snapshot.put_table(name, table);
        n
    };
    store.commit(&snapshot).await?;
    tracing::info!(table = name, rows = count, "table imported");
    Ok(count)
}

/// `drq table import`.
pub async fn run_table_import(config: &Config, name: &str, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    let table = table_from_json(value)?;
    let store = SqliteCaseStore::open(config).await?;
    let count = import_table(&store, name, table).await?;
    println!("imported {} row(s) into {}", count, name);
    Ok(())
}

/// `drq table show`.
pub async fn run_table_show(config: &Config, name: &str, json: bool) -> Result<()> {
    let store = SqliteCaseStore::open(config).await?;
    let snapshot = store.load().await?;
    let Some(table) = snapshot.table(name) else {
        bail!("table {} does not exist", name);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&table.rows)?);
        return Ok(());
    }

    println!("{}", table.columns.join("\t"));
    for row in &table.rows {
        let cells: Vec<String> = table.columns.iter().map(|c| cell_text(row, c)).collect();
        println!("{}", cells.join("\t"));
    }
    println!("({} row(s))", table.len());
    Ok(())
}
