use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the case schema. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Table registry with column order
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS case_tables (
            name TEXT PRIMARY KEY,
            columns_json TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One JSON object per row, in table order
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS case_rows (
            table_name TEXT NOT NULL,
            position INTEGER NOT NULL,
            row_json TEXT NOT NULL,
            PRIMARY KEY (table_name, position),
            FOREIGN KEY (table_name) REFERENCES case_tables(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Evidence index, append-only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS evidence (
            evidence_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            artifact_ref TEXT NOT NULL,
            produced_by TEXT NOT NULL,
            origin_class TEXT NOT NULL,
            source_tag TEXT NOT NULL DEFAULT '',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            seq INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_evidence_produced_by ON evidence(produced_by)")
        .execute(pool)
        .await?;

    Ok(())
}
