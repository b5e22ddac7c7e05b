//! SQLite-backed [`CaseStore`] implementation.
//!
//! Generic tables are stored as JSON rows in `case_rows` with their column
//! order in `case_tables`. The evidence index lives in its own typed,
//! append-only `evidence` table and is surfaced in snapshots as the
//! `EVIDENCE` table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row as _, SqlitePool};

use datareq_harness_core::models::{Evidence, Row, Table, EVIDENCE_TABLE};
use datareq_harness_core::store::{CaseSnapshot, CaseStore};

/// SQLite implementation of the [`CaseStore`] trait.
pub struct SqliteCaseStore {
    pool: SqlitePool,
    label: String,
}

impl SqliteCaseStore {
    pub fn new(pool: SqlitePool, label: impl Into<String>) -> Self {
        Self {
            pool,
            label: label.into(),
        }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &crate::config::Config) -> Result<Self> {
        let pool = crate::db::connect(config).await?;
        crate::migrate::apply(&pool).await?;
        Ok(Self::new(pool, config.db.path.display().to_string()))
    }

    async fn load_evidence(&self) -> Result<Table> {
        let rows = sqlx::query(
            r#"
            SELECT evidence_id, kind, title, artifact_ref, produced_by, origin_class,
                   source_tag, metadata_json, created_at
            FROM evidence
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut table = Table::new();
        for row in rows {
            let mut out = Row::new();
            for col in [
                "evidence_id",
                "kind",
                "title",
                "artifact_ref",
                "produced_by",
                "origin_class",
                "source_tag",
                "created_at",
            ] {
                out.insert(col.into(), serde_json::Value::String(row.get(col)));
            }
            let metadata: String = row.get("metadata_json");
            out.insert(
                "metadata".into(),
                serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            );
            table.push_row(out);
        }
        Ok(table)
    }
}

#[async_trait]
impl CaseStore for SqliteCaseStore {
    async fn load(&self) -> Result<CaseSnapshot> {
        let mut snapshot = CaseSnapshot::new();

        let tables = sqlx::query("SELECT name, columns_json FROM case_tables ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        for t in &tables {
            let name: String = t.get("name");
            let columns_json: String = t.get("columns_json");
            let columns: Vec<String> = serde_json::from_str(&columns_json)
                .with_context(|| format!("corrupt column list for table {}", name))?;
            let mut table = Table::with_columns(columns);

            let rows = sqlx::query(
                "SELECT row_json FROM case_rows WHERE table_name = ? ORDER BY position",
            )
            .bind(&name)
            .fetch_all(&self.pool)
            .await?;
            for r in rows {
                let json: String = r.get("row_json");
                let row: Row = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt row in table {}", name))?;
                table.push_row(row);
            }
            snapshot.put_table(&name, table);
        }

        let evidence = self.load_evidence().await?;
        if !evidence.is_empty() {
            snapshot.put_table(EVIDENCE_TABLE, evidence);
        }
        Ok(snapshot)
    }

    async fn commit(&self, snapshot: &CaseSnapshot) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for (name, table) in &snapshot.tables {
            if name == EVIDENCE_TABLE {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO case_tables (name, columns_json, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    columns_json = excluded.columns_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(name)
            .bind(serde_json::to_string(&table.columns)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM case_rows WHERE table_name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;

            for (i, row) in table.rows.iter().enumerate() {
                sqlx::query("INSERT INTO case_rows (table_name, position, row_json) VALUES (?, ?, ?)")
                    .bind(name)
                    .bind(i as i64)
                    .bind(serde_json::to_string(row)?)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        // Evidence is write-once: existing ids are left untouched.
        let next_seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM evidence")
            .fetch_one(&mut *tx)
            .await?;
        let mut seq = next_seq;
        for row in snapshot.rows(EVIDENCE_TABLE) {
            let ev = Evidence::from_row(row)?;
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO evidence (evidence_id, kind, title, artifact_ref, produced_by,
                                                origin_class, source_tag, metadata_json, created_at, seq)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&ev.evidence_id)
            .bind(&ev.kind)
            .bind(&ev.title)
            .bind(&ev.artifact_ref)
            .bind(&ev.produced_by)
            .bind(ev.origin_class.as_str())
            .bind(&ev.source_tag)
            .bind(serde_json::to_string(&ev.metadata)?)
            .bind(ev.created_at.to_rfc3339())
            .bind(seq)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() > 0 {
                seq += 1;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}
