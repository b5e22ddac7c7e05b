//! Case-store abstraction.
//!
//! A case store holds every table of one case: the request catalog, the
//! evidence index, the project location, and the connector output
//! tables. The runner never mutates a store in place. It loads a full
//! [`CaseSnapshot`], computes all updates against it, and commits the
//! snapshot once at the end of the run.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! No locking discipline is provided across loads and commits: concurrent
//! runs against one store must be serialized by the caller.

pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{Evidence, Row, Table, EVIDENCE_TABLE};

/// Every table of a case, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub tables: BTreeMap<String, Table>,
}

impl CaseSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Mutable access, creating an empty table on first use.
    pub fn table_mut(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_default()
    }

    pub fn rows(&self, name: &str) -> &[Row] {
        self.tables
            .get(name)
            .map(|t| t.rows.as_slice())
            .unwrap_or(&[])
    }

    pub fn first_row(&self, name: &str) -> Option<&Row> {
        self.rows(name).first()
    }

    pub fn is_table_empty(&self, name: &str) -> bool {
        self.rows(name).is_empty()
    }

    pub fn put_table(&mut self, name: &str, table: Table) {
        self.tables.insert(name.to_string(), table);
    }

    /// Parse the evidence index.
    pub fn evidence(&self) -> Result<Vec<Evidence>, EngineError> {
        self.rows(EVIDENCE_TABLE)
            .iter()
            .map(Evidence::from_row)
            .collect()
    }

    pub fn find_evidence(&self, evidence_id: &str) -> Option<Evidence> {
        self.rows(EVIDENCE_TABLE)
            .iter()
            .filter(|r| crate::models::cell_text(r, "evidence_id") == evidence_id)
            .find_map(|r| Evidence::from_row(r).ok())
    }

    pub fn has_evidence_id(&self, evidence_id: &str) -> bool {
        self.rows(EVIDENCE_TABLE)
            .iter()
            .any(|r| crate::models::cell_text(r, "evidence_id") == evidence_id)
    }

    /// Append evidence. Evidence is write-once: an existing id is an error.
    pub fn append_evidence(&mut self, evidence: &Evidence) -> Result<(), EngineError> {
        if self.has_evidence_id(&evidence.evidence_id) {
            return Err(EngineError::invariant(format!(
                "evidence {} already recorded",
                evidence.evidence_id
            )));
        }
        self.table_mut(EVIDENCE_TABLE).push_row(evidence.to_row());
        Ok(())
    }
}

/// Abstract storage backend for case snapshots.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`load`](CaseStore::load) | Read every table into a snapshot |
/// | [`commit`](CaseStore::commit) | Persist a snapshot, replacing stored tables |
/// | [`label`](CaseStore::label) | Human-readable location for logs |
#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Read the full case.
    async fn load(&self) -> Result<CaseSnapshot>;

    /// Persist the full case. Tables absent from the snapshot are left alone.
    async fn commit(&self, snapshot: &CaseSnapshot) -> Result<()>;

    fn label(&self) -> String {
        "case store".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OriginClass;
    use chrono::Utc;
    use serde_json::json;

    fn evidence(id: &str) -> Evidence {
        Evidence {
            evidence_id: id.into(),
            kind: "calculation".into(),
            title: "t".into(),
            artifact_ref: format!("attachments/evidence/calc/{}.csv", id),
            produced_by: "REQ-1".into(),
            origin_class: OriginClass::ModelDerived,
            source_tag: "S-1".into(),
            metadata: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn evidence_is_write_once() {
        let mut snap = CaseSnapshot::new();
        snap.append_evidence(&evidence("EV-1")).unwrap();
        assert!(snap.append_evidence(&evidence("EV-1")).is_err());
        assert_eq!(snap.evidence().unwrap().len(), 1);
        assert!(snap.find_evidence("EV-1").is_some());
        assert!(snap.find_evidence("EV-2").is_none());
    }

    #[test]
    fn missing_tables_read_as_empty() {
        let snap = CaseSnapshot::new();
        assert!(snap.rows("NOPE").is_empty());
        assert!(snap.is_table_empty("NOPE"));
        assert!(snap.first_row("NOPE").is_none());
    }
}
