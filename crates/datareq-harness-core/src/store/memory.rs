//! In-memory [`CaseStore`] implementation for tests and dry runs.
//!
//! Holds a single snapshot behind `std::sync::RwLock`. Commits merge
//! table-by-table, matching the SQLite store: tables missing from the
//! committed snapshot are kept.

use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{CaseSnapshot, CaseStore};

/// In-memory case store.
pub struct InMemoryCaseStore {
    snapshot: RwLock<CaseSnapshot>,
    commits: RwLock<usize>,
}

impl InMemoryCaseStore {
    pub fn new() -> Self {
        Self::with_snapshot(CaseSnapshot::new())
    }

    pub fn with_snapshot(snapshot: CaseSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            commits: RwLock::new(0),
        }
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.read().map(|c| *c).unwrap_or(0)
    }
}

impl Default for InMemoryCaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaseStore for InMemoryCaseStore {
    async fn load(&self) -> Result<CaseSnapshot> {
        let snap = self
            .snapshot
            .read()
            .map_err(|_| anyhow!("case snapshot lock poisoned"))?;
        Ok(snap.clone())
    }

    async fn commit(&self, snapshot: &CaseSnapshot) -> Result<()> {
        let mut stored = self
            .snapshot
            .write()
            .map_err(|_| anyhow!("case snapshot lock poisoned"))?;
        for (name, table) in &snapshot.tables {
            stored.tables.insert(name.clone(), table.clone());
        }
        let mut commits = self
            .commits
            .write()
            .map_err(|_| anyhow!("commit counter lock poisoned"))?;
        *commits += 1;
        Ok(())
    }

    fn label(&self) -> String {
        "memory".to_string()
    }
}
