//! Request catalog: typed access to the `DATA_REQUESTS` table.
//!
//! Reading is forward-compatible: unknown columns are carried on each
//! request in [`Request::extra`] and written back on save. Blank rows are
//! ignored. A catalog with duplicate ids, a row without an id, or an
//! unparseable enum cell is rejected as an invariant violation.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::error::EngineError;
use crate::models::{
    cell_bool, cell_text, MergeStrategy, Request, Row, RunMode, Table, REQUESTS_TABLE,
};
use crate::store::CaseSnapshot;

/// Canonical catalog columns, in write order.
pub const CATALOG_COLUMNS: [&str; 14] = [
    "id",
    "enabled",
    "priority",
    "connector",
    "purpose",
    "params",
    "target_table",
    "merge_strategy",
    "upsert_keys",
    "run_mode",
    "last_run_at",
    "last_evidence_ids",
    "source_tag",
    "note",
];

/// Legacy column names accepted on read.
const COLUMN_ALIASES: [(&str, &str); 4] = [
    ("req_id", "id"),
    ("params_json", "params"),
    ("output_sheet", "target_table"),
    ("src_id", "source_tag"),
];

/// The ordered set of requests of one case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestCatalog {
    requests: Vec<Request>,
}

impl RequestCatalog {
    /// Build a catalog, rejecting duplicate ids. Sorted by `(priority, id)`.
    pub fn from_requests(requests: Vec<Request>) -> Result<Self, EngineError> {
        let mut seen = HashSet::new();
        for r in &requests {
            if !seen.insert(r.id.clone()) {
                return Err(EngineError::invariant(format!(
                    "duplicate request id '{}' in catalog",
                    r.id
                )));
            }
        }
        let mut catalog = Self { requests };
        catalog.sort();
        Ok(catalog)
    }

    pub fn from_table(table: &Table) -> Result<Self, EngineError> {
        let mut requests = Vec::with_capacity(table.rows.len());
        for (idx, row) in table.rows.iter().enumerate() {
            if row_is_blank(row) {
                continue;
            }
            requests.push(request_from_row(row).map_err(|e| {
                EngineError::invariant(format!(
                    "{} row {}: {}",
                    REQUESTS_TABLE,
                    idx + 1,
                    e.message()
                ))
            })?);
        }
        Self::from_requests(requests)
    }

    /// Load the catalog from a snapshot. A missing table is an empty catalog.
    pub fn load(snapshot: &CaseSnapshot) -> Result<Self, EngineError> {
        match snapshot.table(REQUESTS_TABLE) {
            Some(t) => Self::from_table(t),
            None => Ok(Self::default()),
        }
    }

    pub fn to_table(&self) -> Table {
        let mut table = Table::with_columns(CATALOG_COLUMNS);
        for r in &self.requests {
            table.push_row(request_to_row(r));
        }
        table
    }

    /// Write the catalog back into the snapshot.
    pub fn save(&self, snapshot: &mut CaseSnapshot) {
        snapshot.put_table(REQUESTS_TABLE, self.to_table());
    }

    /// Replace requests with matching ids and insert the rest.
    ///
    /// The catalog's key is `id`; incoming duplicates are an error.
    pub fn upsert_by_key(&mut self, incoming: Vec<Request>) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for r in incoming {
            if !seen.insert(r.id.clone()) {
                return Err(EngineError::invariant(format!(
                    "duplicate request id '{}' in upsert batch",
                    r.id
                )));
            }
            match self.requests.iter_mut().find(|e| e.id == r.id) {
                Some(existing) => *existing = r,
                None => self.requests.push(r),
            }
        }
        self.sort();
        Ok(())
    }

    pub fn sort(&mut self) {
        self.requests
            .sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }

    pub fn ids(&self) -> Vec<String> {
        self.requests.iter().map(|r| r.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Request> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Request> {
        self.requests.iter_mut().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Close the loop after an execution: status fields only.
    pub fn record_run(
        &mut self,
        id: &str,
        at: DateTime<Utc>,
        evidence_ids: Vec<String>,
    ) -> Result<(), EngineError> {
        let req = self
            .get_mut(id)
            .ok_or_else(|| EngineError::invariant(format!("request {} vanished mid-run", id)))?;
        req.last_run_at = Some(at);
        req.last_evidence_ids = evidence_ids;
        Ok(())
    }
}

fn row_is_blank(row: &Row) -> bool {
    row.values().all(|v| match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    })
}

/// Split a `;`-separated list cell, or accept a JSON array.
fn list_cell(row: &Row, key: &str) -> Vec<String> {
    match row.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => cell_text(row, key)
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn request_from_row(row: &Row) -> Result<Request, EngineError> {
    let mut row = row.clone();
    for (legacy, canonical) in COLUMN_ALIASES {
        if let Some(v) = row.remove(legacy) {
            row.entry(canonical.to_string()).or_insert(v);
        }
    }

    let id = cell_text(&row, "id");
    if id.is_empty() {
        return Err(EngineError::invariant("row has no id"));
    }
    let connector = cell_text(&row, "connector").to_ascii_uppercase();
    if connector.is_empty() {
        return Err(EngineError::invariant(format!("request {} has no connector", id)));
    }

    let priority = match cell_text(&row, "priority") {
        s if s.is_empty() => 100,
        s => s
            .parse::<f64>()
            .map(|p| p as i64)
            .map_err(|_| EngineError::invariant(format!("request {} has priority '{}'", id, s)))?,
    };

    let upsert_keys = list_cell(&row, "upsert_keys");
    let merge_strategy = match cell_text(&row, "merge_strategy") {
        s if s.is_empty() && !upsert_keys.is_empty() => MergeStrategy::UpsertByKey,
        s if s.is_empty() => MergeStrategy::Append,
        s => s.parse()?,
    };
    let run_mode = match cell_text(&row, "run_mode") {
        s if s.is_empty() => RunMode::Always,
        s => s.parse()?,
    };

    let params = match row.get("params") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(Value::String(s)) if s.trim().is_empty() => Value::Object(Default::default()),
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
        }
        Some(v) => v.clone(),
    };

    let extra: Row = row
        .iter()
        .filter(|(k, _)| !CATALOG_COLUMNS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(Request {
        id,
        enabled: cell_bool(&row, "enabled").unwrap_or(true),
        priority,
        connector,
        purpose: cell_text(&row, "purpose"),
        params,
        target_table: cell_text(&row, "target_table"),
        merge_strategy,
        upsert_keys,
        run_mode,
        last_run_at: parse_timestamp(&cell_text(&row, "last_run_at")),
        last_evidence_ids: list_cell(&row, "last_evidence_ids"),
        source_tag: cell_text(&row, "source_tag"),
        note: cell_text(&row, "note"),
        extra,
    })
}

fn request_to_row(r: &Request) -> Row {
    let mut row = Row::new();
    row.insert("id".into(), Value::String(r.id.clone()));
    row.insert("enabled".into(), Value::Bool(r.enabled));
    row.insert("priority".into(), Value::from(r.priority));
    row.insert("connector".into(), Value::String(r.connector.clone()));
    row.insert("purpose".into(), Value::String(r.purpose.clone()));
    row.insert("params".into(), r.params.clone());
    row.insert("target_table".into(), Value::String(r.target_table.clone()));
    row.insert(
        "merge_strategy".into(),
        Value::String(r.merge_strategy.as_str().to_string()),
    );
    row.insert("upsert_keys".into(), Value::String(r.upsert_keys.join(";")));
    row.insert("run_mode".into(), Value::String(r.run_mode.as_str().to_string()));
    row.insert(
        "last_run_at".into(),
        r.last_run_at
            .map(|t| Value::String(t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)))
            .unwrap_or(Value::Null),
    );
    row.insert(
        "last_evidence_ids".into(),
        Value::String(r.last_evidence_ids.join(";")),
    );
    row.insert("source_tag".into(), Value::String(r.source_tag.clone()));
    row.insert("note".into(), Value::String(r.note.clone()));
    for (k, v) in &r.extra {
        row.entry(k.clone()).or_insert_with(|| v.clone());
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(rows: Vec<Value>) -> Table {
        let mut t = Table::new();
        for r in rows {
            t.push_row(r.as_object().cloned().unwrap());
        }
        t
    }

    #[test]
    fn load_orders_by_priority_then_id() {
        let t = table(vec![
            json!({"id": "B", "connector": "WMS", "priority": 10}),
            json!({"id": "A", "connector": "WMS", "priority": "10"}),
            json!({"id": "C", "connector": "WMS", "priority": 5}),
        ]);
        let cat = RequestCatalog::from_table(&t).unwrap();
        assert_eq!(cat.ids(), vec!["C", "A", "B"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let t = table(vec![
            json!({"id": "A", "connector": "WMS"}),
            json!({"id": "A", "connector": "KOSIS"}),
        ]);
        let err = RequestCatalog::from_table(&t).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn unknown_columns_survive_a_round_trip() {
        let t = table(vec![json!({
            "id": "A", "connector": "wms", "reviewer": "kim", "params_json": "{\"layer_key\":\"X\"}"
        })]);
        let cat = RequestCatalog::from_table(&t).unwrap();
        let req = cat.get("A").unwrap();
        assert_eq!(req.connector, "WMS");
        assert_eq!(req.params["layer_key"], "X");
        assert_eq!(req.extra["reviewer"], "kim");

        let back = RequestCatalog::from_table(&cat.to_table()).unwrap();
        assert_eq!(back, cat);
    }

    #[test]
    fn defaults_and_list_cells() {
        let t = table(vec![json!({
            "id": "A", "connector": "AUTO_GIS", "upsert_keys": "overlay_id; feature_id",
            "last_evidence_ids": "EV-1;EV-2", "last_run_at": "2025-01-02 03:04:05"
        })]);
        let cat = RequestCatalog::from_table(&t).unwrap();
        let r = cat.get("A").unwrap();
        assert!(r.enabled);
        assert_eq!(r.priority, 100);
        assert_eq!(r.run_mode, RunMode::Always);
        assert_eq!(r.merge_strategy, MergeStrategy::UpsertByKey);
        assert_eq!(r.upsert_keys, vec!["overlay_id", "feature_id"]);
        assert_eq!(r.last_evidence_ids, vec!["EV-1", "EV-2"]);
        assert!(r.last_run_at.is_some());
    }

    #[test]
    fn blank_rows_are_ignored_but_idless_rows_fail() {
        let t = table(vec![json!({"id": "", "connector": ""}), json!({"id": "A", "connector": "WMS"})]);
        assert_eq!(RequestCatalog::from_table(&t).unwrap().len(), 1);

        let bad = table(vec![json!({"connector": "WMS", "note": "orphan"})]);
        assert!(RequestCatalog::from_table(&bad).is_err());
    }

    #[test]
    fn upsert_replaces_by_id_and_inserts_new() {
        let mut cat = RequestCatalog::from_requests(vec![Request::new("A", "WMS")]).unwrap();
        let mut a = Request::new("A", "WMS");
        a.note = "edited".into();
        let mut b = Request::new("B", "KOSIS");
        b.priority = 1;
        cat.upsert_by_key(vec![a, b]).unwrap();
        assert_eq!(cat.ids(), vec!["B", "A"]);
        assert_eq!(cat.get("A").unwrap().note, "edited");
    }

    #[test]
    fn record_run_sets_status_fields() {
        let mut cat = RequestCatalog::from_requests(vec![Request::new("A", "WMS")]).unwrap();
        cat.record_run("A", Utc::now(), vec!["EV-A".into()]).unwrap();
        assert!(cat.get("A").unwrap().has_run());
        assert!(cat.record_run("Z", Utc::now(), vec![]).is_err());
    }
}
