//! Core data models used throughout the harness.
//!
//! Tables are the unit of persistence: the request catalog, the evidence
//! index, and every connector output table are all [`Table`]s of loosely
//! typed [`Row`]s inside one case snapshot. Typed views ([`Request`],
//! [`Evidence`]) are parsed from and written back to those rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Table holding the request catalog.
pub const REQUESTS_TABLE: &str = "DATA_REQUESTS";
/// Table holding the evidence index.
pub const EVIDENCE_TABLE: &str = "EVIDENCE";
/// Table holding project location fields.
pub const LOCATION_TABLE: &str = "LOCATION";

/// Marker embedded in artifact refs of generated placeholder evidence.
pub const PLACEHOLDER_MARKER: &str = "__PLACEHOLDER__";
/// Marker embedded in artifact refs of fallback evidence built from a local file.
pub const FALLBACK_MARKER: &str = "__FALLBACK__";

/// One record of a case table, keyed by column name.
pub type Row = Map<String, Value>;

/// A named-column table. Column order is first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn ensure_column(&mut self, name: &str) {
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
    }

    /// Append a row, registering any new columns it introduces.
    pub fn push_row(&mut self, row: Row) {
        for key in row.keys() {
            if !self.columns.iter().any(|c| c == key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }
}

/// Render a cell as trimmed text. Null and missing cells are empty.
pub fn cell_text(row: &Row, key: &str) -> String {
    match row.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Bool(b)) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn cell_f64(row: &Row, key: &str) -> Option<f64> {
    match row.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Spreadsheet-style boolean: `TRUE`, `Y`, `YES`, `1`, `O` are true.
pub fn cell_bool(row: &Row, key: &str) -> Option<bool> {
    match row.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => {
            let s = s.trim().to_ascii_uppercase();
            if s.is_empty() {
                None
            } else {
                Some(matches!(s.as_str(), "TRUE" | "T" | "Y" | "YES" | "1" | "O"))
            }
        }
        _ => None,
    }
}

/// Policy for combining connector output with an existing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    ReplaceAll,
    UpsertByKey,
    Append,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::ReplaceAll => "REPLACE_ALL",
            MergeStrategy::UpsertByKey => "UPSERT_BY_KEY",
            MergeStrategy::Append => "APPEND",
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REPLACE_ALL" | "REPLACE" | "REPLACE_SHEET" => Ok(MergeStrategy::ReplaceAll),
            "UPSERT_BY_KEY" | "UPSERT" | "UPSERT_KEYS" => Ok(MergeStrategy::UpsertByKey),
            "APPEND" => Ok(MergeStrategy::Append),
            other => Err(EngineError::config(format!(
                "unknown merge_strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a request is eligible for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMode {
    Always,
    Once,
    Never,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Always => "ALWAYS",
            RunMode::Once => "ONCE",
            RunMode::Never => "NEVER",
        }
    }
}

impl FromStr for RunMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALWAYS" | "AUTO" => Ok(RunMode::Always),
            "ONCE" => Ok(RunMode::Once),
            "NEVER" | "MANUAL" => Ok(RunMode::Never),
            other => Err(EngineError::config(format!("unknown run_mode '{}'", other))),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an evidence payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OriginClass {
    OfficialSource,
    ModelDerived,
    UserSupplied,
    FallbackPlaceholder,
}

impl OriginClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginClass::OfficialSource => "OFFICIAL_SOURCE",
            OriginClass::ModelDerived => "MODEL_DERIVED",
            OriginClass::UserSupplied => "USER_SUPPLIED",
            OriginClass::FallbackPlaceholder => "FALLBACK_PLACEHOLDER",
        }
    }
}

impl FromStr for OriginClass {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFFICIAL_SOURCE" | "OFFICIAL_DB" => Ok(OriginClass::OfficialSource),
            "MODEL_DERIVED" => Ok(OriginClass::ModelDerived),
            "USER_SUPPLIED" | "CLIENT_PROVIDED" => Ok(OriginClass::UserSupplied),
            "FALLBACK_PLACEHOLDER" => Ok(OriginClass::FallbackPlaceholder),
            other => Err(EngineError::invariant(format!(
                "unknown origin_class '{}'",
                other
            ))),
        }
    }
}

/// A unit of declarative work in the request catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub enabled: bool,
    pub priority: i64,
    /// Connector kind name, e.g. `KMA_ASOS` or `AUTO_GIS`.
    pub connector: String,
    pub purpose: String,
    /// Connector-specific parameters, kept as JSON until dispatch.
    pub params: Value,
    pub target_table: String,
    pub merge_strategy: MergeStrategy,
    pub upsert_keys: Vec<String>,
    pub run_mode: RunMode,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_evidence_ids: Vec<String>,
    pub source_tag: String,
    pub note: String,
    /// Columns this version does not know about, kept for round-tripping.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Row,
}

impl Request {
    /// A request with catalog defaults: enabled, priority 100, ALWAYS, APPEND.
    pub fn new(id: impl Into<String>, connector: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            priority: 100,
            connector: connector.into(),
            purpose: String::new(),
            params: Value::Object(Map::new()),
            target_table: String::new(),
            merge_strategy: MergeStrategy::Append,
            upsert_keys: Vec::new(),
            run_mode: RunMode::Always,
            last_run_at: None,
            last_evidence_ids: Vec::new(),
            source_tag: String::new(),
            note: String::new(),
            extra: Row::new(),
        }
    }

    pub fn has_run(&self) -> bool {
        self.last_run_at.is_some()
    }

    /// Whether the catalog would dispatch this request at all.
    pub fn is_dispatchable(&self) -> bool {
        self.enabled && self.run_mode != RunMode::Never
    }

    /// UPSERT_BY_KEY needs at least one key column.
    pub fn check_merge_config(&self) -> Result<(), EngineError> {
        if self.merge_strategy == MergeStrategy::UpsertByKey
            && self.upsert_keys.iter().all(|k| k.trim().is_empty())
        {
            return Err(EngineError::config(format!(
                "request {} uses UPSERT_BY_KEY without upsert_keys",
                self.id
            )));
        }
        Ok(())
    }

    /// The citation tag for output rows, with a neutral default.
    pub fn source_tag_or_default(&self) -> &str {
        if self.source_tag.trim().is_empty() {
            "S-TBD"
        } else {
            self.source_tag.trim()
        }
    }
}

/// An immutable provenance record backing written values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub evidence_id: String,
    pub kind: String,
    pub title: String,
    /// Path of the stored payload, relative to the case root.
    pub artifact_ref: String,
    pub produced_by: String,
    pub origin_class: OriginClass,
    pub source_tag: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Evidence {
    /// Degrade-path output: generated placeholders and local fallback files.
    pub fn is_placeholder(&self) -> bool {
        self.origin_class == OriginClass::FallbackPlaceholder
            || [PLACEHOLDER_MARKER, FALLBACK_MARKER].iter().any(|m| {
                self.artifact_ref.contains(m) || self.title.contains(m) || self.kind.contains(m)
            })
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("evidence_id".into(), Value::String(self.evidence_id.clone()));
        row.insert("kind".into(), Value::String(self.kind.clone()));
        row.insert("title".into(), Value::String(self.title.clone()));
        row.insert("artifact_ref".into(), Value::String(self.artifact_ref.clone()));
        row.insert("produced_by".into(), Value::String(self.produced_by.clone()));
        row.insert(
            "origin_class".into(),
            Value::String(self.origin_class.as_str().to_string()),
        );
        row.insert("source_tag".into(), Value::String(self.source_tag.clone()));
        row.insert("metadata".into(), self.metadata.clone());
        row.insert(
            "created_at".into(),
            Value::String(self.created_at.to_rfc3339()),
        );
        row
    }

    pub fn from_row(row: &Row) -> Result<Self, EngineError> {
        let evidence_id = cell_text(row, "evidence_id");
        if evidence_id.is_empty() {
            return Err(EngineError::invariant("evidence row without evidence_id"));
        }
        let metadata = match row.get("metadata") {
            Some(Value::String(s)) if !s.trim().is_empty() => {
                serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
            }
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(v) => v.clone(),
        };
        let created_at = DateTime::parse_from_rfc3339(&cell_text(row, "created_at"))
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default();
        let origin = cell_text(row, "origin_class");
        Ok(Self {
            evidence_id,
            kind: cell_text(row, "kind"),
            title: cell_text(row, "title"),
            artifact_ref: cell_text(row, "artifact_ref"),
            produced_by: cell_text(row, "produced_by"),
            origin_class: if origin.is_empty() {
                OriginClass::OfficialSource
            } else {
                origin.parse()?
            },
            source_tag: cell_text(row, "source_tag"),
            metadata,
            created_at,
        })
    }
}

/// Overlay classification of a region against a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Applicability {
    Intersects,
    Disjoint,
    Indeterminate,
}

impl Applicability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Applicability::Intersects => "INTERSECTS",
            Applicability::Disjoint => "DISJOINT",
            Applicability::Indeterminate => "INDETERMINATE",
        }
    }
}

/// Outcome of one region/feature overlay analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayResult {
    pub feature_id: String,
    pub applicability: Applicability,
    /// Meters, rounded to 0.1. Only set when disjoint and measurable.
    pub distance_m: Option<f64>,
    /// One of the 8 compass points, or `-`.
    pub bearing: String,
    pub basis: String,
    pub overlap_area_m2: Option<f64>,
}

impl OverlayResult {
    pub fn indeterminate(feature_id: impl Into<String>, basis: impl Into<String>) -> Self {
        Self {
            feature_id: feature_id.into(),
            applicability: Applicability::Indeterminate,
            distance_m: None,
            bearing: "-".to_string(),
            basis: basis.into(),
            overlap_area_m2: None,
        }
    }
}
