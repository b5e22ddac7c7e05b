//! Evidence recording and health checks.
//!
//! Every connector result is backed by an artifact on disk under
//! `{case}/attachments/evidence/{api,wms,gis,calc,pdf}/` and an
//! [`Evidence`] row pointing at it. The recorder allocates unique
//! evidence ids, writes artifacts, hashes them, and later answers whether
//! a recorded artifact is still usable (the ONCE health check).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use datareq_harness_core::error::EngineError;
use datareq_harness_core::models::{
    cell_text, Evidence, OriginClass, Request, Row,
};
use datareq_harness_core::store::CaseSnapshot;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::sanitize::strip_secrets;

/// Root of all artifacts, relative to the case directory.
pub const EVIDENCE_ROOT: &str = "attachments/evidence";

/// Artifact category, one subdirectory each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactDir {
    Api,
    Wms,
    Gis,
    Calc,
    Pdf,
}

impl ArtifactDir {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactDir::Api => "api",
            ArtifactDir::Wms => "wms",
            ArtifactDir::Gis => "gis",
            ArtifactDir::Calc => "calc",
            ArtifactDir::Pdf => "pdf",
        }
    }
}

/// What a connector hands the recorder to turn into evidence.
pub struct ArtifactSpec<'a> {
    pub evidence_id: &'a str,
    pub request: &'a Request,
    pub dir: ArtifactDir,
    pub file_name: String,
    pub bytes: &'a [u8],
    pub kind: &'a str,
    pub title: String,
    pub origin: OriginClass,
    pub metadata: Map<String, Value>,
}

pub struct EvidenceRecorder {
    case_root: PathBuf,
    issued: Mutex<HashSet<String>>,
    /// Artifacts written by this recorder, not yet known to be committed.
    written: Mutex<Vec<PathBuf>>,
}

impl EvidenceRecorder {
    pub fn new(case_root: impl Into<PathBuf>) -> Self {
        Self {
            case_root: case_root.into(),
            issued: Mutex::new(HashSet::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn case_root(&self) -> &Path {
        &self.case_root
    }

    /// Absolute path of an `artifact_ref`.
    pub fn resolve(&self, artifact_ref: &str) -> PathBuf {
        let p = Path::new(artifact_ref);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.case_root.join(p)
        }
    }

    /// `EV-{request}-{YYYYmmdd-HHMMSS}`, suffixed `-2`, `-3`, ... when the
    /// id is already recorded or was issued earlier in this process.
    pub fn allocate_id(
        &self,
        request_id: &str,
        now: DateTime<Utc>,
        snapshot: &CaseSnapshot,
    ) -> Result<String, EngineError> {
        let base = format!("EV-{}-{}", request_id, now.format("%Y%m%d-%H%M%S"));
        let mut issued = self
            .issued
            .lock()
            .map_err(|_| EngineError::invariant("evidence id registry poisoned"))?;
        let mut candidate = base.clone();
        let mut n = 2;
        while issued.contains(&candidate) || snapshot.has_evidence_id(&candidate) {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        issued.insert(candidate.clone());
        Ok(candidate)
    }

    /// Write an artifact and build its evidence row.
    pub fn record(&self, spec: ArtifactSpec<'_>) -> Result<Evidence, EngineError> {
        if spec.bytes.is_empty() {
            return Err(EngineError::data_quality(format!(
                "refusing to record empty artifact {}",
                spec.file_name
            )));
        }
        let rel = format!(
            "{}/{}/{}",
            EVIDENCE_ROOT,
            spec.dir.as_str(),
            safe_file_name(&spec.file_name)
        );
        let abs = self.resolve(&rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::invariant(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(&abs, spec.bytes)
            .map_err(|e| EngineError::invariant(format!("cannot write {}: {}", abs.display(), e)))?;
        self.written
            .lock()
            .map_err(|_| EngineError::invariant("artifact registry poisoned"))?
            .push(abs);

        let now = Utc::now();
        let mut metadata = Map::new();
        metadata.insert("retrieved_at".into(), Value::String(now.to_rfc3339()));
        metadata.insert("sha256".into(), Value::String(sha256_hex(spec.bytes)));
        metadata.insert("size_bytes".into(), Value::from(spec.bytes.len() as u64));
        metadata.insert(
            "connector".into(),
            Value::String(spec.request.connector.clone()),
        );
        for (k, v) in spec.metadata {
            metadata.insert(k, v);
        }

        Ok(Evidence {
            evidence_id: spec.evidence_id.to_string(),
            kind: spec.kind.to_string(),
            title: spec.title,
            artifact_ref: rel,
            produced_by: spec.request.id.clone(),
            origin_class: spec.origin,
            source_tag: spec.request.source_tag_or_default().to_string(),
            metadata: strip_secrets(&Value::Object(metadata)),
            created_at: now,
        })
    }

    /// Delete every artifact this recorder wrote. Called when the run's
    /// snapshot will not be committed, so no evidence row can refer to them.
    /// Returns how many files were removed.
    pub fn discard_written(&self) -> usize {
        let Ok(mut written) = self.written.lock() else {
            return 0;
        };
        let mut removed = 0;
        for path in written.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), "cannot remove uncommitted artifact: {}", e),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "removed uncommitted artifacts");
        }
        removed
    }

    /// Why an evidence record is unusable, or `Ok` when it is healthy.
    ///
    /// Uniform across kinds: the row exists, points at a non-empty file
    /// that is not a placeholder, and the payload parses for its format.
    pub fn check_health(&self, snapshot: &CaseSnapshot, evidence_id: &str) -> Result<(), String> {
        let ev = snapshot
            .find_evidence(evidence_id)
            .ok_or_else(|| format!("evidence {} not recorded", evidence_id))?;
        if ev.artifact_ref.trim().is_empty() {
            return Err(format!("evidence {} has no artifact", evidence_id));
        }
        if ev.is_placeholder() {
            return Err(format!("evidence {} is a placeholder", evidence_id));
        }
        let path = self.resolve(&ev.artifact_ref);
        let bytes = std::fs::read(&path)
            .map_err(|_| format!("artifact {} is missing", ev.artifact_ref))?;
        if bytes.is_empty() {
            return Err(format!("artifact {} is empty", ev.artifact_ref));
        }
        check_payload(&path, &bytes).map_err(|why| format!("artifact {} {}", ev.artifact_ref, why))
    }
}

fn check_payload(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "webp" => image::load_from_memory(bytes)
            .map(|_| ())
            .map_err(|e| format!("does not decode as an image: {}", e)),
        "json" => serde_json::from_slice::<Value>(bytes)
            .map(|_| ())
            .map_err(|e| format!("is not valid JSON: {}", e)),
        "csv" => {
            let text = std::str::from_utf8(bytes).map_err(|_| "is not UTF-8".to_string())?;
            if csv_is_consistent(text) {
                Ok(())
            } else {
                Err("is not a consistent CSV".to_string())
            }
        }
        "pdf" => {
            if bytes.starts_with(b"%PDF-") {
                Ok(())
            } else {
                Err("is not a PDF".to_string())
            }
        }
        _ => Ok(()),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Keep `[A-Za-z0-9._-]`, replace the rest with `_`.
pub fn safe_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn pretty_json(value: &Value) -> Vec<u8> {
    serde_json::to_vec_pretty(value).unwrap_or_else(|_| value.to_string().into_bytes())
}

// ═══════════════════════════════════════════════════════════════════════
// CSV
// ═══════════════════════════════════════════════════════════════════════

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Render rows under a fixed header. Missing cells are empty.
pub fn to_csv(columns: &[&str], rows: &[Row]) -> String {
    let mut out = columns.iter().map(|c| csv_field(c)).collect::<Vec<_>>().join(",");
    out.push('\n');
    for row in rows {
        let line = columns
            .iter()
            .map(|c| csv_field(&cell_text(row, c)))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Parse RFC 4180-style CSV into records.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                other => field.push(other),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            other => field.push(other),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}

/// A header plus records that all have the header's field count.
pub fn csv_is_consistent(text: &str) -> bool {
    let records = parse_csv(text);
    let Some(header) = records.first() else {
        return false;
    };
    if header.iter().all(|h| h.trim().is_empty()) {
        return false;
    }
    records.iter().all(|r| r.len() == header.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datareq_harness_core::models::EVIDENCE_TABLE;
    use serde_json::json;
    use tempfile::TempDir;

    fn request() -> Request {
        let mut r = Request::new("REQ-1", "KMA_ASOS");
        r.source_tag = "S-01".into();
        r
    }

    fn record(rec: &EvidenceRecorder, id: &str, name: &str, bytes: &[u8]) -> Evidence {
        let req = request();
        rec.record(ArtifactSpec {
            evidence_id: id,
            request: &req,
            dir: ArtifactDir::Api,
            file_name: name.to_string(),
            bytes,
            kind: "api_response",
            title: "t".into(),
            origin: OriginClass::OfficialSource,
            metadata: json!({"request_url": "http://x/?serviceKey=abc"})
                .as_object()
                .cloned()
                .unwrap(),
        })
        .unwrap()
    }

    #[test]
    fn ids_get_suffixes_on_collision() {
        let tmp = TempDir::new().unwrap();
        let rec = EvidenceRecorder::new(tmp.path());
        let now = DateTime::parse_from_rfc3339("2026-03-01T10:20:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut snap = CaseSnapshot::new();
        snap.table_mut(EVIDENCE_TABLE).push_row(
            json!({"evidence_id": "EV-REQ-1-20260301-102030"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(rec.allocate_id("REQ-1", now, &snap).unwrap(), "EV-REQ-1-20260301-102030-2");
        assert_eq!(rec.allocate_id("REQ-1", now, &snap).unwrap(), "EV-REQ-1-20260301-102030-3");
        assert_eq!(rec.allocate_id("REQ-2", now, &snap).unwrap(), "EV-REQ-2-20260301-102030");
    }

    #[test]
    fn discarding_removes_only_this_recorders_files() {
        let tmp = TempDir::new().unwrap();
        let committed = EvidenceRecorder::new(tmp.path());
        let kept = record(&committed, "EV-0", "EV-0_kma.json", b"{}");

        let rec = EvidenceRecorder::new(tmp.path());
        let a = record(&rec, "EV-1", "EV-1_kma.json", b"{}");
        let b = record(&rec, "EV-2", "EV-2_kma.json", b"{}");
        std::fs::remove_file(rec.resolve(&b.artifact_ref)).unwrap();

        assert_eq!(rec.discard_written(), 1);
        assert!(!rec.resolve(&a.artifact_ref).exists());
        assert!(committed.resolve(&kept.artifact_ref).exists());
        assert_eq!(rec.discard_written(), 0);
    }

    #[test]
    fn record_writes_artifact_and_redacts_metadata() {
        let tmp = TempDir::new().unwrap();
        let rec = EvidenceRecorder::new(tmp.path());
        let ev = record(&rec, "EV-1", "EV-1_kma.json", b"{\"a\":1}");
        assert_eq!(ev.artifact_ref, "attachments/evidence/api/EV-1_kma.json");
        assert!(tmp.path().join(&ev.artifact_ref).exists());
        assert_eq!(ev.source_tag, "S-01");
        assert_eq!(ev.metadata["request_url"], "http://x/?serviceKey=***");
        assert_eq!(ev.metadata["sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn health_check_covers_each_failure() {
        let tmp = TempDir::new().unwrap();
        let rec = EvidenceRecorder::new(tmp.path());
        let mut snap = CaseSnapshot::new();

        let good = record(&rec, "EV-GOOD", "good.json", b"{}");
        let bad_json = record(&rec, "EV-BADJ", "bad.json", b"{oops");
        let bad_csv = record(&rec, "EV-BADC", "bad.csv", b"a,b\n1\n");
        let gone = record(&rec, "EV-GONE", "gone.json", b"{}");
        let ph = record(&rec, "EV-PH", "x__PLACEHOLDER__.png", b"whatever");
        for ev in [&good, &bad_json, &bad_csv, &gone, &ph] {
            snap.append_evidence(ev).unwrap();
        }
        std::fs::remove_file(tmp.path().join(&gone.artifact_ref)).unwrap();

        assert!(rec.check_health(&snap, "EV-GOOD").is_ok());
        assert!(rec.check_health(&snap, "EV-BADJ").unwrap_err().contains("JSON"));
        assert!(rec.check_health(&snap, "EV-BADC").unwrap_err().contains("CSV"));
        assert!(rec.check_health(&snap, "EV-GONE").unwrap_err().contains("missing"));
        assert!(rec.check_health(&snap, "EV-PH").unwrap_err().contains("placeholder"));
        assert!(rec.check_health(&snap, "EV-NOPE").unwrap_err().contains("not recorded"));
    }

    #[test]
    fn csv_round_trip_with_quotes() {
        let rows: Vec<Row> = vec![json!({"a": "x,y", "b": "say \"hi\""})
            .as_object()
            .cloned()
            .unwrap()];
        let text = to_csv(&["a", "b"], &rows);
        assert!(csv_is_consistent(&text));
        let parsed = parse_csv(&text);
        assert_eq!(parsed[1], vec!["x,y".to_string(), "say \"hi\"".to_string()]);
    }

    #[test]
    fn safe_names() {
        assert_eq!(safe_file_name("EV-1_a b/c.png"), "EV-1_a_b_c.png");
    }
}
