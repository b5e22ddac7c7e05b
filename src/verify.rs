//! Single-connector pre-flight checks (`drq verify`).
//!
//! Verification talks to the source with a minimal query and reports
//! whether credentials and endpoint work. It never records evidence and
//! never writes the catalog.

use anyhow::{bail, Result};
use chrono::Utc;

use datareq_harness_core::catalog::RequestCatalog;
use datareq_harness_core::error::EngineError;
use datareq_harness_core::store::{CaseSnapshot, CaseStore};

use crate::cache::MapCache;
use crate::config::Config;
use crate::evidence::EvidenceRecorder;
use crate::http::HttpClient;
use crate::sanitize::redact_text;
use crate::sqlite_store::SqliteCaseStore;
use crate::traits::{ConnectorRegistry, RunContext};

/// Verify one connector, optionally with a catalog request's parameters.
pub async fn verify_connector(
    registry: &ConnectorRegistry,
    config: &Config,
    snapshot: &CaseSnapshot,
    name: &str,
    request_id: Option<&str>,
) -> Result<String, EngineError> {
    let connector = registry.get(name).ok_or_else(|| {
        EngineError::config(format!(
            "unknown connector '{}' (available: {})",
            name,
            registry.names().join(", ")
        ))
    })?;

    let catalog = RequestCatalog::load(snapshot)?;
    let request = match request_id {
        Some(id) => {
            let r = catalog
                .get(id)
                .ok_or_else(|| EngineError::config(format!("request {} not in catalog", id)))?;
            if !r.connector.eq_ignore_ascii_case(connector.name()) {
                return Err(EngineError::config(format!(
                    "request {} uses connector {}, not {}",
                    id,
                    r.connector,
                    connector.name()
                )));
            }
            Some(r)
        }
        None => None,
    };

    let http = HttpClient::new(&config.http).map_err(|e| EngineError::config(e.to_string()))?;
    let cache = MapCache::from_config(config);
    let recorder = EvidenceRecorder::new(config.case_root());
    let ctx = RunContext {
        config,
        snapshot,
        catalog: &catalog,
        recorder: &recorder,
        http: &http,
        cache: &cache,
        now: Utc::now(),
    };
    connector.verify(request, &ctx).await
}

/// `drq verify`.
pub async fn run_verify(config: &Config, name: &str, request_id: Option<&str>) -> Result<()> {
    let store = SqliteCaseStore::open(config).await?;
    let snapshot = store.load().await?;
    let registry = ConnectorRegistry::with_builtins();

    let names: Vec<String> = if name.eq_ignore_ascii_case("all") {
        registry.names()
    } else {
        vec![name.to_ascii_uppercase()]
    };

    println!("{:<10} {:<6} DETAIL", "CONNECTOR", "STATUS");
    let mut failures = 0;
    for n in &names {
        match verify_connector(&registry, config, &snapshot, n, request_id).await {
            Ok(detail) => println!("{:<10} {:<6} {}", n, "OK", detail),
            Err(e) => {
                failures += 1;
                tracing::debug!(connector = %n, kind = e.kind().as_str(), "verify failed");
                println!("{:<10} {:<6} {}", n, "FAIL", redact_text(&e.to_string()));
            }
        }
    }
    if failures > 0 {
        bail!("{} of {} connector(s) failed verification", failures, names.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datareq_harness_core::models::Request;

    fn snapshot_with(requests: Vec<Request>) -> CaseSnapshot {
        let mut snap = CaseSnapshot::new();
        RequestCatalog::from_requests(requests).unwrap().save(&mut snap);
        snap
    }

    #[tokio::test]
    async fn unknown_connector_lists_available() {
        let registry = ConnectorRegistry::with_builtins();
        let err = verify_connector(&registry, &Config::minimal(), &CaseSnapshot::new(), "FTP", None)
            .await
            .unwrap_err();
        assert!(err.message().contains("KMA_ASOS"));
    }

    #[tokio::test]
    async fn request_must_match_connector() {
        let registry = ConnectorRegistry::with_builtins();
        let snap = snapshot_with(vec![Request::new("REQ-PDF", "PDF_PAGE")]);
        let err = verify_connector(&registry, &Config::minimal(), &snap, "KOSIS", Some("REQ-PDF"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.message().contains("uses connector PDF_PAGE"));

        let err = verify_connector(&registry, &Config::minimal(), &snap, "KOSIS", Some("REQ-NOPE"))
            .await
            .unwrap_err();
        assert!(err.message().contains("not in catalog"));
    }

    #[tokio::test]
    async fn verify_never_writes_the_snapshot() {
        let registry = ConnectorRegistry::with_builtins();
        let snap = snapshot_with(vec![Request::new("REQ-PDF", "PDF_PAGE")]);
        let before = snap.clone();
        let _ = verify_connector(&registry, &Config::minimal(), &snap, "PDF_PAGE", None).await;
        assert_eq!(snap, before);
    }
}
