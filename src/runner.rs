//! Request execution.
//!
//! Walks the catalog in `(priority, id)` order, one request at a time,
//! against a single in-memory snapshot that is committed once at the end.
//! Per request: decide whether it is due, dispatch to its connector, merge
//! the output and append evidence, or fall back to the connector's degrade
//! path. A failing request never stops the others; only an invariant
//! violation aborts the run. Then nothing is committed and the artifacts
//! written so far are deleted.

use anyhow::Result;
use chrono::{DateTime, SubsecRound, Utc};

use datareq_harness_core::catalog::RequestCatalog;
use datareq_harness_core::error::EngineError;
use datareq_harness_core::merge::apply_rows;
use datareq_harness_core::models::{Request, RunMode, EVIDENCE_TABLE, REQUESTS_TABLE};
use datareq_harness_core::params::{raw_upstream_ids, RequestParams};
use datareq_harness_core::store::{CaseSnapshot, CaseStore};

use crate::cache::MapCache;
use crate::config::Config;
use crate::evidence::EvidenceRecorder;
use crate::http::HttpClient;
use crate::progress::{ProgressMode, RunProgressEvent, RunProgressReporter};
use crate::report::{print_summary, write_report, OutcomeStatus, RequestOutcome, RunSummary};
use crate::sanitize::redact_text;
use crate::sqlite_store::SqliteCaseStore;
use crate::traits::{Connector, ConnectorOutput, ConnectorRegistry, RunContext};

/// Caller-side knobs for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to these request ids. Empty means all.
    pub only: Vec<String>,
}

/// Whether a request should be dispatched this run.
#[derive(Debug, PartialEq)]
enum Due {
    Run { warning: Option<String> },
    Skip(String),
}

const MAX_REASON_CHARS: usize = 200;

/// A redacted single-line reason for the summary table.
fn one_line(err: &EngineError) -> String {
    let text = redact_text(&err.to_string());
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() > MAX_REASON_CHARS {
        let cut: String = line.chars().take(MAX_REASON_CHARS).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

struct RunState<'a> {
    config: &'a Config,
    registry: &'a ConnectorRegistry,
    http: HttpClient,
    cache: MapCache,
    recorder: EvidenceRecorder,
    snapshot: CaseSnapshot,
    catalog: RequestCatalog,
    warnings: Vec<String>,
}

impl<'a> RunState<'a> {
    fn context(&self, now: DateTime<Utc>) -> RunContext<'_> {
        RunContext {
            config: self.config,
            snapshot: &self.snapshot,
            catalog: &self.catalog,
            recorder: &self.recorder,
            http: &self.http,
            cache: &self.cache,
            now,
        }
    }

    /// An upstream request that ran after `request` last did.
    fn newer_upstream(&self, request: &Request) -> Option<String> {
        raw_upstream_ids(&request.params).into_iter().find(|up| {
            match (
                self.catalog.get(up).and_then(|u| u.last_run_at),
                request.last_run_at,
            ) {
                (Some(upstream), Some(own)) => upstream > own,
                _ => false,
            }
        })
    }

    fn check_due(&self, request: &Request) -> Due {
        if !request.enabled {
            return Due::Skip("disabled".into());
        }
        match request.run_mode {
            RunMode::Never => Due::Skip("run_mode NEVER".into()),
            RunMode::Always => Due::Run { warning: None },
            RunMode::Once if !request.has_run() => Due::Run { warning: None },
            RunMode::Once => {
                if let Some(up) = self.newer_upstream(request) {
                    return Due::Run {
                        warning: Some(format!(
                            "[{}] upstream {} has newer evidence; re-running",
                            request.id, up
                        )),
                    };
                }
                let problem = if request.last_evidence_ids.is_empty() {
                    Some("no evidence recorded".to_string())
                } else {
                    request
                        .last_evidence_ids
                        .iter()
                        .find_map(|id| self.recorder.check_health(&self.snapshot, id).err())
                };
                match problem {
                    None => Due::Skip("ONCE: evidence healthy".into()),
                    Some(why) => Due::Run {
                        warning: Some(format!(
                            "[{}] ONCE request has missing/invalid evidence; re-running ({})",
                            request.id, why
                        )),
                    },
                }
            }
        }
    }

    /// Merge output rows, append evidence, then close the loop on the
    /// catalog row. The target table is staged on a copy so a merge error
    /// leaves the snapshot untouched.
    fn apply(
        &mut self,
        request: &Request,
        connector: &dyn Connector,
        output: ConnectorOutput,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, EngineError> {
        let table_name = match request.target_table.trim() {
            "" => connector.default_target_table().to_string(),
            t => t.to_string(),
        };
        if table_name == EVIDENCE_TABLE || table_name == REQUESTS_TABLE {
            return Err(EngineError::config(format!(
                "target_table {} is reserved",
                table_name
            )));
        }

        let ids = output.evidence_ids();
        let mut table = self.snapshot.table(&table_name).cloned().unwrap_or_default();
        let merge_warnings = apply_rows(
            &mut table,
            output.rows,
            request.merge_strategy,
            &request.upsert_keys,
        )?;
        for ev in &output.evidence {
            self.snapshot.append_evidence(ev)?;
        }
        self.snapshot.put_table(&table_name, table);
        self.catalog.record_run(&request.id, now, ids.clone())?;

        for w in output.warnings.iter().chain(merge_warnings.iter()) {
            self.warnings.push(format!("[{}] {}", request.id, w));
        }
        Ok(ids)
    }

    async fn process(&mut self, request: &Request) -> Result<RequestOutcome, EngineError> {
        let outcome = |status, reason: String, evidence_ids| RequestOutcome {
            request_id: request.id.clone(),
            connector: request.connector.clone(),
            status,
            reason,
            evidence_ids,
        };

        match self.check_due(request) {
            Due::Skip(reason) => {
                tracing::debug!(request = %request.id, %reason, "skipped");
                return Ok(outcome(OutcomeStatus::Skipped, reason, Vec::new()));
            }
            Due::Run { warning } => {
                if let Some(w) = warning {
                    tracing::warn!("{}", w);
                    self.warnings.push(w);
                }
            }
        }

        let Some(connector) = self.registry.get(&request.connector) else {
            let reason = format!("unknown connector {}", request.connector);
            self.warnings.push(format!("[{}] {}", request.id, reason));
            return Ok(outcome(OutcomeStatus::Skipped, reason, Vec::new()));
        };

        let failed = |this: &mut Self, err: &EngineError| {
            this.warnings.push(format!(
                "[{}] {} failed: {}",
                request.id,
                request.connector,
                redact_text(&err.to_string())
            ));
            tracing::warn!(request = %request.id, kind = err.kind().as_str(), "request failed");
        };

        let params = match RequestParams::from_request(request)
            .and_then(|p| request.check_merge_config().map(|_| p))
        {
            Ok(p) => p,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                failed(self, &e);
                return Ok(outcome(OutcomeStatus::Failed, one_line(&e), Vec::new()));
            }
        };

        tracing::info!(request = %request.id, connector = %request.connector, "dispatching");
        let now = Utc::now().trunc_subsecs(3);
        let result = {
            let ctx = self.context(now);
            connector.execute(request, &params, &ctx).await
        };

        let err = match result {
            Ok(output) => {
                return match self.apply(request, connector.as_ref(), output, now) {
                    Ok(ids) => Ok(outcome(OutcomeStatus::Executed, String::new(), ids)),
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => {
                        failed(self, &e);
                        Ok(outcome(OutcomeStatus::Failed, one_line(&e), Vec::new()))
                    }
                };
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => e,
        };

        failed(self, &err);
        if !err.allows_degrade() {
            return Ok(outcome(OutcomeStatus::Failed, one_line(&err), Vec::new()));
        }

        let degraded = {
            let ctx = self.context(now);
            connector.degrade(request, &params, &ctx, &err).await
        };
        match degraded {
            Ok(Some(output)) => match self.apply(request, connector.as_ref(), output, now) {
                Ok(ids) => Ok(outcome(
                    OutcomeStatus::Degraded,
                    format!("fallback after {}", one_line(&err)),
                    ids,
                )),
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => {
                    failed(self, &e);
                    Ok(outcome(OutcomeStatus::Failed, one_line(&e), Vec::new()))
                }
            },
            Ok(None) => Ok(outcome(OutcomeStatus::Failed, one_line(&err), Vec::new())),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.warnings.push(format!(
                    "[{}] degrade failed: {}",
                    request.id,
                    redact_text(&e.to_string())
                ));
                Ok(outcome(OutcomeStatus::Failed, one_line(&err), Vec::new()))
            }
        }
    }
}

/// Run every due request of the case in `store` and commit once.
pub async fn run_requests(
    store: &dyn CaseStore,
    config: &Config,
    registry: &ConnectorRegistry,
    options: &RunOptions,
    progress: &dyn RunProgressReporter,
) -> Result<RunSummary> {
    let mut summary = RunSummary {
        started_at: Some(Utc::now().trunc_subsecs(3)),
        ..RunSummary::default()
    };

    let snapshot = store.load().await?;
    let catalog = RequestCatalog::load(&snapshot)?;
    let mut state = RunState {
        config,
        registry,
        http: HttpClient::new(&config.http)?,
        cache: MapCache::from_config(config),
        recorder: EvidenceRecorder::new(config.case_root()),
        snapshot,
        catalog,
        warnings: Vec::new(),
    };

    for id in &options.only {
        if state.catalog.get(id).is_none() {
            state.warnings.push(format!("[{}] not in catalog", id));
        }
    }
    let ids: Vec<String> = state
        .catalog
        .ids()
        .into_iter()
        .filter(|id| options.only.is_empty() || options.only.contains(id))
        .collect();
    let total = ids.len() as u64;

    for (n, id) in ids.iter().enumerate() {
        let Some(request) = state.catalog.get(id).cloned() else {
            continue;
        };
        progress.report(RunProgressEvent::Dispatching {
            request_id: request.id.clone(),
            connector: request.connector.clone(),
            n: n as u64 + 1,
            total,
        });
        let outcome = match state.process(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(request = %request.id, "run aborted: {}", e);
                state.recorder.discard_written();
                anyhow::bail!("run aborted at {}: {}", request.id, redact_text(&e.to_string()));
            }
        };
        progress.report(RunProgressEvent::Finished {
            request_id: outcome.request_id.clone(),
            status: outcome.status.as_str().to_string(),
        });
        summary.push(outcome);
    }

    state.catalog.save(&mut state.snapshot);
    if let Err(e) = store.commit(&state.snapshot).await {
        state.recorder.discard_written();
        return Err(e);
    }

    summary.warnings = state.warnings;
    summary.finished_at = Some(Utc::now().trunc_subsecs(3));
    tracing::info!(
        executed = summary.executed,
        skipped = summary.skipped,
        failed = summary.failed,
        degraded = summary.degraded,
        "run complete"
    );
    Ok(summary)
}

/// `drq run`.
pub async fn run_cli(config: &Config, only: Vec<String>, progress: ProgressMode) -> Result<()> {
    let store = SqliteCaseStore::open(config).await?;
    let registry = ConnectorRegistry::with_builtins();
    let reporter = progress.reporter();
    let summary = run_requests(
        &store,
        config,
        &registry,
        &RunOptions { only },
        reporter.as_ref(),
    )
    .await?;

    let path = write_report(&config.reports_dir(), &summary)?;
    print_summary(&summary);
    println!();
    println!("  report: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{ArtifactDir, ArtifactSpec};
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use datareq_harness_core::models::{MergeStrategy, OriginClass, Row};
    use datareq_harness_core::store::memory::InMemoryCaseStore;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Writes one JSON artifact and one row keyed `k`.
    struct Echo {
        name: &'static str,
        calls: AtomicUsize,
    }

    impl Echo {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
            })
        }
    }

    fn record(
        ctx: &RunContext<'_>,
        request: &Request,
        file_name: &str,
        origin: OriginClass,
    ) -> Result<datareq_harness_core::models::Evidence, EngineError> {
        let id = ctx.new_evidence_id(request)?;
        ctx.recorder.record(ArtifactSpec {
            evidence_id: &id,
            request,
            dir: ArtifactDir::Api,
            file_name: format!("{}_{}", id, file_name),
            bytes: br#"{"ok":true}"#,
            kind: "api_response",
            title: request.id.clone(),
            origin,
            metadata: Map::new(),
        })
    }

    #[async_trait]
    impl Connector for Echo {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test echo"
        }
        fn default_target_table(&self) -> &str {
            "ECHO"
        }
        async fn execute(
            &self,
            request: &Request,
            _params: &RequestParams,
            ctx: &RunContext<'_>,
        ) -> Result<ConnectorOutput, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let ev = record(ctx, request, "echo.json", OriginClass::OfficialSource)?;
            let mut row = Row::new();
            row.insert("k".into(), json!(request.id));
            row.insert("v".into(), json!("value"));
            row.insert("evidence_id".into(), json!(ev.evidence_id));
            Ok(ConnectorOutput {
                rows: vec![row],
                evidence: vec![ev],
                warnings: Vec::new(),
            })
        }
    }

    /// Always fails with the configured error; degrades to a placeholder
    /// when the failure allows it.
    struct Broken {
        name: &'static str,
        error: fn() -> EngineError,
    }

    #[async_trait]
    impl Connector for Broken {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn default_target_table(&self) -> &str {
            "BROKEN"
        }
        async fn execute(
            &self,
            _request: &Request,
            _params: &RequestParams,
            _ctx: &RunContext<'_>,
        ) -> Result<ConnectorOutput, EngineError> {
            Err((self.error)())
        }
        async fn degrade(
            &self,
            request: &Request,
            _params: &RequestParams,
            ctx: &RunContext<'_>,
            _failure: &EngineError,
        ) -> Result<Option<ConnectorOutput>, EngineError> {
            let ev = record(ctx, request, "__PLACEHOLDER__.json", OriginClass::FallbackPlaceholder)?;
            Ok(Some(ConnectorOutput {
                rows: Vec::new(),
                evidence: vec![ev],
                warnings: vec!["wrote placeholder evidence".into()],
            }))
        }
    }

    fn config(tmp: &TempDir) -> Config {
        let mut c = Config::minimal();
        c.storage.root = tmp.path().to_path_buf();
        c
    }

    fn req(id: &str, connector: &str, priority: i64) -> Request {
        let mut r = Request::new(id, connector);
        r.priority = priority;
        r.merge_strategy = MergeStrategy::UpsertByKey;
        r.upsert_keys = vec!["k".into()];
        r
    }

    fn store_with(requests: Vec<Request>) -> InMemoryCaseStore {
        let mut snap = CaseSnapshot::new();
        RequestCatalog::from_requests(requests).unwrap().save(&mut snap);
        InMemoryCaseStore::with_snapshot(snap)
    }

    async fn run(store: &InMemoryCaseStore, config: &Config, registry: &ConnectorRegistry) -> RunSummary {
        run_requests(store, config, registry, &RunOptions::default(), &NoProgress)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn executes_in_catalog_order_and_closes_the_loop() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let echo = Echo::new("GEOCODE");
        let mut registry = ConnectorRegistry::new();
        registry.register(echo.clone());
        let store = store_with(vec![req("REQ-B", "GEOCODE", 20), req("REQ-A", "GEOCODE", 20)]);

        let summary = run(&store, &config, &registry).await;
        let order: Vec<&str> = summary.outcomes.iter().map(|o| o.request_id.as_str()).collect();
        assert_eq!(order, vec!["REQ-A", "REQ-B"]);
        assert_eq!(summary.executed, 2);
        assert_eq!(summary.evidence.len(), 2);

        let snap = store.load().await.unwrap();
        assert_eq!(snap.rows("ECHO").len(), 2);
        assert_eq!(snap.evidence().unwrap().len(), 2);
        let catalog = RequestCatalog::load(&snap).unwrap();
        let a = catalog.get("REQ-A").unwrap();
        assert!(a.last_run_at.is_some());
        assert_eq!(a.last_evidence_ids, vec![summary.outcomes[0].evidence_ids[0].clone()]);
    }

    #[tokio::test]
    async fn disabled_and_never_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let echo = Echo::new("GEOCODE");
        let mut registry = ConnectorRegistry::new();
        registry.register(echo.clone());
        let mut off = req("REQ-OFF", "GEOCODE", 1);
        off.enabled = false;
        let mut never = req("REQ-NEVER", "GEOCODE", 2);
        never.run_mode = RunMode::Never;
        let store = store_with(vec![off, never]);

        let summary = run(&store, &config, &registry).await;
        assert_eq!(summary.skipped, 2);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.outcome("REQ-NEVER").unwrap().reason, "run_mode NEVER");
    }

    #[tokio::test]
    async fn second_run_skips_healthy_once_requests_and_keeps_tables() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let echo = Echo::new("GEOCODE");
        let mut registry = ConnectorRegistry::new();
        registry.register(echo.clone());
        let mut once = req("REQ-ONCE", "GEOCODE", 1);
        once.run_mode = RunMode::Once;
        let store = store_with(vec![once]);

        run(&store, &config, &registry).await;
        let first = store.load().await.unwrap();
        let summary = run(&store, &config, &registry).await;
        let second = store.load().await.unwrap();

        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.outcome("REQ-ONCE").unwrap().status, OutcomeStatus::Skipped);
        assert_eq!(first.table("ECHO"), second.table("ECHO"));
    }

    #[tokio::test]
    async fn deleted_artifact_forces_once_rerun() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let echo = Echo::new("GEOCODE");
        let mut registry = ConnectorRegistry::new();
        registry.register(echo.clone());
        let mut once = req("REQ-ONCE", "GEOCODE", 1);
        once.run_mode = RunMode::Once;
        let store = store_with(vec![once]);

        run(&store, &config, &registry).await;
        let snap = store.load().await.unwrap();
        let ev = &snap.evidence().unwrap()[0];
        std::fs::remove_file(tmp.path().join(&ev.artifact_ref)).unwrap();

        let summary = run(&store, &config, &registry).await;
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.outcome("REQ-ONCE").unwrap().status, OutcomeStatus::Executed);
        assert!(summary.warnings[0]
            .starts_with("[REQ-ONCE] ONCE request has missing/invalid evidence; re-running"));
    }

    #[tokio::test]
    async fn newer_upstream_forces_once_rerun() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let echo = Echo::new("GEOCODE");
        let mut registry = ConnectorRegistry::new();
        registry.register(echo.clone());
        let upstream = req("REQ-UP", "GEOCODE", 1);
        let mut down = req("REQ-DOWN", "GEOCODE", 2);
        down.run_mode = RunMode::Once;
        down.params = json!({"items": [{"from_req_id": "REQ-UP"}]});
        let store = store_with(vec![upstream, down]);

        run(&store, &config, &registry).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let summary = run(&store, &config, &registry).await;
        assert_eq!(summary.outcome("REQ-DOWN").unwrap().status, OutcomeStatus::Executed);
        assert!(summary
            .warnings
            .iter()
            .any(|w| w == "[REQ-DOWN] upstream REQ-UP has newer evidence; re-running"));
    }

    #[tokio::test]
    async fn failing_request_is_isolated_and_degraded() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let echo = Echo::new("GEOCODE");
        let mut registry = ConnectorRegistry::new();
        registry.register(echo.clone());
        registry.register(Arc::new(Broken {
            name: "AIRKOREA",
            error: || EngineError::transient("HTTP 503 for https://x.test?serviceKey=abc"),
        }));
        let store = store_with(vec![req("REQ-FLAKY", "AIRKOREA", 1), req("REQ-OK", "GEOCODE", 2)]);

        let summary = run(&store, &config, &registry).await;
        assert_eq!(summary.outcomes.len(), 2);
        let flaky = summary.outcome("REQ-FLAKY").unwrap();
        assert_eq!(flaky.status, OutcomeStatus::Degraded);
        assert!(!flaky.reason.contains("abc"));
        assert_eq!(summary.outcome("REQ-OK").unwrap().status, OutcomeStatus::Executed);
        assert!(summary
            .warnings
            .iter()
            .any(|w| w.starts_with("[REQ-FLAKY] AIRKOREA failed:") && w.contains("serviceKey=***")));

        let snap = store.load().await.unwrap();
        let placeholder = snap.find_evidence(&flaky.evidence_ids[0]).unwrap();
        assert_eq!(placeholder.origin_class, OriginClass::FallbackPlaceholder);
        let catalog = RequestCatalog::load(&snap).unwrap();
        assert_eq!(catalog.get("REQ-FLAKY").unwrap().last_evidence_ids, flaky.evidence_ids);
    }

    #[tokio::test]
    async fn configuration_failure_leaves_status_untouched() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(Broken {
            name: "AIRKOREA",
            error: || EngineError::config("missing env AIRKOREA_API_KEY"),
        }));
        let store = store_with(vec![req("REQ-AIR", "AIRKOREA", 1)]);

        let summary = run(&store, &config, &registry).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.executed, 1);
        let snap = store.load().await.unwrap();
        assert!(snap.evidence().unwrap().is_empty());
        let catalog = RequestCatalog::load(&snap).unwrap();
        assert!(catalog.get("REQ-AIR").unwrap().last_run_at.is_none());
    }

    #[tokio::test]
    async fn invalid_params_fail_before_dispatch() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let echo = Echo::new("WMS");
        let mut registry = ConnectorRegistry::new();
        registry.register(echo.clone());
        let mut r = req("REQ-WMS", "WMS", 1);
        r.params = json!({"layer_key": ""});
        let store = store_with(vec![r]);

        let summary = run(&store, &config, &registry).await;
        assert_eq!(summary.outcome("REQ-WMS").unwrap().status, OutcomeStatus::Failed);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_connector_is_skipped_with_warning() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let store = store_with(vec![req("REQ-X", "GEOCODE", 1)]);
        let summary = run(&store, &config, &ConnectorRegistry::new()).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.warnings, vec!["[REQ-X] unknown connector GEOCODE"]);
    }

    #[tokio::test]
    async fn invariant_violation_aborts_without_commit() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let echo = Echo::new("GEOCODE");
        let mut registry = ConnectorRegistry::new();
        registry.register(echo.clone());
        registry.register(Arc::new(Broken {
            name: "AIRKOREA",
            error: || EngineError::invariant("mask/raster size mismatch"),
        }));
        let store = store_with(vec![req("REQ-OK", "GEOCODE", 1), req("REQ-BAD", "AIRKOREA", 2)]);

        let err = run_requests(&store, &config, &registry, &RunOptions::default(), &NoProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("REQ-BAD"));
        assert_eq!(store.commit_count(), 0);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        // REQ-OK wrote an artifact before the abort; nothing may refer to it.
        let api_dir = tmp.path().join("attachments/evidence/api");
        let left = std::fs::read_dir(&api_dir).map(|d| d.count()).unwrap_or(0);
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn only_filter_limits_the_run() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let echo = Echo::new("GEOCODE");
        let mut registry = ConnectorRegistry::new();
        registry.register(echo.clone());
        let store = store_with(vec![req("REQ-A", "GEOCODE", 1), req("REQ-B", "GEOCODE", 2)]);

        let options = RunOptions {
            only: vec!["REQ-B".into(), "REQ-GONE".into()],
        };
        let summary = run_requests(&store, &config, &registry, &options, &NoProgress)
            .await
            .unwrap();
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.outcomes[0].request_id, "REQ-B");
        assert_eq!(summary.warnings, vec!["[REQ-GONE] not in catalog"]);
    }
}
