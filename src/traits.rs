//! The connector seam.
//!
//! Every data source is a [`Connector`]: it validates its typed
//! parameters, talks to its source, records evidence, and returns output
//! rows for the runner to merge. A connector may also own a degrade path
//! that produces fallback evidence when the source fails.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  ConnectorRegistry                   │
//! │  ┌──────────┐ ┌──────────┐ ┌───────┐ ┌────────────┐  │
//! │  │KMA/Air/  │ │  WMS     │ │PDF    │ │  AUTO_GIS  │  │
//! │  │KOSIS/NIER│ │ (+cache) │ │page   │ │  (compute) │  │
//! │  │/Geocode  │ │          │ │       │ │            │  │
//! │  └──────────┘ └──────────┘ └───────┘ └────────────┘  │
//! └──────────────────────┬───────────────────────────────┘
//!                        ▼
//!        run_requests() → merge rows, append evidence
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datareq_harness_core::catalog::RequestCatalog;
use datareq_harness_core::error::EngineError;
use datareq_harness_core::models::{Evidence, Request, Row};
use datareq_harness_core::params::RequestParams;
use datareq_harness_core::store::CaseSnapshot;

use crate::cache::MapCache;
use crate::case_state::SiteContext;
use crate::config::Config;
use crate::evidence::EvidenceRecorder;
use crate::http::{env_key, HttpClient};

// ═══════════════════════════════════════════════════════════════════════
// Run context and output
// ═══════════════════════════════════════════════════════════════════════

/// Everything a connector may read while executing one request.
///
/// The snapshot and catalog are the run's working copies: changes made
/// by earlier requests in the same run (a geocoded centre, an upstream
/// request's fresh evidence ids) are visible to later ones.
pub struct RunContext<'a> {
    pub config: &'a Config,
    pub snapshot: &'a CaseSnapshot,
    pub catalog: &'a RequestCatalog,
    pub recorder: &'a EvidenceRecorder,
    pub http: &'a HttpClient,
    pub cache: &'a MapCache,
    pub now: DateTime<Utc>,
}

impl RunContext<'_> {
    pub fn site(&self) -> SiteContext {
        SiteContext::from_snapshot(self.snapshot)
    }

    pub fn case_root(&self) -> &Path {
        self.recorder.case_root()
    }

    pub fn new_evidence_id(&self, request: &Request) -> Result<String, EngineError> {
        self.recorder.allocate_id(&request.id, self.now, self.snapshot)
    }
}

/// What a successful (or degraded) execution hands back to the runner.
#[derive(Debug, Default)]
pub struct ConnectorOutput {
    pub rows: Vec<Row>,
    pub evidence: Vec<Evidence>,
    /// Non-fatal problems, reported without the request id prefix.
    pub warnings: Vec<String>,
}

impl ConnectorOutput {
    pub fn evidence_ids(&self) -> Vec<String> {
        self.evidence.iter().map(|e| e.evidence_id.clone()).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// A data source the runner can dispatch requests to.
///
/// # Lifecycle
///
/// 1. The connector is registered via [`ConnectorRegistry::register`].
/// 2. For each due request naming it, the runner parses the request's
///    parameters and calls [`execute`](Connector::execute).
/// 3. On a transient or data-quality failure the runner calls
///    [`degrade`](Connector::degrade).
/// 4. Output rows are merged into the target table and evidence is
///    appended; the request's status is updated last.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Catalog name, e.g. `"KMA_ASOS"`.
    fn name(&self) -> &str;

    /// One-line description for `drq verify` output.
    fn description(&self) -> &str;

    /// Table written when a request leaves `target_table` empty.
    fn default_target_table(&self) -> &str;

    /// Environment variables consulted for credentials, any one of which
    /// suffices. Empty for keyless connectors.
    fn credential_env(&self) -> &[&'static str] {
        &[]
    }

    /// Run one request.
    async fn execute(
        &self,
        request: &Request,
        params: &RequestParams,
        ctx: &RunContext<'_>,
    ) -> Result<ConnectorOutput, EngineError>;

    /// Produce fallback output after `failure`. `Ok(None)` means the
    /// connector has no degrade path.
    async fn degrade(
        &self,
        _request: &Request,
        _params: &RequestParams,
        _ctx: &RunContext<'_>,
        _failure: &EngineError,
    ) -> Result<Option<ConnectorOutput>, EngineError> {
        Ok(None)
    }

    /// Pre-flight check of credentials and endpoint. Never writes.
    ///
    /// The default only checks that a credential is present.
    async fn verify(
        &self,
        _request: Option<&Request>,
        _ctx: &RunContext<'_>,
    ) -> Result<String, EngineError> {
        check_credentials(self.credential_env()).map(|found| match found {
            Some(var) => format!("credential {} present", var),
            None => "no credentials required".to_string(),
        })
    }
}

/// The first set variable among `vars`, `None` when `vars` is empty.
pub fn check_credentials(vars: &[&'static str]) -> Result<Option<&'static str>, EngineError> {
    if vars.is_empty() {
        return Ok(None);
    }
    vars.iter()
        .copied()
        .find(|v| env_key(&[v]).is_some())
        .map(Some)
        .ok_or_else(|| EngineError::config(format!("missing env {}", vars.join(" or "))))
}

/// The credential value itself.
pub fn require_key(vars: &[&'static str]) -> Result<String, EngineError> {
    env_key(vars).ok_or_else(|| EngineError::config(format!("missing env {}", vars.join(" or "))))
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Connectors by catalog name.
///
/// ```rust
/// use datareq_harness::traits::ConnectorRegistry;
///
/// let registry = ConnectorRegistry::with_builtins();
/// assert!(registry.get("kma_asos").is_some());
/// ```
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: BTreeMap::new(),
        }
    }

    /// Every built-in connector kind.
    pub fn with_builtins() -> Self {
        use crate::connector_airkorea::AirKoreaConnector;
        use crate::connector_geocode::GeocodeConnector;
        use crate::connector_kma::KmaAsosConnector;
        use crate::connector_kosis::KosisConnector;
        use crate::connector_nier::NierWaterConnector;
        use crate::connector_overlay::OverlayConnector;
        use crate::connector_pdf::PdfPageConnector;
        use crate::connector_wms::WmsConnector;

        let mut registry = Self::new();
        registry.register(Arc::new(KmaAsosConnector));
        registry.register(Arc::new(AirKoreaConnector));
        registry.register(Arc::new(KosisConnector));
        registry.register(Arc::new(NierWaterConnector));
        registry.register(Arc::new(WmsConnector));
        registry.register(Arc::new(GeocodeConnector));
        registry.register(Arc::new(PdfPageConnector));
        registry.register(Arc::new(OverlayConnector));
        registry
    }

    /// Register a connector, replacing any with the same name.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.name().to_ascii_uppercase(), connector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors
            .get(&name.trim().to_ascii_uppercase())
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
