//! Default request planning.
//!
//! [`plan`] derives the default request set from what the case already
//! knows (address, coordinates, filled tables, zoned parcels) and what
//! the config defines (stations, map layers, statistical datasets,
//! vector features).
//! [`merge_plan`] folds that set into an existing catalog without
//! clobbering user edits and without ever deleting a row.

use anyhow::Result;
use serde_json::Value;

use datareq_harness_core::catalog::RequestCatalog;
use datareq_harness_core::error::EngineError;
use datareq_harness_core::models::{cell_text, MergeStrategy, Request, RunMode, LOCATION_TABLE};
use datareq_harness_core::overlay::PARCELS_TABLE;
use datareq_harness_core::params::{
    AirKoreaParams, GeocodeParams, KmaAsosParams, KosisParams, NierWaterParams, OverlayItem,
    OverlayMode, OverlayParams, RequestParams, StationCandidate, WmsParams,
};
use datareq_harness_core::store::{CaseSnapshot, CaseStore};

use crate::case_state::SiteContext;
use crate::config::Config;
use crate::connector_airkorea::{AIRKOREA_KEY_ENV, AIR_TABLE};
use crate::connector_kma::{nearest_stations, KMA_KEY_ENV, RAIN_TABLE};
use crate::connector_nier::{NIER_KEY_ENV, WATER_TABLE};
use crate::connector_overlay::{BREAKDOWN_TABLE, OVERLAY_TABLE};
use crate::connector_wms::FIGURES_TABLE;
use crate::http::env_key;
use crate::sqlite_store::SqliteCaseStore;

/// Prefix of notes the planner writes when a credential is missing.
pub const MISSING_ENV_NOTE: &str = "disabled: missing env";

pub const GEOCODE_REQ: &str = "REQ-GEOCODE";
pub const AIRKOREA_REQ: &str = "REQ-AIRKOREA";
pub const KMA_REQ: &str = "REQ-KMA-ASOS";
pub const NIER_REQ: &str = "REQ-NIER-WATER";
pub const OVERLAY_REQ: &str = "REQ-AUTO-GIS";
pub const BREAKDOWN_REQ: &str = "REQ-AUTO-GIS-ZONING-BREAKDOWN";

const CANDIDATE_STATIONS: usize = 3;

/// `REQ-WMS-{KEY}` for a configured layer key.
pub fn wms_request_id(layer_key: &str) -> String {
    format!("REQ-WMS-{}", id_part(layer_key))
}

pub fn kosis_request_id(dataset_key: &str) -> String {
    format!("REQ-KOSIS-{}", id_part(dataset_key))
}

fn id_part(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '-'
            }
        })
        .collect()
}

fn request(
    id: impl Into<String>,
    priority: i64,
    params: RequestParams,
    purpose: &str,
    target_table: &str,
) -> Request {
    let mut r = params.into_request(id);
    r.priority = priority;
    r.purpose = purpose.to_string();
    r.target_table = target_table.to_string();
    r
}

fn upsert(mut r: Request, keys: &[&str]) -> Request {
    r.merge_strategy = MergeStrategy::UpsertByKey;
    r.upsert_keys = keys.iter().map(|k| k.to_string()).collect();
    r
}

/// Disable `r` when none of `vars` is set, leaving a note naming the first.
fn gate_on_env(mut r: Request, vars: &[&str], has_env: &impl Fn(&str) -> bool) -> Request {
    if !vars.is_empty() && !vars.iter().any(|&v| has_env(v)) {
        r.enabled = false;
        r.note = format!("{} {}", MISSING_ENV_NOTE, vars[0]);
    }
    r
}

/// The default request set for a case. Pure: `has_env` answers whether a
/// credential variable is set.
pub fn plan(snapshot: &CaseSnapshot, config: &Config, has_env: impl Fn(&str) -> bool) -> Vec<Request> {
    let site = SiteContext::from_snapshot(snapshot);
    let mut planned = Vec::new();

    if site.address.is_some() && !site.has_coordinates() {
        let mut r = upsert(
            request(
                GEOCODE_REQ,
                10,
                RequestParams::Geocode(GeocodeParams::default()),
                "Resolve site coordinates from the address",
                LOCATION_TABLE,
            ),
            &["location_id"],
        );
        r.run_mode = RunMode::Once;
        r.source_tag = "S-GEOCODE".into();
        planned.push(r);
    }

    if snapshot.is_table_empty(AIR_TABLE) {
        let mut r = upsert(
            request(
                AIRKOREA_REQ,
                30,
                RequestParams::AirKorea(AirKoreaParams::default()),
                "Baseline air quality near the site",
                AIR_TABLE,
            ),
            &["pollutant"],
        );
        r.source_tag = "S-AIRKOREA".into();
        planned.push(gate_on_env(r, &AIRKOREA_KEY_ENV, &has_env));
    }

    if let Some(center) = site.center {
        let station_candidates: Vec<StationCandidate> =
            nearest_stations(&config.stations, center, CANDIDATE_STATIONS)
                .into_iter()
                .map(|(s, km)| StationCandidate {
                    station_id: s.id,
                    name: Some(s.name).filter(|n| !n.is_empty()),
                    distance_km: Some((km * 100.0).round() / 100.0),
                })
                .collect();
        let params = KmaAsosParams {
            station_candidates,
            source_basis: Some("nearest ASOS stations by great-circle distance".into()),
            ..KmaAsosParams::default()
        };
        let mut r = upsert(
            request(
                KMA_REQ,
                31,
                RequestParams::KmaAsos(params),
                "Daily precipitation statistics at the nearest weather station",
                RAIN_TABLE,
            ),
            &["duration_hr"],
        );
        r.source_tag = "S-KMA-ASOS".into();
        planned.push(gate_on_env(r, &KMA_KEY_ENV, &has_env));
    }

    for (key, dataset) in &config.kosis.datasets {
        let params = KosisParams {
            dataset_key: key.clone(),
            ..KosisParams::default()
        };
        let mut r = upsert(
            request(
                kosis_request_id(key),
                32,
                RequestParams::Kosis(params),
                &format!("Statistical series {}", key),
                &dataset.target_table,
            ),
            &["socio_id"],
        );
        r.enabled = false;
        r.note = "opt-in: check the dataset query, then enable".into();
        r.source_tag = if dataset.source_tag.is_empty() {
            "S-KOSIS".into()
        } else {
            dataset.source_tag.clone()
        };
        planned.push(r);
    }

    if snapshot.is_table_empty(WATER_TABLE) {
        let mut r = request(
            NIER_REQ,
            33,
            RequestParams::NierWater(NierWaterParams::default()),
            "Water-quality baseline from assessment survey stations",
            WATER_TABLE,
        );
        r.merge_strategy = MergeStrategy::ReplaceAll;
        r.run_mode = RunMode::Once;
        r.enabled = false;
        r.note = "opt-in: set params.mgt_no (assessment project code), then enable".into();
        r.source_tag = "S-NIER-WATER".into();
        planned.push(gate_on_env(r, &NIER_KEY_ENV, &has_env));
    }

    let parcels = snapshot.rows(PARCELS_TABLE);
    let zoned = parcels.iter().any(|p| !cell_text(p, "zoning").is_empty());
    if zoned && snapshot.is_table_empty(BREAKDOWN_TABLE) {
        let mut r = request(
            BREAKDOWN_REQ,
            40,
            RequestParams::AutoGis(OverlayParams::zoning_breakdown()),
            "Parcel area per zoning class",
            BREAKDOWN_TABLE,
        );
        r.merge_strategy = MergeStrategy::ReplaceAll;
        r.run_mode = RunMode::Once;
        r.source_tag = parcels
            .iter()
            .map(|p| cell_text(p, "source_tag"))
            .find(|t| !t.is_empty())
            .unwrap_or_else(|| "S-AUTO-GIS".into());
        planned.push(r);
    }

    for (i, (key, layer)) in config.layers.iter().enumerate() {
        let title = if layer.title.is_empty() { key } else { &layer.title };
        let mut r = request(
            wms_request_id(key),
            50 + i as i64,
            RequestParams::Wms(WmsParams::new(key.clone())),
            &format!("Map figure: {}", title),
            FIGURES_TABLE,
        );
        r.run_mode = RunMode::Once;
        r.merge_strategy = MergeStrategy::Append;
        r.source_tag = layer.source_tag.clone();
        if !layer.enabled_by_default {
            r.enabled = false;
            r.note = "opt-in layer".into();
        }
        // Every provider's key must be present, not just one.
        for var in layer.auth_env_vars() {
            if !has_env(var.as_str()) {
                r.enabled = false;
                r.note = format!("{} {}", MISSING_ENV_NOTE, var);
                break;
            }
        }
        planned.push(r);
    }

    let mut items: Vec<OverlayItem> = config
        .layers
        .iter()
        .map(|(key, layer)| OverlayItem {
            overlay_id: format!("OV-{}", id_part(key)),
            feature_id: Some(if layer.title.is_empty() {
                key.clone()
            } else {
                layer.title.clone()
            }),
            mode: Some(OverlayMode::Raster),
            from_req_id: Some(wms_request_id(key)),
            ..OverlayItem::default()
        })
        .collect();
    items.extend(config.features.iter().map(|f| OverlayItem {
        overlay_id: f.overlay_id.clone(),
        feature_id: f.feature_id.clone(),
        mode: Some(OverlayMode::Vector),
        geometry_file: Some(f.geometry_file.clone()),
        srs: f.srs.clone(),
        ..OverlayItem::default()
    }));
    if !items.is_empty() && (site.has_coordinates() || site.boundary_file.is_some()) {
        let params = OverlayParams {
            items,
            ..OverlayParams::default()
        };
        let mut r = upsert(
            request(
                OVERLAY_REQ,
                60,
                RequestParams::AutoGis(params),
                "Proximity of the site to mapped zones and features",
                OVERLAY_TABLE,
            ),
            &["overlay_id"],
        );
        r.source_tag = "S-AUTO-GIS".into();
        planned.push(r);
    }

    planned
}

/// What [`merge_plan`] changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
}

fn params_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Fill `existing` from `planned`. Returns whether anything changed.
fn merge_into(existing: &mut Request, planned: &Request) -> bool {
    let before = existing.clone();

    if !existing.has_run() && planned.enabled && !existing.enabled {
        existing.enabled = true;
    }
    let stale_note = existing.note.trim().is_empty() || existing.note.starts_with(MISSING_ENV_NOTE);
    if stale_note && existing.note != planned.note {
        existing.note = planned.note.clone();
    }

    if existing.purpose.trim().is_empty() {
        existing.purpose = planned.purpose.clone();
    }
    if existing.target_table.trim().is_empty() {
        existing.target_table = planned.target_table.clone();
    }
    if existing.source_tag.trim().is_empty() {
        existing.source_tag = planned.source_tag.clone();
    }
    if existing.upsert_keys.is_empty() {
        existing.upsert_keys = planned.upsert_keys.clone();
    }
    if params_empty(&existing.params) {
        existing.params = planned.params.clone();
    }

    *existing != before
}

/// Fold `planned` into `catalog`. Never deletes; status fields are kept.
pub fn merge_plan(catalog: &mut RequestCatalog, planned: Vec<Request>) -> Result<PlanReport, EngineError> {
    let mut report = PlanReport::default();
    let mut fresh = Vec::new();
    for p in planned {
        match catalog.get_mut(&p.id) {
            Some(existing) => {
                if merge_into(existing, &p) {
                    report.updated.push(p.id.clone());
                } else {
                    report.unchanged.push(p.id.clone());
                }
            }
            None => {
                report.added.push(p.id.clone());
                fresh.push(p);
            }
        }
    }
    catalog.upsert_by_key(fresh)?;
    Ok(report)
}

/// Plan against a store, committing unless `dry_run`.
pub async fn plan_case(
    store: &dyn CaseStore,
    config: &Config,
    dry_run: bool,
    has_env: impl Fn(&str) -> bool,
) -> Result<(PlanReport, RequestCatalog)> {
    let mut snapshot = store.load().await?;
    let mut catalog = RequestCatalog::load(&snapshot)?;
    let planned = plan(&snapshot, config, has_env);
    let report = merge_plan(&mut catalog, planned)?;
    tracing::info!(
        added = report.added.len(),
        updated = report.updated.len(),
        dry_run,
        "plan merged"
    );
    if !dry_run {
        catalog.save(&mut snapshot);
        store.commit(&snapshot).await?;
    }
    Ok((report, catalog))
}

/// `drq plan`.
pub async fn run_plan(config: &Config, dry_run: bool) -> Result<()> {
    let store = SqliteCaseStore::open(config).await?;
    let (report, catalog) = plan_case(&store, config, dry_run, |v| env_key(&[v]).is_some()).await?;

    println!("plan{}", if dry_run { " (dry-run)" } else { "" });
    println!("  added: {}", report.added.len());
    println!("  updated: {}", report.updated.len());
    println!("  unchanged: {}", report.unchanged.len());
    println!();
    println!(
        "  {:<24} {:>4} {:<10} {:<7} {:<6} {}",
        "ID", "PRIO", "CONNECTOR", "ENABLED", "MODE", "NOTE"
    );
    println!("  {}", "-".repeat(76));
    for r in catalog.requests() {
        let marker = if report.added.contains(&r.id) { "+" } else { " " };
        println!(
            "{} {:<24} {:>4} {:<10} {:<7} {:<6} {}",
            marker,
            r.id,
            r.priority,
            r.connector,
            if r.enabled { "yes" } else { "no" },
            r.run_mode.as_str(),
            r.note
        );
    }
    if dry_run {
        println!();
        println!("  (nothing written)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayerConfig, StationConfig};
    use chrono::Utc;
    use datareq_harness_core::models::Row;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn layer(enabled_by_default: bool, env_var: Option<&str>) -> LayerConfig {
        let provider: crate::config::ProviderConfig = toml::from_str(&match env_var {
            Some(v) => format!("base_url = \"https://maps.test/wms\"\n[auth]\nenv_var = \"{}\"\n", v),
            None => "base_url = \"https://maps.test/wms\"\n".to_string(),
        })
        .unwrap();
        LayerConfig {
            title: "Flood zone".into(),
            enabled_by_default,
            source_tag: "S-MAP".into(),
            fallback_file_path: None,
            srs: "EPSG:3857".into(),
            providers: vec![provider],
        }
    }

    fn config() -> Config {
        let mut c = Config::minimal();
        c.stations = vec![
            StationConfig { id: "108".into(), name: "Seoul".into(), lat: 37.5714, lon: 126.9658 },
            StationConfig { id: "202".into(), name: "Yangpyeong".into(), lat: 37.4886, lon: 127.4945 },
            StationConfig { id: "119".into(), name: "Suwon".into(), lat: 37.2723, lon: 126.9853 },
            StationConfig { id: "159".into(), name: "Busan".into(), lat: 35.1047, lon: 129.0320 },
        ];
        let mut layers = BTreeMap::new();
        layers.insert("flood".to_string(), layer(true, Some("MAP_KEY")));
        layers.insert("zoning".to_string(), layer(false, None));
        c.layers = layers;
        c
    }

    fn located() -> CaseSnapshot {
        let mut snap = CaseSnapshot::new();
        snap.table_mut(LOCATION_TABLE).push_row(row(json!({
            "location_id": "LOC-001",
            "address": "Sejong-daero 110",
            "center_lat": 37.5663,
            "center_lon": 126.9779
        })));
        snap
    }

    #[test]
    fn address_without_coordinates_plans_geocode_only_for_location() {
        let mut snap = CaseSnapshot::new();
        snap.table_mut(LOCATION_TABLE)
            .push_row(row(json!({"address": "Sejong-daero 110"})));
        let planned = plan(&snap, &Config::minimal(), |_| true);
        let ids: Vec<&str> = planned.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![GEOCODE_REQ, AIRKOREA_REQ, NIER_REQ]);
        assert_eq!(planned[0].run_mode, RunMode::Once);
    }

    #[test]
    fn water_survey_is_opt_in() {
        let planned = plan(&located(), &config(), |_| true);
        let water = planned.iter().find(|r| r.id == NIER_REQ).unwrap();
        assert!(!water.enabled);
        assert!(water.note.starts_with("opt-in"));
        assert_eq!(water.params, json!({"mgt_no": ""}));
        assert_eq!(water.merge_strategy, MergeStrategy::ReplaceAll);

        let keyless = plan(&located(), &config(), |_| false);
        let water = keyless.iter().find(|r| r.id == NIER_REQ).unwrap();
        assert_eq!(water.note, "disabled: missing env NIER_WATER_API_KEY");

        let mut snap = located();
        snap.table_mut(WATER_TABLE).push_row(row(json!({"parameter": "BOD"})));
        assert!(plan(&snap, &config(), |_| true).iter().all(|r| r.id != NIER_REQ));
    }

    #[test]
    fn zoned_parcels_plan_a_breakdown() {
        assert!(plan(&located(), &config(), |_| true).iter().all(|r| r.id != BREAKDOWN_REQ));

        let mut snap = located();
        snap.table_mut(PARCELS_TABLE).push_row(row(json!({"pnu": "1", "zoning": "", "area_m2": 10})));
        snap.table_mut(PARCELS_TABLE)
            .push_row(row(json!({"pnu": "2", "zoning": "Natural green", "area_m2": 10, "source_tag": "S-07"})));
        let planned = plan(&snap, &config(), |_| true);
        let b = planned.iter().find(|r| r.id == BREAKDOWN_REQ).unwrap();
        assert!(b.enabled);
        assert_eq!(b.connector, "AUTO_GIS");
        assert_eq!(b.target_table, BREAKDOWN_TABLE);
        assert_eq!(b.source_tag, "S-07");
        assert_eq!(b.params["operation"], json!("ZONING_BREAKDOWN"));
        assert!(RequestParams::from_request(b).is_ok());
    }

    #[test]
    fn kma_request_lists_three_nearest_stations() {
        let planned = plan(&located(), &config(), |_| true);
        let kma = planned.iter().find(|r| r.id == KMA_REQ).unwrap();
        let ids: Vec<&str> = kma.params["station_candidates"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["station_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["108", "119", "202"]);
        assert!(kma.enabled);
    }

    #[test]
    fn missing_credentials_disable_with_note() {
        let planned = plan(&located(), &config(), |_| false);
        let air = planned.iter().find(|r| r.id == AIRKOREA_REQ).unwrap();
        assert!(!air.enabled);
        assert_eq!(air.note, "disabled: missing env AIRKOREA_API_KEY");

        let flood = planned.iter().find(|r| r.id == "REQ-WMS-FLOOD").unwrap();
        assert!(!flood.enabled);
        assert_eq!(flood.note, "disabled: missing env MAP_KEY");
    }

    #[test]
    fn layers_become_once_figures_and_raster_overlays() {
        let planned = plan(&located(), &config(), |_| true);
        let flood = planned.iter().find(|r| r.id == "REQ-WMS-FLOOD").unwrap();
        assert_eq!(flood.priority, 50);
        assert_eq!(flood.run_mode, RunMode::Once);
        assert_eq!(flood.target_table, FIGURES_TABLE);
        let zoning = planned.iter().find(|r| r.id == "REQ-WMS-ZONING").unwrap();
        assert_eq!(zoning.priority, 51);
        assert!(!zoning.enabled);

        let overlay = planned.iter().find(|r| r.id == OVERLAY_REQ).unwrap();
        assert_eq!(overlay.upsert_keys, vec!["overlay_id"]);
        assert_eq!(overlay.params["items"][0]["from_req_id"], json!("REQ-WMS-FLOOD"));
        assert_eq!(overlay.params["items"][0]["mode"], json!("RASTER"));
    }

    #[test]
    fn filled_air_table_is_not_replanned() {
        let mut snap = located();
        snap.table_mut(AIR_TABLE).push_row(row(json!({"pollutant": "PM10"})));
        let planned = plan(&snap, &config(), |_| true);
        assert!(planned.iter().all(|r| r.id != AIRKOREA_REQ));
    }

    #[test]
    fn merge_keeps_user_edits_and_status() {
        let mut existing = Request::new(KMA_REQ, "KMA_ASOS");
        existing.enabled = false;
        existing.params = json!({"stn_id": "133"});
        existing.merge_strategy = MergeStrategy::ReplaceAll;
        existing.last_run_at = Some(Utc::now());
        existing.last_evidence_ids = vec!["EV-1".into()];
        existing.note = "keep me".into();
        let mut catalog = RequestCatalog::from_requests(vec![existing]).unwrap();

        let planned = plan(&located(), &config(), |_| true);
        let report = merge_plan(&mut catalog, planned).unwrap();
        assert!(report.added.contains(&AIRKOREA_REQ.to_string()));
        assert_eq!(report.updated, vec![KMA_REQ.to_string()]);

        let kma = catalog.get(KMA_REQ).unwrap();
        assert!(!kma.enabled);
        assert_eq!(kma.params, json!({"stn_id": "133"}));
        assert_eq!(kma.merge_strategy, MergeStrategy::ReplaceAll);
        assert_eq!(kma.note, "keep me");
        assert_eq!(kma.last_evidence_ids, vec!["EV-1"]);
        assert_eq!(kma.target_table, RAIN_TABLE);
        assert_eq!(kma.source_tag, "S-KMA-ASOS");
    }

    #[test]
    fn merge_reenables_never_run_request_once_key_appears() {
        let mut catalog = RequestCatalog::default();
        merge_plan(&mut catalog, plan(&located(), &config(), |_| false)).unwrap();
        assert!(!catalog.get(AIRKOREA_REQ).unwrap().enabled);

        let report = merge_plan(&mut catalog, plan(&located(), &config(), |_| true)).unwrap();
        let air = catalog.get(AIRKOREA_REQ).unwrap();
        assert!(air.enabled);
        assert_eq!(air.note, "");
        assert!(report.updated.contains(&AIRKOREA_REQ.to_string()));
    }

    #[test]
    fn merge_never_deletes_rows() {
        let mut catalog =
            RequestCatalog::from_requests(vec![Request::new("REQ-CUSTOM", "PDF_PAGE")]).unwrap();
        merge_plan(&mut catalog, plan(&located(), &config(), |_| true)).unwrap();
        assert!(catalog.get("REQ-CUSTOM").is_some());
        let ids = catalog.ids();
        let mut sorted = ids.clone();
        sorted.sort_by_key(|id| catalog.get(id).map(|r| (r.priority, r.id.clone())));
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn dry_run_leaves_store_untouched() {
        let store = datareq_harness_core::store::memory::InMemoryCaseStore::with_snapshot(located());
        let (report, _) = plan_case(&store, &config(), true, |_| true).await.unwrap();
        assert!(!report.added.is_empty());
        assert_eq!(store.commit_count(), 0);

        plan_case(&store, &config(), false, |_| true).await.unwrap();
        assert_eq!(store.commit_count(), 1);
        let snap = store.load().await.unwrap();
        assert!(!RequestCatalog::load(&snap).unwrap().is_empty());
    }
}
