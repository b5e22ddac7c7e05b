//! KMA ASOS daily weather connector.
//!
//! Fetches daily observations for one station from the data.go.kr ASOS
//! service and reduces them to rainfall design inputs:
//!
//! - max 24h rainfall: the largest daily `sumRn`
//! - max 1h rainfall: the largest of the hourly-maximum fields
//! - total rainfall over the period, kept in evidence metadata
//!
//! The date range is split into blocks of at most 1000 days and each
//! block is paginated (999 rows per page, 50 pages at most).
//!
//! Credentials: `KMA_API_KEY`, falling back to `DATA_GO_KR_SERVICE_KEY`.

use async_trait::async_trait;
use chrono::{Duration, Months, NaiveDate};
use datareq_harness_core::error::EngineError;
use datareq_harness_core::geometry::Point;
use datareq_harness_core::models::{OriginClass, Request, Row};
use datareq_harness_core::params::{parse_ymd, KmaAsosParams, RequestParams};
use serde_json::{json, Map, Value};

use crate::case_state::haversine_km;
use crate::config::StationConfig;
use crate::evidence::{pretty_json, ArtifactDir, ArtifactSpec};
use crate::http::build_data_go_kr_url;
use crate::traits::{require_key, Connector, ConnectorOutput, RunContext};

pub const KMA_KEY_ENV: [&str; 2] = ["KMA_API_KEY", "DATA_GO_KR_SERVICE_KEY"];
pub const RAIN_TABLE: &str = "DRR_HYDRO_RAIN";

const PAGE_SIZE: u32 = 999;
const MAX_PAGES: u32 = 50;
const MAX_BLOCK_DAYS: i64 = 1000;

/// Hourly-maximum field names seen across ASOS API versions.
const MAX_1H_KEYS: [&str; 5] = ["maxRn", "maxRn1hr", "max1hrRn", "maxRnHr", "maxRnHr1"];

pub struct KmaAsosConnector;

/// Rainfall reduced from daily items.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RainStats {
    pub max_1h: Option<f64>,
    pub max_24h: Option<f64>,
    pub total: Option<f64>,
    pub days: usize,
}

/// Numeric cell: numbers or numeric strings; `-`, `NA` and blanks are `None`.
pub fn parse_amount(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s == "-" || s.eq_ignore_ascii_case("NA") {
                None
            } else {
                s.replace(',', "").parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

fn fold_max(acc: Option<f64>, v: Option<f64>) -> Option<f64> {
    match (acc, v) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

pub fn rain_stats(items: &[Value]) -> RainStats {
    let mut stats = RainStats::default();
    for item in items {
        let daily = parse_amount(item.get("sumRn"));
        if let Some(d) = daily {
            stats.max_24h = fold_max(stats.max_24h, Some(d));
            stats.total = Some(stats.total.unwrap_or(0.0) + d);
            stats.days += 1;
        }
        for key in MAX_1H_KEYS {
            stats.max_1h = fold_max(stats.max_1h, parse_amount(item.get(key)));
        }
    }
    stats
}

/// Items and `totalCount` of one response page.
///
/// `items.item` may be a list, a single object, or an empty string.
pub fn parse_page(body: &Value) -> Result<(Vec<Value>, Option<u64>), EngineError> {
    let response = body.get("response").unwrap_or(body);
    let code = response
        .pointer("/header/resultCode")
        .map(|c| match c {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    if !matches!(code.as_str(), "00" | "0" | "200") {
        let msg = response
            .pointer("/header/resultMsg")
            .and_then(|m| m.as_str())
            .unwrap_or("");
        return Err(EngineError::data_quality(format!(
            "ASOS resultCode {:?}: {}",
            code, msg
        )));
    }
    let body = response.get("body");
    let total = body
        .and_then(|b| b.get("totalCount"))
        .and_then(|t| match t {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
    let items = match body.and_then(|b| b.pointer("/items/item")) {
        Some(Value::Array(list)) => list.clone(),
        Some(obj @ Value::Object(_)) => vec![obj.clone()],
        _ => Vec::new(),
    };
    Ok((items, total))
}

/// Requested range, defaulted and clamped to end no later than `yesterday`.
pub fn resolve_dates(
    p: &KmaAsosParams,
    yesterday: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), EngineError> {
    let end = p
        .end_dt
        .as_deref()
        .and_then(parse_ymd)
        .map(|e| e.min(yesterday))
        .unwrap_or(yesterday);
    let start = match p.start_dt.as_deref().and_then(parse_ymd) {
        Some(s) => s,
        None => end.checked_sub_months(Months::new(60)).unwrap_or(end),
    };
    if start > end {
        return Err(EngineError::config(format!(
            "start_dt {} is after end_dt {} (end is clamped to yesterday)",
            start.format("%Y%m%d"),
            end.format("%Y%m%d")
        )));
    }
    Ok((start, end))
}

/// Split `[start, end]` into inclusive blocks of at most `max_days`.
pub fn date_blocks(start: NaiveDate, end: NaiveDate, max_days: i64) -> Vec<(NaiveDate, NaiveDate)> {
    let mut blocks = Vec::new();
    let mut cur = start;
    while cur <= end {
        let block_end = (cur + Duration::days(max_days - 1)).min(end);
        blocks.push((cur, block_end));
        cur = block_end + Duration::days(1);
    }
    blocks
}

/// The `n` configured stations closest to `center`, with distances in km.
pub fn nearest_stations(
    stations: &[StationConfig],
    center: Point,
    n: usize,
) -> Vec<(StationConfig, f64)> {
    let mut ranked: Vec<(StationConfig, f64)> = stations
        .iter()
        .map(|s| (s.clone(), haversine_km(center, Point::new(s.lon, s.lat))))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));
    ranked.truncate(n);
    ranked
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn pairs(p: &[(&str, String)]) -> Vec<(String, String)> {
    p.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

impl KmaAsosConnector {
    fn station(&self, p: &KmaAsosParams, ctx: &RunContext<'_>) -> Result<String, EngineError> {
        if let Some(id) = p.station_id() {
            return Ok(id);
        }
        let center = ctx.site().require_center()?;
        nearest_stations(&ctx.config.stations, center, 1)
            .into_iter()
            .next()
            .map(|(s, _)| s.id)
            .ok_or_else(|| {
                EngineError::config("no stn_id given and no [[stations]] configured to pick from")
            })
    }

    /// Fetch every page of every block. Returns items and the first URL.
    async fn fetch_all(
        &self,
        ctx: &RunContext<'_>,
        key: &str,
        station: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<(Vec<Value>, String), EngineError> {
        let base = &ctx.config.endpoints.kma_asos;
        let mut all = Vec::new();
        let mut first_url = String::new();

        for (b_start, b_end) in date_blocks(start, end, MAX_BLOCK_DAYS) {
            let mut fetched: u64 = 0;
            for page in 1..=MAX_PAGES {
                let params = pairs(&[
                    ("pageNo", page.to_string()),
                    ("numOfRows", PAGE_SIZE.to_string()),
                    ("dataType", "JSON".to_string()),
                    ("dataCd", "ASOS".to_string()),
                    ("dateCd", "DAY".to_string()),
                    ("startDt", b_start.format("%Y%m%d").to_string()),
                    ("endDt", b_end.format("%Y%m%d").to_string()),
                    ("stnIds", station.to_string()),
                ]);
                let url = build_data_go_kr_url(base, key, &params);
                if first_url.is_empty() {
                    first_url = url.clone();
                }
                let body = ctx.http.get_json(&url).await?;
                let (items, total) = parse_page(&body)?;
                let n = items.len() as u64;
                fetched += n;
                all.extend(items);

                if n == 0 || n < u64::from(PAGE_SIZE) {
                    break;
                }
                if let Some(total) = total {
                    if fetched >= total {
                        break;
                    }
                }
            }
        }
        tracing::debug!(station, items = all.len(), "ASOS fetch complete");
        Ok((all, first_url))
    }
}

#[async_trait]
impl Connector for KmaAsosConnector {
    fn name(&self) -> &str {
        "KMA_ASOS"
    }

    fn description(&self) -> &str {
        "KMA ASOS daily station data reduced to max 1h / 24h rainfall"
    }

    fn default_target_table(&self) -> &str {
        RAIN_TABLE
    }

    fn credential_env(&self) -> &[&'static str] {
        &KMA_KEY_ENV
    }

    async fn execute(
        &self,
        request: &Request,
        params: &RequestParams,
        ctx: &RunContext<'_>,
    ) -> Result<ConnectorOutput, EngineError> {
        let RequestParams::KmaAsos(p) = params else {
            return Err(EngineError::invariant("KMA_ASOS connector got foreign params"));
        };
        let key = require_key(&KMA_KEY_ENV)?;
        let station = self.station(p, ctx)?;
        let yesterday = ctx.now.date_naive() - Duration::days(1);
        let (start, end) = resolve_dates(p, yesterday)?;
        let (start_s, end_s) = (start.format("%Y%m%d").to_string(), end.format("%Y%m%d").to_string());

        let (items, first_url) = self.fetch_all(ctx, &key, &station, start, end).await?;
        if items.is_empty() {
            return Err(EngineError::data_quality(format!(
                "ASOS returned no items for station {} {}~{}",
                station, start_s, end_s
            )));
        }
        let stats = rain_stats(&items);
        if stats.max_1h.is_none() && stats.max_24h.is_none() {
            return Err(EngineError::data_quality(format!(
                "ASOS items for station {} carry no rainfall values",
                station
            )));
        }

        let ev_id = ctx.new_evidence_id(request)?;
        let payload = json!({
            "station_id": station,
            "start_dt": start_s,
            "end_dt": end_s,
            "item_count": items.len(),
            "items": items,
        });
        let mut meta = Map::new();
        meta.insert("station_id".into(), json!(station));
        meta.insert("start_dt".into(), json!(start_s));
        meta.insert("end_dt".into(), json!(end_s));
        meta.insert("item_count".into(), json!(items.len()));
        meta.insert("total_rain_mm".into(), json!(stats.total.map(round2)));
        meta.insert("request_url".into(), json!(first_url));
        let evidence = ctx.recorder.record(ArtifactSpec {
            evidence_id: &ev_id,
            request,
            dir: ArtifactDir::Api,
            file_name: format!("{}_kma_asos.json", ev_id),
            bytes: &pretty_json(&payload),
            kind: "api_response",
            title: format!("KMA_ASOS:{}", station),
            origin: OriginClass::OfficialSource,
            metadata: meta,
        })?;

        let basis = p
            .source_basis
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("ASOS({}) {}~{}", station, start_s, end_s));
        let mut rows = Vec::new();
        for (suffix, hours, value) in [("1H", 1, stats.max_1h), ("24H", 24, stats.max_24h)] {
            let Some(v) = value else { continue };
            let mut row = Row::new();
            row.insert("rain_id".into(), json!(format!("{}-{}", ev_id, suffix)));
            row.insert("source_basis".into(), json!(basis));
            row.insert("return_period_yr".into(), json!(p.return_period_yr));
            row.insert("duration_hr".into(), json!(hours));
            row.insert("rainfall_mm".into(), json!(round2(v)));
            row.insert("data_origin".into(), json!(OriginClass::OfficialSource.as_str()));
            row.insert("source_tag".into(), json!(request.source_tag_or_default()));
            row.insert("evidence_id".into(), json!(ev_id));
            rows.push(row);
        }

        let mut warnings = Vec::new();
        if stats.max_1h.is_none() {
            warnings.push(format!(
                "station {} reports no hourly maximum; only the 24h row was written",
                station
            ));
        }
        Ok(ConnectorOutput {
            rows,
            evidence: vec![evidence],
            warnings,
        })
    }

    async fn verify(
        &self,
        request: Option<&Request>,
        ctx: &RunContext<'_>,
    ) -> Result<String, EngineError> {
        let key = require_key(&KMA_KEY_ENV)?;
        let station = match request.map(RequestParams::from_request).transpose()? {
            Some(RequestParams::KmaAsos(p)) => self.station(&p, ctx)?,
            _ => "108".to_string(),
        };
        let day = (ctx.now.date_naive() - Duration::days(1)).format("%Y%m%d").to_string();
        let params = pairs(&[
            ("pageNo", "1".to_string()),
            ("numOfRows", "1".to_string()),
            ("dataType", "JSON".to_string()),
            ("dataCd", "ASOS".to_string()),
            ("dateCd", "DAY".to_string()),
            ("startDt", day.clone()),
            ("endDt", day),
            ("stnIds", station.clone()),
        ]);
        let url = build_data_go_kr_url(&ctx.config.endpoints.kma_asos, &key, &params);
        let (items, _) = parse_page(&ctx.http.get_json(&url).await?)?;
        Ok(format!("ASOS station {} answered with {} item(s)", station, items.len()))
    }
}
