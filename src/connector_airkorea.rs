//! AirKorea air-quality connector.
//!
//! Resolves a measuring station (explicit `station_name`, or the nearest
//! one to the site centre via TM coordinates in EPSG:5181), pulls its
//! real-time measurement series for `data_term`, and averages each
//! requested pollutant over the returned period.
//!
//! Credentials: `AIRKOREA_API_KEY`, falling back to `DATA_GO_KR_SERVICE_KEY`.

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use datareq_harness_core::error::EngineError;
use datareq_harness_core::geometry::Crs;
use datareq_harness_core::models::{OriginClass, Request, Row};
use datareq_harness_core::params::RequestParams;
use serde_json::{json, Map, Value};

use crate::connector_kma::parse_amount;
use crate::evidence::{pretty_json, ArtifactDir, ArtifactSpec};
use crate::http::build_data_go_kr_url;
use crate::traits::{require_key, Connector, ConnectorOutput, RunContext};

pub const AIRKOREA_KEY_ENV: [&str; 2] = ["AIRKOREA_API_KEY", "DATA_GO_KR_SERVICE_KEY"];
pub const AIR_TABLE: &str = "ENV_BASE_AIR";

const NEARBY_PATH: &str = "MsrstnInfoInqireSvc/getNearbyMsrstnList";
const MEASURE_PATH: &str = "ArpltnInforInqireSvc/getMsrstnAcctoRltmMesureDnsty";

pub struct AirKoreaConnector;

/// Response field and unit for a pollutant code.
pub fn pollutant_field(code: &str) -> Option<(&'static str, &'static str)> {
    match code.trim().to_ascii_uppercase().as_str() {
        "PM10" => Some(("pm10Value", "µg/m3")),
        "PM25" | "PM2.5" => Some(("pm25Value", "µg/m3")),
        "O3" => Some(("o3Value", "ppm")),
        "NO2" => Some(("no2Value", "ppm")),
        "SO2" => Some(("so2Value", "ppm")),
        "CO" => Some(("coValue", "ppm")),
        _ => None,
    }
}

/// Items of an AirKorea JSON response, checking the result code.
pub fn response_items(body: &Value) -> Result<Vec<Value>, EngineError> {
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
            "AirKorea resultCode {:?}: {}",
            code, msg
        )));
    }
    let items = response.pointer("/body/items");
    Ok(match items {
        Some(Value::Array(list)) => list.clone(),
        Some(Value::Object(o)) => match o.get("item") {
            Some(Value::Array(list)) => list.clone(),
            Some(obj @ Value::Object(_)) => vec![obj.clone()],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    })
}

/// `dataTime` as `YYYY-mm-dd HH:MM`. The service reports midnight as
/// `24:00` of the previous day.
pub fn parse_data_time(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Some(day) = s.strip_suffix(" 24:00") {
        return NaiveDateTime::parse_from_str(&format!("{} 00:00", day), "%Y-%m-%d %H:%M")
            .ok()
            .map(|t| t + Duration::days(1));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").ok()
}

/// Mean of a pollutant over items and the number of valid samples.
pub fn average(items: &[Value], field: &str) -> Option<(f64, usize)> {
    let values: Vec<f64> = items.iter().filter_map(|i| parse_amount(i.get(field))).collect();
    if values.is_empty() {
        return None;
    }
    Some((values.iter().sum::<f64>() / values.len() as f64, values.len()))
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn pairs(p: &[(&str, String)]) -> Vec<(String, String)> {
    p.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

struct Station {
    name: String,
    distance_km: Option<f64>,
    lookup: Option<Value>,
}

impl AirKoreaConnector {
    async fn resolve_station(
        &self,
        explicit: Option<&str>,
        key: &str,
        ctx: &RunContext<'_>,
    ) -> Result<Station, EngineError> {
        if let Some(name) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(Station {
                name: name.to_string(),
                distance_km: None,
                lookup: None,
            });
        }
        let center = ctx.site().require_center()?;
        let tm = Crs::from_epsg(5181)?.forward(center)?;
        let url = build_data_go_kr_url(
            &format!("{}/{}", ctx.config.endpoints.airkorea.trim_end_matches('/'), NEARBY_PATH),
            key,
            &pairs(&[
                ("returnType", "json".to_string()),
                ("tmX", format!("{:.3}", tm.x)),
                ("tmY", format!("{:.3}", tm.y)),
                ("ver", "1.1".to_string()),
            ]),
        );
        let body = ctx.http.get_json(&url).await?;
        let items = response_items(&body)?;
        let first = items.first().ok_or_else(|| {
            EngineError::data_quality("AirKorea found no measuring station near the site")
        })?;
        let name = first
            .get("stationName")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::data_quality("nearest station has no stationName"))?;
        Ok(Station {
            name: name.to_string(),
            distance_km: parse_amount(first.get("tm")),
            lookup: Some(body),
        })
    }
}

#[async_trait]
impl Connector for AirKoreaConnector {
    fn name(&self) -> &str {
        "AIRKOREA"
    }

    fn description(&self) -> &str {
        "AirKorea station measurements averaged per pollutant"
    }

    fn default_target_table(&self) -> &str {
        AIR_TABLE
    }

    fn credential_env(&self) -> &[&'static str] {
        &AIRKOREA_KEY_ENV
    }

    async fn execute(
        &self,
        request: &Request,
        params: &RequestParams,
        ctx: &RunContext<'_>,
    ) -> Result<ConnectorOutput, EngineError> {
        let RequestParams::AirKorea(p) = params else {
            return Err(EngineError::invariant("AIRKOREA connector got foreign params"));
        };
        let key = require_key(&AIRKOREA_KEY_ENV)?;
        let station = self.resolve_station(p.station_name.as_deref(), &key, ctx).await?;
        let data_term = p.data_term.trim().to_ascii_uppercase();

        let url = build_data_go_kr_url(
            &format!("{}/{}", ctx.config.endpoints.airkorea.trim_end_matches('/'), MEASURE_PATH),
            &key,
            &pairs(&[
                ("returnType", "json".to_string()),
                ("numOfRows", "200".to_string()),
                ("pageNo", "1".to_string()),
                ("stationName", station.name.clone()),
                ("dataTerm", data_term.clone()),
                ("ver", "1.3".to_string()),
            ]),
        );
        let body = ctx.http.get_json(&url).await?;
        let items = response_items(&body)?;
        if items.is_empty() {
            return Err(EngineError::data_quality(format!(
                "AirKorea returned no measurements for {}",
                station.name
            )));
        }

        let times: Vec<NaiveDateTime> = items
            .iter()
            .filter_map(|i| i.get("dataTime").and_then(|t| t.as_str()))
            .filter_map(parse_data_time)
            .collect();
        let fmt = |t: Option<&NaiveDateTime>| t.map(|t| t.format("%Y-%m-%d %H:%M").to_string());
        let period_start = fmt(times.iter().min());
        let period_end = fmt(times.iter().max());

        let mut averages = Vec::new();
        let mut warnings = Vec::new();
        for code in &p.pollutants {
            let Some((field, unit)) = pollutant_field(code) else {
                warnings.push(format!("unknown pollutant {} skipped", code));
                continue;
            };
            match average(&items, field) {
                Some((avg, n)) => averages.push((code.to_ascii_uppercase(), unit, avg, n)),
                None => warnings.push(format!("no valid {} samples at {}", code, station.name)),
            }
        }
        if averages.is_empty() {
            return Err(EngineError::data_quality(format!(
                "AirKorea measurements at {} carry no usable values",
                station.name
            )));
        }

        let ev_id = ctx.new_evidence_id(request)?;
        let payload = json!({
            "station_name": station.name,
            "station_distance_km": station.distance_km,
            "data_term": data_term,
            "station_lookup": station.lookup,
            "measurements": items,
        });
        let mut meta = Map::new();
        meta.insert("station_name".into(), json!(station.name));
        meta.insert("data_term".into(), json!(data_term));
        meta.insert("period_start".into(), json!(period_start));
        meta.insert("period_end".into(), json!(period_end));
        meta.insert("request_url".into(), json!(url));
        let evidence = ctx.recorder.record(ArtifactSpec {
            evidence_id: &ev_id,
            request,
            dir: ArtifactDir::Api,
            file_name: format!("{}_airkorea.json", ev_id),
            bytes: &pretty_json(&payload),
            kind: "api_response",
            title: format!("AIRKOREA:{}", station.name),
            origin: OriginClass::OfficialSource,
            metadata: meta,
        })?;

        let period = match (&period_start, &period_end) {
            (Some(s), Some(e)) => format!("{}~{}", s, e),
            _ => data_term.clone(),
        };
        let rows = averages
            .into_iter()
            .map(|(code, unit, avg, n)| {
                let mut row = Row::new();
                row.insert("air_id".into(), json!(format!("{}-{}", ev_id, code)));
                row.insert("station_name".into(), json!(station.name));
                row.insert("station_distance_km".into(), json!(station.distance_km));
                row.insert("pollutant".into(), json!(code));
                row.insert("value".into(), json!(round4(avg)));
                row.insert("unit".into(), json!(unit));
                row.insert("sample_count".into(), json!(n));
                row.insert("period".into(), json!(period));
                row.insert("period_start".into(), json!(period_start));
                row.insert("period_end".into(), json!(period_end));
                row.insert("data_origin".into(), json!(OriginClass::OfficialSource.as_str()));
                row.insert("source_tag".into(), json!(request.source_tag_or_default()));
                row.insert("evidence_id".into(), json!(ev_id));
                row
            })
            .collect();

        Ok(ConnectorOutput {
            rows,
            evidence: vec![evidence],
            warnings,
        })
    }
}
