//! NIER water-quality survey connector.
//!
//! Environmental impact assessment projects publish their water survey
//! stations under a project code (`mgtNo`). Each station carries its
//! surveyed values and UTM-K (EPSG:5179) coordinates; rows come out in
//! long format, one per station and parameter, with the straight-line
//! distance from the site centre when the centre is known.
//!
//! Credentials: `NIER_WATER_API_KEY`, falling back to `DATA_GO_KR_SERVICE_KEY`.

use async_trait::async_trait;
use datareq_harness_core::error::EngineError;
use datareq_harness_core::geometry::{Crs, Point};
use datareq_harness_core::models::{OriginClass, Request, Row};
use datareq_harness_core::overlay::round_1;
use datareq_harness_core::params::RequestParams;
use serde_json::{json, Map, Value};

use crate::connector_kma::parse_amount;
use crate::evidence::{pretty_json, ArtifactDir, ArtifactSpec};
use crate::http::build_data_go_kr_url;
use crate::sanitize::redact_text;
use crate::traits::{require_key, Connector, ConnectorOutput, RunContext};

pub const NIER_KEY_ENV: [&str; 2] = ["NIER_WATER_API_KEY", "DATA_GO_KR_SERVICE_KEY"];
pub const WATER_TABLE: &str = "ENV_BASE_WATER";

/// Parameter code, response field, unit.
const PARAMETERS: [(&str, &str, &str); 7] = [
    ("BOD", "bodVal", "mg/L"),
    ("COD", "codVal", "mg/L"),
    ("SS", "ssVal", "mg/L"),
    ("TN", "tnVal", "mg/L"),
    ("TP", "tpVal", "mg/L"),
    ("DO", "doVal", "mg/L"),
    ("PH", "phVal", ""),
];

pub struct NierWaterConnector;

/// One surveyed spot.
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyStation {
    pub name: String,
    pub address: String,
    /// UTM-K coordinates, when reported.
    pub position: Option<Point>,
    /// `(parameter, value)` in [`PARAMETERS`] order.
    pub values: Vec<(&'static str, f64)>,
}

/// A JSON value that may be a single object or a list of them.
fn objects(v: Option<&Value>) -> Vec<&Map<String, Value>> {
    match v {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
        Some(Value::Object(o)) => vec![o],
        _ => Vec::new(),
    }
}

fn text(o: &Map<String, Value>, key: &str) -> String {
    o.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}

/// Stations of a survey response, checking the result code.
pub fn parse_stations(body: &Value) -> Result<Vec<SurveyStation>, EngineError> {
    let response = body.get("response").unwrap_or(body);
    if let Some(code) = response.pointer("/header/resultCode") {
        let code = match code {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        };
        if !code.is_empty() && !matches!(code.as_str(), "00" | "0" | "200") {
            let msg = response
                .pointer("/header/resultMsg")
                .and_then(Value::as_str)
                .unwrap_or("");
            return Err(EngineError::data_quality(format!(
                "NIER survey resultCode {:?}: {}",
                code, msg
            )));
        }
    }

    let mut stations = Vec::new();
    for group in objects(response.pointer("/body/ivstgGbs")) {
        for spot in objects(group.get("ivstgs")) {
            let name = text(spot, "ivstgSpotNm");
            let address = text(spot, "adres");
            let position = match (parse_amount(spot.get("xcnts")), parse_amount(spot.get("ydnts"))) {
                (Some(x), Some(y)) => Some(Point::new(x, y)),
                _ => None,
            };
            let odrs = spot.get("odrs");
            let values: Vec<(&'static str, f64)> = PARAMETERS
                .iter()
                .filter_map(|(code, field, _)| {
                    parse_amount(odrs.and_then(|o| o.get(*field))).map(|v| (*code, v))
                })
                .collect();
            if values.is_empty() && name.is_empty() && address.is_empty() {
                continue;
            }
            stations.push(SurveyStation {
                name,
                address,
                position,
                values,
            });
        }
    }
    Ok(stations)
}

fn unit_of(code: &str) -> &'static str {
    PARAMETERS
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, _, u)| *u)
        .unwrap_or("")
}

/// Straight-line distance in UTM-K from `site` (already projected).
pub fn station_distance(site: Option<Point>, station: &SurveyStation) -> Option<f64> {
    let (s, p) = (site?, station.position?);
    Some(round_1(((p.x - s.x).powi(2) + (p.y - s.y).powi(2)).sqrt()))
}

#[async_trait]
impl Connector for NierWaterConnector {
    fn name(&self) -> &str {
        "NIER_WATER"
    }

    fn description(&self) -> &str {
        "NIER assessment water-quality survey stations"
    }

    fn default_target_table(&self) -> &str {
        WATER_TABLE
    }

    fn credential_env(&self) -> &[&'static str] {
        &NIER_KEY_ENV
    }

    async fn execute(
        &self,
        request: &Request,
        params: &RequestParams,
        ctx: &RunContext<'_>,
    ) -> Result<ConnectorOutput, EngineError> {
        let RequestParams::NierWater(p) = params else {
            return Err(EngineError::invariant("NIER_WATER connector got foreign params"));
        };
        let key = require_key(&NIER_KEY_ENV)?;
        let mgt_no = p.mgt_no.trim().to_string();

        let mut query = vec![
            ("mgtNo".to_string(), mgt_no.clone()),
            ("type".to_string(), "json".to_string()),
        ];
        if let Some(spot) = p.spot_name() {
            query.push(("ivstgSpotNm".to_string(), spot.to_string()));
        }
        let url = build_data_go_kr_url(&ctx.config.endpoints.nier_water, &key, &query);
        let body = ctx.http.get_json(&url).await?;
        let stations = parse_stations(&body)?;
        if stations.is_empty() {
            return Err(EngineError::data_quality(format!(
                "NIER survey returned no stations for {}",
                mgt_no
            )));
        }

        let utmk = Crs::from_epsg(5179)?;
        let mut warnings = Vec::new();
        let site = match ctx.site().center {
            Some(c) => Some(utmk.forward(c)?),
            None => {
                warnings.push("site centre unknown; distances left empty".to_string());
                None
            }
        };

        let ev_id = ctx.new_evidence_id(request)?;
        let payload = json!({
            "request": {
                "url": redact_text(&url),
                "params": query
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect::<Map<String, Value>>(),
            },
            "response": body,
            "computed": {
                "mgt_no": mgt_no,
                "station_count": stations.len(),
                "fields": PARAMETERS.iter().map(|(c, _, _)| *c).collect::<Vec<_>>(),
            },
        });
        let mut meta = Map::new();
        meta.insert("mgt_no".into(), json!(mgt_no));
        meta.insert("station_count".into(), json!(stations.len()));
        meta.insert("request_url".into(), json!(url));
        let evidence = ctx.recorder.record(ArtifactSpec {
            evidence_id: &ev_id,
            request,
            dir: ArtifactDir::Api,
            file_name: format!("{}_nier_ivstg.json", ev_id),
            bytes: &pretty_json(&payload),
            kind: "api_response",
            title: format!("NIER_WATER_IVSTG:{}", mgt_no),
            origin: OriginClass::OfficialSource,
            metadata: meta,
        })?;

        let mut rows = Vec::new();
        for (i, station) in stations.iter().enumerate() {
            if station.values.is_empty() {
                warnings.push(format!("station {} reports no values", station.name));
            }
            let distance = station_distance(site, station);
            let name = if station.name.is_empty() {
                "survey spot"
            } else {
                station.name.as_str()
            };
            for (code, value) in &station.values {
                let mut row = Row::new();
                row.insert("water_id".into(), json!(format!("WAT-{:03}", i + 1)));
                row.insert("waterbody_name".into(), json!(name));
                row.insert("relation".into(), json!(station.address));
                row.insert("distance_m".into(), json!(distance));
                row.insert("parameter".into(), json!(code));
                row.insert("value".into(), json!(value));
                row.insert("unit".into(), json!(unit_of(code)));
                row.insert("sampling_date".into(), json!(""));
                row.insert("data_origin".into(), json!(OriginClass::OfficialSource.as_str()));
                row.insert("source_tag".into(), json!(request.source_tag_or_default()));
                row.insert("evidence_id".into(), json!(ev_id));
                rows.push(row);
            }
        }
        if rows.is_empty() {
            return Err(EngineError::data_quality(format!(
                "NIER survey stations for {} carry no usable values",
                mgt_no
            )));
        }

        Ok(ConnectorOutput {
            rows,
            evidence: vec![evidence],
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn survey() -> Value {
        json!({"response": {
            "header": {"resultCode": "00", "resultMsg": "NORMAL SERVICE."},
            "body": {"ivstgGbs": [
                {"ivstgs": [
                    {"ivstgSpotNm": "Upstream", "adres": "Gapyeong", "xcnts": "1000300", "ydnts": "2000400",
                     "odrs": {"bodVal": "1.2", "phVal": "7.4", "ssVal": "-"}},
                    {"ivstgSpotNm": "", "adres": "", "odrs": {}}
                ]},
                {"ivstgs": {"ivstgSpotNm": "Downstream", "odrs": {"tpVal": 0.031}}}
            ]}
        }})
    }

    #[test]
    fn stations_come_from_nested_groups() {
        let stations = parse_stations(&survey()).unwrap();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].name, "Upstream");
        assert_eq!(stations[0].values, vec![("BOD", 1.2), ("PH", 7.4)]);
        assert_eq!(stations[0].position, Some(Point::new(1_000_300.0, 2_000_400.0)));
        assert_eq!(stations[1].values, vec![("TP", 0.031)]);
        assert_eq!(stations[1].position, None);
    }

    #[test]
    fn error_code_is_data_quality() {
        let body = json!({"response": {"header": {"resultCode": "30", "resultMsg": "SERVICE KEY IS NOT REGISTERED"}}});
        let err = parse_stations(&body).unwrap_err();
        assert!(matches!(err, EngineError::DataQuality(_)));
        assert!(err.message().contains("30"));
    }

    #[test]
    fn distance_needs_both_positions() {
        let stations = parse_stations(&survey()).unwrap();
        let site = Some(Point::new(1_000_000.0, 2_000_000.0));
        assert_eq!(station_distance(site, &stations[0]), Some(500.0));
        assert_eq!(station_distance(None, &stations[0]), None);
        assert_eq!(station_distance(site, &stations[1]), None);
    }

    #[test]
    fn ph_has_no_unit() {
        assert_eq!(unit_of("PH"), "");
        assert_eq!(unit_of("COD"), "mg/L");
    }
}
