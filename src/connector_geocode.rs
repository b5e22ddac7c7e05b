//! Address geocoder (VWorld or Nominatim).
//!
//! Writes the site centre back into `LOCATION` so later requests in the
//! same run (station lookup, map extents, overlays) can use it.

use async_trait::async_trait;
use datareq_harness_core::error::EngineError;
use datareq_harness_core::geometry::Point;
use datareq_harness_core::models::{OriginClass, Request, Row, LOCATION_TABLE};
use datareq_harness_core::params::RequestParams;
use serde_json::{json, Map, Value};

use crate::evidence::{pretty_json, ArtifactDir, ArtifactSpec};
use crate::http::{build_url, env_key};
use crate::traits::{Connector, ConnectorOutput, RunContext};

pub const VWORLD_KEY_ENV: [&str; 1] = ["VWORLD_API_KEY"];

pub struct GeocodeConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Vworld,
    Nominatim,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Vworld => "VWORLD",
            Provider::Nominatim => "NOMINATIM",
        }
    }
}

/// `AUTO` picks VWorld when its key is present.
pub fn choose_provider(name: &str, vworld_key_present: bool) -> Result<Provider, EngineError> {
    match name.trim().to_ascii_uppercase().as_str() {
        "" | "AUTO" => Ok(if vworld_key_present {
            Provider::Vworld
        } else {
            Provider::Nominatim
        }),
        "VWORLD" => Ok(Provider::Vworld),
        "NOMINATIM" | "OSM" => Ok(Provider::Nominatim),
        other => Err(EngineError::config(format!("unknown geocode provider '{}'", other))),
    }
}

fn coord(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn checked(lon: f64, lat: f64) -> Option<Point> {
    ((-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat)).then(|| Point::new(lon, lat))
}

/// `Ok(None)` when VWorld reports `NOT_FOUND`.
pub fn parse_vworld(body: &Value) -> Result<Option<Point>, EngineError> {
    let response = body.get("response").unwrap_or(body);
    let status = response
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("")
        .to_ascii_uppercase();
    match status.as_str() {
        "OK" => {
            let point = response.pointer("/result/point");
            let lon = coord(point.and_then(|p| p.get("x")));
            let lat = coord(point.and_then(|p| p.get("y")));
            match (lon, lat) {
                (Some(lon), Some(lat)) => checked(lon, lat)
                    .map(Some)
                    .ok_or_else(|| EngineError::data_quality("VWorld point is out of range")),
                _ => Err(EngineError::data_quality("VWorld response has no result.point")),
            }
        }
        "NOT_FOUND" => Ok(None),
        _ => {
            let text = response
                .pointer("/error/text")
                .and_then(|t| t.as_str())
                .unwrap_or("");
            Err(EngineError::data_quality(format!(
                "VWorld status {:?}: {}",
                status, text
            )))
        }
    }
}

pub fn parse_nominatim(body: &Value) -> Result<Option<Point>, EngineError> {
    let Some(list) = body.as_array() else {
        return Err(EngineError::data_quality("Nominatim returned a non-list body"));
    };
    let Some(first) = list.first() else {
        return Ok(None);
    };
    match (coord(first.get("lon")), coord(first.get("lat"))) {
        (Some(lon), Some(lat)) => checked(lon, lat)
            .map(Some)
            .ok_or_else(|| EngineError::data_quality("Nominatim point is out of range")),
        _ => Err(EngineError::data_quality("Nominatim hit has no lat/lon")),
    }
}

fn pairs(p: &[(&str, &str)]) -> Vec<(String, String)> {
    p.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

impl GeocodeConnector {
    async fn vworld(
        &self,
        address: &str,
        key: &str,
        ctx: &RunContext<'_>,
    ) -> Result<(Option<Point>, Vec<Value>), EngineError> {
        let mut responses = Vec::new();
        // Road-name addresses first, then lot-number addresses.
        for kind in ["road", "parcel"] {
            let url = build_url(
                &ctx.config.endpoints.vworld,
                &pairs(&[
                    ("service", "address"),
                    ("request", "getcoord"),
                    ("version", "2.0"),
                    ("crs", "epsg:4326"),
                    ("address", address),
                    ("format", "json"),
                    ("type", kind),
                    ("key", key),
                ]),
            )?;
            let body = ctx.http.get_json(&url).await?;
            let point = parse_vworld(&body)?;
            responses.push(body);
            if point.is_some() {
                return Ok((point, responses));
            }
        }
        Ok((None, responses))
    }

    async fn nominatim(
        &self,
        address: &str,
        ctx: &RunContext<'_>,
    ) -> Result<(Option<Point>, Vec<Value>), EngineError> {
        let url = build_url(
            &ctx.config.endpoints.nominatim,
            &pairs(&[("q", address), ("format", "jsonv2"), ("limit", "1")]),
        )?;
        let body = ctx.http.get_json(&url).await?;
        let point = parse_nominatim(&body)?;
        Ok((point, vec![body]))
    }
}

#[async_trait]
impl Connector for GeocodeConnector {
    fn name(&self) -> &str {
        "GEOCODE"
    }

    fn description(&self) -> &str {
        "Site address to WGS84 centre via VWorld or Nominatim"
    }

    fn default_target_table(&self) -> &str {
        LOCATION_TABLE
    }

    async fn execute(
        &self,
        request: &Request,
        params: &RequestParams,
        ctx: &RunContext<'_>,
    ) -> Result<ConnectorOutput, EngineError> {
        let RequestParams::Geocode(p) = params else {
            return Err(EngineError::invariant("GEOCODE connector got foreign params"));
        };
        let site = ctx.site();
        let address = p
            .address
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or(site.address.clone())
            .ok_or_else(|| EngineError::config("no address in params or LOCATION"))?;
        let vworld_key = env_key(&VWORLD_KEY_ENV);
        let provider = choose_provider(
            p.provider.as_deref().unwrap_or(&ctx.config.geocode.provider),
            vworld_key.is_some(),
        )?;

        let (point, responses) = match provider {
            Provider::Vworld => {
                let key = vworld_key.ok_or_else(|| {
                    EngineError::config(format!("missing env {}", VWORLD_KEY_ENV[0]))
                })?;
                self.vworld(&address, &key, ctx).await?
            }
            Provider::Nominatim => self.nominatim(&address, ctx).await?,
        };
        let point = point.ok_or_else(|| {
            EngineError::data_quality(format!("{} found no match for '{}'", provider.as_str(), address))
        })?;
        tracing::info!(provider = provider.as_str(), lon = point.x, lat = point.y, "geocoded site");

        let ev_id = ctx.new_evidence_id(request)?;
        let payload = json!({
            "provider": provider.as_str(),
            "address": address,
            "lon": point.x,
            "lat": point.y,
            "responses": responses,
        });
        let mut meta = Map::new();
        meta.insert("provider".into(), json!(provider.as_str()));
        meta.insert("address".into(), json!(address));
        let evidence = ctx.recorder.record(ArtifactSpec {
            evidence_id: &ev_id,
            request,
            dir: ArtifactDir::Api,
            file_name: format!("{}_geocode.json", ev_id),
            bytes: &pretty_json(&payload),
            kind: "api_response",
            title: format!("GEOCODE:{}", provider.as_str()),
            origin: OriginClass::OfficialSource,
            metadata: meta,
        })?;

        let mut row = Row::new();
        row.insert("location_id".into(), json!(site.location_id));
        row.insert("center_lat".into(), json!(point.y));
        row.insert("center_lon".into(), json!(point.x));
        row.insert("crs".into(), json!("EPSG:4326"));
        row.insert("geocode_provider".into(), json!(provider.as_str()));
        row.insert("evidence_id".into(), json!(ev_id));
        if site.address.is_none() {
            row.insert("address".into(), json!(address));
        }

        Ok(ConnectorOutput {
            rows: vec![row],
            evidence: vec![evidence],
            warnings: Vec::new(),
        })
    }

    async fn verify(&self, _request: Option<&Request>, ctx: &RunContext<'_>) -> Result<String, EngineError> {
        let key = env_key(&VWORLD_KEY_ENV);
        let provider = choose_provider(&ctx.config.geocode.provider, key.is_some())?;
        Ok(match provider {
            Provider::Vworld if key.is_none() => {
                return Err(EngineError::config(format!("missing env {}", VWORLD_KEY_ENV[0])))
            }
            Provider::Vworld => format!("provider VWORLD, credential {} present", VWORLD_KEY_ENV[0]),
            Provider::Nominatim => "provider NOMINATIM, no credentials required".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_prefers_vworld_with_key() {
        assert_eq!(choose_provider("AUTO", true).unwrap(), Provider::Vworld);
        assert_eq!(choose_provider("auto", false).unwrap(), Provider::Nominatim);
        assert_eq!(choose_provider("nominatim", true).unwrap(), Provider::Nominatim);
        assert!(choose_provider("GOOGLE", true).is_err());
    }

    #[test]
    fn vworld_point_and_not_found() {
        let ok = json!({"response": {"status": "OK", "result": {"point": {"x": "126.9779", "y": "37.5663"}}}});
        assert_eq!(parse_vworld(&ok).unwrap(), Some(Point::new(126.9779, 37.5663)));
        let miss = json!({"response": {"status": "NOT_FOUND"}});
        assert_eq!(parse_vworld(&miss).unwrap(), None);
        let err = json!({"response": {"status": "ERROR", "error": {"text": "INVALID_KEY"}}});
        assert!(matches!(parse_vworld(&err), Err(EngineError::DataQuality(_))));
    }

    #[test]
    fn nominatim_first_hit() {
        let body = json!([{"lat": "35.1796", "lon": "129.0756"}, {"lat": "0", "lon": "0"}]);
        assert_eq!(parse_nominatim(&body).unwrap(), Some(Point::new(129.0756, 35.1796)));
        assert_eq!(parse_nominatim(&json!([])).unwrap(), None);
        assert!(parse_nominatim(&json!({"error": "x"})).is_err());
    }
}
