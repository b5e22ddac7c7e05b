//! Connector parameters as a tagged union.
//!
//! The catalog stores parameters as an open JSON object next to a
//! connector name. At dispatch time the pair is parsed into
//! [`RequestParams`], one strongly-typed struct per connector kind, and
//! validated. Malformed parameters surface as
//! [`EngineError::Configuration`] before any I/O happens.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::models::Request;

/// The fixed set of connector kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectorKind {
    KmaAsos,
    AirKorea,
    Kosis,
    Wms,
    Geocode,
    PdfPage,
    AutoGis,
    NierWater,
}

impl ConnectorKind {
    pub const ALL: [ConnectorKind; 8] = [
        ConnectorKind::KmaAsos,
        ConnectorKind::AirKorea,
        ConnectorKind::Kosis,
        ConnectorKind::NierWater,
        ConnectorKind::Wms,
        ConnectorKind::Geocode,
        ConnectorKind::PdfPage,
        ConnectorKind::AutoGis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::KmaAsos => "KMA_ASOS",
            ConnectorKind::AirKorea => "AIRKOREA",
            ConnectorKind::Kosis => "KOSIS",
            ConnectorKind::Wms => "WMS",
            ConnectorKind::Geocode => "GEOCODE",
            ConnectorKind::PdfPage => "PDF_PAGE",
            ConnectorKind::AutoGis => "AUTO_GIS",
            ConnectorKind::NierWater => "NIER_WATER",
        }
    }
}

impl FromStr for ConnectorKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        ConnectorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == upper)
            .ok_or_else(|| EngineError::config(format!("unknown connector '{}'", s.trim())))
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for every connector kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "connector", content = "params")]
pub enum RequestParams {
    #[serde(rename = "KMA_ASOS")]
    KmaAsos(KmaAsosParams),
    #[serde(rename = "AIRKOREA")]
    AirKorea(AirKoreaParams),
    #[serde(rename = "KOSIS")]
    Kosis(KosisParams),
    #[serde(rename = "WMS")]
    Wms(WmsParams),
    #[serde(rename = "GEOCODE")]
    Geocode(GeocodeParams),
    #[serde(rename = "PDF_PAGE")]
    PdfPage(PdfPageParams),
    #[serde(rename = "AUTO_GIS")]
    AutoGis(OverlayParams),
    #[serde(rename = "NIER_WATER")]
    NierWater(NierWaterParams),
}

fn parse_as<T: DeserializeOwned>(kind: ConnectorKind, params: &Value) -> Result<T, EngineError> {
    let value = match params {
        Value::Null => Value::Object(Default::default()),
        Value::String(s) if s.trim().is_empty() => Value::Object(Default::default()),
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| EngineError::config(format!("{} params are not JSON: {}", kind, e)))?,
        other => other.clone(),
    };
    serde_json::from_value(value)
        .map_err(|e| EngineError::config(format!("invalid {} params: {}", kind, e)))
}

impl RequestParams {
    /// Parse and validate the parameters of a catalog row.
    pub fn parse(connector: &str, params: &Value) -> Result<Self, EngineError> {
        let kind: ConnectorKind = connector.parse()?;
        let parsed = match kind {
            ConnectorKind::KmaAsos => RequestParams::KmaAsos(parse_as(kind, params)?),
            ConnectorKind::AirKorea => RequestParams::AirKorea(parse_as(kind, params)?),
            ConnectorKind::Kosis => RequestParams::Kosis(parse_as(kind, params)?),
            ConnectorKind::Wms => RequestParams::Wms(parse_as(kind, params)?),
            ConnectorKind::Geocode => RequestParams::Geocode(parse_as(kind, params)?),
            ConnectorKind::PdfPage => RequestParams::PdfPage(parse_as(kind, params)?),
            ConnectorKind::AutoGis => RequestParams::AutoGis(parse_as(kind, params)?),
            ConnectorKind::NierWater => RequestParams::NierWater(parse_as(kind, params)?),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn from_request(request: &Request) -> Result<Self, EngineError> {
        Self::parse(&request.connector, &request.params)
    }

    pub fn kind(&self) -> ConnectorKind {
        match self {
            RequestParams::KmaAsos(_) => ConnectorKind::KmaAsos,
            RequestParams::AirKorea(_) => ConnectorKind::AirKorea,
            RequestParams::Kosis(_) => ConnectorKind::Kosis,
            RequestParams::Wms(_) => ConnectorKind::Wms,
            RequestParams::Geocode(_) => ConnectorKind::Geocode,
            RequestParams::PdfPage(_) => ConnectorKind::PdfPage,
            RequestParams::AutoGis(_) => ConnectorKind::AutoGis,
            RequestParams::NierWater(_) => ConnectorKind::NierWater,
        }
    }

    /// The untagged parameter object, as stored in the catalog.
    pub fn to_value(&self) -> Value {
        let tagged = serde_json::to_value(self).unwrap_or(Value::Null);
        tagged.get("params").cloned().unwrap_or(Value::Null)
    }

    /// Build a catalog row carrying these parameters.
    pub fn into_request(self, id: impl Into<String>) -> Request {
        let mut request = Request::new(id, self.kind().as_str());
        request.params = self.to_value();
        request
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            RequestParams::KmaAsos(p) => p.validate(),
            RequestParams::AirKorea(p) => p.validate(),
            RequestParams::Kosis(p) => p.validate(),
            RequestParams::Wms(p) => p.validate(),
            RequestParams::Geocode(_) => Ok(()),
            RequestParams::PdfPage(p) => p.validate(),
            RequestParams::AutoGis(p) => p.validate(),
            RequestParams::NierWater(p) => p.validate(),
        }
    }
}

/// Request ids whose evidence these parameters consume: every
/// `from_req_id`, sorted and deduplicated.
///
/// Scans the raw value, so freshness checks work on rows whose
/// parameters would fail validation.
pub fn raw_upstream_ids(params: &Value) -> Vec<String> {
    let mut ids = Vec::new();
    collect_from_req_ids(params, &mut ids);
    ids.sort();
    ids.dedup();
    ids
}

fn collect_from_req_ids(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if k == "from_req_id" {
                    if let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
                        out.push(s.to_string());
                    }
                } else {
                    collect_from_req_ids(v, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_from_req_ids(v, out)),
        Value::String(s) if s.trim_start().starts_with('{') => {
            if let Ok(inner) = serde_json::from_str::<Value>(s) {
                collect_from_req_ids(&inner, out);
            }
        }
        _ => {}
    }
}

/// Parse a `YYYYMMDD` date.
pub fn parse_ymd(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y%m%d").ok()
}

fn check_ymd(field: &str, value: &Option<String>) -> Result<(), EngineError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(()),
        Some(s) if parse_ymd(s).is_some() => Ok(()),
        Some(s) => Err(EngineError::config(format!(
            "{} must be YYYYMMDD, got '{}'",
            field, s
        ))),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Weather station (KMA ASOS)
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StationCandidate {
    #[serde(alias = "stn_id")]
    pub station_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KmaAsosParams {
    #[serde(default, alias = "stnIds", skip_serializing_if = "Option::is_none")]
    pub stn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub station_candidates: Vec<StationCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_dt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_dt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_basis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_period_yr: Option<f64>,
}

impl KmaAsosParams {
    /// Explicit station, else the first candidate.
    pub fn station_id(&self) -> Option<String> {
        self.stn_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.station_candidates
                    .iter()
                    .map(|c| c.station_id.trim())
                    .find(|s| !s.is_empty())
                    .map(str::to_string)
            })
    }

    fn validate(&self) -> Result<(), EngineError> {
        check_ymd("start_dt", &self.start_dt)?;
        check_ymd("end_dt", &self.end_dt)?;
        if let (Some(s), Some(e)) = (
            self.start_dt.as_deref().and_then(parse_ymd),
            self.end_dt.as_deref().and_then(parse_ymd),
        ) {
            if s > e {
                return Err(EngineError::config(format!(
                    "start_dt {} is after end_dt {}",
                    s.format("%Y%m%d"),
                    e.format("%Y%m%d")
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Air quality (AirKorea)
// ═══════════════════════════════════════════════════════════════════════

fn default_data_term() -> String {
    "MONTH".to_string()
}

fn default_pollutants() -> Vec<String> {
    vec!["PM10".into(), "PM25".into(), "O3".into()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirKoreaParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_name: Option<String>,
    #[serde(default = "default_data_term")]
    pub data_term: String,
    #[serde(default = "default_pollutants")]
    pub pollutants: Vec<String>,
}

impl Default for AirKoreaParams {
    fn default() -> Self {
        Self {
            station_name: None,
            data_term: default_data_term(),
            pollutants: default_pollutants(),
        }
    }
}

impl AirKoreaParams {
    fn validate(&self) -> Result<(), EngineError> {
        match self.data_term.trim().to_ascii_uppercase().as_str() {
            "DAILY" | "MONTH" | "3MONTH" => {}
            other => {
                return Err(EngineError::config(format!(
                    "data_term must be DAILY, MONTH or 3MONTH, got '{}'",
                    other
                )))
            }
        }
        for p in &self.pollutants {
            if !matches!(p.to_ascii_uppercase().as_str(), "PM10" | "PM25" | "O3" | "NO2" | "SO2" | "CO") {
                return Err(EngineError::config(format!("unsupported pollutant '{}'", p)));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Census statistics (KOSIS)
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KosisParams {
    pub dataset_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_year: Option<String>,
}

impl KosisParams {
    fn validate(&self) -> Result<(), EngineError> {
        if self.dataset_key.trim().is_empty() {
            return Err(EngineError::config("dataset_key is required"));
        }
        for (field, v) in [("start_year", &self.start_year), ("end_year", &self.end_year)] {
            if let Some(y) = v.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                if y.len() != 4 || y.parse::<u32>().is_err() {
                    return Err(EngineError::config(format!("{} must be YYYY, got '{}'", field, y)));
                }
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Water quality survey (NIER)
// ═══════════════════════════════════════════════════════════════════════

/// Survey stations of an environmental impact assessment project.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NierWaterParams {
    /// Assessment project code (`mgtNo`).
    #[serde(default, alias = "mgtNo")]
    pub mgt_no: String,
    #[serde(default, alias = "ivstgSpotNm", skip_serializing_if = "Option::is_none")]
    pub ivstg_spot_nm: Option<String>,
}

impl NierWaterParams {
    /// Spot name filter, `None` when blank.
    pub fn spot_name(&self) -> Option<&str> {
        self.ivstg_spot_nm
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.mgt_no.trim().is_empty() {
            return Err(EngineError::config("mgt_no (assessment project code) is required"));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Map image (WMS)
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BboxMode {
    /// Boundary envelope when a boundary exists, else point + radius.
    #[default]
    Auto,
    Boundary,
    Point,
}

fn default_radius_m() -> f64 {
    1000.0
}

fn default_image_px() -> u32 {
    1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WmsParams {
    pub layer_key: String,
    #[serde(default)]
    pub bbox_mode: BboxMode,
    #[serde(default = "default_radius_m")]
    pub radius_m: f64,
    #[serde(default = "default_image_px")]
    pub width: u32,
    #[serde(default = "default_image_px")]
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub figure_id: Option<String>,
}

impl WmsParams {
    pub fn new(layer_key: impl Into<String>) -> Self {
        Self {
            layer_key: layer_key.into(),
            bbox_mode: BboxMode::Auto,
            radius_m: default_radius_m(),
            width: default_image_px(),
            height: default_image_px(),
            srs: None,
            force_refresh: false,
            figure_id: None,
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.layer_key.trim().is_empty() {
            return Err(EngineError::config("layer_key is required"));
        }
        if !(self.radius_m > 0.0) {
            return Err(EngineError::config("radius_m must be > 0"));
        }
        for (field, v) in [("width", self.width), ("height", self.height)] {
            if v == 0 || v > 4096 {
                return Err(EngineError::config(format!("{} must be in 1..=4096", field)));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Geocoder
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeocodeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Document page
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PdfPageParams {
    pub pdf_path: String,
    pub page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl PdfPageParams {
    fn validate(&self) -> Result<(), EngineError> {
        if self.pdf_path.trim().is_empty() {
            return Err(EngineError::config("pdf_path is required"));
        }
        if self.page == 0 {
            return Err(EngineError::config("page is 1-based; got 0"));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Overlay analyzer
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverlayMode {
    Vector,
    Raster,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OverlayItem {
    pub overlay_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<OverlayMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_req_id: Option<String>,
    /// `[minx, miny, maxx, maxy]` of `image_file`, in `srs` units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
}

impl OverlayItem {
    /// Explicit mode, else RASTER for image sources and VECTOR otherwise.
    pub fn effective_mode(&self) -> OverlayMode {
        self.mode.unwrap_or({
            if self.image_file.is_some() || self.from_req_id.is_some() {
                OverlayMode::Raster
            } else {
                OverlayMode::Vector
            }
        })
    }

    pub fn feature_label(&self) -> String {
        self.feature_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.overlay_id.clone())
    }
}

/// What an AUTO_GIS request computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GisOperation {
    /// Site region against each overlay item.
    #[default]
    #[serde(alias = "OVERLAY_FROM_GEOJSON")]
    Overlay,
    /// Parcel area summed per zoning class.
    #[serde(alias = "ZONING_BREAKDOWN_FROM_PARCELS")]
    ZoningBreakdown,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OverlayParams {
    #[serde(default, skip_serializing_if = "is_overlay")]
    pub operation: GisOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary_file: Option<String>,
    /// Circle radius around the site centre, used when no boundary exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_m: Option<f64>,
    #[serde(default)]
    pub items: Vec<OverlayItem>,
}

fn is_overlay(op: &GisOperation) -> bool {
    *op == GisOperation::Overlay
}

impl OverlayParams {
    pub fn zoning_breakdown() -> Self {
        Self {
            operation: GisOperation::ZoningBreakdown,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.operation == GisOperation::ZoningBreakdown {
            return Ok(());
        }
        if self.items.is_empty() {
            return Err(EngineError::config("items must list at least one overlay"));
        }
        if let Some(b) = self.buffer_m {
            if !(b > 0.0) {
                return Err(EngineError::config("buffer_m must be > 0"));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for item in &self.items {
            if item.overlay_id.trim().is_empty() {
                return Err(EngineError::config("every overlay item needs an overlay_id"));
            }
            if !seen.insert(item.overlay_id.trim()) {
                return Err(EngineError::config(format!(
                    "duplicate overlay_id '{}'",
                    item.overlay_id
                )));
            }
            if item.effective_mode() == OverlayMode::Raster
                && item.from_req_id.is_none()
                && item.image_file.is_some()
                && item.bbox.is_none()
            {
                return Err(EngineError::config(format!(
                    "overlay '{}' has image_file but no bbox",
                    item.overlay_id
                )));
            }
        }
        Ok(())
    }
}
