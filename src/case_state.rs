//! Project site facts read from the case store.
//!
//! The `LOCATION` table's first row describes the site: address,
//! centre coordinates (WGS84), boundary file and administrative code.
//! Connectors and the planner read it through [`SiteContext`]; overlay
//! and map requests turn it into a region geometry with [`site_region`].

use std::path::Path;

use datareq_harness_core::error::EngineError;
use datareq_harness_core::geometry::{Crs, Geometry, Point, Polygon};
use datareq_harness_core::models::{cell_f64, cell_text, Row, LOCATION_TABLE};
use datareq_harness_core::store::CaseSnapshot;
use serde_json::Value;

pub const DEFAULT_LOCATION_ID: &str = "LOC-001";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteContext {
    pub location_id: String,
    pub address: Option<String>,
    /// WGS84 `(lon, lat)`.
    pub center: Option<Point>,
    pub boundary_file: Option<String>,
    pub admin_code: Option<String>,
    pub admin_name: Option<String>,
}

fn first_text(row: &Row, keys: &[&str]) -> Option<String> {
    keys.iter()
        .map(|k| cell_text(row, k))
        .find(|s| !s.is_empty())
}

impl SiteContext {
    pub fn from_snapshot(snapshot: &CaseSnapshot) -> Self {
        let Some(row) = snapshot.first_row(LOCATION_TABLE) else {
            return Self {
                location_id: DEFAULT_LOCATION_ID.to_string(),
                ..Self::default()
            };
        };
        let lat = cell_f64(row, "center_lat").or_else(|| cell_f64(row, "lat"));
        let lon = cell_f64(row, "center_lon").or_else(|| cell_f64(row, "lon"));
        let center = match (lon, lat) {
            (Some(lon), Some(lat))
                if (-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat) =>
            {
                Some(Point::new(lon, lat))
            }
            _ => None,
        };
        Self {
            location_id: first_text(row, &["location_id"])
                .unwrap_or_else(|| DEFAULT_LOCATION_ID.to_string()),
            address: first_text(row, &["address", "address_road", "address_jibeon"]),
            center,
            boundary_file: first_text(row, &["boundary_file"]),
            admin_code: first_text(row, &["admin_code"]),
            admin_name: first_text(row, &["admin_name"]),
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.center.is_some()
    }

    pub fn require_center(&self) -> Result<Point, EngineError> {
        self.center.ok_or_else(|| {
            EngineError::config("LOCATION has no center_lat/center_lon; run a GEOCODE request first")
        })
    }
}

/// Great-circle distance in kilometres between two `(lon, lat)` points.
pub fn haversine_km(a: Point, b: Point) -> f64 {
    const R: f64 = 6371.0088;
    let (lat1, lat2) = (a.y.to_radians(), b.y.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.x - a.x).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * R * h.sqrt().asin()
}

/// CRS declared by a legacy GeoJSON `crs` member, WGS84 otherwise.
pub fn geojson_crs(value: &Value) -> Result<Crs, EngineError> {
    match value
        .get("crs")
        .and_then(|c| c.get("properties"))
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
    {
        Some(name) => Ok(name.parse::<Crs>()?),
        None => Ok(Crs::Geographic),
    }
}

/// Read a GeoJSON file relative to the case directory.
///
/// `srs` overrides the file's declared system.
pub fn load_geojson(
    case_root: &Path,
    rel: &str,
    srs: Option<&str>,
) -> Result<(Geometry, Crs), EngineError> {
    let path = case_root.join(rel);
    let text = std::fs::read_to_string(&path)
        .map_err(|e| EngineError::config(format!("cannot read {}: {}", path.display(), e)))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| EngineError::config(format!("{} is not JSON: {}", rel, e)))?;
    let geometry = Geometry::from_geojson(&value)?;
    let crs = match srs.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s.parse::<Crs>()?,
        None => geojson_crs(&value)?,
    };
    Ok((geometry, crs))
}

/// The area of interest for overlays and map extents.
#[derive(Debug, Clone)]
pub struct Region {
    pub geometry: Geometry,
    pub crs: Crs,
    /// Short description for `basis` texts.
    pub label: String,
}

/// Boundary polygon when one is known, otherwise a circle of `buffer_m`
/// around the centre, built in `metric`.
pub fn site_region(
    site: &SiteContext,
    case_root: &Path,
    boundary_file: Option<&str>,
    buffer_m: f64,
    metric: &Crs,
) -> Result<Region, EngineError> {
    let boundary = boundary_file
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| site.boundary_file.clone());

    if let Some(rel) = boundary {
        let (geometry, crs) = load_geojson(case_root, &rel, None)?;
        if !geometry.has_area() {
            return Err(EngineError::config(format!("boundary {} has no polygon area", rel)));
        }
        return Ok(Region {
            geometry,
            crs,
            label: format!("boundary {}", rel),
        });
    }

    let center = site.require_center()?;
    let c = metric.forward(center)?;
    Ok(Region {
        geometry: Geometry::polygon(Polygon::circle(c, buffer_m, 64)),
        crs: *metric,
        label: format!("{}m buffer around site centre", buffer_m),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn snapshot_with(row: Value) -> CaseSnapshot {
        let mut snap = CaseSnapshot::new();
        snap.table_mut(LOCATION_TABLE)
            .push_row(row.as_object().cloned().unwrap());
        snap
    }

    #[test]
    fn reads_location_row_with_fallbacks() {
        let snap = snapshot_with(json!({
            "address_road": "Sejong-daero 110",
            "center_lat": "37.5663",
            "center_lon": 126.9779,
            "admin_code": "11140"
        }));
        let site = SiteContext::from_snapshot(&snap);
        assert_eq!(site.location_id, DEFAULT_LOCATION_ID);
        assert_eq!(site.address.as_deref(), Some("Sejong-daero 110"));
        assert_eq!(site.center, Some(Point::new(126.9779, 37.5663)));
        assert_eq!(site.admin_code.as_deref(), Some("11140"));
    }

    #[test]
    fn out_of_range_coordinates_are_ignored() {
        let snap = snapshot_with(json!({"center_lat": 200000.0, "center_lon": 550000.0}));
        assert!(!SiteContext::from_snapshot(&snap).has_coordinates());
    }

    #[test]
    fn haversine_seoul_busan() {
        let d = haversine_km(Point::new(126.978, 37.5665), Point::new(129.0756, 35.1796));
        assert!((d - 325.0).abs() < 5.0, "got {}", d);
    }

    #[test]
    fn region_prefers_boundary_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("site.geojson"),
            json!({
                "type": "Polygon",
                "coordinates": [[[127.0, 37.5], [127.01, 37.5], [127.01, 37.51], [127.0, 37.51], [127.0, 37.5]]]
            })
            .to_string(),
        )
        .unwrap();
        let site = SiteContext {
            boundary_file: Some("site.geojson".into()),
            ..SiteContext::default()
        };
        let metric = Crs::from_epsg(5186).unwrap();
        let region = site_region(&site, tmp.path(), None, 500.0, &metric).unwrap();
        assert_eq!(region.crs, Crs::Geographic);
        assert!(region.label.contains("site.geojson"));
    }

    #[test]
    fn region_falls_back_to_buffer() {
        let site = SiteContext {
            center: Some(Point::new(127.0, 37.5)),
            ..SiteContext::default()
        };
        let metric = Crs::from_epsg(5186).unwrap();
        let region = site_region(&site, Path::new("."), None, 500.0, &metric).unwrap();
        assert_eq!(region.crs, metric);
        let area = region.geometry.area();
        assert!((area - std::f64::consts::PI * 250_000.0).abs() / area < 0.01);
    }

    #[test]
    fn region_without_centre_is_a_configuration_error() {
        let metric = Crs::from_epsg(5186).unwrap();
        let err = site_region(&SiteContext::default(), Path::new("."), None, 500.0, &metric)
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
