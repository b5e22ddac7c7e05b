//! Overlay analysis: does a region of interest intersect a candidate
//! feature, and if not, how far away and in which direction is it?
//!
//! - [`analyze_vector`] works on two geometries.
//! - [`raster::analyze_raster`] works on a region geometry and a rendered
//!   feature layer (alpha channel + bounding box + CRS).
//! - [`zoning::zoning_breakdown`] sums parcel areas per zoning class.
//!
//! The proximity analyses report distances in meters of the metric CRS
//! and bearings from the region centroid to the nearest feature point,
//! quantized to 8 compass points.

pub mod raster;
pub mod zoning;

use crate::geometry::projection::TmParams;
use crate::geometry::{bearing_8, Crs, Geometry, GeometryError};
use crate::models::{Applicability, OverlayResult};

pub use raster::{analyze_raster, AlphaRaster, RasterFrame};
pub use zoning::{zoning_breakdown, ZoningArea, ZoningBreakdown, PARCELS_TABLE};

/// EPSG:5186, the Korea 2000 central belt.
pub const DEFAULT_METRIC_EPSG: u32 = 5186;

/// Tunables for overlay analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySettings {
    /// Pixels with alpha strictly above this count as feature.
    pub alpha_threshold: u8,
    /// Take every n-th feature pixel in both axes when sampling.
    pub sample_stride: usize,
    /// Upper bound on sampled feature pixels.
    pub max_points: usize,
    /// Longest raster side after downsampling.
    pub analysis_max_size: u32,
    /// Planar system used for distance math.
    pub metric_crs: Crs,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            alpha_threshold: 10,
            sample_stride: 4,
            max_points: 5000,
            analysis_max_size: 512,
            metric_crs: Crs::TransverseMercator {
                epsg: DEFAULT_METRIC_EPSG,
                params: TmParams {
                    lat0: 38.0,
                    lon0: 127.0,
                    k0: 1.0,
                    false_easting: 200_000.0,
                    false_northing: 600_000.0,
                },
            },
        }
    }
}

/// Round to one decimal place.
pub fn round_1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Vector/vector overlay in the metric CRS.
///
/// `region` and `feature` are given in their own systems and reprojected
/// into `settings.metric_crs` before any distance math.
pub fn analyze_vector(
    feature_id: &str,
    region: &Geometry,
    region_crs: &Crs,
    feature: &Geometry,
    feature_crs: &Crs,
    settings: &OverlaySettings,
    basis: &str,
) -> Result<OverlayResult, GeometryError> {
    if region.is_empty() || feature.is_empty() {
        return Err(GeometryError::Empty);
    }
    let metric = &settings.metric_crs;
    let region_m = region.transform(region_crs, metric)?;
    let feature_m = feature.transform(feature_crs, metric)?;
    let basis = format!("{} (vector, {})", basis, metric.code());

    if region_m.intersects(&feature_m) {
        return Ok(OverlayResult {
            feature_id: feature_id.to_string(),
            applicability: Applicability::Intersects,
            distance_m: None,
            bearing: "-".to_string(),
            basis,
            overlap_area_m2: None,
        });
    }

    let Some((distance, nearest)) = region_m.nearest_on(&feature_m) else {
        return Ok(OverlayResult::indeterminate(feature_id, "empty geometry"));
    };
    let Some(center) = region_m.centroid() else {
        return Ok(OverlayResult::indeterminate(feature_id, "region has no centroid"));
    };
    Ok(OverlayResult {
        feature_id: feature_id.to_string(),
        applicability: Applicability::Disjoint,
        distance_m: Some(round_1(distance)),
        bearing: bearing_8(nearest.x - center.x, nearest.y - center.y).to_string(),
        basis,
        overlap_area_m2: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{opposite_bearing, Point, Polygon};

    fn metric() -> OverlaySettings {
        OverlaySettings::default()
    }

    fn square(cx: f64, cy: f64, half: f64) -> Geometry {
        Geometry::polygon(Polygon::new(vec![
            Point::new(cx - half, cy - half),
            Point::new(cx + half, cy - half),
            Point::new(cx + half, cy + half),
            Point::new(cx - half, cy + half),
        ]))
    }

    #[test]
    fn vector_symmetry_for_disjoint_convex_polygons() {
        let s = metric();
        let crs = s.metric_crs;
        let a = square(200_000.0, 550_000.0, 100.0);
        let b = square(200_700.0, 550_650.0, 50.0);

        let ab = analyze_vector("B", &a, &crs, &b, &crs, &s, "a/b").unwrap();
        let ba = analyze_vector("A", &b, &crs, &a, &crs, &s, "b/a").unwrap();

        assert_eq!(ab.applicability, Applicability::Disjoint);
        assert_eq!(ba.applicability, Applicability::Disjoint);
        let (d1, d2) = (ab.distance_m.unwrap(), ba.distance_m.unwrap());
        assert!((d1 - d2).abs() < 0.11);
        assert_eq!(ab.bearing, "NE");
        assert_eq!(ba.bearing, opposite_bearing(&ab.bearing));
    }

    #[test]
    fn circle_against_polygon_800m_east() {
        let s = metric();
        let crs = s.metric_crs;
        let center = Point::new(200_000.0, 550_000.0);
        let region = Geometry::polygon(Polygon::circle(center, 500.0, 64));
        let feature = Geometry::polygon(Polygon::new(vec![
            Point::new(center.x + 800.0, center.y - 200.0),
            Point::new(center.x + 1200.0, center.y - 200.0),
            Point::new(center.x + 1200.0, center.y + 200.0),
            Point::new(center.x + 800.0, center.y + 200.0),
        ]));
        let r = analyze_vector("F1", &region, &crs, &feature, &crs, &s, "circle").unwrap();
        assert_eq!(r.applicability, Applicability::Disjoint);
        assert!((r.distance_m.unwrap() - 300.0).abs() < 0.5);
        assert_eq!(r.bearing, "E");
        assert!(r.basis.contains("EPSG:5186"));
    }

    #[test]
    fn intersecting_geometries_report_no_distance() {
        let s = metric();
        let crs = s.metric_crs;
        let a = square(200_000.0, 550_000.0, 100.0);
        let b = square(200_150.0, 550_000.0, 100.0);
        let r = analyze_vector("B", &a, &crs, &b, &crs, &s, "overlap").unwrap();
        assert_eq!(r.applicability, Applicability::Intersects);
        assert_eq!(r.distance_m, None);
        assert_eq!(r.bearing, "-");
    }

    #[test]
    fn geographic_inputs_are_projected() {
        let s = metric();
        let wgs = Crs::Geographic;
        // two small squares ~0.01° of longitude apart near 37.5°N
        let a = square(127.0, 37.5, 0.001);
        let b = square(127.012, 37.5, 0.001);
        let r = analyze_vector("B", &a, &wgs, &b, &wgs, &s, "wgs").unwrap();
        assert_eq!(r.applicability, Applicability::Disjoint);
        let d = r.distance_m.unwrap();
        // 0.010° of longitude at 37.5°N is about 883 m
        assert!((d - 883.0).abs() < 5.0, "got {}", d);
        assert_eq!(r.bearing, "E");
    }

    #[test]
    fn rounding_to_one_decimal() {
        assert_eq!(round_1(299.96), 300.0);
        assert_eq!(round_1(12.34), 12.3);
    }
}
