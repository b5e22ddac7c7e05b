//! AUTO_GIS: overlay the site against zoning features.
//!
//! Pure computation over files already in the case directory. The region
//! is the site boundary, or a buffer circle around the site centre. Each
//! item is either a vector feature (GeoJSON) or a rendered layer image,
//! the latter given directly or taken from an upstream WMS request's
//! latest evidence.
//!
//! A problem with one item (missing file, bad bbox, undecodable image)
//! yields an INDETERMINATE row and a warning; the other items proceed.
//!
//! The `ZONING_BREAKDOWN` operation instead sums the case's `PARCELS`
//! areas per zoning class.

use std::path::Path;

use async_trait::async_trait;
use datareq_harness_core::error::EngineError;
use datareq_harness_core::geometry::{BBox, Crs, GeometryError};
use datareq_harness_core::models::{OriginClass, OverlayResult, Request, Row};
use datareq_harness_core::overlay::{
    analyze_raster, analyze_vector, zoning_breakdown, AlphaRaster, OverlaySettings, RasterFrame,
    PARCELS_TABLE,
};
use datareq_harness_core::params::{GisOperation, OverlayItem, OverlayMode, OverlayParams, RequestParams};
use serde_json::{json, Map, Value};

use crate::case_state::{load_geojson, site_region, Region};
use crate::evidence::{to_csv, ArtifactDir, ArtifactSpec};
use crate::traits::{Connector, ConnectorOutput, RunContext};

pub const OVERLAY_TABLE: &str = "ZONING_OVERLAY";
pub const BREAKDOWN_TABLE: &str = "ZONING_BREAKDOWN";

const BREAKDOWN_COLUMNS: [&str; 3] = ["zoning", "area_m2", "source_tag"];

const CSV_COLUMNS: [&str; 9] = [
    "overlay_id",
    "feature_id",
    "mode",
    "applicability",
    "distance_m",
    "bearing",
    "overlap_area_m2",
    "basis",
    "upstream_evidence_id",
];

pub struct OverlayConnector;

/// A rendered layer located in the world.
struct RasterSource {
    raster: AlphaRaster,
    frame: RasterFrame,
    label: String,
    upstream_evidence_id: Option<String>,
}

/// A per-item failure that becomes an INDETERMINATE row.
struct Skip(String);

impl From<EngineError> for Skip {
    fn from(e: EngineError) -> Self {
        Skip(e.message().to_string())
    }
}

pub fn decode_alpha(bytes: &[u8]) -> Result<AlphaRaster, EngineError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| EngineError::data_quality(format!("image does not decode: {}", e)))?
        .to_rgba8();
    let (w, h) = img.dimensions();
    let alpha: Vec<u8> = img.pixels().map(|p| p.0[3]).collect();
    Ok(AlphaRaster::new(w, h, alpha)?)
}

fn bbox_from_value(v: Option<&Value>) -> Option<BBox> {
    let arr = v?.as_array()?;
    if arr.len() != 4 {
        return None;
    }
    let nums: Vec<f64> = arr.iter().filter_map(Value::as_f64).collect();
    (nums.len() == 4)
        .then(|| BBox::new(nums[0], nums[1], nums[2], nums[3]))
        .filter(BBox::is_valid)
}

fn upstream_source(item: &OverlayItem, req_id: &str, ctx: &RunContext<'_>) -> Result<RasterSource, Skip> {
    let upstream = ctx
        .catalog
        .get(req_id)
        .ok_or_else(|| Skip(format!("upstream request {} is not in the catalog", req_id)))?;
    let ev_id = upstream
        .last_evidence_ids
        .first()
        .ok_or_else(|| Skip(format!("upstream request {} has no evidence yet", req_id)))?;
    let ev = ctx
        .snapshot
        .find_evidence(ev_id)
        .ok_or_else(|| Skip(format!("upstream evidence {} is not recorded", ev_id)))?;
    if ev.is_placeholder() {
        return Err(Skip(format!("upstream evidence {} is a placeholder", ev_id)));
    }
    let bbox = match item.bbox {
        Some(b) => Some(BBox::from_array(b)),
        None => bbox_from_value(ev.metadata.get("bbox")),
    }
    .ok_or_else(|| Skip(format!("upstream evidence {} carries no bbox", ev_id)))?;
    let srs = item
        .srs
        .clone()
        .or_else(|| ev.metadata.get("srs").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "EPSG:3857".to_string());
    let crs = srs.parse::<Crs>().map_err(|e| Skip(e.to_string()))?;
    let path = ctx.recorder.resolve(&ev.artifact_ref);
    let bytes = std::fs::read(&path)
        .map_err(|_| Skip(format!("upstream artifact {} is missing", ev.artifact_ref)))?;
    Ok(RasterSource {
        raster: decode_alpha(&bytes)?,
        frame: RasterFrame { bbox, crs },
        label: format!("{} via {}", ev.artifact_ref, req_id),
        upstream_evidence_id: Some(ev_id.clone()),
    })
}

fn file_source(item: &OverlayItem, file: &str, case_root: &Path) -> Result<RasterSource, Skip> {
    let bbox = item
        .bbox
        .map(BBox::from_array)
        .filter(BBox::is_valid)
        .ok_or_else(|| Skip(format!("image_file {} needs a valid bbox", file)))?;
    let crs = item
        .srs
        .as_deref()
        .unwrap_or("EPSG:3857")
        .parse::<Crs>()
        .map_err(|e| Skip(e.to_string()))?;
    let bytes = std::fs::read(case_root.join(file))
        .map_err(|_| Skip(format!("image_file {} is missing", file)))?;
    Ok(RasterSource {
        raster: decode_alpha(&bytes)?,
        frame: RasterFrame { bbox, crs },
        label: file.to_string(),
        upstream_evidence_id: None,
    })
}

/// Analysis result plus the upstream evidence it used. Only a size
/// mismatch between mask and raster escapes as an error.
fn analyze_item(
    item: &OverlayItem,
    region: &Region,
    settings: &OverlaySettings,
    ctx: &RunContext<'_>,
) -> Result<(Result<OverlayResult, Skip>, Option<String>), EngineError> {
    let feature = item.feature_label();
    let geometry_err = |e: GeometryError| -> Result<Skip, EngineError> {
        match e {
            GeometryError::SizeMismatch { .. } => Err(e.into()),
            other => Ok(Skip(other.to_string())),
        }
    };

    match item.effective_mode() {
        OverlayMode::Vector => {
            let Some(file) = item.geometry_file.as_deref().filter(|s| !s.trim().is_empty()) else {
                return Ok((Err(Skip("VECTOR item has no geometry_file".into())), None));
            };
            let (geometry, crs) = match load_geojson(ctx.case_root(), file, item.srs.as_deref()) {
                Ok(g) => g,
                Err(e) => return Ok((Err(Skip(format!("geometry_file {}: {}", file, e.message()))), None)),
            };
            let basis = format!("{} vs {}", region.label, file);
            let result = match analyze_vector(&feature, &region.geometry, &region.crs, &geometry, &crs, settings, &basis) {
                Ok(r) => Ok(r),
                Err(e) => Err(geometry_err(e)?),
            };
            Ok((result, None))
        }
        OverlayMode::Raster => {
            let source = match (&item.image_file, &item.from_req_id) {
                (Some(file), _) if !file.trim().is_empty() => file_source(item, file, ctx.case_root()),
                (_, Some(req)) if !req.trim().is_empty() => upstream_source(item, req.trim(), ctx),
                _ => Err(Skip("RASTER item has neither image_file nor from_req_id".into())),
            };
            let source = match source {
                Ok(s) => s,
                Err(skip) => return Ok((Err(skip), None)),
            };
            let basis = format!("{} vs {}", region.label, source.label);
            let result = match analyze_raster(
                &feature,
                &region.geometry,
                &region.crs,
                &source.raster,
                &source.frame,
                settings,
                &basis,
            ) {
                Ok(r) => Ok(r),
                Err(e) => Err(geometry_err(e)?),
            };
            Ok((result, source.upstream_evidence_id))
        }
    }
}

impl OverlayConnector {
    fn breakdown(&self, request: &Request, ctx: &RunContext<'_>) -> Result<ConnectorOutput, EngineError> {
        let parcels = ctx.snapshot.rows(PARCELS_TABLE);
        let breakdown = zoning_breakdown(parcels);
        if breakdown.areas.is_empty() {
            return Err(EngineError::data_quality(format!(
                "{} has no rows with zoning and a positive area_m2",
                PARCELS_TABLE
            )));
        }
        let source_tag = if breakdown.source_tags.is_empty() {
            request.source_tag_or_default().to_string()
        } else {
            breakdown.source_tags.join(";")
        };

        let ev_id = ctx.new_evidence_id(request)?;
        let rows: Vec<Row> = breakdown
            .areas
            .iter()
            .map(|a| {
                let mut row = Row::new();
                row.insert("zoning".into(), json!(a.zoning));
                row.insert("area_m2".into(), json!(a.area_m2));
                row.insert("source_tag".into(), json!(source_tag));
                row.insert("data_origin".into(), json!(OriginClass::ModelDerived.as_str()));
                row.insert("evidence_id".into(), json!(ev_id));
                row
            })
            .collect();
        tracing::info!(classes = rows.len(), total_m2 = breakdown.total_m2(), "zoning breakdown");

        let csv = to_csv(&BREAKDOWN_COLUMNS, &rows);
        let mut meta = Map::new();
        meta.insert("operation".into(), json!("ZONING_BREAKDOWN"));
        meta.insert("parcels".into(), json!(parcels.len()));
        meta.insert("total_area_m2".into(), json!(breakdown.total_m2()));
        let evidence = ctx.recorder.record(ArtifactSpec {
            evidence_id: &ev_id,
            request,
            dir: ArtifactDir::Calc,
            file_name: format!("{}_zoning_breakdown.csv", ev_id),
            bytes: csv.as_bytes(),
            kind: "calculation",
            title: "AUTO_GIS:ZONING_BREAKDOWN".to_string(),
            origin: OriginClass::ModelDerived,
            metadata: meta,
        })?;

        Ok(ConnectorOutput {
            rows,
            evidence: vec![evidence],
            warnings: Vec::new(),
        })
    }

    fn overlay(
        &self,
        request: &Request,
        p: &OverlayParams,
        ctx: &RunContext<'_>,
    ) -> Result<ConnectorOutput, EngineError> {
        let settings = ctx.config.overlay.settings()?;
        let buffer_m = p.buffer_m.unwrap_or(ctx.config.overlay.default_buffer_m);
        let region = site_region(
            &ctx.site(),
            ctx.case_root(),
            p.boundary_file.as_deref(),
            buffer_m,
            &settings.metric_crs,
        )?;

        let ev_id = ctx.new_evidence_id(request)?;
        let mut rows = Vec::with_capacity(p.items.len());
        let mut warnings = Vec::new();
        for item in &p.items {
            let feature = item.feature_label();
            let (result, upstream) = analyze_item(item, &region, &settings, ctx)?;
            let result = match result {
                Ok(r) => r,
                Err(Skip(why)) => {
                    warnings.push(format!("{}: {}", item.overlay_id, why));
                    OverlayResult::indeterminate(&feature, why)
                }
            };
            tracing::info!(
                overlay = %item.overlay_id,
                applicability = result.applicability.as_str(),
                distance_m = ?result.distance_m,
                "overlay analyzed"
            );
            let mut row = Row::new();
            row.insert("overlay_id".into(), json!(item.overlay_id));
            row.insert("feature_id".into(), json!(result.feature_id));
            row.insert("mode".into(), json!(mode_str(item.effective_mode())));
            row.insert("applicability".into(), json!(result.applicability.as_str()));
            row.insert("distance_m".into(), json!(result.distance_m));
            row.insert("bearing".into(), json!(result.bearing));
            row.insert("overlap_area_m2".into(), json!(result.overlap_area_m2));
            row.insert("basis".into(), json!(format!("{} evidence={}", result.basis, ev_id)));
            row.insert("upstream_evidence_id".into(), json!(upstream));
            row.insert("data_origin".into(), json!(OriginClass::ModelDerived.as_str()));
            row.insert("source_tag".into(), json!(request.source_tag_or_default()));
            row.insert("evidence_id".into(), json!(ev_id));
            rows.push(row);
        }

        let csv = to_csv(&CSV_COLUMNS, &rows);
        let mut meta = Map::new();
        meta.insert("region".into(), json!(region.label));
        meta.insert("metric_crs".into(), json!(settings.metric_crs.code()));
        meta.insert("items".into(), json!(p.items.len()));
        let evidence = ctx.recorder.record(ArtifactSpec {
            evidence_id: &ev_id,
            request,
            dir: ArtifactDir::Gis,
            file_name: format!("{}_overlay.csv", ev_id),
            bytes: csv.as_bytes(),
            kind: "calculation",
            title: "AUTO_GIS:OVERLAY".to_string(),
            origin: OriginClass::ModelDerived,
            metadata: meta,
        })?;

        Ok(ConnectorOutput {
            rows,
            evidence: vec![evidence],
            warnings,
        })
    }
}

fn mode_str(mode: OverlayMode) -> &'static str {
    match mode {
        OverlayMode::Vector => "VECTOR",
        OverlayMode::Raster => "RASTER",
    }
}

#[async_trait]
impl Connector for OverlayConnector {
    fn name(&self) -> &str {
        "AUTO_GIS"
    }

    fn description(&self) -> &str {
        "Site/feature overlay (intersects, or distance and bearing) and zoning breakdown"
    }

    fn default_target_table(&self) -> &str {
        OVERLAY_TABLE
    }

    async fn execute(
        &self,
        request: &Request,
        params: &RequestParams,
        ctx: &RunContext<'_>,
    ) -> Result<ConnectorOutput, EngineError> {
        let RequestParams::AutoGis(p) = params else {
            return Err(EngineError::invariant("AUTO_GIS connector got foreign params"));
        };
        match p.operation {
            GisOperation::Overlay => self.overlay(request, p, ctx),
            GisOperation::ZoningBreakdown => self.breakdown(request, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::io::Cursor;

    #[test]
    fn alpha_channel_is_extracted() {
        let mut img = RgbaImage::new(3, 2);
        img.put_pixel(1, 0, Rgba([255, 0, 0, 200]));
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        let raster = decode_alpha(buf.get_ref()).unwrap();
        assert_eq!((raster.width, raster.height), (3, 2));
        assert_eq!(raster.get(1, 0), 200);
        assert_eq!(raster.get(0, 1), 0);
    }

    #[test]
    fn bbox_metadata_must_be_four_ordered_numbers() {
        assert!(bbox_from_value(Some(&json!([0.0, 0.0, 1.0, 1.0]))).is_some());
        assert!(bbox_from_value(Some(&json!([1.0, 1.0, 0.0, 0.0]))).is_none());
        assert!(bbox_from_value(Some(&json!([0.0, 0.0, 1.0]))).is_none());
        assert!(bbox_from_value(Some(&json!("0,0,1,1"))).is_none());
        assert!(bbox_from_value(None).is_none());
    }

    #[test]
    fn undecodable_image_is_data_quality() {
        assert!(matches!(decode_alpha(b"nope"), Err(EngineError::DataQuality(_))));
    }
}
