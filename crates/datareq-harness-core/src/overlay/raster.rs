//! Raster overlay: a region geometry against a rendered feature layer.
//!
//! The layer is reduced to its alpha channel. Pixels with alpha above the
//! threshold are feature; the region is scanline-filled into a mask on the
//! same grid. Overlap of the two means the region intersects the feature,
//! otherwise sampled feature pixels give the distance and bearing.

use crate::geometry::{bearing_8, BBox, Crs, Geometry, GeometryError, Point};
use crate::models::{Applicability, OverlayResult};

use super::{round_1, OverlaySettings};

/// Alpha channel of a decoded layer image, row-major from the top-left.
#[derive(Debug, Clone, PartialEq)]
pub struct AlphaRaster {
    pub width: u32,
    pub height: u32,
    pub alpha: Vec<u8>,
}

impl AlphaRaster {
    pub fn new(width: u32, height: u32, alpha: Vec<u8>) -> Result<Self, GeometryError> {
        let expected = width as usize * height as usize;
        if alpha.len() != expected {
            return Err(GeometryError::SizeMismatch {
                mask: expected,
                raster: alpha.len(),
            });
        }
        Ok(Self {
            width,
            height,
            alpha,
        })
    }

    /// Fully transparent raster.
    pub fn transparent(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            alpha: vec![0; width as usize * height as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.alpha.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alpha.is_empty()
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.alpha[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, a: u8) {
        let w = self.width as usize;
        self.alpha[y as usize * w + x as usize] = a;
    }

    pub fn min_alpha(&self) -> u8 {
        self.alpha.iter().copied().min().unwrap_or(0)
    }

    /// Nearest-neighbour downsample so the longer side is at most `max_size`.
    pub fn downsample(&self, max_size: u32) -> AlphaRaster {
        let longest = self.width.max(self.height);
        if max_size == 0 || longest <= max_size {
            return self.clone();
        }
        let scale = max_size as f64 / longest as f64;
        let nw = ((self.width as f64 * scale).round() as u32).max(1);
        let nh = ((self.height as f64 * scale).round() as u32).max(1);
        let mut alpha = Vec::with_capacity(nw as usize * nh as usize);
        for y in 0..nh {
            let sy = (((y as f64 + 0.5) * self.height as f64 / nh as f64) as u32).min(self.height - 1);
            for x in 0..nw {
                let sx =
                    (((x as f64 + 0.5) * self.width as f64 / nw as f64) as u32).min(self.width - 1);
                alpha.push(self.get(sx, sy));
            }
        }
        AlphaRaster {
            width: nw,
            height: nh,
            alpha,
        }
    }
}

/// Where a raster sits in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterFrame {
    pub bbox: BBox,
    pub crs: Crs,
}

impl RasterFrame {
    /// Continuous pixel coordinates of a world point. Cell `(i, j)` spans
    /// `[i, i + 1) x [j, j + 1)`, so the bbox edges land on `0` and `w`.
    pub fn world_to_pixel(&self, p: &Point, width: u32, height: u32) -> (f64, f64) {
        let b = &self.bbox;
        let px = (p.x - b.minx) / b.width() * width as f64;
        let py = (b.maxy - p.y) / b.height() * height as f64;
        (px, py)
    }

    /// World coordinates of the centre of pixel cell `(px, py)`; the
    /// inverse of [`world_to_pixel`](Self::world_to_pixel) at `px + 0.5`.
    pub fn pixel_to_world(&self, px: u32, py: u32, width: u32, height: u32) -> Point {
        let b = &self.bbox;
        Point::new(
            b.minx + (px as f64 + 0.5) / width as f64 * b.width(),
            b.maxy - (py as f64 + 0.5) / height as f64 * b.height(),
        )
    }
}

/// Scanline-fill the polygonal parts of `region` (already in the frame's
/// CRS) into a `width * height` mask. A cell is set when its centre is
/// inside. Even-odd per polygon, so holes stay empty; separate polygons
/// are OR-ed.
pub fn rasterize_mask(
    region: &Geometry,
    frame: &RasterFrame,
    width: u32,
    height: u32,
) -> Result<Vec<bool>, GeometryError> {
    if !region.has_area() {
        return Err(GeometryError::NoArea);
    }
    let mut mask = vec![false; width as usize * height as usize];
    let max_x = width as i64 - 1;

    for poly in region.polygons() {
        let rings: Vec<Vec<(f64, f64)>> = poly
            .rings()
            .map(|r| {
                r.iter()
                    .map(|p| frame.world_to_pixel(p, width, height))
                    .collect()
            })
            .collect();

        let mut crossings: Vec<f64> = Vec::new();
        for py in 0..height {
            let y = py as f64 + 0.5;
            crossings.clear();
            for ring in &rings {
                let n = ring.len();
                for i in 0..n {
                    let (x0, y0) = ring[i];
                    let (x1, y1) = ring[(i + 1) % n];
                    if (y0 <= y && y < y1) || (y1 <= y && y < y0) {
                        crossings.push(x0 + (y - y0) * (x1 - x0) / (y1 - y0));
                    }
                }
            }
            crossings.sort_by(|a, b| a.total_cmp(b));
            for pair in crossings.chunks_exact(2) {
                let start = ((pair[0] - 0.5).ceil() as i64).max(0);
                let end = ((pair[1] - 0.5).ceil() as i64 - 1).min(max_x);
                let row = py as usize * width as usize;
                for px in start..=end {
                    mask[row + px as usize] = true;
                }
            }
        }
    }
    Ok(mask)
}

/// Count feature pixels and mask/feature overlap. Errors when the mask was
/// built for a different grid.
pub fn overlap_counts(
    mask: &[bool],
    raster: &AlphaRaster,
    alpha_threshold: u8,
) -> Result<(usize, usize), GeometryError> {
    if mask.len() != raster.len() {
        return Err(GeometryError::SizeMismatch {
            mask: mask.len(),
            raster: raster.len(),
        });
    }
    let mut feature = 0;
    let mut overlap = 0;
    for (m, a) in mask.iter().zip(&raster.alpha) {
        if *a > alpha_threshold {
            feature += 1;
            if *m {
                overlap += 1;
            }
        }
    }
    Ok((feature, overlap))
}

/// Strided sample of feature pixel cells, capped at `max_points`. Falls
/// back to every feature pixel when the stride misses a sparse layer.
fn sample_feature_pixels(
    raster: &AlphaRaster,
    alpha_threshold: u8,
    stride: usize,
    max_points: usize,
) -> Vec<(u32, u32)> {
    let collect = |step: usize| -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for y in (0..raster.height).step_by(step) {
            for x in (0..raster.width).step_by(step) {
                if raster.get(x, y) > alpha_threshold {
                    out.push((x, y));
                }
            }
        }
        out
    };
    let mut pts = collect(stride.max(1));
    if pts.is_empty() {
        pts = collect(1);
    }
    let cap = max_points.max(10);
    if pts.len() > cap {
        let step = pts.len() as f64 / cap as f64;
        pts = (0..cap).map(|i| pts[(i as f64 * step) as usize]).collect();
    }
    pts
}

/// Analyze `region` (in `region_crs`) against a rendered layer.
pub fn analyze_raster(
    feature_id: &str,
    region: &Geometry,
    region_crs: &Crs,
    raster: &AlphaRaster,
    frame: &RasterFrame,
    settings: &OverlaySettings,
    basis: &str,
) -> Result<OverlayResult, GeometryError> {
    if raster.is_empty() {
        return Ok(OverlayResult::indeterminate(
            feature_id,
            format!("{}: empty raster", basis),
        ));
    }
    if raster.min_alpha() == 255 {
        return Ok(OverlayResult::indeterminate(
            feature_id,
            format!("{}: layer is fully opaque, features cannot be separated", basis),
        ));
    }
    if !frame.bbox.is_valid() {
        return Ok(OverlayResult::indeterminate(
            feature_id,
            format!("{}: invalid raster bbox", basis),
        ));
    }

    let raster = raster.downsample(settings.analysis_max_size);
    let (w, h) = (raster.width, raster.height);
    let region_px = region.transform(region_crs, &frame.crs)?;
    let mask = rasterize_mask(&region_px, frame, w, h)?;
    let threshold = settings.alpha_threshold;
    let (feature_px, overlap_px) = overlap_counts(&mask, &raster, threshold)?;

    let metric = &settings.metric_crs;
    let basis = format!(
        "{} (raster {}x{}, alpha>{}, {})",
        basis,
        w,
        h,
        threshold,
        metric.code()
    );

    if feature_px == 0 {
        return Ok(OverlayResult::indeterminate(
            feature_id,
            format!("{}: no feature pixels", basis),
        ));
    }

    if overlap_px > 0 {
        let pixel_area = metric_pixel_area(frame, metric, w, h)?;
        return Ok(OverlayResult {
            feature_id: feature_id.to_string(),
            applicability: Applicability::Intersects,
            distance_m: None,
            bearing: "-".to_string(),
            basis,
            overlap_area_m2: Some(round_1(overlap_px as f64 * pixel_area)),
        });
    }

    let region_m = region.transform(region_crs, metric)?;
    let Some(center) = region_m.centroid() else {
        return Ok(OverlayResult::indeterminate(feature_id, "region has no centroid"));
    };

    let mut best: Option<(f64, Point)> = None;
    for (px, py) in sample_feature_pixels(&raster, threshold, settings.sample_stride, settings.max_points) {
        let world = frame.pixel_to_world(px, py, w, h);
        let p = crate::geometry::projection::transform(world, &frame.crs, metric)?;
        let d = region_m.boundary_distance(&p);
        if best.map(|(bd, _)| d < bd).unwrap_or(true) {
            best = Some((d, p));
        }
    }

    let Some((distance, nearest)) = best else {
        return Ok(OverlayResult::indeterminate(feature_id, format!("{}: no samples", basis)));
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

/// Ground area of one pixel, measured by projecting the frame corners.
fn metric_pixel_area(frame: &RasterFrame, metric: &Crs, w: u32, h: u32) -> Result<f64, GeometryError> {
    let b = &frame.bbox;
    let lo = crate::geometry::projection::transform(Point::new(b.minx, b.miny), &frame.crs, metric)?;
    let hi = crate::geometry::projection::transform(Point::new(b.maxx, b.maxy), &frame.crs, metric)?;
    Ok(((hi.x - lo.x) * (hi.y - lo.y)).abs() / (w as f64 * h as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Polygon;

    fn settings() -> OverlaySettings {
        OverlaySettings::default()
    }

    // 2 km square in EPSG:5186 at 10 m per pixel.
    fn frame() -> RasterFrame {
        RasterFrame {
            bbox: BBox::new(199_000.0, 549_000.0, 201_000.0, 551_000.0),
            crs: settings().metric_crs,
        }
    }

    fn circle(r: f64) -> Geometry {
        Geometry::polygon(Polygon::circle(Point::new(200_000.0, 550_000.0), r, 64))
    }

    fn fill(raster: &mut AlphaRaster, xs: std::ops::Range<u32>, ys: std::ops::Range<u32>) {
        for y in ys {
            for x in xs.clone() {
                raster.set(x, y, 255);
            }
        }
    }

    #[test]
    fn fully_opaque_raster_is_indeterminate() {
        let s = settings();
        let raster = AlphaRaster::new(4, 4, vec![255; 16]).unwrap();
        let r = analyze_raster("F", &circle(100.0), &s.metric_crs, &raster, &frame(), &s, "wms").unwrap();
        assert_eq!(r.applicability, Applicability::Indeterminate);
        assert!(r.basis.contains("opaque"));
    }

    #[test]
    fn transparent_raster_has_no_feature_pixels() {
        let s = settings();
        let raster = AlphaRaster::transparent(50, 50);
        let r = analyze_raster("F", &circle(100.0), &s.metric_crs, &raster, &frame(), &s, "wms").unwrap();
        assert_eq!(r.applicability, Applicability::Indeterminate);
        assert!(r.basis.contains("no feature pixels"));
    }

    #[test]
    fn mask_size_mismatch_is_an_error() {
        let raster = AlphaRaster::transparent(10, 10);
        let err = overlap_counts(&[false; 99], &raster, 10).unwrap_err();
        assert_eq!(err, GeometryError::SizeMismatch { mask: 99, raster: 100 });
    }

    #[test]
    fn alpha_buffer_must_match_dimensions() {
        assert!(AlphaRaster::new(3, 3, vec![0; 8]).is_err());
    }

    #[test]
    fn overlapping_feature_reports_area() {
        let s = settings();
        let mut raster = AlphaRaster::transparent(200, 200);
        fill(&mut raster, 90..110, 90..110);
        let r = analyze_raster("F", &circle(200.0), &s.metric_crs, &raster, &frame(), &s, "wms").unwrap();
        assert_eq!(r.applicability, Applicability::Intersects);
        let area = r.overlap_area_m2.unwrap();
        assert!((area - 40_000.0).abs() < 1.0, "got {}", area);
    }

    #[test]
    fn disjoint_feature_reports_distance_and_bearing() {
        let s = settings();
        let mut raster = AlphaRaster::transparent(200, 200);
        // band from x = 200500 m to the east edge
        fill(&mut raster, 150..200, 0..200);
        let r = analyze_raster("F", &circle(200.0), &s.metric_crs, &raster, &frame(), &s, "wms").unwrap();
        assert_eq!(r.applicability, Applicability::Disjoint);
        let d = r.distance_m.unwrap();
        assert!((300.0..340.0).contains(&d), "got {}", d);
        assert_eq!(r.bearing, "E");
    }

    #[test]
    fn faint_pixels_below_threshold_are_ignored() {
        let s = settings();
        let mut raster = AlphaRaster::transparent(20, 20);
        raster.set(3, 3, 10);
        let (feature, _) = overlap_counts(&vec![false; 400], &raster, s.alpha_threshold).unwrap();
        assert_eq!(feature, 0);
    }

    #[test]
    fn mask_leaves_holes_empty() {
        let f = RasterFrame {
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            crs: settings().metric_crs,
        };
        let outer = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ];
        let hole = vec![
            Point::new(3.0, 3.0),
            Point::new(7.0, 3.0),
            Point::new(7.0, 7.0),
            Point::new(3.0, 7.0),
        ];
        let g = Geometry::polygon(Polygon::with_holes(outer, vec![hole]));
        let mask = rasterize_mask(&g, &f, 10, 10).unwrap();
        // cell (5, 5) is centred on the world point (5.5, 4.5), inside the hole
        assert!(!mask[5 * 10 + 5]);
        assert!(mask[1 * 10 + 1]);
        assert_eq!(mask.iter().filter(|m| **m).count(), 100 - 16);
    }

    #[test]
    fn mask_agrees_with_cell_centres() {
        let f = frame();
        let region = circle(430.0);
        let (w, h) = (37, 23);
        let mask = rasterize_mask(&region, &f, w, h).unwrap();
        for py in 0..h {
            for px in 0..w {
                let centre = f.pixel_to_world(px, py, w, h);
                assert_eq!(
                    mask[(py * w + px) as usize],
                    region.covers_point(&centre),
                    "cell ({}, {})",
                    px,
                    py
                );
                let (cx, cy) = f.world_to_pixel(&centre, w, h);
                assert!((cx - (px as f64 + 0.5)).abs() < 1e-9);
                assert!((cy - (py as f64 + 0.5)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn region_without_area_cannot_be_masked() {
        let line = Geometry::new(vec![crate::geometry::Part::Line(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
        ])]);
        let err = rasterize_mask(&line, &frame(), 10, 10).unwrap_err();
        assert_eq!(err, GeometryError::NoArea);
    }

    #[test]
    fn downsample_caps_longest_side() {
        let r = AlphaRaster::transparent(1024, 512).downsample(512);
        assert_eq!((r.width, r.height), (512, 256));
        assert_eq!(r.len(), 512 * 256);
    }
}
