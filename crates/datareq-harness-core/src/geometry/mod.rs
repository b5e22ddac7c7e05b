//! Planar geometry for overlay analysis.
//!
//! A [`Geometry`] is the union of its parts (polygons with holes, line
//! strings, points). All distance and intersection math is Euclidean in
//! whatever planar system the coordinates are in; callers reproject with
//! [`projection`] first.

pub mod projection;

use serde_json::Value;
use thiserror::Error;

pub use projection::Crs;

const EPS: f64 = 1e-12;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("invalid GeoJSON: {0}")]
    InvalidGeoJson(String),

    #[error("geometry is empty")]
    Empty,

    #[error("region has no polygon area to rasterize")]
    NoArea,

    #[error("unsupported CRS '{0}'")]
    UnsupportedCrs(String),

    #[error("mask/raster size mismatch: mask has {mask} pixels, raster has {raster}")]
    SizeMismatch { mask: usize, raster: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Axis-aligned envelope `[minx, miny, maxx, maxy]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl BBox {
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self { minx, miny, maxx, maxy }
    }

    pub fn from_array(a: [f64; 4]) -> Self {
        Self::new(a[0], a[1], a[2], a[3])
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.minx, self.miny, self.maxx, self.maxy]
    }

    pub fn width(&self) -> f64 {
        self.maxx - self.minx
    }

    pub fn height(&self) -> f64 {
        self.maxy - self.miny
    }

    pub fn is_valid(&self) -> bool {
        self.width() > 0.0 && self.height() > 0.0 && self.to_array().iter().all(|v| v.is_finite())
    }

    pub fn center(&self) -> Point {
        Point::new((self.minx + self.maxx) / 2.0, (self.miny + self.maxy) / 2.0)
    }
}

/// A polygon ring list. Rings are stored open (no repeated closing point).
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Vec<Point>,
    pub holes: Vec<Vec<Point>>,
}

impl Polygon {
    pub fn new(exterior: Vec<Point>) -> Self {
        Self {
            exterior: open_ring(exterior),
            holes: Vec::new(),
        }
    }

    pub fn with_holes(exterior: Vec<Point>, holes: Vec<Vec<Point>>) -> Self {
        Self {
            exterior: open_ring(exterior),
            holes: holes.into_iter().map(open_ring).collect(),
        }
    }

    /// Regular polygon approximating a circle, first vertex due east.
    pub fn circle(center: Point, radius: f64, segments: usize) -> Self {
        let n = segments.max(8);
        let pts = (0..n)
            .map(|i| {
                let a = std::f64::consts::TAU * i as f64 / n as f64;
                Point::new(center.x + radius * a.cos(), center.y + radius * a.sin())
            })
            .collect();
        Self::new(pts)
    }

    pub fn rings(&self) -> impl Iterator<Item = &Vec<Point>> {
        std::iter::once(&self.exterior).chain(self.holes.iter())
    }

    /// Even-odd containment over all rings; boundary points count as inside.
    pub fn contains(&self, p: &Point) -> bool {
        if self
            .rings()
            .any(|r| ring_segments(r).any(|(a, b)| point_segment_distance(p, &a, &b) <= 1e-9))
        {
            return true;
        }
        let mut inside = false;
        for ring in self.rings() {
            if ring_contains(ring, p) {
                inside = !inside;
            }
        }
        inside
    }

    fn signed_ring_area_and_centroid(ring: &[Point]) -> (f64, f64, f64) {
        let mut a = 0.0;
        let mut cx = 0.0;
        let mut cy = 0.0;
        for (p, q) in ring_segments(ring) {
            let cross = p.x * q.y - q.x * p.y;
            a += cross;
            cx += (p.x + q.x) * cross;
            cy += (p.y + q.y) * cross;
        }
        (a / 2.0, cx, cy)
    }

    pub fn area(&self) -> f64 {
        let outer = Self::signed_ring_area_and_centroid(&self.exterior).0.abs();
        let holes: f64 = self
            .holes
            .iter()
            .map(|h| Self::signed_ring_area_and_centroid(h).0.abs())
            .sum();
        (outer - holes).max(0.0)
    }
}

fn open_ring(mut ring: Vec<Point>) -> Vec<Point> {
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    ring
}

fn ring_segments(ring: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
    let n = ring.len();
    (0..n).map(move |i| (ring[i], ring[(i + 1) % n]))
}

fn ring_contains(ring: &[Point], p: &Point) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (ring[i], ring[j]);
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// One component of a [`Geometry`].
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Polygon(Polygon),
    Line(Vec<Point>),
    Point(Point),
}

/// Union of polygons, lines and points in one coordinate system.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Geometry {
    pub parts: Vec<Part>,
}

impl Geometry {
    pub fn new(parts: Vec<Part>) -> Self {
        Self { parts }
    }

    pub fn polygon(p: Polygon) -> Self {
        Self::new(vec![Part::Polygon(p)])
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn polygons(&self) -> impl Iterator<Item = &Polygon> {
        self.parts.iter().filter_map(|p| match p {
            Part::Polygon(poly) => Some(poly),
            _ => None,
        })
    }

    pub fn has_area(&self) -> bool {
        self.polygons().any(|p| p.exterior.len() >= 3)
    }

    /// Apply a coordinate transform to every vertex.
    pub fn map_points<F>(&self, mut f: F) -> Result<Geometry, GeometryError>
    where
        F: FnMut(Point) -> Result<Point, GeometryError>,
    {
        let mut mapped = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            mapped.push(match part {
                Part::Polygon(poly) => Part::Polygon(Polygon {
                    exterior: poly.exterior.iter().map(|p| f(*p)).collect::<Result<_, _>>()?,
                    holes: poly
                        .holes
                        .iter()
                        .map(|h| h.iter().map(|p| f(*p)).collect::<Result<Vec<_>, _>>())
                        .collect::<Result<_, _>>()?,
                }),
                Part::Line(pts) => Part::Line(pts.iter().map(|p| f(*p)).collect::<Result<_, _>>()?),
                Part::Point(p) => Part::Point(f(*p)?),
            });
        }
        Ok(Geometry::new(mapped))
    }

    /// Reproject from one CRS to another.
    pub fn transform(&self, from: &Crs, to: &Crs) -> Result<Geometry, GeometryError> {
        if from == to {
            return Ok(self.clone());
        }
        self.map_points(|p| projection::transform(p, from, to))
    }

    pub fn vertices(&self) -> Vec<Point> {
        let mut out = Vec::new();
        for part in &self.parts {
            match part {
                Part::Polygon(poly) => poly.rings().for_each(|r| out.extend_from_slice(r)),
                Part::Line(pts) => out.extend_from_slice(pts),
                Part::Point(p) => out.push(*p),
            }
        }
        out
    }

    /// All edges: polygon ring edges (closed) and line segments.
    pub fn segments(&self) -> Vec<(Point, Point)> {
        let mut out = Vec::new();
        for part in &self.parts {
            match part {
                Part::Polygon(poly) => {
                    for ring in poly.rings() {
                        out.extend(ring_segments(ring));
                    }
                }
                Part::Line(pts) => out.extend(pts.windows(2).map(|w| (w[0], w[1]))),
                Part::Point(_) => {}
            }
        }
        out
    }

    fn points(&self) -> impl Iterator<Item = Point> + '_ {
        self.parts.iter().filter_map(|p| match p {
            Part::Point(pt) => Some(*pt),
            _ => None,
        })
    }

    pub fn envelope(&self) -> Option<BBox> {
        let v = self.vertices();
        let first = v.first()?;
        let mut b = BBox::new(first.x, first.y, first.x, first.y);
        for p in &v[1..] {
            b.minx = b.minx.min(p.x);
            b.miny = b.miny.min(p.y);
            b.maxx = b.maxx.max(p.x);
            b.maxy = b.maxy.max(p.y);
        }
        Some(b)
    }

    pub fn area(&self) -> f64 {
        self.polygons().map(Polygon::area).sum()
    }

    /// Area-weighted centroid of the polygonal parts; falls back to the
    /// vertex mean for purely linear or point geometries.
    pub fn centroid(&self) -> Option<Point> {
        let mut area = 0.0;
        let mut cx = 0.0;
        let mut cy = 0.0;
        for poly in self.polygons() {
            for (idx, ring) in poly.rings().enumerate() {
                let (a, x, y) = Polygon::signed_ring_area_and_centroid(ring);
                // holes subtract regardless of winding
                let sign = if idx == 0 { 1.0 } else { -1.0 };
                area += sign * a.abs();
                cx += sign * x * a.signum();
                cy += sign * y * a.signum();
            }
        }
        if area.abs() > EPS {
            return Some(Point::new(cx / (6.0 * area), cy / (6.0 * area)));
        }
        let v = self.vertices();
        if v.is_empty() {
            return None;
        }
        let n = v.len() as f64;
        Some(Point::new(
            v.iter().map(|p| p.x).sum::<f64>() / n,
            v.iter().map(|p| p.y).sum::<f64>() / n,
        ))
    }

    /// Whether `p` lies in a polygon, on a line, or on a point of this geometry.
    pub fn covers_point(&self, p: &Point) -> bool {
        self.parts.iter().any(|part| match part {
            Part::Polygon(poly) => poly.contains(p),
            Part::Line(pts) => pts
                .windows(2)
                .any(|w| point_segment_distance(p, &w[0], &w[1]) <= 1e-9),
            Part::Point(q) => q.distance(p) <= 1e-9,
        })
    }

    pub fn intersects(&self, other: &Geometry) -> bool {
        let mine = self.segments();
        let theirs = other.segments();
        if mine
            .iter()
            .any(|(a, b)| theirs.iter().any(|(c, d)| segments_intersect(a, b, c, d)))
        {
            return true;
        }
        // containment without edge crossings: test one vertex per part
        let any_inside = |g: &Geometry, h: &Geometry| {
            g.parts.iter().any(|part| {
                let sample = match part {
                    Part::Polygon(poly) => poly.exterior.first().copied(),
                    Part::Line(pts) => pts.first().copied(),
                    Part::Point(p) => Some(*p),
                };
                sample.map(|p| h.covers_point(&p)).unwrap_or(false)
            })
        };
        any_inside(self, other) || any_inside(other, self)
    }

    /// Distance from `p` to the nearest edge or point of this geometry,
    /// ignoring interiors.
    pub fn boundary_distance(&self, p: &Point) -> f64 {
        let seg = self
            .segments()
            .iter()
            .map(|(a, b)| point_segment_distance(p, a, b))
            .fold(f64::INFINITY, f64::min);
        self.points().map(|q| q.distance(p)).fold(seg, f64::min)
    }

    /// Minimum distance between the two geometries and the point on `other`
    /// where it is attained. Zero when they intersect.
    pub fn nearest_on(&self, other: &Geometry) -> Option<(f64, Point)> {
        if self.is_empty() || other.is_empty() {
            return None;
        }
        let mine = self.segments();
        let theirs = other.segments();
        let my_points: Vec<Point> = self.points().collect();
        let their_points: Vec<Point> = other.points().collect();

        let mut best: Option<(f64, Point)> = None;
        let mut consider = |d: f64, p: Point| {
            if best.map(|(bd, _)| d < bd).unwrap_or(true) {
                best = Some((d, p));
            }
        };

        for (a, b) in &mine {
            for (c, d) in &theirs {
                let (dist, on_other) = segment_segment_nearest(a, b, c, d);
                consider(dist, on_other);
            }
            for q in &their_points {
                consider(point_segment_distance(q, a, b), *q);
            }
        }
        for p in &my_points {
            for (c, d) in &theirs {
                let q = closest_on_segment(p, c, d);
                consider(p.distance(&q), q);
            }
            for q in &their_points {
                consider(p.distance(q), *q);
            }
        }

        if self.intersects(other) {
            return best.map(|(_, p)| (0.0, p));
        }
        best
    }

    // ═══════════════════════════════════════════════════════════════════
    // GeoJSON
    // ═══════════════════════════════════════════════════════════════════

    /// Parse a FeatureCollection, Feature, GeometryCollection or bare
    /// geometry into one unioned geometry.
    pub fn from_geojson(value: &Value) -> Result<Geometry, GeometryError> {
        let mut parts = Vec::new();
        collect_geojson(value, &mut parts)?;
        if parts.is_empty() {
            return Err(GeometryError::Empty);
        }
        Ok(Geometry::new(parts))
    }

    pub fn from_geojson_str(text: &str) -> Result<Geometry, GeometryError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| GeometryError::InvalidGeoJson(e.to_string()))?;
        Self::from_geojson(&value)
    }

}

fn invalid(msg: impl Into<String>) -> GeometryError {
    GeometryError::InvalidGeoJson(msg.into())
}

fn parse_position(v: &Value) -> Result<Point, GeometryError> {
    let arr = v.as_array().ok_or_else(|| invalid("position is not an array"))?;
    let x = arr.first().and_then(Value::as_f64);
    let y = arr.get(1).and_then(Value::as_f64);
    match (x, y) {
        (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Ok(Point::new(x, y)),
        _ => Err(invalid("position needs two finite numbers")),
    }
}

fn parse_positions(v: &Value) -> Result<Vec<Point>, GeometryError> {
    v.as_array()
        .ok_or_else(|| invalid("coordinates are not an array"))?
        .iter()
        .map(parse_position)
        .collect()
}

fn parse_polygon(v: &Value) -> Result<Polygon, GeometryError> {
    let rings = v
        .as_array()
        .ok_or_else(|| invalid("polygon coordinates are not an array"))?
        .iter()
        .map(parse_positions)
        .collect::<Result<Vec<_>, _>>()?;
    let mut rings = rings.into_iter();
    let exterior = rings.next().ok_or_else(|| invalid("polygon without rings"))?;
    let poly = Polygon::with_holes(exterior, rings.collect());
    if poly.exterior.len() < 3 {
        return Err(invalid("polygon ring needs at least 3 distinct positions"));
    }
    Ok(poly)
}

fn collect_geojson(v: &Value, out: &mut Vec<Part>) -> Result<(), GeometryError> {
    let kind = v
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("object without a type"))?;
    let coords = || v.get("coordinates").ok_or_else(|| invalid("geometry without coordinates"));
    match kind {
        "FeatureCollection" => {
            let features = v
                .get("features")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid("FeatureCollection without features"))?;
            for f in features {
                collect_geojson(f, out)?;
            }
        }
        "Feature" => match v.get("geometry") {
            Some(Value::Null) | None => {}
            Some(g) => collect_geojson(g, out)?,
        },
        "GeometryCollection" => {
            let geoms = v
                .get("geometries")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid("GeometryCollection without geometries"))?;
            for g in geoms {
                collect_geojson(g, out)?;
            }
        }
        "Point" => out.push(Part::Point(parse_position(coords()?)?)),
        "MultiPoint" => out.extend(parse_positions(coords()?)?.into_iter().map(Part::Point)),
        "LineString" => out.push(Part::Line(parse_positions(coords()?)?)),
        "MultiLineString" => {
            for line in coords()?.as_array().ok_or_else(|| invalid("bad MultiLineString"))? {
                out.push(Part::Line(parse_positions(line)?));
            }
        }
        "Polygon" => out.push(Part::Polygon(parse_polygon(coords()?)?)),
        "MultiPolygon" => {
            for poly in coords()?.as_array().ok_or_else(|| invalid("bad MultiPolygon"))? {
                out.push(Part::Polygon(parse_polygon(poly)?));
            }
        }
        other => return Err(invalid(format!("unsupported type '{}'", other))),
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Segment primitives
// ═══════════════════════════════════════════════════════════════════════

fn cross(o: &Point, a: &Point, b: &Point) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn on_segment(p: &Point, a: &Point, b: &Point) -> bool {
    p.x >= a.x.min(b.x) - 1e-12
        && p.x <= a.x.max(b.x) + 1e-12
        && p.y >= a.y.min(b.y) - 1e-12
        && p.y <= a.y.max(b.y) + 1e-12
}

pub fn segments_intersect(a: &Point, b: &Point, c: &Point, d: &Point) -> bool {
    let d1 = cross(c, d, a);
    let d2 = cross(c, d, b);
    let d3 = cross(a, b, c);
    let d4 = cross(a, b, d);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1.abs() <= EPS && on_segment(a, c, d))
        || (d2.abs() <= EPS && on_segment(b, c, d))
        || (d3.abs() <= EPS && on_segment(c, a, b))
        || (d4.abs() <= EPS && on_segment(d, a, b))
}

pub fn closest_on_segment(p: &Point, a: &Point, b: &Point) -> Point {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len2 = dx * dx + dy * dy;
    if len2 <= EPS {
        return *a;
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    Point::new(a.x + t * dx, a.y + t * dy)
}

pub fn point_segment_distance(p: &Point, a: &Point, b: &Point) -> f64 {
    p.distance(&closest_on_segment(p, a, b))
}

/// Distance between segments `ab` and `cd`, with the attaining point on `cd`.
fn segment_segment_nearest(a: &Point, b: &Point, c: &Point, d: &Point) -> (f64, Point) {
    if segments_intersect(a, b, c, d) {
        // crossing point approximated by the closer endpoint projection
        let q = closest_on_segment(a, c, d);
        return (0.0, q);
    }
    let candidates = [
        (point_segment_distance(a, c, d), closest_on_segment(a, c, d)),
        (point_segment_distance(b, c, d), closest_on_segment(b, c, d)),
        (point_segment_distance(c, a, b), *c),
        (point_segment_distance(d, a, b), *d),
    ];
    candidates
        .into_iter()
        .fold((f64::INFINITY, *c), |best, cand| if cand.0 < best.0 { cand } else { best })
}

/// Compass point names, clockwise from north.
pub const COMPASS_8: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];

/// Quantize the direction of `(dx, dy)` to 8 compass points, 0° = north,
/// clockwise: `round(atan2(dx, dy) / 45°) mod 8`. `-` for a zero vector.
pub fn bearing_8(dx: f64, dy: f64) -> &'static str {
    if dx.abs() < 1e-9 && dy.abs() < 1e-9 {
        return "-";
    }
    let mut deg = dx.atan2(dy).to_degrees();
    if deg < 0.0 {
        deg += 360.0;
    }
    let idx = ((deg + 22.5) / 45.0).floor() as usize % 8;
    COMPASS_8[idx]
}

/// The compass point opposite `bearing`, or `-` unchanged.
pub fn opposite_bearing(bearing: &str) -> &'static str {
    match COMPASS_8.iter().position(|b| *b == bearing) {
        Some(i) => COMPASS_8[(i + 4) % 8],
        None => "-",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn square(x0: f64, y0: f64, size: f64) -> Geometry {
        Geometry::polygon(Polygon::new(vec![
            Point::new(x0, y0),
            Point::new(x0 + size, y0),
            Point::new(x0 + size, y0 + size),
            Point::new(x0, y0 + size),
        ]))
    }

    #[test]
    fn bearing_quantization() {
        assert_eq!(bearing_8(0.0, 1.0), "N");
        assert_eq!(bearing_8(1.0, 1.0), "NE");
        assert_eq!(bearing_8(1.0, 0.0), "E");
        assert_eq!(bearing_8(0.0, -1.0), "S");
        assert_eq!(bearing_8(-1.0, 0.0), "W");
        assert_eq!(bearing_8(-1.0, 1.0), "NW");
        // 22.4° still rounds to N, 22.6° to NE
        let a = 22.4f64.to_radians();
        assert_eq!(bearing_8(a.sin(), a.cos()), "N");
        let b = 22.6f64.to_radians();
        assert_eq!(bearing_8(b.sin(), b.cos()), "NE");
        assert_eq!(bearing_8(0.0, 0.0), "-");
        assert_eq!(opposite_bearing("NE"), "SW");
    }

    #[test]
    fn containment_respects_holes() {
        let poly = Polygon::with_holes(
            vec![
                Point::new(0.0, 0.0),
                Point::new(10.0, 0.0),
                Point::new(10.0, 10.0),
                Point::new(0.0, 10.0),
                Point::new(0.0, 0.0),
            ],
            vec![vec![
                Point::new(4.0, 4.0),
                Point::new(6.0, 4.0),
                Point::new(6.0, 6.0),
                Point::new(4.0, 6.0),
            ]],
        );
        assert_eq!(poly.exterior.len(), 4);
        assert!(poly.contains(&Point::new(1.0, 1.0)));
        assert!(!poly.contains(&Point::new(5.0, 5.0)));
        assert!(!poly.contains(&Point::new(11.0, 5.0)));
        assert!((poly.area() - 96.0).abs() < 1e-9);
    }

    #[test]
    fn intersects_covers_crossing_and_containment() {
        let big = square(0.0, 0.0, 10.0);
        assert!(big.intersects(&square(8.0, 8.0, 5.0)));
        assert!(big.intersects(&square(2.0, 2.0, 1.0)));
        assert!(square(2.0, 2.0, 1.0).intersects(&big));
        assert!(!big.intersects(&square(20.0, 0.0, 1.0)));
        // touching edges intersect
        assert!(big.intersects(&square(10.0, 0.0, 1.0)));
    }

    #[test]
    fn distance_between_disjoint_squares() {
        let a = square(0.0, 0.0, 1.0);
        let b = square(3.0, 0.0, 1.0);
        let (d, p) = a.nearest_on(&b).unwrap();
        assert!((d - 2.0).abs() < 1e-9);
        assert!((p.x - 3.0).abs() < 1e-9);
        assert!((b.nearest_on(&a).unwrap().0 - 2.0).abs() < 1e-9);
        assert_eq!(a.nearest_on(&square(0.5, 0.5, 0.1)).map(|(d, _)| d), Some(0.0));
    }

    #[test]
    fn distance_to_points_and_lines() {
        let a = square(0.0, 0.0, 1.0);
        let pt = Geometry::new(vec![Part::Point(Point::new(1.0, 4.0))]);
        assert!((a.nearest_on(&pt).unwrap().0 - 3.0).abs() < 1e-9);
        let line = Geometry::new(vec![Part::Line(vec![Point::new(-5.0, 3.0), Point::new(5.0, 3.0)])]);
        assert!((a.nearest_on(&line).unwrap().0 - 2.0).abs() < 1e-9);
        assert!((a.boundary_distance(&Point::new(0.5, 0.5)) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn centroid_of_square_and_circle() {
        let c = square(0.0, 0.0, 2.0).centroid().unwrap();
        assert!((c.x - 1.0).abs() < 1e-9 && (c.y - 1.0).abs() < 1e-9);
        let circle = Geometry::polygon(Polygon::circle(Point::new(5.0, -5.0), 3.0, 64));
        let c = circle.centroid().unwrap();
        assert!((c.x - 5.0).abs() < 1e-9 && (c.y + 5.0).abs() < 1e-9);
    }

    #[test]
    fn geojson_feature_collection_unions_parts() {
        let gj = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {}, "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 1], [0, 0]]]
                }},
                {"type": "Feature", "properties": {}, "geometry": {
                    "type": "MultiLineString",
                    "coordinates": [[[5, 5], [6, 6]], [[7, 7], [8, 8]]]
                }},
                {"type": "Feature", "properties": {}, "geometry": null}
            ]
        });
        let g = Geometry::from_geojson(&gj).unwrap();
        assert_eq!(g.parts.len(), 3);
        assert!(g.has_area());
        let env = g.envelope().unwrap();
        assert_eq!(env.to_array(), [0.0, 0.0, 8.0, 8.0]);
    }

    #[test]
    fn geojson_errors_are_descriptive() {
        assert_eq!(
            Geometry::from_geojson(&json!({"type": "FeatureCollection", "features": []})),
            Err(GeometryError::Empty)
        );
        assert!(matches!(
            Geometry::from_geojson(&json!({"type": "Polygon", "coordinates": [[[0, 0], [1, 1]]]})),
            Err(GeometryError::InvalidGeoJson(_))
        ));
        assert!(Geometry::from_geojson_str("not json").is_err());
    }
}
