//! Coordinate reference systems used by the overlay analyzer.
//!
//! Supported: geographic WGS84 (EPSG:4326), Web Mercator (EPSG:3857),
//! and the Transverse Mercator grids common for Korean site data
//! (EPSG:5179 UTM-K, 5181, 5185-5188 central/west/east belts, 32651/32652
//! UTM). TM math follows the Snyder series on the GRS80 ellipsoid, which
//! is sub-millimetre within a belt.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};
use std::str::FromStr;

use super::{GeometryError, Point};

const A: f64 = 6_378_137.0;
const F: f64 = 1.0 / 298.257_222_101;

/// Transverse Mercator grid parameters (angles in degrees).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TmParams {
    pub lat0: f64,
    pub lon0: f64,
    pub k0: f64,
    pub false_easting: f64,
    pub false_northing: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Crs {
    /// Longitude/latitude in degrees.
    Geographic,
    WebMercator,
    TransverseMercator { epsg: u32, params: TmParams },
}

fn tm(epsg: u32, lat0: f64, lon0: f64, k0: f64, fe: f64, fn_: f64) -> Crs {
    Crs::TransverseMercator {
        epsg,
        params: TmParams {
            lat0,
            lon0,
            k0,
            false_easting: fe,
            false_northing: fn_,
        },
    }
}

impl Crs {
    pub fn from_epsg(code: u32) -> Result<Crs, GeometryError> {
        Ok(match code {
            4326 | 4737 | 4258 => Crs::Geographic,
            3857 | 900913 => Crs::WebMercator,
            5179 => tm(5179, 38.0, 127.5, 0.9996, 1_000_000.0, 2_000_000.0),
            5181 => tm(5181, 38.0, 127.0, 1.0, 200_000.0, 500_000.0),
            5185 => tm(5185, 38.0, 125.0, 1.0, 200_000.0, 600_000.0),
            5186 => tm(5186, 38.0, 127.0, 1.0, 200_000.0, 600_000.0),
            5187 => tm(5187, 38.0, 129.0, 1.0, 200_000.0, 600_000.0),
            5188 => tm(5188, 38.0, 131.0, 1.0, 200_000.0, 600_000.0),
            32651 => tm(32651, 0.0, 123.0, 0.9996, 500_000.0, 0.0),
            32652 => tm(32652, 0.0, 129.0, 0.9996, 500_000.0, 0.0),
            other => return Err(GeometryError::UnsupportedCrs(format!("EPSG:{}", other))),
        })
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Geographic => 4326,
            Crs::WebMercator => 3857,
            Crs::TransverseMercator { epsg, .. } => *epsg,
        }
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Geographic)
    }

    /// `EPSG:xxxx` label.
    pub fn code(&self) -> String {
        format!("EPSG:{}", self.epsg())
    }

    /// Geographic (lon, lat) degrees to this system.
    pub fn forward(&self, lonlat: Point) -> Result<Point, GeometryError> {
        match self {
            Crs::Geographic => Ok(lonlat),
            Crs::WebMercator => {
                let lat = lonlat.y.clamp(-85.051_128_78, 85.051_128_78).to_radians();
                Ok(Point::new(
                    A * lonlat.x.to_radians(),
                    A * (FRAC_PI_4 + lat / 2.0).tan().ln(),
                ))
            }
            Crs::TransverseMercator { params, .. } => Ok(tm_forward(params, lonlat)),
        }
    }

    /// This system to geographic (lon, lat) degrees.
    pub fn inverse(&self, p: Point) -> Result<Point, GeometryError> {
        match self {
            Crs::Geographic => Ok(p),
            Crs::WebMercator => Ok(Point::new(
                (p.x / A).to_degrees(),
                (2.0 * (p.y / A).exp().atan() - FRAC_PI_2).to_degrees(),
            )),
            Crs::TransverseMercator { params, .. } => Ok(tm_inverse(params, p)),
        }
    }
}

impl FromStr for Crs {
    type Err = GeometryError;

    /// Accepts `EPSG:5186`, `epsg:4326`, `5186`, and the OGC CRS84 URN.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        let upper = t.to_ascii_uppercase();
        if upper.ends_with("CRS84") {
            return Ok(Crs::Geographic);
        }
        let digits = upper
            .rsplit(|c: char| c == ':' || c == '/')
            .next()
            .unwrap_or("");
        digits
            .parse::<u32>()
            .map_err(|_| GeometryError::UnsupportedCrs(t.to_string()))
            .and_then(Crs::from_epsg)
    }
}

/// Reproject a point between two systems via geographic coordinates.
pub fn transform(p: Point, from: &Crs, to: &Crs) -> Result<Point, GeometryError> {
    if from == to {
        return Ok(p);
    }
    to.forward(from.inverse(p)?)
}

fn ellipsoid() -> (f64, f64) {
    let e2 = 2.0 * F - F * F;
    (e2, e2 / (1.0 - e2))
}

fn meridian_arc(phi: f64, e2: f64) -> f64 {
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    A * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
        - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
        + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
        - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

fn tm_forward(p: &TmParams, lonlat: Point) -> Point {
    let (e2, ep2) = ellipsoid();
    let phi = lonlat.y.to_radians();
    let lam = lonlat.x.to_radians();
    let lam0 = p.lon0.to_radians();

    let sin = phi.sin();
    let cos = phi.cos();
    let tan = phi.tan();
    let n = A / (1.0 - e2 * sin * sin).sqrt();
    let t = tan * tan;
    let c = ep2 * cos * cos;
    let a = (lam - lam0) * cos;
    let m = meridian_arc(phi, e2);
    let m0 = meridian_arc(p.lat0.to_radians(), e2);

    let x = p.false_easting
        + p.k0
            * n
            * (a + (1.0 - t + c) * a.powi(3) / 6.0
                + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0);
    let y = p.false_northing
        + p.k0
            * (m - m0
                + n * tan
                    * (a * a / 2.0
                        + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                        + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6)
                            / 720.0));
    Point::new(x, y)
}

fn tm_inverse(p: &TmParams, xy: Point) -> Point {
    let (e2, ep2) = ellipsoid();
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    let m0 = meridian_arc(p.lat0.to_radians(), e2);
    let m = m0 + (xy.y - p.false_northing) / p.k0;
    let mu = m / (A * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin1 = phi1.sin();
    let cos1 = phi1.cos();
    let tan1 = phi1.tan();
    let c1 = ep2 * cos1 * cos1;
    let t1 = tan1 * tan1;
    let n1 = A / (1.0 - e2 * sin1 * sin1).sqrt();
    let r1 = A * (1.0 - e2) / (1.0 - e2 * sin1 * sin1).powf(1.5);
    let d = (xy.x - p.false_easting) / (n1 * p.k0);

    let phi = phi1
        - (n1 * tan1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lam = p.lon0.to_radians()
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                * d.powi(5)
                / 120.0)
            / cos1;
    Point::new(lam.to_degrees(), phi.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_epsg_labels() {
        assert_eq!("EPSG:4326".parse::<Crs>().unwrap(), Crs::Geographic);
        assert_eq!("3857".parse::<Crs>().unwrap(), Crs::WebMercator);
        assert_eq!("epsg:5186".parse::<Crs>().unwrap().epsg(), 5186);
        assert_eq!(
            "urn:ogc:def:crs:OGC:1.3:CRS84".parse::<Crs>().unwrap(),
            Crs::Geographic
        );
        assert!("EPSG:9999".parse::<Crs>().is_err());
        assert!("garbage".parse::<Crs>().is_err());
    }

    #[test]
    fn tm_origin_maps_to_false_origin() {
        let crs = Crs::from_epsg(5186).unwrap();
        let p = crs.forward(Point::new(127.0, 38.0)).unwrap();
        assert!((p.x - 200_000.0).abs() < 1e-6);
        assert!((p.y - 600_000.0).abs() < 1e-6);
    }

    #[test]
    fn tm_round_trip_is_tight() {
        for code in [5179, 5181, 5186, 5187, 32652] {
            let crs = Crs::from_epsg(code).unwrap();
            let ll = Point::new(126.9780, 37.5665);
            let back = crs.inverse(crs.forward(ll).unwrap()).unwrap();
            assert!((back.x - ll.x).abs() < 1e-7, "lon drift for {}", code);
            assert!((back.y - ll.y).abs() < 1e-7, "lat drift for {}", code);
        }
    }

    #[test]
    fn tm_distances_are_metric() {
        // one arc-minute of latitude is about 1849 m at 37.5°N
        let crs = Crs::from_epsg(5186).unwrap();
        let a = crs.forward(Point::new(127.0, 37.5)).unwrap();
        let b = crs.forward(Point::new(127.0, 37.5 + 1.0 / 60.0)).unwrap();
        let d = a.distance(&b);
        assert!((d - 1849.5).abs() < 2.0, "got {}", d);
    }

    #[test]
    fn web_mercator_round_trip() {
        let ll = Point::new(127.1, 37.4);
        let p = Crs::WebMercator.forward(ll).unwrap();
        let back = Crs::WebMercator.inverse(p).unwrap();
        assert!((back.x - ll.x).abs() < 1e-9 && (back.y - ll.y).abs() < 1e-9);
    }

    #[test]
    fn transform_between_grids() {
        let from = Crs::from_epsg(5186).unwrap();
        let to = Crs::from_epsg(5181).unwrap();
        let p = Point::new(210_000.0, 550_000.0);
        let q = transform(p, &from, &to).unwrap();
        // same central meridian, northing offset differs by 100 km
        assert!((q.x - p.x).abs() < 1e-3);
        assert!((p.y - q.y - 100_000.0).abs() < 1e-3);
    }
}
