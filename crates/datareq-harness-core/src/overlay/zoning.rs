//! Zoning breakdown: parcel areas summed per zoning class.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{cell_f64, cell_text, Row};

/// Table of land parcels with `zoning` and `area_m2` columns.
pub const PARCELS_TABLE: &str = "PARCELS";

#[derive(Debug, Clone, PartialEq)]
pub struct ZoningArea {
    pub zoning: String,
    pub area_m2: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ZoningBreakdown {
    /// Largest class first; ties by name.
    pub areas: Vec<ZoningArea>,
    /// Distinct source tags of the parcels that contributed.
    pub source_tags: Vec<String>,
}

impl ZoningBreakdown {
    pub fn total_m2(&self) -> f64 {
        self.areas.iter().map(|a| a.area_m2).sum()
    }
}

fn round_2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Sum `area_m2` per `zoning`. Parcels without a zoning class or a
/// positive area are ignored.
pub fn zoning_breakdown(parcels: &[Row]) -> ZoningBreakdown {
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    let mut tags = BTreeSet::new();
    for row in parcels {
        let zoning = cell_text(row, "zoning");
        if zoning.is_empty() {
            continue;
        }
        let Some(area) = cell_f64(row, "area_m2").filter(|a| *a > 0.0) else {
            continue;
        };
        *sums.entry(zoning).or_insert(0.0) += area;
        let tag = match cell_text(row, "source_tag") {
            t if t.is_empty() => cell_text(row, "src_id"),
            t => t,
        };
        if !tag.is_empty() {
            tags.insert(tag);
        }
    }

    let mut areas: Vec<ZoningArea> = sums
        .into_iter()
        .map(|(zoning, a)| ZoningArea {
            zoning,
            area_m2: round_2(a),
        })
        .collect();
    areas.sort_by(|a, b| b.area_m2.total_cmp(&a.area_m2).then_with(|| a.zoning.cmp(&b.zoning)));
    ZoningBreakdown {
        areas,
        source_tags: tags.into_iter().collect(),
    }
}
