//! # Data Request Harness Core
//!
//! Shared, I/O-free logic for the data request harness: request and
//! evidence models, the typed connector parameter union, the request
//! catalog, table merge strategies, the case-store abstraction, and the
//! planar geometry used by the overlay analyzer.
//!
//! This crate contains no tokio runtime, sqlx, HTTP, or filesystem I/O.
//! Everything here is deterministic and unit-testable in isolation.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Engine error taxonomy |
//! | [`models`] | Requests, evidence, tables, overlay results |
//! | [`params`] | Per-connector parameter structs and their tagged union |
//! | [`catalog`] | Request catalog read/write over a table |
//! | [`merge`] | REPLACE_ALL / UPSERT_BY_KEY / APPEND |
//! | [`geometry`] | Points, polygons, GeoJSON, projections |
//! | [`overlay`] | Vector and raster proximity analysis |
//! | [`store`] | Case-store trait and in-memory implementation |

pub mod catalog;
pub mod error;
pub mod geometry;
pub mod merge;
pub mod models;
pub mod overlay;
pub mod params;
pub mod store;
