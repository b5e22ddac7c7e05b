//! # Data Request Harness
//!
//! A provenance-stamped data request engine for site assessment cases.
//!
//! Each case carries a catalog of declarative requests (fetch weather
//! station precipitation, air quality, census series, water survey
//! stations, map figures, geocode the site, extract a document page,
//! overlay the site against mapped zones). The harness plans a default catalog, executes due
//! requests in priority order, merges their rows into case tables and
//! records an immutable evidence artifact behind every value it writes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌───────────┐
//! │ Planner  │──▶│ Catalog  │──▶│   Runner   │──▶│  SQLite   │
//! │ defaults │   │ DATA_REQ │   │ sequential │   │ case store│
//! └──────────┘   └──────────┘   └─────┬──────┘   └───────────┘
//!                                     │
//!                     ┌───────────────┼────────────────┐
//!                     ▼               ▼                ▼
//!               ┌──────────┐   ┌────────────┐   ┌────────────┐
//!               │Connectors│   │  Evidence  │   │ Run report │
//!               │ HTTP/GIS │   │ artifacts  │   │   (JSON)   │
//!               └──────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! drq init                                   # create the case store
//! drq table import LOCATION location.json    # seed the site
//! drq plan                                   # default requests
//! drq run                                    # execute due requests
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`traits`] | Connector trait, run context, registry |
//! | [`connector_kma`] | Weather station precipitation |
//! | [`connector_airkorea`] | Air quality |
//! | [`connector_kosis`] | Statistical series |
//! | [`connector_nier`] | Water-quality survey stations |
//! | [`connector_wms`] | Map images with provider fallback |
//! | [`connector_geocode`] | Address geocoding |
//! | [`connector_pdf`] | Document page extraction |
//! | [`connector_overlay`] | Site vs. feature overlay, zoning breakdown |
//! | [`planner`] | Default request set and catalog merge |
//! | [`runner`] | Sequential execution with degrade paths |
//! | [`evidence`] | Artifact recording and health checks |
//! | [`cache`] | Read-through map image cache |
//! | [`sqlite_store`] | SQLite case store |
//! | [`report`] | Run summaries |
//! | [`progress`] | Run progress on stderr |
//! | [`verify`] | Connector pre-flight checks |
//! | [`tables`] | Case table import and display |
//! | [`case_state`] | Site facts and region geometry |
//! | [`http`] | HTTP client with retries |
//! | [`sanitize`] | Secret redaction |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod case_state;
pub mod config;
pub mod connector_airkorea;
pub mod connector_geocode;
pub mod connector_kma;
pub mod connector_kosis;
pub mod connector_nier;
pub mod connector_overlay;
pub mod connector_pdf;
pub mod connector_wms;
pub mod db;
pub mod evidence;
pub mod http;
pub mod migrate;
pub mod planner;
pub mod progress;
pub mod report;
pub mod runner;
pub mod sanitize;
pub mod sqlite_store;
pub mod tables;
pub mod traits;
pub mod verify;
