//! TOML configuration for the `drq` binary.
//!
//! One file carries everything a run needs apart from credentials: where
//! the case lives, HTTP and cache tuning, overlay tunables, the station
//! catalog, WMS layer definitions and KOSIS dataset templates.
//! Credentials are read from environment variables by the connectors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use datareq_harness_core::geometry::{Crs, GeometryError};
use datareq_harness_core::overlay::OverlaySettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub geocode: GeocodeConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
    #[serde(default)]
    pub layers: BTreeMap<String, LayerConfig>,
    #[serde(default)]
    pub kosis: KosisConfig,
    #[serde(default)]
    pub features: Vec<FeatureConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Case directory. Evidence lands in `attachments/evidence/`, reports
    /// in `reports/`, relative paths in request params resolve against it.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before the first retry; doubles per attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    25
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_user_agent() -> String {
    format!("datareq-harness/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Relative paths resolve against `storage.root`.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            ttl_days: default_ttl_days(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache/maps")
}
fn default_ttl_days() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct OverlayConfig {
    #[serde(default = "default_alpha_threshold")]
    pub alpha_threshold: u8,
    #[serde(default = "default_sample_stride")]
    pub sample_stride: usize,
    #[serde(default = "default_max_points")]
    pub max_points: usize,
    #[serde(default = "default_analysis_max_size")]
    pub analysis_max_size: u32,
    #[serde(default = "default_metric_epsg")]
    pub metric_epsg: u32,
    /// Circle radius around the site centre when a case has no boundary.
    #[serde(default = "default_buffer_m")]
    pub default_buffer_m: f64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            alpha_threshold: default_alpha_threshold(),
            sample_stride: default_sample_stride(),
            max_points: default_max_points(),
            analysis_max_size: default_analysis_max_size(),
            metric_epsg: default_metric_epsg(),
            default_buffer_m: default_buffer_m(),
        }
    }
}

impl OverlayConfig {
    pub fn settings(&self) -> Result<OverlaySettings, GeometryError> {
        Ok(OverlaySettings {
            alpha_threshold: self.alpha_threshold,
            sample_stride: self.sample_stride,
            max_points: self.max_points,
            analysis_max_size: self.analysis_max_size,
            metric_crs: Crs::from_epsg(self.metric_epsg)?,
        })
    }
}

fn default_alpha_threshold() -> u8 {
    10
}
fn default_sample_stride() -> usize {
    4
}
fn default_max_points() -> usize {
    5000
}
fn default_analysis_max_size() -> u32 {
    512
}
fn default_metric_epsg() -> u32 {
    5186
}
fn default_buffer_m() -> f64 {
    500.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocodeConfig {
    /// `AUTO`, `VWORLD` or `NOMINATIM`.
    #[serde(default = "default_geocode_provider")]
    pub provider: String,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            provider: default_geocode_provider(),
        }
    }
}

fn default_geocode_provider() -> String {
    "AUTO".to_string()
}

/// Base URLs of the public APIs. Overridable for mirrors and tests.
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointsConfig {
    #[serde(default = "default_kma_asos_url")]
    pub kma_asos: String,
    #[serde(default = "default_airkorea_url")]
    pub airkorea: String,
    #[serde(default = "default_kosis_url")]
    pub kosis: String,
    #[serde(default = "default_nier_water_url")]
    pub nier_water: String,
    #[serde(default = "default_vworld_url")]
    pub vworld: String,
    #[serde(default = "default_nominatim_url")]
    pub nominatim: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            kma_asos: default_kma_asos_url(),
            airkorea: default_airkorea_url(),
            kosis: default_kosis_url(),
            nier_water: default_nier_water_url(),
            vworld: default_vworld_url(),
            nominatim: default_nominatim_url(),
        }
    }
}

fn default_kma_asos_url() -> String {
    "http://apis.data.go.kr/1360000/AsosDalyInfoService/getWthrDataList".to_string()
}
fn default_airkorea_url() -> String {
    "http://apis.data.go.kr/B552584".to_string()
}
fn default_kosis_url() -> String {
    "https://kosis.kr/openapi/Param/statisticsParameterData.do".to_string()
}
fn default_nier_water_url() -> String {
    "https://apis.data.go.kr/1480523/WaterqualityServices/getIvstg".to_string()
}
fn default_vworld_url() -> String {
    "https://api.vworld.kr/req/address".to_string()
}
fn default_nominatim_url() -> String {
    "https://nominatim.openstreetmap.org/search".to_string()
}

/// One ASOS weather station.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StationConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

/// How a map provider expects its request parameters.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    #[default]
    OgcWms,
    RestImage,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Environment variable holding the key.
    pub env_var: String,
    /// Query parameter names to send the key under. The first that
    /// succeeds wins.
    #[serde(default = "default_key_params")]
    pub key_params: Vec<String>,
}

fn default_key_params() -> Vec<String> {
    vec!["key".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub layers: String,
    #[serde(default)]
    pub styles: String,
    #[serde(default = "default_wms_version")]
    pub version: String,
    #[serde(default = "default_image_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub transparent: bool,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub default_params: BTreeMap<String, String>,
    #[serde(default)]
    pub omit_params: Vec<String>,
    /// REST_IMAGE only: logical name (`bbox`, `width`, `height`, `srs`,
    /// `format`) to the provider's query parameter name.
    #[serde(default)]
    pub param_map: BTreeMap<String, String>,
    /// REST_IMAGE only: axis order of the bbox value.
    #[serde(default = "default_bbox_order")]
    pub bbox_order: String,
}

fn default_wms_version() -> String {
    "1.3.0".to_string()
}
fn default_image_format() -> String {
    "image/png".to_string()
}
fn default_bbox_order() -> String {
    "minx,miny,maxx,maxy".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LayerConfig {
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_true")]
    pub enabled_by_default: bool,
    #[serde(default)]
    pub source_tag: String,
    /// User-provided image used when every provider fails.
    #[serde(default)]
    pub fallback_file_path: Option<PathBuf>,
    #[serde(default = "default_layer_srs")]
    pub srs: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_layer_srs() -> String {
    "EPSG:3857".to_string()
}

impl LayerConfig {
    /// Env vars every provider needs. Empty when a provider is keyless.
    pub fn auth_env_vars(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter_map(|p| p.auth.as_ref())
            .map(|a| a.env_var.clone())
            .filter(|v| !v.trim().is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KosisConfig {
    #[serde(default)]
    pub datasets: BTreeMap<String, KosisDataset>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KosisDataset {
    #[serde(default)]
    pub description: String,
    /// Overrides `endpoints.kosis` for this dataset.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_socio_table")]
    pub target_table: String,
    #[serde(default)]
    pub source_tag: String,
    /// Query template. Values may use `{admin_code}`, `{admin_name}`,
    /// `{start_year}`, `{end_year}` and `{year}`.
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub mappings: Vec<KosisMapping>,
}

fn default_socio_table() -> String {
    "ENV_BASE_SOCIO".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct KosisMapping {
    pub output_col: String,
    #[serde(default)]
    pub match_itm_id: Option<String>,
    #[serde(default)]
    pub match_itm_nm_contains: Option<String>,
}

/// A vector feature the planner adds to the overlay request.
#[derive(Debug, Deserialize, Clone)]
pub struct FeatureConfig {
    pub overlay_id: String,
    #[serde(default)]
    pub feature_id: Option<String>,
    pub geometry_file: String,
    #[serde(default)]
    pub srs: Option<String>,
}

impl Config {
    /// A config with every optional section at its default.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/case.sqlite"),
            },
            storage: StorageConfig {
                root: PathBuf::from("./case"),
            },
            http: HttpConfig::default(),
            cache: CacheConfig::default(),
            overlay: OverlayConfig::default(),
            geocode: GeocodeConfig::default(),
            endpoints: EndpointsConfig::default(),
            stations: Vec::new(),
            layers: BTreeMap::new(),
            kosis: KosisConfig::default(),
            features: Vec::new(),
        }
    }

    pub fn case_root(&self) -> &Path {
        &self.storage.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        if self.cache.dir.is_absolute() {
            self.cache.dir.clone()
        } else {
            self.storage.root.join(&self.cache.dir)
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.storage.root.join("reports")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.http.timeout_secs == 0 {
        anyhow::bail!("http.timeout_secs must be > 0");
    }
    if config.http.max_retries > 10 {
        anyhow::bail!("http.max_retries must be <= 10");
    }

    if config.overlay.sample_stride == 0 {
        anyhow::bail!("overlay.sample_stride must be > 0");
    }
    if config.overlay.max_points == 0 {
        anyhow::bail!("overlay.max_points must be > 0");
    }
    if config.overlay.analysis_max_size < 16 {
        anyhow::bail!("overlay.analysis_max_size must be >= 16");
    }
    if !(config.overlay.default_buffer_m > 0.0) {
        anyhow::bail!("overlay.default_buffer_m must be > 0");
    }
    let metric = Crs::from_epsg(config.overlay.metric_epsg)
        .with_context(|| "overlay.metric_epsg is not a supported system")?;
    if metric.is_geographic() {
        anyhow::bail!("overlay.metric_epsg must be a projected (metric) system");
    }

    match config.geocode.provider.to_ascii_uppercase().as_str() {
        "AUTO" | "VWORLD" | "NOMINATIM" => {}
        _ => anyhow::bail!(
            "Unknown geocode provider: '{}'. Must be AUTO, VWORLD, or NOMINATIM.",
            config.geocode.provider
        ),
    }

    for station in &config.stations {
        if station.id.trim().is_empty() {
            anyhow::bail!("stations: every station needs an id");
        }
        if !(-90.0..=90.0).contains(&station.lat) || !(-180.0..=180.0).contains(&station.lon) {
            anyhow::bail!("stations.{}: lat/lon out of range", station.id);
        }
    }

    for (key, layer) in &config.layers {
        if layer.providers.is_empty() {
            anyhow::bail!("layers.{}: at least one provider is required", key);
        }
        layer
            .srs
            .parse::<Crs>()
            .with_context(|| format!("layers.{}.srs", key))?;
        for p in &layer.providers {
            if p.base_url.trim().is_empty() {
                anyhow::bail!("layers.{}: provider base_url must not be empty", key);
            }
            if p.kind == ProviderKind::OgcWms && p.layers.trim().is_empty() {
                anyhow::bail!("layers.{}: OGC_WMS provider needs `layers`", key);
            }
        }
    }

    for (key, ds) in &config.kosis.datasets {
        if ds.mappings.is_empty() {
            anyhow::bail!("kosis.datasets.{}: at least one mapping is required", key);
        }
        for m in &ds.mappings {
            if m.match_itm_id.is_none() && m.match_itm_nm_contains.is_none() {
                anyhow::bail!(
                    "kosis.datasets.{}.{}: needs match_itm_id or match_itm_nm_contains",
                    key,
                    m.output_col
                );
            }
        }
    }

    Ok(())
}
