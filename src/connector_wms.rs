//! Map image connector (OGC WMS `GetMap` and REST image endpoints).
//!
//! A layer is configured under `[layers.<KEY>]` with one or more
//! providers, tried in order until one returns a decodable image. Fetches
//! go through the read-through [`MapCache`](crate::cache::MapCache).
//!
//! When every provider fails the degrade path records either the layer's
//! local reference image or a transparent placeholder, so downstream
//! overlays still have an artifact to point at. Both are placeholder
//! evidence and the next run tries the providers again.

use std::io::Cursor;
use std::sync::LazyLock;

use async_trait::async_trait;
use datareq_harness_core::error::EngineError;
use datareq_harness_core::geometry::{BBox, Crs, Point};
use datareq_harness_core::models::{
    OriginClass, Request, Row, FALLBACK_MARKER, PLACEHOLDER_MARKER,
};
use datareq_harness_core::params::{BboxMode, RequestParams, WmsParams};
use image::{DynamicImage, ImageFormat, RgbaImage};
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::cache::MapCache;
use crate::case_state::{load_geojson, SiteContext};
use crate::config::{LayerConfig, ProviderConfig, ProviderKind};
use crate::evidence::{ArtifactDir, ArtifactSpec};
use crate::http::{build_url, env_key, snippet};
use crate::sanitize::{public_pairs, redact_text};
use crate::traits::{Connector, ConnectorOutput, RunContext};

pub const FIGURES_TABLE: &str = "FIGURES";
const CACHE_NAMESPACE: &str = "wms";

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title>\s*(.*?)\s*</title>").unwrap());
static ALERT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)alert\(\s*['"](.*?)['"]\s*\)"#).unwrap());
static EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:ogc:)?ServiceException(?:\s[^>]*)?>\s*(.*?)\s*</(?:ogc:)?ServiceException>")
        .unwrap()
});

pub struct WmsConnector;

// ═══════════════════════════════════════════════════════════════════════
// Extent and request building
// ═══════════════════════════════════════════════════════════════════════

/// Map extent in `target` units.
pub fn resolve_bbox(
    p: &WmsParams,
    site: &SiteContext,
    case_root: &std::path::Path,
    target: &Crs,
) -> Result<BBox, EngineError> {
    let boundary = site.boundary_file.as_deref().filter(|s| !s.trim().is_empty());
    match (p.bbox_mode, boundary) {
        (BboxMode::Boundary, None) => Err(EngineError::config(
            "bbox_mode BOUNDARY needs LOCATION.boundary_file",
        )),
        (BboxMode::Boundary | BboxMode::Auto, Some(rel)) => {
            let (geometry, crs) = load_geojson(case_root, rel, None)?;
            let projected = geometry.transform(&crs, target)?;
            projected
                .envelope()
                .filter(BBox::is_valid)
                .ok_or_else(|| EngineError::config(format!("boundary {} has no extent", rel)))
        }
        _ => point_bbox(site.require_center()?, p.radius_m, target),
    }
}

/// Centre ± radius. Geographic systems use 111 km per degree.
pub fn point_bbox(center: Point, radius_m: f64, target: &Crs) -> Result<BBox, EngineError> {
    if target.is_geographic() {
        let d = radius_m / 111_000.0;
        return Ok(BBox::new(center.x - d, center.y - d, center.x + d, center.y + d));
    }
    let c = target.forward(center)?;
    Ok(BBox::new(
        c.x - radius_m,
        c.y - radius_m,
        c.x + radius_m,
        c.y + radius_m,
    ))
}

fn fmt_coord(v: f64) -> String {
    let s = format!("{:.6}", v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() || s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

/// Bbox value ordered per `order`, e.g. `"minx,miny,maxx,maxy"`.
pub fn ordered_bbox(bbox: &BBox, order: &str) -> Result<String, EngineError> {
    order
        .split(',')
        .map(|axis| match axis.trim().to_ascii_lowercase().as_str() {
            "minx" => Ok(fmt_coord(bbox.minx)),
            "miny" => Ok(fmt_coord(bbox.miny)),
            "maxx" => Ok(fmt_coord(bbox.maxx)),
            "maxy" => Ok(fmt_coord(bbox.maxy)),
            other => Err(EngineError::config(format!("unknown bbox axis '{}'", other))),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|v| v.join(","))
}

fn apply_overrides(mut params: Vec<(String, String)>, provider: &ProviderConfig) -> Vec<(String, String)> {
    for (k, v) in &provider.default_params {
        match params.iter_mut().find(|(pk, _)| pk.eq_ignore_ascii_case(k)) {
            Some(existing) => existing.1 = v.clone(),
            None => params.push((k.clone(), v.clone())),
        }
    }
    params.retain(|(k, _)| !provider.omit_params.iter().any(|o| o.eq_ignore_ascii_case(k)));
    params
}

/// Query parameters for one provider, without credentials.
pub fn provider_params(
    provider: &ProviderConfig,
    srs: &Crs,
    bbox: &BBox,
    width: u32,
    height: u32,
) -> Result<Vec<(String, String)>, EngineError> {
    let pair = |k: &str, v: String| (k.to_string(), v);
    let params = match provider.kind {
        ProviderKind::OgcWms => {
            let v13 = provider.version.trim().starts_with("1.3");
            // WMS 1.3.0 uses lat/lon axis order for EPSG:4326.
            let order = if v13 && srs.is_geographic() {
                "miny,minx,maxy,maxx"
            } else {
                "minx,miny,maxx,maxy"
            };
            vec![
                pair("SERVICE", "WMS".into()),
                pair("REQUEST", "GetMap".into()),
                pair("VERSION", provider.version.clone()),
                pair("LAYERS", provider.layers.clone()),
                pair("STYLES", provider.styles.clone()),
                pair(if v13 { "CRS" } else { "SRS" }, srs.code()),
                pair("BBOX", ordered_bbox(bbox, order)?),
                pair("WIDTH", width.to_string()),
                pair("HEIGHT", height.to_string()),
                pair("FORMAT", provider.format.clone()),
                pair(
                    "TRANSPARENT",
                    if provider.transparent { "TRUE" } else { "FALSE" }.into(),
                ),
            ]
        }
        ProviderKind::RestImage => {
            let name = |logical: &str| {
                provider
                    .param_map
                    .get(logical)
                    .cloned()
                    .unwrap_or_else(|| logical.to_string())
            };
            vec![
                (name("bbox"), ordered_bbox(bbox, &provider.bbox_order)?),
                (name("width"), width.to_string()),
                (name("height"), height.to_string()),
                (name("srs"), srs.code()),
                (name("format"), provider.format.clone()),
            ]
        }
    };
    Ok(apply_overrides(params, provider))
}

/// A short human-readable reason from an error page.
pub fn error_hint(body: &str) -> String {
    for re in [&*EXCEPTION_RE, &*ALERT_RE, &*TITLE_RE] {
        if let Some(m) = re.captures(body).and_then(|c| c.get(1)) {
            let hint = m.as_str().trim();
            if !hint.is_empty() {
                return snippet(hint);
            }
        }
    }
    snippet(body)
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, EngineError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| EngineError::data_quality(format!("PNG encoding failed: {}", e)))?;
    Ok(buf.into_inner())
}

fn image_ext(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(ImageFormat::WebP) => "webp",
        _ => "png",
    }
}

fn decodes(bytes: &[u8]) -> bool {
    image::load_from_memory(bytes).is_ok()
}

// ═══════════════════════════════════════════════════════════════════════
// Fetching
// ═══════════════════════════════════════════════════════════════════════

struct Fetched {
    bytes: Vec<u8>,
    provider: String,
    url: String,
    params: Vec<(String, String)>,
    content_type: String,
    cache_hit: bool,
}

fn provider_label(provider: &ProviderConfig, index: usize) -> String {
    if provider.name.trim().is_empty() {
        format!("provider#{}", index + 1)
    } else {
        provider.name.clone()
    }
}

impl WmsConnector {
    fn layer<'a>(&self, layer_key: &str, ctx: &'a RunContext<'_>) -> Result<&'a LayerConfig, EngineError> {
        ctx.config.layers.get(layer_key.trim()).ok_or_else(|| {
            EngineError::config(format!("layer '{}' is not configured under [layers]", layer_key))
        })
    }

    fn srs(&self, p: &WmsParams, layer: &LayerConfig) -> Result<Crs, EngineError> {
        let code = p
            .srs
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&layer.srs);
        Ok(code.parse::<Crs>()?)
    }

    /// One provider, trying each configured key parameter name in turn.
    async fn fetch_from(
        &self,
        provider: &ProviderConfig,
        label: &str,
        base_params: Vec<(String, String)>,
        force_refresh: bool,
        ctx: &RunContext<'_>,
    ) -> Result<Fetched, EngineError> {
        let source = format!("{}|{}", label, provider.base_url);
        let cache_key = MapCache::key(&source, &base_params);
        if !force_refresh {
            if let Some(bytes) = ctx.cache.get(CACHE_NAMESPACE, &cache_key, "img", decodes) {
                return Ok(Fetched {
                    bytes,
                    provider: label.to_string(),
                    url: build_url(&provider.base_url, &base_params)?,
                    params: base_params,
                    content_type: String::new(),
                    cache_hit: true,
                });
            }
        }

        let attempts: Vec<Vec<(String, String)>> = match &provider.auth {
            None => vec![base_params.clone()],
            Some(auth) => {
                let key = env_key(&[auth.env_var.as_str()]).ok_or_else(|| {
                    EngineError::config(format!("missing env {}", auth.env_var))
                })?;
                auth.key_params
                    .iter()
                    .map(|name| {
                        let mut p = base_params.clone();
                        p.push((name.clone(), key.clone()));
                        p
                    })
                    .collect()
            }
        };

        let mut last_err = EngineError::config(format!("{} has no key_params", label));
        for params in attempts {
            let url = build_url(&provider.base_url, &params)?;
            let resp = match ctx.http.get(&url).await {
                Ok(r) => r,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            let sniffed = image::guess_format(&resp.body).is_ok();
            if !resp.is_image() && !(resp.content_type.is_empty() && sniffed) {
                last_err = EngineError::data_quality(format!(
                    "{} returned {} instead of an image: {}",
                    label,
                    if resp.content_type.is_empty() { "no content type" } else { resp.content_type.as_str() },
                    error_hint(&resp.text_lossy())
                ));
                continue;
            }
            if let Err(e) = image::load_from_memory(&resp.body) {
                last_err = EngineError::data_quality(format!("{} image does not decode: {}", label, e));
                continue;
            }
            if let Err(e) = ctx.cache.put(CACHE_NAMESPACE, &cache_key, "img", &resp.body, &source) {
                tracing::warn!(provider = label, error = %e, "cache write failed");
            }
            return Ok(Fetched {
                bytes: resp.body,
                provider: label.to_string(),
                url: redact_text(&url),
                params: public_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
                content_type: resp.content_type,
                cache_hit: false,
            });
        }
        Err(last_err)
    }

    async fn fetch(
        &self,
        layer: &LayerConfig,
        srs: &Crs,
        bbox: &BBox,
        width: u32,
        height: u32,
        force_refresh: bool,
        ctx: &RunContext<'_>,
    ) -> Result<Fetched, EngineError> {
        if layer.providers.is_empty() {
            return Err(EngineError::config("layer has no providers"));
        }
        let mut failures = Vec::new();
        let mut transient = false;
        let mut config_only = true;
        for (i, provider) in layer.providers.iter().enumerate() {
            let label = provider_label(provider, i);
            let params = provider_params(provider, srs, bbox, width, height)?;
            match self.fetch_from(provider, &label, params, force_refresh, ctx).await {
                Ok(f) => return Ok(f),
                Err(e) => {
                    tracing::warn!(provider = %label, error = %e, "map provider failed");
                    transient |= matches!(e, EngineError::TransientSource(_));
                    config_only &= matches!(e, EngineError::Configuration(_));
                    failures.push(format!("{}: {}", label, e.message()));
                }
            }
        }
        let msg = format!("all providers failed ({})", failures.join("; "));
        Err(if config_only {
            EngineError::config(msg)
        } else if transient {
            EngineError::transient(msg)
        } else {
            EngineError::data_quality(msg)
        })
    }
}

fn figure_row(
    request: &Request,
    p: &WmsParams,
    layer: &LayerConfig,
    evidence_id: &str,
    bbox: Option<&BBox>,
    srs: &Crs,
    origin: OriginClass,
) -> Row {
    let mut row = Row::new();
    let figure_id = p
        .figure_id
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| format!("FIG-{}", p.layer_key));
    row.insert("figure_id".into(), json!(figure_id));
    row.insert("layer_key".into(), json!(p.layer_key));
    row.insert("title".into(), json!(layer.title));
    row.insert("evidence_id".into(), json!(evidence_id));
    row.insert("bbox".into(), json!(bbox.map(BBox::to_array)));
    row.insert("srs".into(), json!(srs.code()));
    row.insert("data_origin".into(), json!(origin.as_str()));
    row.insert("source_tag".into(), json!(tag(request, layer)));
    row
}

fn tag<'a>(request: &'a Request, layer: &'a LayerConfig) -> &'a str {
    if request.source_tag.trim().is_empty() && !layer.source_tag.trim().is_empty() {
        &layer.source_tag
    } else {
        request.source_tag_or_default()
    }
}

fn layer_title(p: &WmsParams, layer: &LayerConfig) -> String {
    if layer.title.trim().is_empty() {
        format!("WMS:{}", p.layer_key)
    } else {
        format!("WMS:{} {}", p.layer_key, layer.title)
    }
}

#[async_trait]
impl Connector for WmsConnector {
    fn name(&self) -> &str {
        "WMS"
    }

    fn description(&self) -> &str {
        "Map images from configured WMS/REST providers, cached"
    }

    fn default_target_table(&self) -> &str {
        FIGURES_TABLE
    }

    async fn execute(
        &self,
        request: &Request,
        params: &RequestParams,
        ctx: &RunContext<'_>,
    ) -> Result<ConnectorOutput, EngineError> {
        let RequestParams::Wms(p) = params else {
            return Err(EngineError::invariant("WMS connector got foreign params"));
        };
        let layer = self.layer(&p.layer_key, ctx)?;
        let srs = self.srs(p, layer)?;
        let bbox = resolve_bbox(p, &ctx.site(), ctx.case_root(), &srs)?;
        let fetched = self
            .fetch(layer, &srs, &bbox, p.width, p.height, p.force_refresh, ctx)
            .await?;

        let ev_id = ctx.new_evidence_id(request)?;
        let mut meta = Map::new();
        meta.insert("layer_key".into(), json!(p.layer_key));
        meta.insert("provider".into(), json!(fetched.provider));
        meta.insert("srs".into(), json!(srs.code()));
        meta.insert("bbox".into(), json!(bbox.to_array()));
        meta.insert("width".into(), json!(p.width));
        meta.insert("height".into(), json!(p.height));
        meta.insert("cache_hit".into(), json!(fetched.cache_hit));
        meta.insert("request_url".into(), json!(fetched.url));
        meta.insert(
            "request_params".into(),
            Value::Object(
                fetched
                    .params
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect(),
            ),
        );
        meta.insert("content_type".into(), json!(fetched.content_type));
        let evidence = ctx.recorder.record(ArtifactSpec {
            evidence_id: &ev_id,
            request,
            dir: ArtifactDir::Wms,
            file_name: format!("{}_{}.{}", ev_id, p.layer_key, image_ext(&fetched.bytes)),
            bytes: &fetched.bytes,
            kind: "map_image",
            title: layer_title(p, layer),
            origin: OriginClass::OfficialSource,
            metadata: meta,
        })?;

        let row = figure_row(request, p, layer, &ev_id, Some(&bbox), &srs, OriginClass::OfficialSource);
        let mut warnings = Vec::new();
        if fetched.cache_hit {
            tracing::info!(layer = %p.layer_key, "map served from cache");
        }
        if fetched.provider != provider_label(&layer.providers[0], 0) {
            warnings.push(format!("primary provider failed; used {}", fetched.provider));
        }
        Ok(ConnectorOutput {
            rows: vec![row],
            evidence: vec![evidence],
            warnings,
        })
    }

    async fn degrade(
        &self,
        request: &Request,
        params: &RequestParams,
        ctx: &RunContext<'_>,
        failure: &EngineError,
    ) -> Result<Option<ConnectorOutput>, EngineError> {
        let RequestParams::Wms(p) = params else {
            return Ok(None);
        };
        let Ok(layer) = self.layer(&p.layer_key, ctx) else {
            return Ok(None);
        };
        let srs = self.srs(p, layer).unwrap_or(Crs::WebMercator);
        let bbox = resolve_bbox(p, &ctx.site(), ctx.case_root(), &srs).ok();
        let mut warnings = Vec::new();

        let mut meta = Map::new();
        meta.insert("layer_key".into(), json!(p.layer_key));
        meta.insert("srs".into(), json!(srs.code()));
        meta.insert("bbox".into(), json!(bbox.map(|b| b.to_array())));
        meta.insert("failure".into(), json!(redact_text(failure.message())));

        if let Some(path) = &layer.fallback_file_path {
            let abs = if path.is_absolute() {
                path.clone()
            } else {
                ctx.case_root().join(path)
            };
            match std::fs::read(&abs)
                .map_err(|e| e.to_string())
                .and_then(|b| image::load_from_memory(&b).map_err(|e| e.to_string()))
            {
                Ok(img) => {
                    let png = encode_png(&img)?;
                    let ev_id = ctx.new_evidence_id(request)?;
                    let mut meta = meta.clone();
                    meta.insert("fallback_source".into(), json!(path.display().to_string()));
                    let evidence = ctx.recorder.record(ArtifactSpec {
                        evidence_id: &ev_id,
                        request,
                        dir: ArtifactDir::Wms,
                        file_name: format!("{}_{}{}.png", ev_id, p.layer_key, FALLBACK_MARKER),
                        bytes: &png,
                        kind: "map_image",
                        title: format!("{} (reference image)", layer_title(p, layer)),
                        origin: OriginClass::FallbackPlaceholder,
                        metadata: meta,
                    })?;
                    warnings.push("WMS failed; used fallback_image instead".to_string());
                    let row = figure_row(
                        request,
                        p,
                        layer,
                        &ev_id,
                        bbox.as_ref(),
                        &srs,
                        OriginClass::FallbackPlaceholder,
                    );
                    return Ok(Some(ConnectorOutput {
                        rows: vec![row],
                        evidence: vec![evidence],
                        warnings,
                    }));
                }
                Err(e) => warnings.push(format!(
                    "fallback image {} unusable: {}",
                    path.display(),
                    e
                )),
            }
        }

        let blank = DynamicImage::ImageRgba8(RgbaImage::new(p.width.min(256), p.height.min(256)));
        let png = encode_png(&blank)?;
        let ev_id = ctx.new_evidence_id(request)?;
        let evidence = ctx.recorder.record(ArtifactSpec {
            evidence_id: &ev_id,
            request,
            dir: ArtifactDir::Wms,
            file_name: format!("{}_{}{}.png", ev_id, p.layer_key, PLACEHOLDER_MARKER),
            bytes: &png,
            kind: "map_image",
            title: format!("{} {}", layer_title(p, layer), PLACEHOLDER_MARKER),
            origin: OriginClass::FallbackPlaceholder,
            metadata: meta,
        })?;
        warnings.push("WMS failed; wrote placeholder evidence".to_string());
        let row = figure_row(request, p, layer, &ev_id, bbox.as_ref(), &srs, OriginClass::FallbackPlaceholder);
        Ok(Some(ConnectorOutput {
            rows: vec![row],
            evidence: vec![evidence],
            warnings,
        }))
    }

    async fn verify(&self, request: Option<&Request>, ctx: &RunContext<'_>) -> Result<String, EngineError> {
        let p = match request.map(RequestParams::from_request).transpose()? {
            Some(RequestParams::Wms(p)) => p,
            Some(other) => {
                return Err(EngineError::config(format!(
                    "request is a {} request, not WMS",
                    other.kind()
                )))
            }
            None => {
                let key = ctx
                    .config
                    .layers
                    .keys()
                    .next()
                    .ok_or_else(|| EngineError::config("no [layers] configured"))?;
                WmsParams::new(key.clone())
            }
        };
        let layer = self.layer(&p.layer_key, ctx)?;
        let srs = self.srs(&p, layer)?;
        let bbox = match resolve_bbox(&p, &ctx.site(), ctx.case_root(), &srs) {
            Ok(b) => b,
            // City Hall, Seoul
            Err(_) => point_bbox(Point::new(126.978, 37.5665), 500.0, &srs)?,
        };
        let fetched = self.fetch(layer, &srs, &bbox, 64, 64, true, ctx).await?;
        Ok(format!(
            "layer {} ok via {} ({} bytes)",
            p.layer_key,
            fetched.provider,
            fetched.bytes.len()
        ))
    }
}
