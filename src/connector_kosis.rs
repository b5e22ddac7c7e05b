//! KOSIS statistical series connector.
//!
//! Each configured dataset is a query template plus mappings from KOSIS
//! items to output columns. Template values may reference
//! `{admin_code}`, `{admin_name}`, `{start_year}`, `{end_year}` and
//! `{year}`. A multi-valued `itmId` (`T10+T20`) is fanned out into one
//! call per item. Output is one wide row per year.
//!
//! Credentials: `KOSIS_API_KEY`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Datelike;
use datareq_harness_core::error::EngineError;
use datareq_harness_core::models::{OriginClass, Request, Row};
use datareq_harness_core::params::{KosisParams, RequestParams};
use serde_json::{json, Map, Value};

use crate::config::{KosisDataset, KosisMapping};
use crate::evidence::{pretty_json, ArtifactDir, ArtifactSpec};
use crate::http::build_url;
use crate::traits::{require_key, Connector, ConnectorOutput, RunContext};

pub const KOSIS_KEY_ENV: [&str; 1] = ["KOSIS_API_KEY"];
pub const SOCIO_TABLE: &str = "ENV_BASE_SOCIO";

pub struct KosisConnector;

/// Template variables for one call.
#[derive(Debug, Clone)]
pub struct QueryVars {
    pub admin_code: String,
    pub admin_name: String,
    pub start_year: String,
    pub end_year: String,
}

fn is_placeholder_value(v: &str) -> bool {
    let t = v.trim();
    t.is_empty() || t.eq_ignore_ascii_case("TBD") || t.eq_ignore_ascii_case("TODO")
}

/// Substitute template variables into every query value.
pub fn render_query(
    template: &BTreeMap<String, String>,
    vars: &QueryVars,
) -> Result<Vec<(String, String)>, EngineError> {
    let mut out = Vec::with_capacity(template.len());
    for (k, v) in template {
        let rendered = v
            .replace("{admin_code}", &vars.admin_code)
            .replace("{admin_name}", &vars.admin_name)
            .replace("{start_year}", &vars.start_year)
            .replace("{end_year}", &vars.end_year)
            .replace("{year}", &vars.end_year);
        if is_placeholder_value(&rendered) {
            return Err(EngineError::config(format!(
                "KOSIS query param {} is unset ('{}')",
                k, v
            )));
        }
        out.push((k.clone(), rendered));
    }
    Ok(out)
}

/// Split a multi-valued `itmId` into one query per item.
pub fn fan_out(query: Vec<(String, String)>) -> Vec<Vec<(String, String)>> {
    let items: Vec<String> = query
        .iter()
        .find(|(k, _)| k == "itmId")
        .map(|(_, v)| {
            v.split(['+', ',', ';'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if items.len() <= 1 {
        return vec![query];
    }
    items
        .into_iter()
        .map(|item| {
            query
                .iter()
                .map(|(k, v)| {
                    if k == "itmId" {
                        (k.clone(), item.clone())
                    } else {
                        (k.clone(), v.clone())
                    }
                })
                .collect()
        })
        .collect()
}

/// Numeric `DT` cell; thousands separators are stripped.
pub fn parse_dt(v: Option<&Value>) -> Option<Value> {
    match v? {
        Value::Number(n) => Some(Value::Number(n.clone())),
        Value::String(s) => {
            let t = s.trim().replace(',', "");
            if let Ok(i) = t.parse::<i64>() {
                Some(json!(i))
            } else {
                t.parse::<f64>().ok().map(|f| json!(f))
            }
        }
        _ => None,
    }
}

fn text(item: &Value, key: &str) -> String {
    match item.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn mapping_matches(m: &KosisMapping, item: &Value) -> bool {
    if let Some(id) = m.match_itm_id.as_deref().filter(|s| !s.trim().is_empty()) {
        if text(item, "ITM_ID") == id.trim() {
            return true;
        }
    }
    if let Some(part) = m.match_itm_nm_contains.as_deref().filter(|s| !s.trim().is_empty()) {
        if text(item, "ITM_NM").contains(part.trim()) {
            return true;
        }
    }
    false
}

/// Wide rows keyed by year: `year -> {output_col: value}`.
pub fn pivot_by_year(items: &[Value], mappings: &[KosisMapping]) -> BTreeMap<String, Map<String, Value>> {
    let mut by_year: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for item in items {
        let period = text(item, "PRD_DE");
        if period.len() < 4 {
            continue;
        }
        let year = period[..4].to_string();
        let Some(value) = parse_dt(item.get("DT")) else {
            continue;
        };
        for m in mappings.iter().filter(|m| mapping_matches(m, item)) {
            by_year
                .entry(year.clone())
                .or_default()
                .insert(m.output_col.clone(), value.clone());
        }
    }
    by_year
}

impl KosisConnector {
    fn dataset<'a>(&self, p: &KosisParams, ctx: &'a RunContext<'_>) -> Result<&'a KosisDataset, EngineError> {
        ctx.config
            .kosis
            .datasets
            .get(p.dataset_key.trim())
            .ok_or_else(|| {
                EngineError::config(format!(
                    "KOSIS dataset '{}' is not configured under [kosis.datasets]",
                    p.dataset_key
                ))
            })
    }
}

#[async_trait]
impl Connector for KosisConnector {
    fn name(&self) -> &str {
        "KOSIS"
    }

    fn description(&self) -> &str {
        "KOSIS statistical series pivoted to one row per year"
    }

    fn default_target_table(&self) -> &str {
        SOCIO_TABLE
    }

    fn credential_env(&self) -> &[&'static str] {
        &KOSIS_KEY_ENV
    }

    async fn execute(
        &self,
        request: &Request,
        params: &RequestParams,
        ctx: &RunContext<'_>,
    ) -> Result<ConnectorOutput, EngineError> {
        let RequestParams::Kosis(p) = params else {
            return Err(EngineError::invariant("KOSIS connector got foreign params"));
        };
        let dataset = self.dataset(p, ctx)?;
        let key = require_key(&KOSIS_KEY_ENV)?;
        let site = ctx.site();
        let admin_code = p
            .admin_code
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or(site.admin_code.clone())
            .ok_or_else(|| EngineError::config("KOSIS needs admin_code (params or LOCATION)"))?;
        let end_year = p
            .end_year
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| (ctx.now.year() - 1).to_string());
        let start_year = match p.start_year.clone().filter(|s| !s.trim().is_empty()) {
            Some(s) => s,
            None => end_year
                .parse::<i32>()
                .map(|y| (y - 4).to_string())
                .map_err(|_| EngineError::config(format!("bad end_year '{}'", end_year)))?,
        };
        let vars = QueryVars {
            admin_code: admin_code.clone(),
            admin_name: site.admin_name.clone().unwrap_or_default(),
            start_year: start_year.clone(),
            end_year: end_year.clone(),
        };

        let query = render_query(&dataset.query_params, &vars)?;
        let base = dataset
            .endpoint_url
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| ctx.config.endpoints.kosis.clone());

        let mut items: Vec<Value> = Vec::new();
        let mut urls = Vec::new();
        for q in fan_out(query) {
            let mut all = vec![
                ("method".to_string(), "getList".to_string()),
                ("apiKey".to_string(), key.clone()),
                ("format".to_string(), "json".to_string()),
                ("jsonVD".to_string(), "Y".to_string()),
            ];
            all.extend(q);
            let url = build_url(&base, &all)?;
            let body = ctx.http.get_json(&url).await?;
            match body {
                Value::Array(list) => items.extend(list),
                Value::Object(err) => {
                    let msg = err
                        .get("errMsg")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unexpected object response");
                    let code = err.get("err").map(|c| c.to_string()).unwrap_or_default();
                    return Err(EngineError::data_quality(format!(
                        "KOSIS error {}: {}",
                        code, msg
                    )));
                }
                other => {
                    return Err(EngineError::data_quality(format!(
                        "KOSIS returned {} instead of a list",
                        other
                    )))
                }
            }
            urls.push(url);
        }

        let by_year = pivot_by_year(&items, &dataset.mappings);
        if by_year.is_empty() {
            return Err(EngineError::data_quality(format!(
                "KOSIS dataset {} matched no items for {}",
                p.dataset_key, admin_code
            )));
        }

        let ev_id = ctx.new_evidence_id(request)?;
        let payload = json!({
            "dataset_key": p.dataset_key,
            "admin_code": admin_code,
            "start_year": start_year,
            "end_year": end_year,
            "items": items,
        });
        let mut meta = Map::new();
        meta.insert("dataset_key".into(), json!(p.dataset_key));
        meta.insert("admin_code".into(), json!(admin_code));
        meta.insert("request_urls".into(), json!(urls));
        let evidence = ctx.recorder.record(ArtifactSpec {
            evidence_id: &ev_id,
            request,
            dir: ArtifactDir::Api,
            file_name: format!("{}_kosis_{}.json", ev_id, p.dataset_key),
            bytes: &pretty_json(&payload),
            kind: "api_response",
            title: format!("KOSIS:{}", p.dataset_key),
            origin: OriginClass::OfficialSource,
            metadata: meta,
        })?;

        let mut warnings = Vec::new();
        let rows = by_year
            .into_iter()
            .map(|(year, cols)| {
                for m in &dataset.mappings {
                    if !cols.contains_key(&m.output_col) {
                        warnings.push(format!("{} has no value for {}", year, m.output_col));
                    }
                }
                let mut row = Row::new();
                row.insert("socio_id".into(), json!(format!("SOC-{}", year)));
                row.insert("admin_code".into(), json!(admin_code));
                row.insert("admin_name".into(), json!(vars.admin_name));
                row.insert("year".into(), json!(year));
                for (k, v) in cols {
                    row.insert(k, v);
                }
                row.insert("data_origin".into(), json!(OriginClass::OfficialSource.as_str()));
                row.insert("source_tag".into(), json!(request.source_tag_or_default()));
                row.insert("evidence_id".into(), json!(ev_id));
                row
            })
            .collect();

        Ok(ConnectorOutput {
            rows,
            evidence: vec![evidence],
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> QueryVars {
        QueryVars {
            admin_code: "11140".into(),
            admin_name: "Jung-gu".into(),
            start_year: "2020".into(),
            end_year: "2024".into(),
        }
    }

    fn template(p: &[(&str, &str)]) -> BTreeMap<String, String> {
        p.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn templates_are_rendered() {
        let q = render_query(
            &template(&[("objL1", "{admin_code}"), ("startPrdDe", "{start_year}"), ("endPrdDe", "{year}")]),
            &vars(),
        )
        .unwrap();
        assert!(q.contains(&("objL1".to_string(), "11140".to_string())));
        assert!(q.contains(&("endPrdDe".to_string(), "2024".to_string())));
    }

    #[test]
    fn placeholder_values_are_rejected() {
        let err = render_query(&template(&[("tblId", "TBD")]), &vars()).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn multi_valued_item_ids_fan_out() {
        let q = vec![
            ("itmId".to_string(), "T100+T200+".to_string()),
            ("orgId".to_string(), "101".to_string()),
        ];
        let calls = fan_out(q);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1][0], ("itmId".to_string(), "T200".to_string()));
        assert_eq!(calls[1][1], ("orgId".to_string(), "101".to_string()));
    }

    #[test]
    fn items_pivot_into_year_rows() {
        let items = vec![
            json!({"PRD_DE": "2023", "ITM_ID": "T100", "ITM_NM": "Population", "DT": "1,234"}),
            json!({"PRD_DE": "2023", "ITM_ID": "T200", "ITM_NM": "Households", "DT": "500"}),
            json!({"PRD_DE": "2024", "ITM_ID": "T100", "ITM_NM": "Population", "DT": "1,300"}),
            json!({"PRD_DE": "2024", "ITM_ID": "T999", "ITM_NM": "Other", "DT": "1"}),
        ];
        let mappings = vec![
            KosisMapping { output_col: "population".into(), match_itm_id: Some("T100".into()), match_itm_nm_contains: None },
            KosisMapping { output_col: "households".into(), match_itm_id: None, match_itm_nm_contains: Some("House".into()) },
        ];
        let rows = pivot_by_year(&items, &mappings);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows["2023"]["population"], json!(1234));
        assert_eq!(rows["2023"]["households"], json!(500));
        assert!(!rows["2024"].contains_key("households"));
    }
}
