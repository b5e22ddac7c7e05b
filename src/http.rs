//! Shared HTTP client with bounded retries.
//!
//! Every connector goes through [`HttpClient`]. Requests carry the
//! configured timeout and user agent. Rate limits (429), server errors
//! and network failures are retried with exponential backoff; any other
//! non-success status fails immediately. All failures surface as
//! [`EngineError::TransientSource`] with credentials redacted, so the
//! runner may take a connector's degrade path.

use std::time::Duration;

use datareq_harness_core::error::EngineError;
use serde_json::Value;
use url::form_urlencoded;
use url::Url;

use crate::config::HttpConfig;
use crate::sanitize::redact_text;

/// A fully-read response body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_image(&self) -> bool {
        self.content_type
            .to_ascii_lowercase()
            .starts_with("image/")
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct HttpClient {
    client: reqwest::Client,
    max_retries: u32,
    backoff: Duration,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        })
    }

    /// GET a fully-built URL, retrying transient failures.
    pub async fn get(&self, url: &str) -> Result<HttpResponse, EngineError> {
        let shown = redact_text(url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: base, 2x, 4x, ... capped at 32x
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.get(url).send().await;
            match resp {
                Ok(response) => {
                    let status = response.status();
                    let content_type = response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();

                    if status.is_success() {
                        let body = response.bytes().await.map_err(|e| {
                            EngineError::transient(format!(
                                "GET {} body read failed: {}",
                                shown,
                                redact_text(&e.without_url().to_string())
                            ))
                        })?;
                        return Ok(HttpResponse {
                            status: status.as_u16(),
                            content_type,
                            body: body.to_vec(),
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = EngineError::transient(format!(
                        "GET {} returned HTTP {}: {}",
                        shown,
                        status.as_u16(),
                        snippet(&body_text)
                    ));

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::debug!(attempt, status = status.as_u16(), url = %shown, "retrying");
                        last_err = Some(err);
                        continue;
                    }

                    // Client error (not 429): don't retry
                    return Err(err);
                }
                Err(e) => {
                    let e = e.without_url();
                    tracing::debug!(attempt, url = %shown, "request error: {}", e);
                    last_err = Some(EngineError::transient(format!(
                        "GET {} failed: {}",
                        shown,
                        redact_text(&e.to_string())
                    )));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::transient(format!("GET {} failed after retries", shown))))
    }

    /// GET and parse the body as JSON.
    pub async fn get_json(&self, url: &str) -> Result<Value, EngineError> {
        let resp = self.get(url).await?;
        serde_json::from_slice(&resp.body).map_err(|e| {
            EngineError::data_quality(format!(
                "response from {} is not JSON ({}): {}",
                redact_text(url),
                e,
                snippet(&resp.text_lossy())
            ))
        })
    }
}

/// First 200 characters of a body, single-line and redacted.
pub fn snippet(text: &str) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .take(200)
        .collect();
    redact_text(flat.trim())
}

/// `base?k=v&...` with standard form encoding.
pub fn build_url(base: &str, params: &[(String, String)]) -> Result<String, EngineError> {
    let url = Url::parse_with_params(base, params)
        .map_err(|e| EngineError::config(format!("invalid URL '{}': {}", base, e)))?;
    Ok(url.into())
}

/// URL for data.go.kr services.
///
/// Portal keys are issued both raw and pre-encoded. A key that already
/// contains `%` is embedded verbatim; otherwise it is percent-encoded.
/// Any `serviceKey` entry in `params` is ignored.
pub fn build_data_go_kr_url(base: &str, service_key: &str, params: &[(String, String)]) -> String {
    let key = service_key.trim();
    let key = if key.contains('%') {
        key.to_string()
    } else {
        form_urlencoded::byte_serialize(key.as_bytes()).collect::<String>()
    };
    let rest = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(
            params
                .iter()
                .filter(|(k, _)| !k.eq_ignore_ascii_case("servicekey")),
        )
        .finish();
    let sep = if base.contains('?') { '&' } else { '?' };
    if rest.is_empty() {
        format!("{}{}serviceKey={}", base, sep, key)
    } else {
        format!("{}{}serviceKey={}&{}", base, sep, key, rest)
    }
}

/// First non-empty environment variable among `names`.
pub fn env_key(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| std::env::var(n).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(p: &[(&str, &str)]) -> Vec<(String, String)> {
        p.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn raw_service_key_is_encoded() {
        let url = build_data_go_kr_url(
            "http://apis.data.go.kr/svc",
            "ab+c/d==",
            &pairs(&[("pageNo", "1"), ("dataType", "JSON")]),
        );
        assert_eq!(
            url,
            "http://apis.data.go.kr/svc?serviceKey=ab%2Bc%2Fd%3D%3D&pageNo=1&dataType=JSON"
        );
    }

    #[test]
    fn pre_encoded_service_key_is_kept() {
        let url = build_data_go_kr_url(
            "http://apis.data.go.kr/svc",
            "ab%2Bc",
            &pairs(&[("serviceKey", "dup"), ("stnIds", "108")]),
        );
        assert_eq!(url, "http://apis.data.go.kr/svc?serviceKey=ab%2Bc&stnIds=108");
    }

    #[test]
    fn build_url_encodes_params() {
        let url = build_url(
            "https://example.test/wms",
            &pairs(&[("LAYERS", "a b"), ("BBOX", "1,2,3,4")]),
        )
        .unwrap();
        assert_eq!(url, "https://example.test/wms?LAYERS=a+b&BBOX=1%2C2%2C3%2C4");
    }

    #[test]
    fn snippet_is_short_and_redacted() {
        let long = format!("error key=SECRET {}", "x".repeat(500));
        let s = snippet(&long);
        assert!(s.starts_with("error key=***"));
        assert!(s.len() <= 200);
    }
}
