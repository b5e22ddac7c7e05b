//! Secret redaction for anything that leaves a connector.
//!
//! Request URLs, error messages and response snippets routinely carry API
//! keys as query parameters. [`redact_text`] masks them before a string
//! reaches a warning, a log line or a report. [`strip_secrets`] removes the
//! same keys from parameter maps written into evidence metadata.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Parameter names treated as credentials (compared case-insensitively).
pub const SENSITIVE_KEYS: [&str; 8] = [
    "servicekey",
    "apikey",
    "api_key",
    "key",
    "token",
    "access_token",
    "authorization",
    "secret",
];

static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(servicekey|apikey|api_key|access_token|token|authorization|secret|key)=([^&\s"'<>]+)"#,
    )
    .unwrap()
});
static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9._~+/=-]+").unwrap());

pub fn is_sensitive(name: &str) -> bool {
    let lower = name.trim().to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lower.as_str())
}

/// Mask `name=value` credentials and bearer tokens.
pub fn redact_text(text: &str) -> String {
    let masked = PARAM_RE.replace_all(text, "$1=***");
    BEARER_RE.replace_all(&masked, "$1 ***").into_owned()
}

/// Drop credential keys from a parameter map, recursively.
pub fn strip_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if !is_sensitive(k) {
                    out.insert(k.clone(), strip_secrets(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_secrets).collect()),
        Value::String(s) => Value::String(redact_text(s)),
        other => other.clone(),
    }
}

/// Parameter pairs with credentials removed, for metadata and cache keys.
pub fn public_pairs<I, K, V>(pairs: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    pairs
        .into_iter()
        .filter(|(k, _)| !is_sensitive(k.as_ref()))
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect()
}
