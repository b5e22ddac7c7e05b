//! Read-through, content-addressed file cache for map images.
//!
//! Entries live at `{dir}/{namespace}/{key}.{ext}` next to a JSON sidecar
//! recording when and from where they were fetched. A read is a hit only
//! when the entry is younger than the TTL and passes the caller's
//! validator; anything else is removed so the next write starts clean.
//! Writes go to a temp file and are renamed into place.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::sanitize::is_sensitive;

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    created_at: DateTime<Utc>,
    source: String,
}

pub struct MapCache {
    dir: PathBuf,
    ttl: Duration,
    enabled: bool,
}

impl MapCache {
    pub fn new(dir: impl Into<PathBuf>, ttl_days: u32, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            ttl: Duration::days(i64::from(ttl_days)),
            enabled,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cache_dir(), config.cache.ttl_days, config.cache.enabled)
    }

    /// SHA-256 over the source identity and sorted, non-secret params.
    pub fn key(source: &str, params: &[(String, String)]) -> String {
        let mut pairs: Vec<&(String, String)> =
            params.iter().filter(|(k, _)| !is_sensitive(k)).collect();
        pairs.sort();
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        for (k, v) in pairs {
            hasher.update(b"\n");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn entry_path(&self, namespace: &str, key: &str, ext: &str) -> PathBuf {
        self.dir.join(namespace).join(format!("{}.{}", key, ext))
    }

    fn sidecar_path(entry: &Path) -> PathBuf {
        let mut name = entry.file_name().unwrap_or_default().to_os_string();
        name.push(".meta.json");
        entry.with_file_name(name)
    }

    /// Cached bytes, or `None` on miss, expiry, or validator failure.
    pub fn get<F>(&self, namespace: &str, key: &str, ext: &str, validate: F) -> Option<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool,
    {
        if !self.enabled {
            return None;
        }
        let path = self.entry_path(namespace, key, ext);
        let bytes = std::fs::read(&path).ok()?;

        let fresh = std::fs::read_to_string(Self::sidecar_path(&path))
            .ok()
            .and_then(|s| serde_json::from_str::<Sidecar>(&s).ok())
            .map(|meta| Utc::now() - meta.created_at < self.ttl)
            .unwrap_or(false);

        if fresh && !bytes.is_empty() && validate(&bytes) {
            tracing::debug!(namespace, key, "cache hit");
            return Some(bytes);
        }

        tracing::debug!(namespace, key, fresh, "cache entry discarded");
        self.remove(&path);
        None
    }

    pub fn put(
        &self,
        namespace: &str,
        key: &str,
        ext: &str,
        bytes: &[u8],
        source: &str,
    ) -> std::io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.entry_path(namespace, key, ext);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&path, bytes)?;
        let meta = Sidecar {
            created_at: Utc::now(),
            source: source.to_string(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta)?;
        write_atomic(&Self::sidecar_path(&path), &meta_json)
    }

    fn remove(&self, path: &Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(Self::sidecar_path(path));
    }
}

/// Write to `{path}.tmp`, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pairs(p: &[(&str, &str)]) -> Vec<(String, String)> {
        p.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn key_ignores_order_and_secrets() {
        let a = MapCache::key("wms:x", &pairs(&[("a", "1"), ("b", "2"), ("apikey", "K1")]));
        let b = MapCache::key("wms:x", &pairs(&[("b", "2"), ("a", "1"), ("apikey", "K2")]));
        let c = MapCache::key("wms:y", &pairs(&[("a", "1"), ("b", "2")]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn put_then_get_hits() {
        let tmp = TempDir::new().unwrap();
        let cache = MapCache::new(tmp.path(), 30, true);
        cache.put("wms", "k1", "png", b"payload", "test").unwrap();
        assert_eq!(cache.get("wms", "k1", "png", |_| true), Some(b"payload".to_vec()));
        assert!(tmp.path().join("wms/k1.png.meta.json").exists());
    }

    #[test]
    fn invalid_entry_is_removed() {
        let tmp = TempDir::new().unwrap();
        let cache = MapCache::new(tmp.path(), 30, true);
        cache.put("wms", "k1", "png", b"not an image", "test").unwrap();
        assert_eq!(cache.get("wms", "k1", "png", |_| false), None);
        assert!(!tmp.path().join("wms/k1.png").exists());
    }

    #[test]
    fn expired_entry_misses() {
        let tmp = TempDir::new().unwrap();
        let cache = MapCache::new(tmp.path(), 0, true);
        cache.put("wms", "k1", "png", b"payload", "test").unwrap();
        assert_eq!(cache.get("wms", "k1", "png", |_| true), None);
    }

    #[test]
    fn disabled_cache_never_stores() {
        let tmp = TempDir::new().unwrap();
        let cache = MapCache::new(tmp.path(), 30, false);
        cache.put("wms", "k1", "png", b"payload", "test").unwrap();
        assert!(!tmp.path().join("wms").exists());
    }
}
