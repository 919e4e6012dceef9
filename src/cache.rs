//! Last-known-good store of rendered markup, keyed by normalized URL

use crate::markup::Markup;
use crate::{RenderError, RenderResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Normalized URL the entry is stored under
    pub url: String,
    pub body: Markup,
    pub status: u16,
    /// Whether the body is the unmodified render (no transforms applied yet)
    pub is_raw: bool,
    pub stored_at: DateTime<Utc>,
    /// Changes on every write to this key
    pub revision: u64,
}

impl CacheEntry {
    /// The entry as a result served to a caller.
    pub fn to_result(&self, served_from_cache: bool) -> Result<RenderResult, RenderError> {
        Ok(RenderResult {
            html: self.body.to_plain()?,
            status: self.status,
            served_from_cache,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
}

pub struct ContentCache {
    entries: DashMap<String, CacheEntry>,
    compress_entries: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    next_revision: AtomicU64,
}

impl ContentCache {
    pub fn new(compress_entries: bool) -> Self {
        Self {
            entries: DashMap::new(),
            compress_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            next_revision: AtomicU64::new(1),
        }
    }

    /// Read the stored entry for `url` without touching it.
    pub fn achieve(&self, url: &str) -> Option<CacheEntry> {
        let key = normalize_url(url);
        match self.entries.get(&key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value().clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `html` for `url`, replacing any previous entry.
    pub fn set(
        &self,
        url: &str,
        html: impl Into<Markup>,
        status: u16,
        is_raw: bool,
    ) -> Result<RenderResult, RenderError> {
        let key = normalize_url(url);
        let entry = self.build_entry(key.clone(), html.into(), status, is_raw)?;
        let result = entry.to_result(false)?;

        self.entries.insert(key.clone(), entry);
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!("Cached {} ({}, raw={})", key, status, is_raw);

        Ok(result)
    }

    /// Store `html` for `url` only if the entry there is still the one
    /// written at `revision`.
    ///
    /// Returns `Ok(None)` and writes nothing when the entry was evicted or
    /// replaced in the meantime.
    pub fn replace_if(
        &self,
        url: &str,
        revision: u64,
        html: impl Into<Markup>,
        status: u16,
        is_raw: bool,
    ) -> Result<Option<RenderResult>, RenderError> {
        let key = normalize_url(url);
        let entry = self.build_entry(key.clone(), html.into(), status, is_raw)?;
        let result = entry.to_result(false)?;

        match self.entries.get_mut(&key) {
            Some(mut current) if current.revision == revision => {
                *current = entry;
                self.writes.fetch_add(1, Ordering::Relaxed);
                debug!("Replaced {} ({}, raw={})", key, status, is_raw);
                Ok(Some(result))
            }
            _ => {
                debug!("Entry for {} changed since revision {}, not replacing", key, revision);
                Ok(None)
            }
        }
    }

    fn build_entry(
        &self,
        key: String,
        html: Markup,
        status: u16,
        is_raw: bool,
    ) -> Result<CacheEntry, RenderError> {
        let body = match html {
            Markup::Plain(text) if self.compress_entries => Markup::compress(&text)?,
            Markup::Compressed(bytes) if !self.compress_entries => {
                Markup::Plain(Markup::Compressed(bytes).into_plain()?)
            }
            body => body,
        };

        Ok(CacheEntry {
            url: key,
            body,
            status,
            is_raw,
            stored_at: Utc::now(),
            revision: self.next_revision.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn remove(&self, url: &str) -> Option<CacheEntry> {
        let key = normalize_url(url);
        let removed = self.entries.remove(&key).map(|(_, entry)| entry);
        if removed.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted {}", key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn get_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Canonical cache key for a URL
///
/// Scheme and host are lower-cased, the fragment and default port dropped,
/// query pairs sorted and a trailing slash trimmed from non-root paths.
/// Strings that do not parse as URLs are used as-is.
pub fn normalize_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url.trim()) else {
        return url.to_string();
    };

    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        pairs.sort();
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_achieve() {
        let cache = ContentCache::new(true);
        let result = cache
            .set("https://shop.test/p/1", "<html>one</html>", 200, true)
            .unwrap();

        assert_eq!(result.html, "<html>one</html>");
        assert_eq!(result.status, 200);
        assert!(!result.served_from_cache);

        let entry = cache.achieve("https://shop.test/p/1").unwrap();
        assert!(entry.body.is_compressed());
        assert!(entry.is_raw);
        assert_eq!(entry.to_result(true).unwrap().html, "<html>one</html>");
    }

    #[test]
    fn test_uncompressed_store() {
        let cache = ContentCache::new(false);
        let packed = Markup::compress("<p>x</p>").unwrap();
        cache.set("https://shop.test/", packed, 302, false).unwrap();
        let entry = cache.achieve("https://shop.test/").unwrap();
        assert_eq!(entry.body, Markup::Plain("<p>x</p>".to_string()));
        assert_eq!(entry.status, 302);
    }

    #[test]
    fn test_set_overwrites() {
        let cache = ContentCache::new(true);
        cache.set("https://shop.test/a", "old", 200, true).unwrap();
        cache.set("https://shop.test/a", "new", 200, false).unwrap();

        assert_eq!(cache.len(), 1);
        let entry = cache.achieve("https://shop.test/a").unwrap();
        assert_eq!(entry.body.to_plain().unwrap(), "new");
        assert!(!entry.is_raw);
    }

    #[test]
    fn test_achieve_does_not_mutate() {
        let cache = ContentCache::new(true);
        assert!(cache.achieve("https://shop.test/missing").is_none());
        cache.set("https://shop.test/a", "x", 200, true).unwrap();
        let before = cache.achieve("https://shop.test/a").unwrap();
        let after = cache.achieve("https://shop.test/a").unwrap();
        assert_eq!(before.stored_at, after.stored_at);
        assert_eq!(cache.len(), 1);

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
    }

    #[test]
    fn test_replace_if_current_revision() {
        let cache = ContentCache::new(true);
        cache.set("https://shop.test/a", "<p>raw</p>", 200, true).unwrap();
        let read = cache.achieve("https://shop.test/a").unwrap();

        let replaced = cache
            .replace_if("https://shop.test/a", read.revision, "<p>slim</p>", 200, false)
            .unwrap();

        assert_eq!(replaced.unwrap().html, "<p>slim</p>");
        let entry = cache.achieve("https://shop.test/a").unwrap();
        assert!(!entry.is_raw);
        assert_ne!(entry.revision, read.revision);
        assert_eq!(cache.get_stats().writes, 2);
    }

    #[test]
    fn test_replace_if_never_restores_an_evicted_entry() {
        let cache = ContentCache::new(true);
        cache.set("https://shop.test/a", "<p>raw</p>", 200, true).unwrap();
        let read = cache.achieve("https://shop.test/a").unwrap();
        cache.remove("https://shop.test/a");

        let replaced = cache
            .replace_if("https://shop.test/a", read.revision, "<p>slim</p>", 200, false)
            .unwrap();

        assert!(replaced.is_none());
        assert!(cache.achieve("https://shop.test/a").is_none());
        assert_eq!(cache.get_stats().writes, 1);
    }

    #[test]
    fn test_replace_if_keeps_a_newer_write() {
        let cache = ContentCache::new(false);
        cache.set("https://shop.test/a", "<p>first</p>", 200, true).unwrap();
        let read = cache.achieve("https://shop.test/a").unwrap();
        cache.set("https://shop.test/a", "<p>second</p>", 302, true).unwrap();

        let replaced = cache
            .replace_if("https://shop.test/a", read.revision, "<p>first, slim</p>", 200, false)
            .unwrap();

        assert!(replaced.is_none());
        let entry = cache.achieve("https://shop.test/a").unwrap();
        assert_eq!(entry.body.to_plain().unwrap(), "<p>second</p>");
        assert_eq!(entry.status, 302);
        assert!(entry.is_raw);
    }

    #[test]
    fn test_remove() {
        let cache = ContentCache::new(true);
        cache.set("https://shop.test/a", "x", 200, true).unwrap();
        assert!(cache.remove("https://shop.test/a/").is_some());
        assert!(cache.remove("https://shop.test/a").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.get_stats().evictions, 1);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("HTTPS://Shop.Test:443/Path/?b=2&a=1#top"),
            "https://shop.test/Path?a=1&b=2"
        );
        assert_eq!(normalize_url("https://shop.test"), "https://shop.test/");
        assert_eq!(normalize_url("https://shop.test/?"), "https://shop.test/");
        assert_eq!(normalize_url("http://shop.test:8080/x"), "http://shop.test:8080/x");
        assert_eq!(normalize_url("not a url"), "not a url");
    }

    #[test]
    fn test_equivalent_urls_share_an_entry() {
        let cache = ContentCache::new(false);
        cache.set("https://shop.test/p?b=2&a=1", "x", 200, true).unwrap();
        assert!(cache.achieve("https://SHOP.test/p?a=1&b=2#reviews").is_some());
    }
}
