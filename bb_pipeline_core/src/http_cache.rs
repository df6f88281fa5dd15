// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # HTTP response cache (C5)
//!
//! Fingerprinted by the exact request URL (spec.md §4.5), with
//! conditional-request validation, TTL accounting, stale-while-revalidate,
//! LRU eviction by `last_accessed`, and optional deflate compression via
//! `flate2`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{Duration, SystemTime};

use bb_pipeline_domain::services::CachePort;
use bb_pipeline_domain::value_objects::CacheEntry;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Store,
    Hit,
    Miss,
    StaleHit,
    ExpiredMiss,
    Validated,
    Removed,
    Evicted,
    Cleanup,
    Cleared,
}

pub type EventCallback = Box<dyn Fn(CacheEvent, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub max_entries: usize,
    pub compression_enabled: bool,
    pub stale_while_revalidate: bool,
    pub stale_max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            min_ttl: Duration::from_secs(1),
            max_ttl: Duration::from_secs(24 * 3600),
            max_entries: 10_000,
            compression_enabled: false,
            stale_while_revalidate: false,
            stale_max_age: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub validations: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.requests as f64
        }
    }
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    stats: CacheStats,
    config: CacheConfig,
    on_event: Option<EventCallback>,
}

/// C5. A single lock protects the entry map; event callbacks fire inside
/// it, so callbacks must never re-enter the cache (spec.md §4.5).
pub struct HttpCache {
    inner: Mutex<Inner>,
}

impl HttpCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
                config,
                on_event: None,
            }),
        }
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        self.inner.lock().on_event = Some(callback);
    }

    fn emit(inner: &Inner, event: CacheEvent, url: &str) {
        if let Some(callback) = &inner.on_event {
            callback(event, url);
        }
    }

    /// Parses `cache-control: max-age=N` case-insensitively; `Expires` is
    /// an unsupported placeholder that falls through to the default TTL
    /// (spec.md §9 Open Questions, resolved conservatively).
    fn resolve_ttl(config: &CacheConfig, headers: &HashMap<String, String>) -> Duration {
        let max_age = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("cache-control"))
            .and_then(|(_, v)| parse_max_age(v));
        let ttl = max_age.map(Duration::from_secs).unwrap_or(config.default_ttl);
        ttl.clamp(config.min_ttl, config.max_ttl)
    }

    fn header_ci<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
        headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn store(&self, url: &str, body: Vec<u8>, headers: HashMap<String, String>) {
        let mut inner = self.inner.lock();
        let ttl = Self::resolve_ttl(&inner.config, &headers);
        let etag = Self::header_ci(&headers, "etag").map(str::to_string);
        let last_modified = Self::header_ci(&headers, "last-modified").map(str::to_string);

        if inner.entries.len() >= inner.config.max_entries && !inner.entries.contains_key(url) {
            if let Some(oldest_url) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(url, _)| url.clone())
            {
                inner.entries.remove(&oldest_url);
                inner.stats.evictions += 1;
                Self::emit(&inner, CacheEvent::Evicted, &oldest_url);
            }
        }

        let (stored_body, compressed) = if inner.config.compression_enabled {
            (deflate(&body), true)
        } else {
            (body, false)
        };

        let entry = CacheEntry::new(stored_body, compressed, headers, etag, last_modified, SystemTime::now(), ttl);
        inner.entries.insert(url.to_string(), entry);
        Self::emit(&inner, CacheEvent::Store, url);
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        let now = SystemTime::now();
        let mut inner = self.inner.lock();
        inner.stats.requests += 1;

        let stale_deadline = inner
            .entries
            .get(url)
            .map(|e| e.expires_at + inner.config.stale_max_age);
        let is_expired = inner.entries.get(url).map_or(false, |e| e.is_expired(now));
        let stale_enabled = inner.config.stale_while_revalidate;

        let Some(entry) = inner.entries.get_mut(url) else {
            inner.stats.misses += 1;
            Self::emit(&inner, CacheEvent::Miss, url);
            return None;
        };

        if is_expired {
            if !stale_enabled {
                inner.entries.remove(url);
                inner.stats.misses += 1;
                Self::emit(&inner, CacheEvent::ExpiredMiss, url);
                return None;
            }
            if now < stale_deadline.unwrap() {
                let entry = inner.entries.get_mut(url).unwrap();
                entry.stale = true;
                entry.access_count += 1;
                entry.last_accessed = now;
                let body = decompress_if_needed(entry);
                inner.stats.hits += 1;
                Self::emit(&inner, CacheEvent::StaleHit, url);
                return Some(body);
            }
            inner.entries.remove(url);
            inner.stats.misses += 1;
            Self::emit(&inner, CacheEvent::ExpiredMiss, url);
            return None;
        }

        entry.access_count += 1;
        entry.last_accessed = now;
        let body = decompress_if_needed(entry);
        inner.stats.hits += 1;
        Self::emit(&inner, CacheEvent::Hit, url);
        Some(body)
    }

    /// Compares entity tags, then last-modified, then falls back to
    /// expiry (spec.md §4.5 `validate`).
    pub fn validate(&self, url: &str, response_headers: &HashMap<String, String>) -> Validation {
        let inner = self.inner.lock();
        let Some(entry) = inner.entries.get(url) else {
            return Validation::Modified;
        };
        let response_etag = Self::header_ci(response_headers, "etag");
        if let (Some(stored), Some(incoming)) = (entry.etag.as_deref(), response_etag) {
            return if stored == incoming { Validation::Fresh } else { Validation::Modified };
        }
        let response_last_modified = Self::header_ci(response_headers, "last-modified");
        if let (Some(stored), Some(incoming)) = (entry.last_modified.as_deref(), response_last_modified) {
            return if stored == incoming { Validation::Fresh } else { Validation::Modified };
        }
        if entry.is_expired(SystemTime::now()) {
            Validation::Stale
        } else {
            Validation::Fresh
        }
    }

    pub fn conditional_headers(&self, url: &str) -> HashMap<String, String> {
        let inner = self.inner.lock();
        let mut headers = HashMap::new();
        if let Some(entry) = inner.entries.get(url) {
            if let Some(etag) = &entry.etag {
                headers.insert("If-None-Match".to_string(), etag.clone());
            }
            if let Some(last_modified) = &entry.last_modified {
                headers.insert("If-Modified-Since".to_string(), last_modified.clone());
            }
        }
        headers
    }

    pub fn update_after_validation(&self, url: &str, headers: &HashMap<String, String>) {
        let mut inner = self.inner.lock();
        let ttl = Self::resolve_ttl(&inner.config, headers);
        if let Some(entry) = inner.entries.get_mut(url) {
            entry.etag = Self::header_ci(headers, "etag").map(str::to_string);
            entry.last_modified = Self::header_ci(headers, "last-modified").map(str::to_string);
            entry.expires_at = SystemTime::now() + ttl;
            entry.stale = false;
        }
        inner.stats.validations += 1;
        Self::emit(&inner, CacheEvent::Validated, url);
    }

    pub fn remove(&self, url: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(url).is_some();
        if removed {
            Self::emit(&inner, CacheEvent::Removed, url);
        }
        removed
    }

    /// Drops every entry that is expired and (stale-while-revalidate
    /// disabled, or past the stale deadline). Returns the removal count.
    pub fn cleanup(&self) -> usize {
        let now = SystemTime::now();
        let mut inner = self.inner.lock();
        let stale_max_age = inner.config.stale_while_revalidate.then_some(inner.config.stale_max_age);
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| {
                if !entry.is_expired(now) {
                    return false;
                }
                match stale_max_age {
                    Some(max_age) => now >= entry.expires_at + max_age,
                    None => true,
                }
            })
            .map(|(url, _)| url.clone())
            .collect();
        for url in &expired {
            inner.entries.remove(url);
        }
        let count = expired.len();
        if count > 0 {
            Self::emit(&inner, CacheEvent::Cleanup, "");
        }
        count
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        Self::emit(&inner, CacheEvent::Cleared, "");
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_footprint(&self) -> usize {
        let inner = self.inner.lock();
        inner.entries.iter().map(|(url, entry)| entry.memory_footprint(url.len())).sum()
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats = CacheStats::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Fresh,
    Modified,
    Stale,
}

fn parse_max_age(cache_control: &str) -> Option<u64> {
    cache_control.to_ascii_lowercase().split(',').find_map(|directive| {
        let directive = directive.trim();
        directive.strip_prefix("max-age=").and_then(|v| v.parse::<u64>().ok())
    })
}

fn deflate(body: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    let _ = encoder.write_all(body);
    encoder.finish().unwrap_or_default()
}

fn decompress_if_needed(entry: &CacheEntry) -> Vec<u8> {
    if !entry.compressed {
        return entry.body.clone();
    }
    let mut decoder = DeflateDecoder::new(entry.body.as_slice());
    let mut out = Vec::new();
    let _ = decoder.read_to_end(&mut out);
    out
}

#[async_trait::async_trait]
impl CachePort for HttpCache {
    async fn get(&self, url: &str) -> Option<Vec<u8>> {
        HttpCache::get(self, url)
    }

    async fn put(&self, url: &str, body: Vec<u8>, headers: HashMap<String, String>) {
        HttpCache::store(self, url, body, headers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn round_trip_through_store_and_get_preserves_bytes() {
        let cache = HttpCache::new(CacheConfig::default());
        cache.store("https://example.com/x", b"payload".to_vec(), headers(&[]));
        assert_eq!(cache.get("https://example.com/x"), Some(b"payload".to_vec()));
    }

    #[test]
    fn round_trip_through_compression_preserves_bytes() {
        let cache = HttpCache::new(CacheConfig {
            compression_enabled: true,
            ..Default::default()
        });
        cache.store("https://example.com/x", b"payload payload payload".to_vec(), headers(&[]));
        assert_eq!(cache.get("https://example.com/x"), Some(b"payload payload payload".to_vec()));
    }

    #[test]
    fn s3_entity_tag_revalidation() {
        let cache = HttpCache::new(CacheConfig::default());
        cache.store(
            "https://example.com/x",
            b"body".to_vec(),
            headers(&[("etag", "v1"), ("cache-control", "max-age=60")]),
        );
        let conditional = cache.conditional_headers("https://example.com/x");
        assert_eq!(conditional.get("If-None-Match").map(String::as_str), Some("v1"));
        assert_eq!(cache.validate("https://example.com/x", &headers(&[("etag", "v1")])), Validation::Fresh);
        assert_eq!(cache.validate("https://example.com/x", &headers(&[("etag", "v2")])), Validation::Modified);
    }

    #[test]
    fn s4_stale_while_revalidate() {
        let cache = HttpCache::new(CacheConfig {
            default_ttl: Duration::from_millis(40),
            min_ttl: Duration::from_millis(1),
            stale_while_revalidate: true,
            stale_max_age: Duration::from_millis(80),
            ..Default::default()
        });
        cache.store("https://example.com/x", b"body".to_vec(), headers(&[]));

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get("https://example.com/x"), Some(b"body".to_vec()));
        assert!(cache.inner.lock().entries.get("https://example.com/x").unwrap().stale);

        std::thread::sleep(Duration::from_millis(90));
        assert_eq!(cache.get("https://example.com/x"), None);
    }

    #[test]
    fn ttl_is_clamped_into_configured_bounds() {
        let config = CacheConfig {
            min_ttl: Duration::from_secs(10),
            max_ttl: Duration::from_secs(20),
            ..Default::default()
        };
        let cache = HttpCache::new(config.clone());
        cache.store("https://example.com/x", b"b".to_vec(), headers(&[("cache-control", "max-age=1")]));
        let ttl = stored_ttl(&cache, "https://example.com/x");
        assert!(ttl >= config.min_ttl && ttl <= config.max_ttl);
    }

    fn stored_ttl(cache: &HttpCache, url: &str) -> Duration {
        let inner = cache.inner.lock();
        let entry = inner.entries.get(url).unwrap();
        entry.expires_at.duration_since(entry.created_at).unwrap()
    }

    #[test]
    fn lru_eviction_drops_the_least_recently_accessed_entry() {
        let cache = HttpCache::new(CacheConfig {
            max_entries: 1,
            ..Default::default()
        });
        cache.store("https://a.example.com", b"a".to_vec(), headers(&[]));
        cache.store("https://b.example.com", b"b".to_vec(), headers(&[]));
        assert_eq!(cache.get("https://a.example.com"), None);
        assert_eq!(cache.get("https://b.example.com"), Some(b"b".to_vec()));
    }
}
