// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! HTTP cache entry value object (spec.md §3, §4.5).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// A single cached HTTP response, keyed externally by the request URL
/// (the fingerprint, per spec.md §4.5).
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Vec<u8>,
    pub compressed: bool,
    pub headers: HashMap<String, String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
    pub access_count: u64,
    pub last_accessed: SystemTime,
    pub stale: bool,
}

impl CacheEntry {
    pub fn new(
        body: Vec<u8>,
        compressed: bool,
        headers: HashMap<String, String>,
        etag: Option<String>,
        last_modified: Option<String>,
        created_at: SystemTime,
        ttl: Duration,
    ) -> Self {
        Self {
            body,
            compressed,
            headers,
            etag,
            last_modified,
            created_at,
            expires_at: created_at + ttl,
            access_count: 0,
            last_accessed: created_at,
            stale: false,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Approximate in-memory footprint: URL is owned by the cache's map
    /// key, so this covers body + headers + validators + a fixed
    /// struct-overhead estimate.
    pub fn memory_footprint(&self, url_len: usize) -> usize {
        let headers_len: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        let validators_len = self.etag.as_ref().map_or(0, String::len) + self.last_modified.as_ref().map_or(0, String::len);
        url_len + self.body.len() + headers_len + validators_len + 128
    }

    pub fn header_ci(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_at_is_created_at_plus_ttl() {
        let now = SystemTime::now();
        let entry = CacheEntry::new(vec![1, 2, 3], false, HashMap::new(), None, None, now, Duration::from_secs(60));
        assert_eq!(entry.expires_at, now + Duration::from_secs(60));
        assert!(entry.expires_at >= entry.created_at);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("ETag".to_string(), "\"v1\"".to_string());
        let entry = CacheEntry::new(vec![], false, headers, None, None, SystemTime::now(), Duration::from_secs(1));
        assert_eq!(entry.header_ci("etag"), Some("\"v1\""));
    }
}
