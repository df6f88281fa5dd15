// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Per-domain rate limiter with adaptive backoff (C3)

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bb_pipeline_domain::error::CoreError;
use bb_pipeline_domain::services::{RateLimiterPort, SnapshotSource};
use bb_pipeline_domain::value_objects::{BackoffConfig, BackoffState, StateSnapshot, TokenBucket};
use parking_lot::Mutex;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DomainStats {
    pub requests: u64,
    pub denials: u64,
    pub backoff_activations: u64,
}

struct DomainEntry {
    bucket: TokenBucket,
    backoff: BackoffState,
    stats: DomainStats,
}

struct Inner {
    domains: HashMap<String, DomainEntry>,
    global_bucket: Option<TokenBucket>,
    default_backoff: BackoffConfig,
}

/// C3. One lock guards the domain map and all bucket state; acquisitions
/// never block internally (spec.md §4.3).
pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                domains: HashMap::new(),
                global_bucket: None,
                default_backoff: BackoffConfig::default(),
            }),
        }
    }

    /// Creates or replaces a domain bucket. `burst` defaults to
    /// `max(1, 2*rate)` when `None` (spec.md §4.3).
    pub fn set_bucket(&self, domain: &str, rate: f64, burst: Option<f64>) {
        let burst = burst.unwrap_or_else(|| (2.0 * rate).max(1.0));
        let mut inner = self.inner.lock();
        let backoff_config = inner.default_backoff;
        inner.domains.insert(
            domain.to_string(),
            DomainEntry {
                bucket: TokenBucket::new(burst, rate),
                backoff: BackoffState::new(backoff_config),
                stats: DomainStats::default(),
            },
        );
    }

    pub fn set_global_rate(&self, rate: f64) {
        let mut inner = self.inner.lock();
        inner.global_bucket = Some(TokenBucket::new((2.0 * rate).max(1.0), rate));
    }

    pub fn set_backoff(&self, domain: &str, config: BackoffConfig) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.domains.get_mut(domain) {
            entry.backoff = BackoffState::new(config);
        } else {
            inner.domains.insert(
                domain.to_string(),
                DomainEntry {
                    bucket: TokenBucket::new((2.0 * 1.0_f64).max(1.0), 1.0),
                    backoff: BackoffState::new(config),
                    stats: DomainStats::default(),
                },
            );
        }
    }

    fn ensure_domain<'a>(inner: &'a mut Inner, domain: &str) -> &'a mut DomainEntry {
        inner.domains.entry(domain.to_string()).or_insert_with(|| DomainEntry {
            bucket: TokenBucket::new(2.0, 1.0),
            backoff: BackoffState::new(BackoffConfig::default()),
            stats: DomainStats::default(),
        })
    }

    /// Refills both buckets, then applies the admission rule from
    /// spec.md §4.3. Debits both buckets only on success.
    pub fn try_acquire(&self, domain: &str, n: f64) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(global) = inner.global_bucket.as_mut() {
            global.refill(now);
        }
        let entry = Self::ensure_domain(&mut inner, domain);
        entry.bucket.refill(now);
        entry.stats.requests += 1;

        if entry.backoff.denied_at(now) {
            entry.stats.denials += 1;
            return false;
        }

        let global_ok = inner.global_bucket.as_ref().map_or(true, |g| g.tokens() >= n);
        let domain_ok = inner.domains.get(domain).map_or(false, |e| e.bucket.tokens() >= n);
        if !global_ok || !domain_ok {
            if let Some(entry) = inner.domains.get_mut(domain) {
                entry.stats.denials += 1;
            }
            return false;
        }

        if let Some(global) = inner.global_bucket.as_mut() {
            global.try_debit(n);
        }
        inner.domains.get_mut(domain).unwrap().bucket.try_debit(n);
        true
    }

    /// Time until `n` tokens would be available, taken as the maximum
    /// with any outstanding backoff delay (spec.md §4.3).
    pub fn wait_time_ms(&self, domain: &str, n: f64) -> f64 {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = Self::ensure_domain(&mut inner, domain);
        entry.bucket.refill(now);
        let token_wait = entry.bucket.wait_time_ms(n);
        let backoff_wait = if entry.backoff.is_in_backoff() {
            match entry.backoff.last_failure() {
                Some(last) => {
                    let elapsed = now.saturating_duration_since(last).as_millis() as f64;
                    (entry.backoff.current_delay_ms() as f64 - elapsed).max(0.0)
                }
                None => 0.0,
            }
        } else {
            0.0
        };
        token_wait.max(backoff_wait)
    }

    pub async fn wait_for_token(&self, domain: &str, n: f64) {
        let wait_ms = self.wait_time_ms(domain, n);
        if wait_ms > 0.0 {
            tokio::time::sleep(Duration::from_millis(wait_ms.ceil() as u64)).await;
        }
    }

    pub fn report_failure(&self, domain: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let was_in_backoff = inner.domains.get(domain).map_or(false, |e| e.backoff.is_in_backoff());
        let entry = Self::ensure_domain(&mut inner, domain);
        entry.backoff.report_failure(now);
        if !was_in_backoff {
            entry.stats.backoff_activations += 1;
        }
    }

    pub fn report_success(&self, domain: &str) {
        let mut inner = self.inner.lock();
        Self::ensure_domain(&mut inner, domain).backoff.report_success();
    }

    pub fn reset_backoff(&self, domain: &str) {
        let mut inner = self.inner.lock();
        Self::ensure_domain(&mut inner, domain).backoff.reset();
    }

    pub fn is_rate_limited(&self, domain: &str) -> bool {
        let inner = self.inner.lock();
        inner.domains.get(domain).map_or(false, |e| e.backoff.denied_at(Instant::now()))
    }

    pub fn current_delay_ms(&self, domain: &str) -> u64 {
        let inner = self.inner.lock();
        inner.domains.get(domain).map_or(0, |e| e.backoff.current_delay_ms())
    }

    pub fn stats(&self, domain: &str) -> DomainStats {
        let inner = self.inner.lock();
        inner.domains.get(domain).map(|e| e.stats.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.domains.clear();
        inner.global_bucket = None;
    }

    /// Per-domain request/denial/backoff-activation counters, as fed to
    /// kill-switch phase 2 ("saving state") via [`SnapshotSource`].
    pub fn snapshot_domains(&self) -> HashMap<String, DomainStats> {
        let inner = self.inner.lock();
        inner.domains.iter().map(|(domain, entry)| (domain.clone(), entry.stats.clone())).collect()
    }
}

/// Persists per-domain statistics so a resumed process can see what was
/// in flight at shutdown time; token bucket levels themselves are not
/// preserved, since they are time-relative and would be stale on reload.
#[async_trait]
impl SnapshotSource for RateLimiter {
    fn component_id(&self) -> &str {
        "rate_limiter"
    }

    async fn snapshot(&self) -> Result<StateSnapshot, CoreError> {
        let domains = self.snapshot_domains();
        let state_data = serde_json::to_vec(&domains)?;
        Ok(StateSnapshot {
            component_id: self.component_id().to_string(),
            operation_id: format!("domains-{}", domains.len()),
            timestamp_secs: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
            state_type: "rate_limiter.domain_stats".to_string(),
            data_size: state_data.len() as u64,
            checksum: StateSnapshot::checksum_of(&state_data),
            state_data,
            metadata: HashMap::new(),
            priority: 10,
            expiry: None,
        })
    }
}

impl RateLimiterPort for RateLimiter {
    fn try_acquire(&self, domain: &str) -> bool {
        RateLimiter::try_acquire(self, domain, 1.0)
    }

    fn report_outcome(&self, domain: &str, succeeded: bool) {
        if succeeded {
            self.report_success(domain);
        } else {
            self.report_failure(domain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_burst_of_ten_then_eleventh_denied() {
        let limiter = RateLimiter::new();
        limiter.set_bucket("example.com", 5.0, Some(10.0));
        for _ in 0..10 {
            assert!(limiter.try_acquire("example.com", 1.0));
        }
        assert!(!limiter.try_acquire("example.com", 1.0));
    }

    #[test]
    fn global_bucket_caps_even_when_domain_has_room() {
        let limiter = RateLimiter::new();
        limiter.set_global_rate(1.0);
        limiter.set_bucket("a.example.com", 100.0, Some(100.0));
        // global burst defaults to 2.0; third request should be denied.
        assert!(limiter.try_acquire("a.example.com", 1.0));
        assert!(limiter.try_acquire("a.example.com", 1.0));
        assert!(!limiter.try_acquire("a.example.com", 1.0));
    }

    #[test]
    fn backoff_denies_acquisition_even_with_tokens_available() {
        let limiter = RateLimiter::new();
        limiter.set_bucket("example.com", 100.0, Some(100.0));
        limiter.set_backoff(
            "example.com",
            BackoffConfig {
                initial_delay_ms: 10_000,
                max_delay_ms: 10_000,
                multiplier: 2.0,
            },
        );
        limiter.report_failure("example.com");
        assert!(limiter.is_rate_limited("example.com"));
        assert!(!limiter.try_acquire("example.com", 1.0));
    }

    #[test]
    fn reset_clears_all_domains() {
        let limiter = RateLimiter::new();
        limiter.set_bucket("example.com", 5.0, None);
        limiter.try_acquire("example.com", 1.0);
        limiter.reset();
        assert_eq!(limiter.stats("example.com").requests, 0);
    }

    #[tokio::test]
    async fn snapshot_carries_domain_stats_as_valid_json() {
        let limiter = RateLimiter::new();
        limiter.set_bucket("example.com", 5.0, None);
        limiter.try_acquire("example.com", 1.0);

        let snapshot = limiter.snapshot().await.unwrap();
        assert_eq!(snapshot.component_id, "rate_limiter");
        assert_eq!(StateSnapshot::checksum_of(&snapshot.state_data), snapshot.checksum);
        let decoded: HashMap<String, DomainStats> = serde_json::from_slice(&snapshot.state_data).unwrap();
        assert_eq!(decoded["example.com"].requests, 1);
    }
}
