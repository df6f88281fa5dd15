// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Error-Recovery Executor (C4)
//!
//! A generic retry+backoff+circuit-breaker wrapper around an arbitrary
//! async closure, replacing the source's function-template-per-call-site
//! expansion with a single entry point (spec.md §9's "generic closure
//! executor" redesign note). Classification happens through a pluggable
//! `Classifier`, with a built-in text heuristic as the default.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use bb_pipeline_domain::error::{CoreError, RecoverableErrorKind};
use bb_pipeline_domain::value_objects::{RetryConfig, RetryContext};
use parking_lot::Mutex;

/// Classifies an error message into a recoverable kind, or `None` if it
/// cannot. The executor tries registered classifiers in order (first
/// non-`None` wins) before falling back to [`default_classifier`].
pub trait Classifier: Send + Sync {
    fn classify(&self, message: &str) -> Option<RecoverableErrorKind>;
}

/// Built-in heuristic covering HTTP status families and common errno
/// names (spec.md §4.4: "HTTP status 5xx, 429, and errno families").
pub fn default_classifier(message: &str) -> RecoverableErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") {
        RecoverableErrorKind::Http429
    } else if lower.contains("5xx") || is_5xx_status(&lower) {
        RecoverableErrorKind::Http5xx
    } else if lower.contains("timeout") || lower.contains("timed out") {
        RecoverableErrorKind::NetworkTimeout
    } else if lower.contains("refused") {
        RecoverableErrorKind::ConnectionRefused
    } else if lower.contains("dns") || lower.contains("resolve") || lower.contains("resolution") {
        RecoverableErrorKind::DnsResolution
    } else if lower.contains("ssl") || lower.contains("tls") || lower.contains("handshake") {
        RecoverableErrorKind::SslHandshake
    } else if lower.contains("unreachable") || lower.contains("reset") || lower.contains("would block") || lower.contains("socket") {
        RecoverableErrorKind::SocketError
    } else if lower.contains("temporary") || lower.contains("try again") {
        RecoverableErrorKind::TemporaryFailure
    } else {
        RecoverableErrorKind::Custom
    }
}

fn is_5xx_status(lower: &str) -> bool {
    ["500", "501", "502", "503", "504", "505"].iter().any(|code| lower.contains(code))
}

/// Configuration for the circuit breaker component of the executor.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5 }
    }
}

/// Trips after `failure_threshold` consecutive exhausted retries; once
/// open, every call fails immediately with `NonRecoverable` until an
/// explicit [`CircuitBreaker::reset`] (spec.md §9 Open Questions: success
/// resets the failure counter but does not auto-close the breaker).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    open: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            open: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    fn record_exhaustion(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold {
            self.open.store(true, Ordering::Release);
        }
    }

    pub fn reset(&self) {
        self.open.store(false, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry: RetryConfig,
    pub recoverable_kinds: Vec<RecoverableErrorKind>,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            recoverable_kinds: RecoverableErrorKind::ALL.to_vec(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// C4. Wraps an arbitrary fallible async operation with classification,
/// exponential backoff with jitter, and a shared circuit breaker.
pub struct ErrorRecoveryExecutor {
    config: ExecutorConfig,
    classifiers: Vec<Box<dyn Classifier>>,
    breaker: CircuitBreaker,
    last_context: Mutex<Option<RetryContext>>,
}

impl ErrorRecoveryExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker);
        Self {
            config,
            classifiers: Vec::new(),
            breaker,
            last_context: Mutex::new(None),
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifiers.push(classifier);
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Snapshot of the most recently completed call's attempt history,
    /// for diagnostics (spec.md §3 `RetryContext`).
    pub fn last_retry_context(&self) -> Option<RetryContext> {
        self.last_context.lock().clone()
    }

    fn classify(&self, message: &str) -> RecoverableErrorKind {
        for classifier in &self.classifiers {
            if let Some(kind) = classifier.classify(message) {
                if kind != RecoverableErrorKind::Custom {
                    return kind;
                }
            }
        }
        default_classifier(message)
    }

    fn is_recoverable_kind(&self, kind: RecoverableErrorKind) -> bool {
        self.config.recoverable_kinds.contains(&kind)
    }

    /// Delay for `attempt` (1-indexed): `base * multiplier^(attempt-1)`,
    /// capped at `max_delay`, optionally perturbed by uniform jitter in
    /// `±base*jitter_factor` clamped to zero (spec.md §4.4).
    fn delay_for_attempt(&self, attempt: u32, rng_unit: f64) -> Duration {
        let base = self.config.retry.initial_delay.as_millis() as f64;
        let scaled = base * self.config.retry.multiplier.powi(attempt as i32 - 1);
        let capped = scaled.min(self.config.retry.max_delay.as_millis() as f64);
        let delay = if self.config.retry.jitter_enabled {
            let jitter = base * self.config.retry.jitter_factor * (2.0 * rng_unit - 1.0);
            (capped + jitter).max(0.0)
        } else {
            capped
        };
        Duration::from_millis(delay as u64)
    }

    /// Runs `operation` to completion, retrying on recoverable failure.
    /// `operation` returns `Err(message)` on failure; the message is
    /// classified to decide whether to retry.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        if self.breaker.is_open() {
            return Err(CoreError::NonRecoverable(format!("circuit breaker open for '{operation_name}'")));
        }

        let mut ctx = RetryContext::new(operation_name, self.config.retry);
        let mut rng_state: u64 = 0x9E3779B97F4A7C15 ^ operation_name.len() as u64;

        loop {
            match operation().await {
                Ok(value) => {
                    self.breaker.record_success();
                    *self.last_context.lock() = Some(ctx);
                    return Ok(value);
                }
                Err(message) => {
                    let kind = self.classify(&message);
                    if !self.is_recoverable_kind(kind) {
                        *self.last_context.lock() = Some(ctx);
                        return Err(CoreError::NonRecoverable(message));
                    }
                    if !ctx.can_retry() {
                        self.breaker.record_exhaustion();
                        let attempts = ctx.current_attempt;
                        *self.last_context.lock() = Some(ctx);
                        return Err(CoreError::RetryExhausted { attempts, message });
                    }
                    rng_state ^= rng_state << 13;
                    rng_state ^= rng_state >> 7;
                    rng_state ^= rng_state << 17;
                    let rng_unit = (rng_state % 1_000_000) as f64 / 1_000_000.0;
                    let delay = self.delay_for_attempt(ctx.current_attempt + 1, rng_unit);
                    ctx.record_attempt(delay, SystemTime::now(), message, kind);
                    sleep_interruptible(delay).await;
                }
            }
        }
    }
}

/// Sleeps in 100ms slices so a cooperative cancellation signal (not yet
/// wired at this layer) could interrupt between slices, per spec.md
/// §4.4's "interruptible sleep" requirement.
async fn sleep_interruptible(total: Duration) {
    const SLICE: Duration = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > SLICE {
        tokio::time::sleep(SLICE).await;
        remaining -= SLICE;
    }
    if !remaining.is_zero() {
        tokio::time::sleep(remaining).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;
    use std::sync::Arc;

    #[tokio::test]
    async fn s6_retry_exhaustion_then_recovery() {
        let executor = ErrorRecoveryExecutor::new(ExecutorConfig {
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(1),
                multiplier: 2.0,
                jitter_factor: 0.0,
                jitter_enabled: false,
            },
            ..Default::default()
        });
        let calls = Arc::new(Counter::new(0));
        let calls_clone = Arc::clone(&calls);
        let started = std::time::Instant::now();

        let result = executor
            .execute("probe", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt < 3 {
                        Err("network timeout".to_string())
                    } else {
                        Ok(100)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 100);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn non_recoverable_error_fails_immediately_without_retry() {
        let executor = ErrorRecoveryExecutor::new(ExecutorConfig {
            recoverable_kinds: vec![RecoverableErrorKind::NetworkTimeout],
            ..Default::default()
        });
        let calls = Arc::new(Counter::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<(), CoreError> = executor
            .execute("probe", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("totally unrelated custom failure".to_string())
                }
            })
            .await;
        assert!(matches!(result, Err(CoreError::NonRecoverable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold_and_rejects_immediately() {
        let executor = ErrorRecoveryExecutor::new(ExecutorConfig {
            retry: RetryConfig {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                multiplier: 1.0,
                jitter_factor: 0.0,
                jitter_enabled: false,
            },
            circuit_breaker: CircuitBreakerConfig { failure_threshold: 2 },
            ..Default::default()
        });

        for _ in 0..2 {
            let _: Result<(), CoreError> = executor.execute("probe", || async { Err("network timeout".to_string()) }).await;
        }
        assert!(executor.circuit_breaker().is_open());

        let calls = Arc::new(Counter::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<(), CoreError> = executor
            .execute("probe", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "breaker must short-circuit before invoking the operation");
    }

    #[test]
    fn circuit_breaker_success_does_not_auto_close() {
        // Pins the Open Question decision from SPEC_FULL.md §9: success
        // resets the consecutive-failure counter but the breaker stays
        // open until an explicit reset().
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 1 });
        breaker.record_exhaustion();
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(breaker.is_open(), "success alone must not close an open breaker");

        breaker.reset();
        assert!(!breaker.is_open());
    }
}
