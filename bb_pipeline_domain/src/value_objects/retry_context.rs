// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! Retry context value object (spec.md §3, §4.4).

use crate::error::RecoverableErrorKind;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub delay_applied: Duration,
    pub timestamp: SystemTime,
    pub error_message: String,
    pub kind: RecoverableErrorKind,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
    pub jitter_enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            jitter_enabled: true,
        }
    }
}

/// Per-call bookkeeping for the error-recovery executor (C4).
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation_name: String,
    pub config: RetryConfig,
    pub current_attempt: u32,
    pub history: Vec<AttemptRecord>,
}

impl RetryContext {
    pub fn new(operation_name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            operation_name: operation_name.into(),
            config,
            current_attempt: 0,
            history: Vec::new(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.current_attempt < self.config.max_attempts
    }

    /// Exponential schedule, clamped at `max_delay`, for the *next*
    /// attempt (1-indexed: the delay before attempt `current_attempt + 1`).
    pub fn base_delay_for_next_attempt(&self) -> Duration {
        let exp = self.current_attempt; // attempt-1 in 1-indexed terms
        let millis = self.config.initial_delay.as_millis() as f64 * self.config.multiplier.powi(exp as i32);
        let capped = millis.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn record_attempt(&mut self, delay_applied: Duration, timestamp: SystemTime, error_message: String, kind: RecoverableErrorKind) {
        self.current_attempt += 1;
        self.history.push(AttemptRecord {
            attempt: self.current_attempt,
            delay_applied,
            timestamp,
            error_message,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_retry_until_max_attempts() {
        let mut ctx = RetryContext::new("op", RetryConfig { max_attempts: 2, ..Default::default() });
        assert!(ctx.can_retry());
        ctx.record_attempt(Duration::ZERO, SystemTime::now(), "e".into(), RecoverableErrorKind::NetworkTimeout);
        assert!(ctx.can_retry());
        ctx.record_attempt(Duration::ZERO, SystemTime::now(), "e".into(), RecoverableErrorKind::NetworkTimeout);
        assert!(!ctx.can_retry());
    }

    #[test]
    fn base_delay_follows_exponential_schedule() {
        let ctx = RetryContext::new(
            "op",
            RetryConfig {
                initial_delay: Duration::from_millis(10),
                multiplier: 2.0,
                max_delay: Duration::from_millis(1000),
                ..Default::default()
            },
        );
        assert_eq!(ctx.base_delay_for_next_attempt(), Duration::from_millis(10));
    }
}
