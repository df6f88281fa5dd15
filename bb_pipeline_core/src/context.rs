// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Composition root (SPEC_FULL.md §10.3)
//!
//! `PipelineContext` owns the construction-injected services every other
//! component links against. No component here reaches for a process-wide
//! singleton; a tenant builds exactly one context and threads it through.

use std::sync::Arc;

use crate::executor::{ErrorRecoveryExecutor, ExecutorConfig};
use crate::http_cache::{CacheConfig, HttpCache};
use crate::logging::{Logger, LoggerConfig};
use crate::pool_allocator::{PoolAllocator, PoolConfig};
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Clone, Default)]
pub struct PipelineContextConfig {
    pub logger: LoggerConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub executor: ExecutorConfig,
}

/// The composition root. Every field is an `Arc` so cloning the context
/// is cheap and safe to hand to concurrent tasks.
pub struct PipelineContext {
    pub logger: Arc<Logger>,
    pub pool_allocator: Arc<PoolAllocator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub http_cache: Arc<HttpCache>,
    pub executor: Arc<ErrorRecoveryExecutor>,
}

impl PipelineContext {
    pub fn new(config: PipelineContextConfig) -> Self {
        Self {
            logger: Arc::new(Logger::new(config.logger)),
            pool_allocator: Arc::new(PoolAllocator::new(config.pool)),
            rate_limiter: Arc::new(RateLimiter::new()),
            http_cache: Arc::new(HttpCache::new(config.cache)),
            executor: Arc::new(ErrorRecoveryExecutor::new(config.executor)),
        }
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new(PipelineContextConfig::default())
    }
}

impl Clone for PipelineContext {
    fn clone(&self) -> Self {
        Self {
            logger: self.logger.clone(),
            pool_allocator: self.pool_allocator.clone(),
            rate_limiter: self.rate_limiter.clone(),
            http_cache: self.http_cache.clone(),
            executor: self.executor.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_builds_all_services_and_clones_share_state() {
        let ctx = PipelineContext::default();
        ctx.rate_limiter.set_bucket("example.com", 1.0, Some(1.0));
        let cloned = ctx.clone();
        assert!(cloned.rate_limiter.try_acquire("example.com", 1.0));
        assert!(!ctx.rate_limiter.try_acquire("example.com", 1.0));
    }
}
