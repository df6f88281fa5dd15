// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! Shared infrastructure for the BB-Pipeline reconnaissance pipeline:
//! structured logging, a handle-based pool allocator, a per-domain rate
//! limiter, an error-recovery executor with circuit breaker, an HTTP
//! response cache, and the streaming CSV engine (parser + schema
//! validator). See `bb_pipeline_domain` for the shared data model and
//! port traits these components implement.

pub mod context;
pub mod csv;
pub mod executor;
pub mod http_cache;
pub mod logging;
pub mod pool_allocator;
pub mod rate_limiter;

pub use context::{PipelineContext, PipelineContextConfig};
