// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! Port traits implemented by `bb_pipeline_core` and
//! `bb_pipeline_orchestrator`. These exist so the domain crate can name the
//! contracts between components without depending on tokio, flate2, or any
//! other infrastructure crate.

use async_trait::async_trait;

use crate::entities::log_record::LogRecord;
use crate::error::CoreError;
use crate::value_objects::state_snapshot::StateSnapshot;

/// Destination for structured log records. `bb_pipeline_core::logging`
/// provides the NDJSON-file implementation; tests use an in-memory one.
pub trait LogSink: Send + Sync {
    fn write(&self, record: &LogRecord);

    fn flush(&self);
}

/// Admission-control surface the error-recovery executor (C4) reports
/// outcomes to and consults before issuing a call, decoupling it from the
/// concrete `RateLimiter` (C3).
pub trait RateLimiterPort: Send + Sync {
    fn try_acquire(&self, domain: &str) -> bool;

    fn report_outcome(&self, domain: &str, succeeded: bool);
}

/// Cache lookup/store surface used by callers that wrap HTTP fetches with
/// caching, decoupling them from the concrete `HttpCache` (C5).
#[async_trait]
pub trait CachePort: Send + Sync {
    async fn get(&self, url: &str) -> Option<Vec<u8>>;

    async fn put(&self, url: &str, body: Vec<u8>, headers: std::collections::HashMap<String, String>);
}

/// A component that can serialize its live state for kill-switch phase 2
/// ("saving state", spec.md §4.8). Implementors should be fast and
/// non-blocking; the orchestrator budgets each call against the phase
/// timeout.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn component_id(&self) -> &str;

    async fn snapshot(&self) -> Result<StateSnapshot, CoreError>;
}

/// A long-running task's cooperative-cancellation hook, invoked during
/// kill-switch phase 1 ("stopping tasks", spec.md §4.8).
#[async_trait]
pub trait TaskStopHook: Send + Sync {
    fn task_name(&self) -> &str;

    async fn stop(&self) -> Result<(), CoreError>;
}

/// A resource-release hook invoked during kill-switch phase 4 ("cleanup",
/// spec.md §4.8), after state has been saved.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    fn resource_name(&self) -> &str;

    async fn cleanup(&self) -> Result<(), CoreError>;
}
