// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Orchestrator
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! Registers a [`bb_pipeline_core::PipelineContext`]'s components with a
//! [`KillSwitch`] so shutdown actually reaches them, rather than leaving
//! every tenant to rediscover which components implement which hook.

use std::sync::Arc;

use bb_pipeline_core::PipelineContext;

use crate::kill_switch::KillSwitch;

/// Registers `context`'s rate limiter as a snapshot source and its pool
/// allocator as a cleanup hook. The HTTP cache and executor currently
/// have nothing a shutdown needs to persist or release, so they are not
/// registered (spec.md §4.8 only requires participation from components
/// that hold state or resources worth saving/releasing).
pub fn register_pipeline_context(kill_switch: &Arc<KillSwitch>, context: &PipelineContext) {
    kill_switch.register_snapshot_source(context.rate_limiter.clone());
    kill_switch.register_cleanup_hook(context.pool_allocator.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kill_switch::{KillSwitchConfig, TriggerReason};
    use crate::signals::SignalFacility;

    #[tokio::test]
    async fn registered_context_components_participate_in_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let context = PipelineContext::default();
        context.rate_limiter.set_bucket("example.com", 5.0, None);
        context.rate_limiter.try_acquire("example.com", 1.0);
        context.pool_allocator.allocate(64, 8).unwrap();

        let kill_switch = KillSwitch::new(
            KillSwitchConfig { snapshot_dir: dir.path().to_path_buf(), ..Default::default() },
            SignalFacility::new(),
        );
        register_pipeline_context(&kill_switch, &context);

        assert!(kill_switch.trigger(TriggerReason::UserRequest, "test", false));
        kill_switch.wait_for_completion().await;

        assert_eq!(context.pool_allocator.stats().total_allocations, 0);
        let saved = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(saved, 1, "expected exactly one snapshot file written");
    }
}
