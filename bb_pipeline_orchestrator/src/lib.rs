// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Orchestrator
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! Graceful-shutdown orchestration for the BB-Pipeline reconnaissance
//! pipeline: the kill-switch phase machine (C8), the process-signal
//! facility it subscribes to, and the on-disk state-snapshot format the
//! "saving state" phase writes. See `bb_pipeline_domain` for the
//! `SnapshotSource`/`TaskStopHook`/`CleanupHook` port traits components
//! implement to participate in a shutdown.

pub mod kill_switch;
pub mod signals;
pub mod snapshot_file;
pub mod wiring;

pub use kill_switch::{KillSwitch, KillSwitchConfig, KillSwitchStats, NotificationSink, Phase, PhaseRecord, TriggerReason};
pub use signals::{SignalFacility, SignalKind};
pub use wiring::register_pipeline_context;
