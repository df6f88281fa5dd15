// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Orchestrator
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Kill-switch orchestrator (spec.md §4.8)
//!
//! A linear phase state machine — `inactive → triggered → stopping_tasks
//! → saving_state → cleanup → finalizing → completed` — that coordinates
//! graceful process shutdown across every registered hook. Each phase is
//! budgeted independently and the whole run is additionally capped by
//! `total_shutdown_timeout`. `trigger()` is non-blocking: it moves the
//! machine to `triggered` synchronously (so `cancel()` has a window to
//! act) and drives the remaining phases on a spawned task.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bb_pipeline_domain::services::{CleanupHook, SnapshotSource, TaskStopHook};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::signals::{SignalFacility, SignalKind};
use crate::snapshot_file;

const TRIGGER_HISTORY_CAP: usize = 10;
const PHASE_HISTORY_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TriggerReason {
    UserRequest,
    ProcessSignal,
    Timeout,
    ResourceExhaustion,
    CriticalError,
    DependencyFailure,
    SecurityThreat,
    ExternalCommand,
}

/// Canonical phase order. Declaration order doubles as the `Ord`
/// derivation so "phase sequence is a prefix of the canonical order"
/// (spec.md §8) is a plain `<=` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Phase {
    Inactive,
    Triggered,
    StoppingTasks,
    SavingState,
    Cleanup,
    Finalizing,
    Completed,
}

impl Phase {
    /// Stable lowercase-with-underscores name, used for the snapshot
    /// file's human-readable phase history (spec.md §6).
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Inactive => "inactive",
            Phase::Triggered => "triggered",
            Phase::StoppingTasks => "stopping_tasks",
            Phase::SavingState => "saving_state",
            Phase::Cleanup => "cleanup",
            Phase::Finalizing => "finalizing",
            Phase::Completed => "completed",
        }
    }

    /// Inverse of [`Phase::as_str`]; `None` for any unrecognized name.
    pub fn from_str_name(name: &str) -> Option<Self> {
        match name {
            "inactive" => Some(Phase::Inactive),
            "triggered" => Some(Phase::Triggered),
            "stopping_tasks" => Some(Phase::StoppingTasks),
            "saving_state" => Some(Phase::SavingState),
            "cleanup" => Some(Phase::Cleanup),
            "finalizing" => Some(Phase::Finalizing),
            "completed" => Some(Phase::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives every phase transition the kill switch makes, carrying the
/// trigger reason (absent only before the first transition) and the
/// free-text details string passed to `trigger()`.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, phase: Phase, reason: Option<TriggerReason>, details: &str);
}

#[derive(Debug, Clone)]
pub struct KillSwitchConfig {
    pub stopping_tasks_timeout: Duration,
    pub saving_state_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub finalizing_timeout: Duration,
    pub total_shutdown_timeout: Duration,
    pub snapshot_dir: PathBuf,
    pub file_prefix: String,
    pub file_tag: String,
    pub max_state_files: usize,
    pub compress_snapshots: bool,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            stopping_tasks_timeout: Duration::from_secs(10),
            saving_state_timeout: Duration::from_secs(10),
            cleanup_timeout: Duration::from_secs(5),
            finalizing_timeout: Duration::from_secs(2),
            total_shutdown_timeout: Duration::from_secs(30),
            snapshot_dir: PathBuf::from("./state"),
            file_prefix: "bb_".to_string(),
            file_tag: "shutdown".to_string(),
            max_state_files: 10,
            compress_snapshots: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub reason: Option<TriggerReason>,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct KillSwitchStats {
    pub trigger_counts: HashMap<TriggerReason, u64>,
    pub recent_triggers: Vec<TriggerReason>,
    pub shutdown_count: u64,
    pub min_shutdown: Option<Duration>,
    pub max_shutdown: Option<Duration>,
    pub mean_shutdown: Option<Duration>,
    pub states_saved: u64,
    pub state_bytes_saved: u64,
    pub save_failures: u64,
    pub phase_history: Vec<PhaseRecord>,
}

#[derive(Default)]
struct StatsInner {
    trigger_counts: HashMap<TriggerReason, u64>,
    recent_triggers: VecDeque<TriggerReason>,
    shutdown_count: u64,
    min_shutdown: Option<Duration>,
    max_shutdown: Option<Duration>,
    total_shutdown: Duration,
    states_saved: u64,
    state_bytes_saved: u64,
    save_failures: u64,
    phase_history: VecDeque<PhaseRecord>,
}

pub struct KillSwitch {
    phase: Mutex<Phase>,
    config: KillSwitchConfig,
    task_stop_hooks: Mutex<Vec<Arc<dyn TaskStopHook>>>,
    snapshot_sources: Mutex<Vec<Arc<dyn SnapshotSource>>>,
    cleanup_hooks: Mutex<Vec<Arc<dyn CleanupHook>>>,
    notification_sinks: Mutex<Vec<Arc<dyn NotificationSink>>>,
    signal_facility: Arc<SignalFacility>,
    completion: Notify,
    stats: Mutex<StatsInner>,
}

impl KillSwitch {
    /// Builds a kill switch and registers it with `signal_facility` as a
    /// one-way hook: the facility calls into the kill switch on a raw
    /// signal, the kill switch never calls back into the facility except
    /// to flip its `shutdown_in_progress` flag (spec.md §9).
    pub fn new(config: KillSwitchConfig, signal_facility: Arc<SignalFacility>) -> Arc<Self> {
        let switch = Arc::new(Self {
            phase: Mutex::new(Phase::Inactive),
            config,
            task_stop_hooks: Mutex::new(Vec::new()),
            snapshot_sources: Mutex::new(Vec::new()),
            cleanup_hooks: Mutex::new(Vec::new()),
            notification_sinks: Mutex::new(Vec::new()),
            signal_facility: Arc::clone(&signal_facility),
            completion: Notify::new(),
            stats: Mutex::new(StatsInner::default()),
        });

        let hook_target = Arc::clone(&switch);
        signal_facility.register_hook(move |kind: SignalKind| {
            hook_target.trigger(TriggerReason::ProcessSignal, format!("{kind:?}"), false);
        });

        switch
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn register_task_stop_hook(&self, hook: Arc<dyn TaskStopHook>) {
        self.task_stop_hooks.lock().push(hook);
    }

    pub fn register_snapshot_source(&self, source: Arc<dyn SnapshotSource>) {
        self.snapshot_sources.lock().push(source);
    }

    pub fn register_cleanup_hook(&self, hook: Arc<dyn CleanupHook>) {
        self.cleanup_hooks.lock().push(hook);
    }

    pub fn register_notification_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.notification_sinks.lock().push(sink);
    }

    /// Loads every previously persisted snapshot file from the
    /// configured directory, decoded and sorted by priority ascending
    /// (spec.md §4.8 "Load").
    pub fn load_saved_state(&self) -> Result<Vec<snapshot_file::SnapshotEntry>, bb_pipeline_domain::error::CoreError> {
        snapshot_file::load_all(&self.config.snapshot_dir)
    }

    /// Begins a shutdown. Returns `false` without effect if a shutdown
    /// is already underway. Non-blocking: phase execution runs on a
    /// spawned task; call [`KillSwitch::wait_for_completion`] to block
    /// until `completed`.
    pub fn trigger(self: &Arc<Self>, reason: TriggerReason, details: impl Into<String>, forced_immediate: bool) -> bool {
        {
            let mut phase = self.phase.lock();
            if !matches!(*phase, Phase::Inactive) {
                return false;
            }
            *phase = Phase::Triggered;
        }
        self.record_trigger(reason);
        let details = details.into();
        self.notify_sinks(Phase::Triggered, Some(reason), &details);

        let me = Arc::clone(self);
        tokio::spawn(async move {
            me.run_phases(reason, details, forced_immediate).await;
        });
        true
    }

    /// Cancels a pending shutdown. Only legal while the machine is
    /// `inactive` (a no-op, returns `false`) or `triggered` (succeeds,
    /// reverts to `inactive`); once task-stopping has begun cancellation
    /// is refused (spec.md §5, §4.8).
    pub fn cancel(&self) -> bool {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Triggered => {
                *phase = Phase::Inactive;
                true
            }
            _ => false,
        }
    }

    pub async fn wait_for_completion(&self) {
        loop {
            if matches!(*self.phase.lock(), Phase::Completed) {
                return;
            }
            self.completion.notified().await;
        }
    }

    pub fn stats(&self) -> KillSwitchStats {
        let stats = self.stats.lock();
        let mean_shutdown = if stats.shutdown_count > 0 {
            Some(stats.total_shutdown / stats.shutdown_count as u32)
        } else {
            None
        };
        KillSwitchStats {
            trigger_counts: stats.trigger_counts.clone(),
            recent_triggers: stats.recent_triggers.iter().copied().collect(),
            shutdown_count: stats.shutdown_count,
            min_shutdown: stats.min_shutdown,
            max_shutdown: stats.max_shutdown,
            mean_shutdown,
            states_saved: stats.states_saved,
            state_bytes_saved: stats.state_bytes_saved,
            save_failures: stats.save_failures,
            phase_history: stats.phase_history.iter().cloned().collect(),
        }
    }

    async fn run_phases(self: Arc<Self>, reason: TriggerReason, details: String, forced_immediate: bool) {
        // Yields once so a `cancel()` issued synchronously right after
        // `trigger()` returns wins the race before any hook runs.
        tokio::task::yield_now().await;
        if !matches!(self.phase(), Phase::Triggered) {
            return;
        }

        self.signal_facility.mark_shutdown_started();
        let start = Instant::now();

        if !forced_immediate {
            self.set_phase(Phase::StoppingTasks, Some(reason), &details);
            let budget = self.remaining_budget(self.config.stopping_tasks_timeout, start);
            let ok = self.stop_tasks(budget).await;
            self.record_phase(Phase::StoppingTasks, Some(reason), ok);

            self.set_phase(Phase::SavingState, Some(reason), &details);
            let budget = self.remaining_budget(self.config.saving_state_timeout, start);
            let ok = self.save_state(budget, reason, &details).await;
            self.record_phase(Phase::SavingState, Some(reason), ok);
        }

        self.set_phase(Phase::Cleanup, Some(reason), &details);
        let budget = self.remaining_budget(self.config.cleanup_timeout, start);
        let ok = self.run_cleanup(budget).await;
        self.record_phase(Phase::Cleanup, Some(reason), ok);

        self.set_phase(Phase::Finalizing, Some(reason), &details);
        self.signal_facility.finalize();
        self.record_phase(Phase::Finalizing, Some(reason), true);

        self.set_phase(Phase::Completed, Some(reason), &details);
        self.record_shutdown_time(start.elapsed());
        self.signal_facility.mark_shutdown_finished();
        self.completion.notify_waiters();
    }

    fn remaining_budget(&self, phase_timeout: Duration, start: Instant) -> Duration {
        let remaining_total = self.config.total_shutdown_timeout.saturating_sub(start.elapsed());
        phase_timeout.min(remaining_total)
    }

    async fn stop_tasks(&self, budget: Duration) -> bool {
        let start = Instant::now();
        let hooks = self.task_stop_hooks.lock().clone();
        let mut all_ok = true;
        for hook in &hooks {
            let remaining = budget.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                all_ok = false;
                break;
            }
            match tokio::time::timeout(remaining, hook.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(task = hook.task_name(), %err, "task stop hook failed");
                    all_ok = false;
                }
                Err(_) => {
                    tracing::error!(task = hook.task_name(), "task stop hook timed out");
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    async fn save_state(&self, budget: Duration, reason: TriggerReason, details: &str) -> bool {
        let start = Instant::now();
        let sources = self.snapshot_sources.lock().clone();
        let mut entries = Vec::new();
        let mut any_failure = false;

        for source in &sources {
            let remaining = budget.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                any_failure = true;
                break;
            }
            match tokio::time::timeout(remaining, source.snapshot()).await {
                Ok(Ok(snapshot)) => {
                    entries.push(snapshot_file::entry_from_snapshot(snapshot, self.config.compress_snapshots));
                }
                Ok(Err(err)) => {
                    tracing::error!(component = source.component_id(), %err, "snapshot hook failed");
                    any_failure = true;
                }
                Err(_) => {
                    tracing::error!(component = source.component_id(), "snapshot hook timed out");
                    any_failure = true;
                }
            }
        }

        let bytes_saved: u64 = entries.iter().map(|e| e.data_size).sum();
        let count = entries.len() as u64;

        if !entries.is_empty() {
            let now = chrono::Utc::now();
            let file = snapshot_file::SnapshotFile {
                version: snapshot_file::SNAPSHOT_FILE_VERSION.to_string(),
                timestamp: now.timestamp().max(0) as u64,
                trigger: format!("{reason:?}"),
                trigger_details: details.to_string(),
                snapshots: entries,
            };
            let filename = snapshot_file::build_filename(&self.config.file_prefix, &self.config.file_tag, now);
            match snapshot_file::write_file(&self.config.snapshot_dir, &filename, &file) {
                Ok(_) => {
                    if let Err(err) = snapshot_file::prune_old_files(&self.config.snapshot_dir, self.config.max_state_files) {
                        tracing::warn!(%err, "failed to prune old snapshot files");
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "failed to write snapshot file");
                    any_failure = true;
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.states_saved += count;
        stats.state_bytes_saved += bytes_saved;
        if any_failure {
            stats.save_failures += 1;
        }
        !any_failure
    }

    async fn run_cleanup(&self, budget: Duration) -> bool {
        let start = Instant::now();
        let hooks = self.cleanup_hooks.lock().clone();
        let mut all_ok = true;
        for hook in &hooks {
            let remaining = budget.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                all_ok = false;
                break;
            }
            match tokio::time::timeout(remaining, hook.cleanup()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(resource = hook.resource_name(), %err, "cleanup hook failed");
                    all_ok = false;
                }
                Err(_) => {
                    tracing::error!(resource = hook.resource_name(), "cleanup hook timed out");
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    fn set_phase(&self, phase: Phase, reason: Option<TriggerReason>, details: &str) {
        *self.phase.lock() = phase;
        self.notify_sinks(phase, reason, details);
    }

    fn notify_sinks(&self, phase: Phase, reason: Option<TriggerReason>, details: &str) {
        for sink in self.notification_sinks.lock().iter() {
            sink.notify(phase, reason, details);
        }
    }

    fn record_trigger(&self, reason: TriggerReason) {
        let mut stats = self.stats.lock();
        *stats.trigger_counts.entry(reason).or_insert(0) += 1;
        stats.recent_triggers.push_back(reason);
        if stats.recent_triggers.len() > TRIGGER_HISTORY_CAP {
            stats.recent_triggers.pop_front();
        }
    }

    fn record_phase(&self, phase: Phase, reason: Option<TriggerReason>, succeeded: bool) {
        let mut stats = self.stats.lock();
        stats.phase_history.push_back(PhaseRecord { phase, reason, succeeded });
        if stats.phase_history.len() > PHASE_HISTORY_CAP {
            stats.phase_history.pop_front();
        }
    }

    fn record_shutdown_time(&self, elapsed: Duration) {
        let mut stats = self.stats.lock();
        stats.shutdown_count += 1;
        stats.total_shutdown += elapsed;
        stats.min_shutdown = Some(stats.min_shutdown.map_or(elapsed, |m| m.min(elapsed)));
        stats.max_shutdown = Some(stats.max_shutdown.map_or(elapsed, |m| m.max(elapsed)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bb_pipeline_domain::error::CoreError;
    use bb_pipeline_domain::value_objects::StateSnapshot;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingStopHook {
        name: String,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskStopHook for RecordingStopHook {
        fn task_name(&self) -> &str {
            &self.name
        }
        async fn stop(&self) -> Result<(), CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FixedSnapshotSource {
        id: String,
        data: Vec<u8>,
    }

    #[async_trait]
    impl SnapshotSource for FixedSnapshotSource {
        fn component_id(&self) -> &str {
            &self.id
        }
        async fn snapshot(&self) -> Result<StateSnapshot, CoreError> {
            Ok(StateSnapshot {
                component_id: self.id.clone(),
                operation_id: "op-1".to_string(),
                timestamp_secs: 0,
                state_type: "json".to_string(),
                state_data: self.data.clone(),
                metadata: StdHashMap::new(),
                data_size: self.data.len() as u64,
                checksum: 0,
                priority: 0,
                expiry: None,
            })
        }
    }

    fn test_config(dir: &std::path::Path) -> KillSwitchConfig {
        KillSwitchConfig {
            stopping_tasks_timeout: Duration::from_millis(200),
            saving_state_timeout: Duration::from_millis(200),
            cleanup_timeout: Duration::from_millis(200),
            finalizing_timeout: Duration::from_millis(200),
            total_shutdown_timeout: Duration::from_secs(5),
            snapshot_dir: dir.to_path_buf(),
            file_prefix: "bb_".to_string(),
            file_tag: "shutdown".to_string(),
            max_state_files: 10,
            compress_snapshots: false,
        }
    }

    #[tokio::test]
    async fn s7_preserves_a_registered_snapshot_through_a_full_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(test_config(dir.path()), SignalFacility::new());
        switch.register_snapshot_source(Arc::new(FixedSnapshotSource {
            id: "X".to_string(),
            data: br#"{"k":"v"}"#.to_vec(),
        }));

        assert!(switch.trigger(TriggerReason::UserRequest, "manual", false));
        switch.wait_for_completion().await;
        assert_eq!(switch.phase(), Phase::Completed);

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);

        let loaded = switch.load_saved_state().unwrap();
        assert_eq!(loaded.len(), 1);
        let recovered = snapshot_file::decode_entry(&loaded[0]).unwrap();
        assert_eq!(recovered, br#"{"k":"v"}"#);
    }

    #[tokio::test]
    async fn stopping_tasks_hook_runs_before_completion() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(test_config(dir.path()), SignalFacility::new());
        let calls = Arc::new(AtomicUsize::new(0));
        switch.register_task_stop_hook(Arc::new(RecordingStopHook {
            name: "worker".to_string(),
            calls: Arc::clone(&calls),
        }));

        switch.trigger(TriggerReason::UserRequest, "", false);
        switch.wait_for_completion().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forced_immediate_skips_stopping_tasks_and_saving_state() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(test_config(dir.path()), SignalFacility::new());
        let calls = Arc::new(AtomicUsize::new(0));
        switch.register_task_stop_hook(Arc::new(RecordingStopHook {
            name: "worker".to_string(),
            calls: Arc::clone(&calls),
        }));
        switch.register_snapshot_source(Arc::new(FixedSnapshotSource {
            id: "X".to_string(),
            data: b"data".to_vec(),
        }));

        switch.trigger(TriggerReason::CriticalError, "panic", true);
        switch.wait_for_completion().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn cancel_before_phases_start_prevents_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(test_config(dir.path()), SignalFacility::new());
        assert!(switch.trigger(TriggerReason::UserRequest, "", false));
        assert!(switch.cancel());
        assert_eq!(switch.phase(), Phase::Inactive);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(test_config(dir.path()), SignalFacility::new());
        switch.trigger(TriggerReason::Timeout, "", false);
        switch.wait_for_completion().await;
        assert!(!switch.cancel());
    }

    #[tokio::test]
    async fn double_trigger_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(test_config(dir.path()), SignalFacility::new());
        assert!(switch.trigger(TriggerReason::UserRequest, "", false));
        assert!(!switch.trigger(TriggerReason::Timeout, "", false));
        switch.wait_for_completion().await;
    }

    #[tokio::test]
    async fn stats_record_trigger_reason_and_phase_history() {
        let dir = tempfile::tempdir().unwrap();
        let switch = KillSwitch::new(test_config(dir.path()), SignalFacility::new());
        switch.trigger(TriggerReason::ExternalCommand, "", false);
        switch.wait_for_completion().await;

        let stats = switch.stats();
        assert_eq!(stats.trigger_counts.get(&TriggerReason::ExternalCommand), Some(&1));
        assert_eq!(stats.shutdown_count, 1);
        assert!(!stats.phase_history.is_empty());
        assert!(stats.phase_history.windows(2).all(|w| w[0].phase <= w[1].phase));
    }

    #[tokio::test]
    async fn signal_delivery_triggers_the_switch() {
        let dir = tempfile::tempdir().unwrap();
        let facility = SignalFacility::new();
        let switch = KillSwitch::new(test_config(dir.path()), Arc::clone(&facility));
        facility.deliver(SignalKind::Terminate);
        switch.wait_for_completion().await;
        assert_eq!(switch.phase(), Phase::Completed);
        assert_eq!(switch.stats().trigger_counts.get(&TriggerReason::ProcessSignal), Some(&1));
    }
}
