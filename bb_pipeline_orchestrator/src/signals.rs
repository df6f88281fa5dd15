// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Orchestrator
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # Signal facility (spec.md §4.8, §5, §6, §9)
//!
//! The lower-level process-signal hook the kill switch subscribes to. Per
//! the source's circular reference between kill switch and signal
//! facility, this is modeled as a one-way registration: the kill switch
//! hands the facility a closure at construction and the facility calls it
//! exactly once per interrupt/terminate signal. The facility never calls
//! back into the kill switch synchronously during a shutdown it is
//! driving — it only flips `shutdown_in_progress` so a signal arriving
//! mid-shutdown is logged and ignored rather than re-entering the phase
//! machine.
//!
//! This is the one unavoidable process-wide singleton the design notes
//! allow: a tenant process has exactly one OS signal disposition. It is
//! still hidden behind a constructed object rather than a `static`, so
//! tests build their own facility and never touch the real signal mask.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Portable signal kinds the facility forwards. Behavior on any other
/// signal is undefined (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Interrupt,
    Terminate,
}

type Hook = dyn Fn(SignalKind) + Send + Sync;

struct Inner {
    hook: Option<Arc<Hook>>,
}

/// Process-wide signal registration point. Construct one per process (or
/// one per test), register a hook, then call [`SignalFacility::spawn_listener`]
/// once a tokio runtime is running.
pub struct SignalFacility {
    inner: Mutex<Inner>,
    shutdown_in_progress: AtomicBool,
}

impl SignalFacility {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner { hook: None }),
            shutdown_in_progress: AtomicBool::new(false),
        })
    }

    /// One-way registration: replaces any previously registered hook.
    /// The kill switch calls this once, at construction, with a closure
    /// that triggers its own phase machine.
    pub fn register_hook<F>(&self, hook: F)
    where
        F: Fn(SignalKind) + Send + Sync + 'static,
    {
        self.inner.lock().hook = Some(Arc::new(hook));
    }

    pub fn mark_shutdown_started(&self) {
        self.shutdown_in_progress.store(true, Ordering::SeqCst);
    }

    pub fn mark_shutdown_finished(&self) {
        self.shutdown_in_progress.store(false, Ordering::SeqCst);
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        self.shutdown_in_progress.load(Ordering::SeqCst)
    }

    /// Delivers a signal to the registered hook, or logs and ignores it
    /// if a shutdown this facility already started is still running
    /// (spec.md §6: "a signal received during an in-progress shutdown
    /// is logged and ignored").
    pub fn deliver(&self, kind: SignalKind) {
        if self.is_shutdown_in_progress() {
            tracing::warn!(?kind, "signal received during in-progress shutdown, ignoring");
            return;
        }
        let hook = self.inner.lock().hook.clone();
        // Call outside the lock: the hook may itself touch this facility
        // (e.g. mark_shutdown_started), which would deadlock if we held
        // the mutex across the call.
        match hook {
            Some(hook) => hook(kind),
            None => tracing::debug!(?kind, "signal received with no registered hook"),
        }
    }

    /// Performs the facility's terminal action for kill-switch phase 4
    /// ("finalize", spec.md §4.8): this process does not call `exit()`
    /// itself, so there is nothing destructive to do, but the call site
    /// exists so a host process can later hook in a real exit policy.
    pub fn finalize(&self) {
        tracing::info!("signal facility finalized");
    }

    /// Spawns the OS listener task. Unix listens for SIGTERM and SIGINT
    /// separately; every other platform falls back to `ctrl_c` only, per
    /// spec.md §6's "behavior on other signals is undefined".
    pub fn spawn_listener(self: &Arc<Self>) {
        let facility = Arc::clone(self);
        tokio::spawn(async move {
            facility.listen().await;
        });
    }

    #[cfg(unix)]
    async fn listen(self: Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind as UnixSignalKind};

        let mut term = match signal(UnixSignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(%err, "failed to register SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(UnixSignalKind::interrupt()) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(%err, "failed to register SIGINT handler");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = term.recv() => self.deliver(SignalKind::Terminate),
                _ = int.recv() => self.deliver(SignalKind::Interrupt),
            }
        }
    }

    #[cfg(not(unix))]
    async fn listen(self: Arc<Self>) {
        loop {
            if tokio::signal::ctrl_c().await.is_ok() {
                self.deliver(SignalKind::Interrupt);
            } else {
                break;
            }
        }
    }
}

impl Default for SignalFacility {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner { hook: None }),
            shutdown_in_progress: AtomicBool::new(false),
        }
    }
}
