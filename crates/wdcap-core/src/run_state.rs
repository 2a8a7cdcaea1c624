//! Process-wide flags replacing the volatile globals of the original implementation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Shared, `Arc`-wrapped run state polled by signal handlers, processing threads,
/// and the main thread. Never blocks: every field is a plain atomic.
#[derive(Debug, Default)]
pub struct RunState {
    halted: AtomicBool,
    restart_requested: AtomicBool,
    threads_ended: AtomicUsize,
}

impl RunState {
    pub fn new() -> Self {
        RunState::default()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    pub fn set_halted(&self) {
        self.halted.store(true, Ordering::Relaxed);
    }

    pub fn is_restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::Relaxed)
    }

    pub fn set_restart_requested(&self) {
        self.restart_requested.store(true, Ordering::Relaxed);
    }

    pub fn clear_restart_requested(&self) {
        self.restart_requested.store(false, Ordering::Relaxed);
    }

    /// Records that one more processing thread has drained its final interval and
    /// entered `ENDING`. Returns the new total.
    pub fn mark_thread_ended(&self) -> usize {
        self.threads_ended.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn threads_ended(&self) -> usize {
        self.threads_ended.load(Ordering::SeqCst)
    }
}
