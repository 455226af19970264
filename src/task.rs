//! Ready-to-run continuations
//!
//! A task is an erased closure queued on a shard's pending-task FIFO. It
//! is owned exclusively by the reactor until executed, then destroyed.
//! Tasks must not block.

/// An erased continuation with a single `run()` operation.
pub struct Task {
    f: Box<dyn FnOnce()>,
}

impl Task {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// Execute and destroy the task.
    pub fn run(self) {
        (self.f)();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}
