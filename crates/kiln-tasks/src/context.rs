//! Handle given to a running task body.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kiln_core::TaskId;

use crate::processor::{Shared, TaskRecord};
use crate::types::{TaskEvent, TaskKind};

/// What a task body can see of its own execution.
///
/// Cancellation is cooperative: long-running bodies poll
/// [`is_cancelled`](Self::is_cancelled) at convenient boundaries and return
/// early. Everything sent through [`deliver`](Self::deliver) or
/// [`report_progress`](Self::report_progress) reaches its callback in order,
/// before the task's completion callback.
pub struct TaskContext {
    record: Arc<TaskRecord>,
    shared: Arc<Shared>,
}

impl TaskContext {
    pub(crate) fn new(record: Arc<TaskRecord>, shared: Arc<Shared>) -> Self {
        Self { record, shared }
    }

    /// ID of the running task.
    pub fn id(&self) -> &TaskId {
        &self.record.id
    }

    /// Kind of the running task.
    pub fn kind(&self) -> TaskKind {
        self.record.kind
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.record.cancelled.load(Ordering::Acquire)
    }

    /// Shared cancellation flag, for code that polls without the context.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.record.cancelled)
    }

    /// Report fractional progress. Values are clamped to `[0, 1]`.
    pub fn report_progress(&self, progress: f32) {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        self.record.state.lock().progress = progress;
        let _ = self.shared.events.emit(TaskEvent::Progress {
            id: self.record.id.clone(),
            progress,
        });
        if let Some(handler) = &self.record.on_progress {
            let handler = Arc::clone(handler);
            self.shared.dispatch(Box::new(move || {
                let mut callback = handler.lock();
                (*callback)(progress);
            }));
        }
    }

    /// Run `f` on the delivery dispatcher, after everything delivered so far.
    pub fn deliver<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.dispatch(Box::new(f));
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.record.id)
            .field("kind", &self.record.kind)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
