//! Typed task builder and its type-erased form.
//!
//! A [`Task<T>`] bundles a body producing `T` with the callbacks that observe
//! it. The processor stores tasks of different output types side by side, so
//! each one is erased into a [`Job`] before it is queued.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use kiln_core::{KilnError, TaskId};
use parking_lot::Mutex;

use crate::context::TaskContext;
use crate::types::{TaskKind, TaskPriority};

type Body<T> = Box<dyn FnOnce(&TaskContext) -> kiln_core::Result<T> + Send>;
type CompletionFn<T> = Box<dyn FnOnce(TaskCompletion<T>) + Send>;
pub(crate) type ProgressFn = Arc<Mutex<Box<dyn FnMut(f32) + Send>>>;
pub(crate) type CancelFn = Box<dyn FnOnce() + Send>;
pub(crate) type Delivery = Box<dyn FnOnce() + Send>;

/// How a task ended. Exactly one of these reaches the completion callback.
#[derive(Debug, PartialEq)]
pub enum TaskCompletion<T> {
    /// Body returned a value.
    Completed(T),
    /// Body returned an error or panicked.
    Failed(KilnError),
    /// Cancelled before or during execution. Carries no error.
    Cancelled,
}

impl<T> TaskCompletion<T> {
    /// Collapse into a result, mapping cancellation to
    /// [`KilnError::GenerationCancelled`].
    ///
    /// # Errors
    ///
    /// The failure error, or `GenerationCancelled`.
    pub fn into_result(self) -> kiln_core::Result<T> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(err) => Err(err),
            Self::Cancelled => Err(KilnError::GenerationCancelled),
        }
    }

    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Terminal outcome recorded on the task, without the payload.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Outcome {
    Completed,
    Failed(KilnError),
    Cancelled,
}

/// A unit of work with a typed result.
///
/// The ID is assigned at construction so callers can record it before
/// submitting.
pub struct Task<T> {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) priority: TaskPriority,
    pub(crate) description: Option<String>,
    body: Body<T>,
    on_complete: Option<CompletionFn<T>>,
    pub(crate) on_progress: Option<ProgressFn>,
    pub(crate) on_cancel: Option<CancelFn>,
}

impl<T: Send + 'static> Task<T> {
    /// Create a task running `body` on a worker thread.
    pub fn new<F>(kind: TaskKind, priority: TaskPriority, body: F) -> Self
    where
        F: FnOnce(&TaskContext) -> kiln_core::Result<T> + Send + 'static,
    {
        Self {
            id: TaskId::new(),
            kind,
            priority,
            description: None,
            body: Box::new(body),
            on_complete: None,
            on_progress: None,
            on_cancel: None,
        }
    }

    /// The task's identifier.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Attach a human-readable description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Called exactly once when the task ends, whatever the path.
    #[must_use]
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(TaskCompletion<T>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Called with each progress report from the body.
    #[must_use]
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: FnMut(f32) + Send + 'static,
    {
        self.on_progress = Some(Arc::new(Mutex::new(Box::new(f))));
        self
    }

    /// Called once when cancellation is requested.
    #[must_use]
    pub fn on_cancel<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_cancel = Some(Box::new(f));
        self
    }

    /// Split into bookkeeping parts and the erased job.
    pub(crate) fn into_parts(self) -> (TaskParts, Box<dyn Job>) {
        let parts = TaskParts {
            id: self.id,
            kind: self.kind,
            priority: self.priority,
            description: self.description,
            on_progress: self.on_progress,
            on_cancel: self.on_cancel,
        };
        let job = TypedJob {
            body: self.body,
            on_complete: self.on_complete,
        };
        (parts, Box::new(job))
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

pub(crate) struct TaskParts {
    pub id: TaskId,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub description: Option<String>,
    pub on_progress: Option<ProgressFn>,
    pub on_cancel: Option<CancelFn>,
}

/// Type-erased task body plus its completion callback.
pub(crate) trait Job: Send {
    /// Run the body, returning the recorded outcome and the completion
    /// delivery to dispatch.
    fn execute(self: Box<Self>, ctx: &TaskContext) -> (Outcome, Delivery);

    /// Drop the body unrun, returning a delivery reporting cancellation.
    fn abandon(self: Box<Self>) -> Delivery;
}

struct TypedJob<T> {
    body: Body<T>,
    on_complete: Option<CompletionFn<T>>,
}

impl<T: Send + 'static> Job for TypedJob<T> {
    fn execute(self: Box<Self>, ctx: &TaskContext) -> (Outcome, Delivery) {
        let Self { body, on_complete } = *self;
        let result = catch_unwind(AssertUnwindSafe(|| body(ctx)));

        let completion = match result {
            Ok(_) if ctx.is_cancelled() => TaskCompletion::Cancelled,
            Ok(Ok(value)) => TaskCompletion::Completed(value),
            Ok(Err(err)) if err.is_cancellation() => TaskCompletion::Cancelled,
            Ok(Err(err)) => TaskCompletion::Failed(err),
            Err(payload) => TaskCompletion::Failed(KilnError::Unknown(format!(
                "task panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };

        let outcome = match &completion {
            TaskCompletion::Completed(_) => Outcome::Completed,
            TaskCompletion::Failed(err) => Outcome::Failed(err.clone()),
            TaskCompletion::Cancelled => Outcome::Cancelled,
        };
        (outcome, completion_delivery(on_complete, completion))
    }

    fn abandon(self: Box<Self>) -> Delivery {
        completion_delivery(self.on_complete, TaskCompletion::Cancelled)
    }
}

fn completion_delivery<T: Send + 'static>(
    on_complete: Option<CompletionFn<T>>,
    completion: TaskCompletion<T>,
) -> Delivery {
    Box::new(move || {
        if let Some(callback) = on_complete {
            callback(completion);
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
