//! # kiln-tasks
//!
//! Background task processor for the kiln runtime.
//!
//! A [`TaskProcessor`] runs typed units of work on Tokio's blocking pool,
//! never more than a configured number at once. Waiting tasks are started in
//! priority order (Critical > High > Normal > Low, FIFO within a priority).
//!
//! - **Lifecycle**: `Pending → Running → {Completed | Cancelled | Failed}`,
//!   tracked per task and queryable through [`TaskSnapshot`]s
//! - **Cancellation**: cooperative; a cancelled pending task never starts,
//!   a running one observes [`TaskContext::is_cancelled`]
//! - **Fault isolation**: errors and panics in a task body become a `Failed`
//!   state carrying a [`KilnError`](kiln_core::KilnError)
//! - **Delivery**: completion, progress and cancellation callbacks run in
//!   submission order on a single dispatcher, never under a processor lock

#![deny(unsafe_code)]

pub mod context;
pub mod processor;
pub mod task;
pub mod types;

pub use context::TaskContext;
pub use processor::TaskProcessor;
pub use task::{Task, TaskCompletion};
pub use types::{TaskEvent, TaskKind, TaskPriority, TaskSnapshot, TaskState, TaskStatistics};
