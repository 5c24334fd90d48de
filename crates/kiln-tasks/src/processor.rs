//! The task processor: priority queue, worker dispatch, cancellation.
//!
//! Locking: the scheduler mutex may be held while locking a record's state,
//! never the other way round. Callbacks and task bodies never run under
//! either lock.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kiln_core::{EventEmitter, KilnError, TaskId};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::context::TaskContext;
use crate::task::{CancelFn, Delivery, Job, Outcome, ProgressFn, Task, TaskParts};
use crate::types::{TaskEvent, TaskKind, TaskPriority, TaskSnapshot, TaskState, TaskStatistics};

// =============================================================================
// TaskRecord
// =============================================================================

/// Registry entry for one submitted task.
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub cancelled: Arc<AtomicBool>,
    pub state: Mutex<RecordState>,
    pub on_progress: Option<ProgressFn>,
    on_cancel: Mutex<Option<CancelFn>>,
}

pub(crate) struct RecordState {
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f32,
    pub error: Option<KilnError>,
}

impl TaskRecord {
    fn new(parts: TaskParts) -> Self {
        Self {
            id: parts.id,
            kind: parts.kind,
            priority: parts.priority,
            description: parts.description,
            created_at: Utc::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(RecordState {
                state: TaskState::Pending,
                started_at: None,
                completed_at: None,
                progress: 0.0,
                error: None,
            }),
            on_progress: parts.on_progress,
            on_cancel: Mutex::new(parts.on_cancel),
        }
    }

    fn current_state(&self) -> TaskState {
        self.state.lock().state
    }

    /// Move to `next` if the lifecycle allows it.
    fn transition(&self, next: TaskState) -> bool {
        let mut inner = self.state.lock();
        if !inner.state.can_transition_to(next) {
            return false;
        }
        inner.state = next;
        let now = Utc::now();
        if next == TaskState::Running {
            inner.started_at = Some(now);
        } else {
            inner.completed_at = Some(now);
        }
        true
    }

    fn finish(&self, outcome: &Outcome) {
        let next = match outcome {
            Outcome::Completed => TaskState::Completed,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Cancelled => TaskState::Cancelled,
        };
        if !self.transition(next) {
            return;
        }
        let mut inner = self.state.lock();
        match outcome {
            Outcome::Completed => inner.progress = 1.0,
            Outcome::Failed(err) => inner.error = Some(err.clone()),
            Outcome::Cancelled => {}
        }
    }

    fn take_cancel_handler(&self) -> Option<CancelFn> {
        self.on_cancel.lock().take()
    }

    fn snapshot(&self) -> TaskSnapshot {
        let inner = self.state.lock();
        TaskSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            priority: self.priority,
            state: inner.state,
            description: self.description.clone(),
            created_at: self.created_at,
            started_at: inner.started_at,
            completed_at: inner.completed_at,
            progress: inner.progress,
            cancelled: self.cancelled.load(Ordering::Acquire),
            error: inner.error.clone(),
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

#[derive(PartialEq, Eq)]
struct QueueEntry {
    priority: TaskPriority,
    seq: u64,
    id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence (older) first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Scheduler {
    queue: BinaryHeap<QueueEntry>,
    pending: HashMap<TaskId, Box<dyn Job>>,
    running: usize,
    max_concurrent: usize,
    accepting: bool,
    paused: bool,
    next_seq: u64,
}

impl Scheduler {
    fn enqueue(&mut self, id: TaskId, priority: TaskPriority, job: Box<dyn Job>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let _ = self.pending.insert(id.clone(), job);
        self.queue.push(QueueEntry { priority, seq, id });
    }

    /// Drop heap entries whose task is no longer pending. Cancelled entries
    /// are otherwise only discarded when popped, which never happens while
    /// paused.
    fn compact(&mut self) {
        if self.queue.len() > 2 * self.pending.len() {
            let pending = &self.pending;
            self.queue.retain(|entry| pending.contains_key(&entry.id));
        }
    }

    fn can_start(&self) -> bool {
        self.accepting && !self.paused && self.running < self.max_concurrent
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && self.pending.is_empty()
    }
}

// =============================================================================
// Shared state
// =============================================================================

pub(crate) struct Shared {
    scheduler: Mutex<Scheduler>,
    records: DashMap<TaskId, Arc<TaskRecord>>,
    pub events: EventEmitter<TaskEvent>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    runtime: Handle,
    idle: Notify,
}

impl Shared {
    /// Queue a callback on the delivery dispatcher.
    pub fn dispatch(&self, delivery: Delivery) {
        if self.deliveries.send(delivery).is_err() {
            warn!("delivery dispatcher closed, dropping callback");
        }
    }

    fn record(&self, id: &TaskId) -> Option<Arc<TaskRecord>> {
        self.records.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Start as many pending tasks as capacity allows.
    fn pump(self: &Arc<Self>) {
        let mut starts = Vec::new();
        {
            let mut sched = self.scheduler.lock();
            while sched.can_start() {
                let Some(entry) = sched.queue.pop() else {
                    break;
                };
                // Entries of cancelled tasks stay in the heap until popped.
                let Some(job) = sched.pending.remove(&entry.id) else {
                    continue;
                };
                let Some(record) = self.record(&entry.id) else {
                    continue;
                };
                if !record.transition(TaskState::Running) {
                    continue;
                }
                sched.running += 1;
                starts.push((record, job));
            }
        }

        for (record, job) in starts {
            debug!(task_id = %record.id, kind = ?record.kind, priority = ?record.priority, "task started");
            let _ = self.events.emit(TaskEvent::Started {
                id: record.id.clone(),
                kind: record.kind,
            });
            let shared = Arc::clone(self);
            let _ = self
                .runtime
                .spawn_blocking(move || shared.run(&record, job));
        }
    }

    /// Worker entry point.
    fn run(self: Arc<Self>, record: &Arc<TaskRecord>, job: Box<dyn Job>) {
        let ctx = TaskContext::new(Arc::clone(record), Arc::clone(&self));
        let (outcome, delivery) = job.execute(&ctx);
        record.finish(&outcome);
        {
            let mut sched = self.scheduler.lock();
            sched.running = sched.running.saturating_sub(1);
        }

        let id = record.id.clone();
        let event = match outcome {
            Outcome::Completed => {
                debug!(task_id = %id, kind = ?record.kind, "task completed");
                TaskEvent::Completed { id }
            }
            Outcome::Failed(error) => {
                error!(task_id = %id, kind = ?record.kind, error = %error, "task failed");
                TaskEvent::Failed { id, error }
            }
            Outcome::Cancelled => {
                debug!(task_id = %id, kind = ?record.kind, "task cancelled while running");
                TaskEvent::Cancelled { id }
            }
        };
        let _ = self.events.emit(event);
        self.dispatch(delivery);
        self.pump();
        self.notify_if_idle();
    }

    fn cancel(&self, id: &TaskId) -> bool {
        let Some(record) = self.record(id) else {
            return false;
        };

        let abandoned = {
            let mut sched = self.scheduler.lock();
            if record.current_state().is_terminal() {
                return false;
            }
            if record.cancelled.swap(true, Ordering::AcqRel) {
                return false;
            }
            match sched.pending.remove(id) {
                Some(job) => {
                    let _ = record.transition(TaskState::Cancelled);
                    sched.compact();
                    Some(job)
                }
                None => None,
            }
        };

        if let Some(handler) = record.take_cancel_handler() {
            self.dispatch(handler);
        }
        if let Some(job) = abandoned {
            debug!(task_id = %id, "pending task cancelled");
            let _ = self.events.emit(TaskEvent::Cancelled { id: id.clone() });
            self.dispatch(job.abandon());
            self.notify_if_idle();
        } else {
            debug!(task_id = %id, "cancellation requested for running task");
        }
        true
    }

    fn notify_if_idle(&self) {
        if self.scheduler.lock().is_idle() {
            self.idle.notify_waiters();
        }
    }
}

// =============================================================================
// TaskProcessor
// =============================================================================

/// Bounded-concurrency executor for [`Task`]s.
///
/// Bodies run on Tokio's blocking pool; callbacks run on one dispatcher task
/// in the order they were produced. Dropping the processor stops it.
pub struct TaskProcessor {
    shared: Arc<Shared>,
}

impl TaskProcessor {
    /// Create a processor on the current Tokio runtime.
    ///
    /// `max_concurrent` is raised to 1 if zero.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_runtime(max_concurrent, Handle::current())
    }

    /// Create a processor that spawns onto `runtime`.
    pub fn with_runtime(max_concurrent: usize, runtime: Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let _ = runtime.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(delivery)).is_err() {
                    error!("task callback panicked");
                }
            }
        });

        let shared = Arc::new(Shared {
            scheduler: Mutex::new(Scheduler {
                queue: BinaryHeap::new(),
                pending: HashMap::new(),
                running: 0,
                max_concurrent: max_concurrent.max(1),
                accepting: true,
                paused: false,
                next_seq: 0,
            }),
            records: DashMap::new(),
            events: EventEmitter::new(),
            deliveries: tx,
            runtime,
            idle: Notify::new(),
        });
        Self { shared }
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Register a task and schedule it.
    ///
    /// Returns `None` without running anything (and without calling the
    /// task's callbacks) when the processor has been stopped.
    pub fn submit<T: Send + 'static>(&self, task: Task<T>) -> Option<TaskId> {
        let (parts, job) = task.into_parts();
        let id = parts.id.clone();
        let kind = parts.kind;
        let priority = parts.priority;
        {
            let mut sched = self.shared.scheduler.lock();
            if !sched.accepting {
                warn!(task_id = %id, kind = ?kind, "processor stopped, rejecting task");
                return None;
            }
            let _ = self
                .shared
                .records
                .insert(id.clone(), Arc::new(TaskRecord::new(parts)));
            sched.enqueue(id.clone(), priority, job);
        }

        debug!(task_id = %id, kind = ?kind, priority = ?priority, "task submitted");
        let _ = self.shared.events.emit(TaskEvent::Submitted {
            id: id.clone(),
            kind,
            priority,
        });
        self.shared.pump();
        Some(id)
    }

    /// Submit several tasks, returning the IDs of those accepted.
    pub fn submit_batch<T, I>(&self, tasks: I) -> Vec<TaskId>
    where
        T: Send + 'static,
        I: IntoIterator<Item = Task<T>>,
    {
        tasks
            .into_iter()
            .filter_map(|task| self.submit(task))
            .collect()
    }

    // ── Cancellation ────────────────────────────────────────────────

    /// Request cancellation.
    ///
    /// A pending task is cancelled on the spot and never starts. A running
    /// task only has its flag set; its body is expected to notice. Returns
    /// `false` for unknown, finished or already-cancelled tasks.
    pub fn cancel(&self, id: &TaskId) -> bool {
        self.shared.cancel(id)
    }

    /// Cancel every unfinished task. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.cancel_matching(|_| true)
    }

    /// Cancel every unfinished task of `kind`.
    pub fn cancel_kind(&self, kind: TaskKind) -> usize {
        self.cancel_matching(|record| record.kind == kind)
    }

    fn cancel_matching(&self, predicate: impl Fn(&TaskRecord) -> bool) -> usize {
        let ids: Vec<TaskId> = self
            .shared
            .records
            .iter()
            .filter(|r| predicate(r.value()) && !r.value().current_state().is_terminal())
            .map(|r| r.key().clone())
            .collect();
        ids.iter().filter(|id| self.shared.cancel(id)).count()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Stop accepting tasks and cancel everything outstanding.
    pub fn stop(&self) {
        self.shared.scheduler.lock().accepting = false;
        let cancelled = self.cancel_all();
        info!(cancelled, "task processor stopped");
    }

    /// Accept tasks again after [`stop`](Self::stop).
    pub fn start(&self) {
        self.shared.scheduler.lock().accepting = true;
        info!("task processor started");
        self.shared.pump();
    }

    /// Stop starting new tasks. Running tasks are unaffected.
    pub fn pause(&self) {
        self.shared.scheduler.lock().paused = true;
        debug!("task processor paused");
    }

    /// Resume starting tasks.
    pub fn resume(&self) {
        self.shared.scheduler.lock().paused = false;
        debug!("task processor resumed");
        self.shared.pump();
    }

    /// Whether submissions are accepted.
    pub fn is_running(&self) -> bool {
        self.shared.scheduler.lock().accepting
    }

    /// Whether task starts are suspended.
    pub fn is_paused(&self) -> bool {
        self.shared.scheduler.lock().paused
    }

    /// Change the concurrency cap. Extra capacity is used immediately.
    ///
    /// # Errors
    ///
    /// [`KilnError::InvalidArgument`] when `max` is zero.
    pub fn set_max_concurrent(&self, max: usize) -> kiln_core::Result<()> {
        if max == 0 {
            return Err(KilnError::invalid_argument(
                "max concurrent tasks must be at least 1",
            ));
        }
        self.shared.scheduler.lock().max_concurrent = max;
        self.shared.pump();
        Ok(())
    }

    /// Current concurrency cap.
    pub fn max_concurrent(&self) -> usize {
        self.shared.scheduler.lock().max_concurrent
    }

    /// Wait until nothing is running or pending.
    ///
    /// Never returns while the processor is paused with pending work.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();
            if self.shared.scheduler.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Snapshot of one task.
    pub fn task(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.shared.record(id).map(|r| r.snapshot())
    }

    /// Snapshots of every registered task of `kind`.
    pub fn tasks_of_kind(&self, kind: TaskKind) -> Vec<TaskSnapshot> {
        self.snapshots(|s| s.kind == kind)
    }

    /// Snapshots of every registered task in `state`.
    pub fn tasks_in_state(&self, state: TaskState) -> Vec<TaskSnapshot> {
        self.snapshots(|s| s.state == state)
    }

    /// Snapshots of every registered task, oldest first.
    pub fn all_tasks(&self) -> Vec<TaskSnapshot> {
        self.snapshots(|_| true)
    }

    fn snapshots(&self, keep: impl Fn(&TaskSnapshot) -> bool) -> Vec<TaskSnapshot> {
        let mut out: Vec<TaskSnapshot> = self
            .shared
            .records
            .iter()
            .map(|r| r.value().snapshot())
            .filter(|s| keep(s))
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Counts by state plus processor flags.
    pub fn statistics(&self) -> TaskStatistics {
        let mut stats = TaskStatistics::default();
        for record in self.shared.records.iter() {
            stats.total += 1;
            match record.value().current_state() {
                TaskState::Pending => stats.pending += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
                TaskState::Failed => stats.failed += 1,
            }
        }
        let sched = self.shared.scheduler.lock();
        stats.max_concurrent = sched.max_concurrent;
        stats.is_running = sched.accepting;
        stats.is_paused = sched.paused;
        stats
    }

    // ── Registry maintenance ────────────────────────────────────────

    /// Remove a finished task from the registry.
    pub fn evict(&self, id: &TaskId) -> bool {
        self.shared
            .records
            .remove_if(id, |_, r| r.current_state().is_terminal())
            .is_some()
    }

    /// Remove every finished task. Returns how many were removed.
    pub fn evict_finished(&self) -> usize {
        let before = self.shared.records.len();
        self.shared
            .records
            .retain(|_, r| !r.current_state().is_terminal());
        before.saturating_sub(self.shared.records.len())
    }

    // ── Observers ───────────────────────────────────────────────────

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        self.shared.scheduler.lock().accepting = false;
        let _ = self.cancel_all();
    }
}

impl std::fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("statistics", &self.statistics())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
