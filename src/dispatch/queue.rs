use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::model::Priority;
use crate::runtime::task::TaskExecutionRunnable;

/// Dispatch order, smallest first: workflow priority, task priority, task-group priority
/// (higher first, absent last), first submit time, insertion sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DispatchKey {
    pub workflow_priority: Priority,
    pub task_priority: Priority,
    pub task_group_priority: Reverse<Option<i32>>,
    pub first_submit_time: DateTime<Utc>,
    pub seq: u64,
}

struct ReadyEntry {
    key: DispatchKey,
    runnable: Arc<TaskExecutionRunnable>,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key.cmp(&other.key)
    }
}

struct DelayedEntry {
    eligible_at: Instant,
    entry: ReadyEntry,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.eligible_at == other.eligible_at && self.entry.key.seq == other.entry.key.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.eligible_at
            .cmp(&other.eligible_at)
            .then(self.entry.key.seq.cmp(&other.entry.key.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    ready: BinaryHeap<Reverse<ReadyEntry>>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
}

impl QueueInner {
    fn promote_expired(&mut self, now: Instant) {
        while let Some(Reverse(head)) = self.delayed.peek() {
            if head.eligible_at > now {
                break;
            }
            if let Some(Reverse(delayed)) = self.delayed.pop() {
                self.ready.push(Reverse(delayed.entry));
            }
        }
    }
}

/// Process-wide priority queue feeding the dispatch loopers. Producers never block;
/// consumers block in [`Self::take_task_execute_runnable`] until an entry is eligible.
pub struct GlobalTaskDispatchWaitingQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    seq: AtomicU64,
}

impl Default for GlobalTaskDispatchWaitingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalTaskDispatchWaitingQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn entry_for(&self, runnable: Arc<TaskExecutionRunnable>) -> ReadyEntry {
        let key = runnable.update(|task| DispatchKey {
            workflow_priority: task.workflow_instance_priority,
            task_priority: task.priority,
            task_group_priority: Reverse(task.task_group_priority),
            first_submit_time: task.first_submit_time,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        });
        ReadyEntry { key, runnable }
    }

    pub fn dispatch_task_execute_runnable(&self, runnable: Arc<TaskExecutionRunnable>) {
        let entry = self.entry_for(runnable);
        trace!(task_instance_id = entry.runnable.task_instance_id(), "Enqueued for dispatch");
        self.inner.lock().ready.push(Reverse(entry));
        self.notify.notify_one();
    }

    /// Enqueues an entry that stays invisible to consumers for `delay_ms`.
    pub fn dispatch_task_execute_runnable_with_delay(&self, runnable: Arc<TaskExecutionRunnable>, delay_ms: u64) {
        let entry = self.entry_for(runnable);
        let eligible_at = Instant::now() + Duration::from_millis(delay_ms);
        debug!(
            task_instance_id = entry.runnable.task_instance_id(),
            delay_ms,
            "Enqueued for delayed dispatch"
        );
        self.inner
            .lock()
            .delayed
            .push(Reverse(DelayedEntry { eligible_at, entry }));
        self.notify.notify_one();
    }

    /// Blocks until an entry is eligible and removes it.
    pub async fn take_task_execute_runnable(&self) -> Arc<TaskExecutionRunnable> {
        loop {
            // Registered before the heaps are inspected so an insert in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut inner = self.inner.lock();
                inner.promote_expired(Instant::now());
                if let Some(Reverse(entry)) = inner.ready.pop() {
                    let has_more = !inner.ready.is_empty();
                    drop(inner);
                    if has_more {
                        // Pass the wakeup on so a sibling consumer picks up the rest.
                        self.notify.notify_one();
                    }
                    return entry.runnable;
                }
                inner.delayed.peek().map(|Reverse(d)| d.eligible_at)
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Non-blocking variant of [`Self::take_task_execute_runnable`].
    pub fn try_take_task_execute_runnable(&self) -> Option<Arc<TaskExecutionRunnable>> {
        let mut inner = self.inner.lock();
        inner.promote_expired(Instant::now());
        inner.ready.pop().map(|Reverse(entry)| entry.runnable)
    }

    /// Ready plus delayed entries.
    pub fn get_waiting_dispatch_task_number(&self) -> usize {
        let inner = self.inner.lock();
        inner.ready.len() + inner.delayed.len()
    }

    /// Drops every entry of one workflow instance. Returns how many were removed.
    pub fn remove_workflow_instance(&self, workflow_instance_id: i64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.ready.len() + inner.delayed.len();
        inner
            .ready
            .retain(|Reverse(e)| e.runnable.workflow_instance_id() != workflow_instance_id);
        inner
            .delayed
            .retain(|Reverse(d)| d.entry.runnable.workflow_instance_id() != workflow_instance_id);
        before - (inner.ready.len() + inner.delayed.len())
    }
}
