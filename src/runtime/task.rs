use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::config::DispatchRetryConfig;
use crate::dispatch::queue::GlobalTaskDispatchWaitingQueue;
use crate::model::{TaskExecutionStatus, TaskInstance};
use crate::rpc::TaskDispatchRequest;

/// Wraps one task instance on its way from the workflow runnable, through the global
/// queue and a dispatcher, to a worker. State changes go through compare-and-set so the
/// looper, the dispatcher and the owning workflow never overwrite each other.
pub struct TaskExecutionRunnable {
    task_instance_id: i64,
    workflow_instance_id: i64,
    task_code: i64,
    task_instance: Mutex<TaskInstance>,
    queue: Arc<GlobalTaskDispatchWaitingQueue>,
    dispatch_failures: AtomicU32,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for TaskExecutionRunnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutionRunnable")
            .field("task_instance_id", &self.task_instance_id)
            .field("workflow_instance_id", &self.workflow_instance_id)
            .field("task_code", &self.task_code)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskExecutionRunnable {
    pub fn new(task_instance: TaskInstance, queue: Arc<GlobalTaskDispatchWaitingQueue>) -> Arc<Self> {
        Arc::new(Self {
            task_instance_id: task_instance.id,
            workflow_instance_id: task_instance.workflow_instance_id,
            task_code: task_instance.task_code,
            task_instance: Mutex::new(task_instance),
            queue,
            dispatch_failures: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn task_instance_id(&self) -> i64 {
        self.task_instance_id
    }

    pub fn workflow_instance_id(&self) -> i64 {
        self.workflow_instance_id
    }

    pub fn task_code(&self) -> i64 {
        self.task_code
    }

    pub fn snapshot(&self) -> TaskInstance {
        self.task_instance.lock().clone()
    }

    pub fn state(&self) -> TaskExecutionStatus {
        self.task_instance.lock().state
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut TaskInstance) -> R) -> R {
        let mut task = self.task_instance.lock();
        f(&mut *task)
    }

    /// Sets `new` only if the current state is `expected`.
    pub fn compare_and_set_state(&self, expected: TaskExecutionStatus, new: TaskExecutionStatus) -> bool {
        let mut task = self.task_instance.lock();
        if task.state != expected {
            return false;
        }
        task.state = new;
        if new.is_finished() && task.end_time.is_none() {
            task.end_time = Some(Utc::now());
        }
        true
    }

    /// Claims the task for sending to `host`.
    pub fn mark_dispatched(&self, host: &str) -> bool {
        let mut task = self.task_instance.lock();
        if task.state != TaskExecutionStatus::SubmittedSuccess {
            return false;
        }
        task.state = TaskExecutionStatus::Dispatch;
        task.host = Some(host.to_string());
        true
    }

    /// Undoes [`Self::mark_dispatched`] after the send failed.
    pub fn revert_dispatch(&self) -> bool {
        let mut task = self.task_instance.lock();
        if task.state != TaskExecutionStatus::Dispatch {
            return false;
        }
        task.state = TaskExecutionStatus::SubmittedSuccess;
        task.host = None;
        true
    }

    /// Marks the owning workflow as stopping. Dispatch failures of a cancelled task end it
    /// instead of requeueing it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Pushes this runnable onto the global queue. A retry attempt is held back until its
    /// retry interval has passed.
    pub fn dispatch(self: &Arc<Self>) {
        let delay = self.remaining_retry_delay();
        if delay.is_zero() {
            self.queue.dispatch_task_execute_runnable(self.clone());
        } else {
            self.queue
                .dispatch_task_execute_runnable_with_delay(self.clone(), delay.as_millis() as u64);
        }
    }

    pub fn dispatch_with_delay(self: &Arc<Self>, delay_ms: u64) {
        self.queue
            .dispatch_task_execute_runnable_with_delay(self.clone(), delay_ms);
    }

    /// Requeues after a transient dispatch failure. Returns the delay used, or `None` once
    /// the policy's attempts are exhausted.
    pub fn requeue_after_dispatch_failure(self: &Arc<Self>, policy: &DispatchRetryConfig) -> Option<Duration> {
        let attempt = self.dispatch_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > policy.max_attempts {
            return None;
        }
        let delay = policy.delay_for(attempt);
        self.dispatch_with_delay(delay.as_millis() as u64);
        Some(delay)
    }

    pub fn dispatch_failures(&self) -> u32 {
        self.dispatch_failures.load(Ordering::SeqCst)
    }

    pub fn build_dispatch_request(&self) -> TaskDispatchRequest {
        let task = self.task_instance.lock();
        TaskDispatchRequest {
            request_id: Uuid::new_v4(),
            task_instance_id: task.id,
            workflow_instance_id: task.workflow_instance_id,
            task_code: task.task_code,
            task_name: task.name.clone(),
            task_type: task.task_type.clone(),
            task_params: task.task_params.clone(),
            var_pool: task.var_pool.clone(),
            worker_group: task.worker_group.clone(),
            host: task.host.clone().unwrap_or_default(),
            retry_times: task.retry_times,
        }
    }

    fn remaining_retry_delay(&self) -> Duration {
        let task = self.task_instance.lock();
        if task.retry_times == 0 || task.retry_interval_ms == 0 {
            return Duration::ZERO;
        }
        let interval_ms = i64::try_from(task.retry_interval_ms).unwrap_or(i64::MAX);
        // An interval past the calendar range means no hold back.
        let Some(eligible_at) = chrono::TimeDelta::try_milliseconds(interval_ms)
            .and_then(|interval| task.submit_time.checked_add_signed(interval))
        else {
            return Duration::ZERO;
        };
        (eligible_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}
