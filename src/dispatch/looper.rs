use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatchRetryConfig;
use crate::dispatch::dispatcher::TaskDispatchFactory;
use crate::dispatch::queue::GlobalTaskDispatchWaitingQueue;
use crate::error::DispatchError;
use crate::model::TaskExecutionStatus;
use crate::rpc::TaskStateEvent;
use crate::runtime::event::WorkflowEventBus;
use crate::runtime::task::TaskExecutionRunnable;

/// Drains the global queue into the dispatchers. A failing entry never stops the loop.
pub struct GlobalTaskDispatchWaitingQueueLooper {
    name: String,
    queue: Arc<GlobalTaskDispatchWaitingQueue>,
    factory: Arc<TaskDispatchFactory>,
    retry: DispatchRetryConfig,
    event_bus: Arc<WorkflowEventBus>,
    cancel: CancellationToken,
}

impl GlobalTaskDispatchWaitingQueueLooper {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<GlobalTaskDispatchWaitingQueue>,
        factory: Arc<TaskDispatchFactory>,
        retry: DispatchRetryConfig,
        event_bus: Arc<WorkflowEventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            factory,
            retry,
            event_bus,
            cancel,
        }
    }

    pub async fn run(self) {
        info!(looper = %self.name, "Dispatch looper started");
        loop {
            let runnable = tokio::select! {
                _ = self.cancel.cancelled() => break,
                runnable = self.queue.take_task_execute_runnable() => runnable,
            };
            self.dispatch_one(runnable).await;
        }
        info!(looper = %self.name, "Dispatch looper stopped");
    }

    pub async fn dispatch_one(&self, runnable: Arc<TaskExecutionRunnable>) {
        let state = runnable.state();
        if state != TaskExecutionStatus::SubmittedSuccess {
            debug!(
                task_instance_id = runnable.task_instance_id(),
                state = ?state,
                "Dropping stale dispatch entry"
            );
            return;
        }

        let dispatcher = self.factory.get_task_dispatcher(&runnable.snapshot());
        let handle = {
            let runnable = runnable.clone();
            tokio::spawn(async move { dispatcher.dispatch_task(runnable).await })
        };

        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.handle_dispatch_error(runnable, e),
            Err(join_error) => {
                error!(
                    task_instance_id = runnable.task_instance_id(),
                    error = %join_error,
                    "Dispatcher panicked"
                );
                runnable.revert_dispatch();
                self.give_up(&runnable, TaskExecutionStatus::Failure);
            }
        }
    }

    fn handle_dispatch_error(&self, runnable: Arc<TaskExecutionRunnable>, e: DispatchError) {
        if runnable.is_cancelled() {
            debug!(task_instance_id = runnable.task_instance_id(), error = %e, "Dispatch failed for a cancelled task");
            self.give_up(&runnable, TaskExecutionStatus::Kill);
            return;
        }

        if e.is_transient() {
            if let Some(delay) = runnable.requeue_after_dispatch_failure(&self.retry) {
                warn!(
                    task_instance_id = runnable.task_instance_id(),
                    attempt = runnable.dispatch_failures(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Dispatch failed, requeued with backoff"
                );
                return;
            }
            error!(
                task_instance_id = runnable.task_instance_id(),
                attempts = runnable.dispatch_failures(),
                error = %e,
                "Dispatch retries exhausted"
            );
        } else {
            error!(task_instance_id = runnable.task_instance_id(), error = %e, "Dispatch failed permanently");
        }
        self.give_up(&runnable, TaskExecutionStatus::Failure);
    }

    /// Reports a task that will never reach a worker to its workflow.
    fn give_up(&self, runnable: &Arc<TaskExecutionRunnable>, state: TaskExecutionStatus) {
        self.event_bus.publish_task_event(TaskStateEvent::new(
            runnable.task_instance_id(),
            runnable.workflow_instance_id(),
            state,
        ));
    }
}
