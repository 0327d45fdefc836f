use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::model::{TaskExecutionStatus, TaskInstance};
use crate::rpc::{TaskStateEvent, WorkerClient};
use crate::runtime::event::WorkflowEventBus;
use crate::runtime::task::TaskExecutionRunnable;

/// Sends one task instance to wherever it executes.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch_task(&self, runnable: Arc<TaskExecutionRunnable>) -> Result<(), DispatchError>;
}

/// Picks the dispatcher for a task by its type, falling back to the default one.
pub struct TaskDispatchFactory {
    by_type: HashMap<String, Arc<dyn TaskDispatcher>>,
    default_dispatcher: Arc<dyn TaskDispatcher>,
}

impl TaskDispatchFactory {
    pub fn new(default_dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self {
            by_type: HashMap::new(),
            default_dispatcher,
        }
    }

    pub fn with_dispatcher(mut self, task_type: &str, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.by_type.insert(task_type.to_uppercase(), dispatcher);
        self
    }

    pub fn get_task_dispatcher(&self, task: &TaskInstance) -> Arc<dyn TaskDispatcher> {
        self.by_type
            .get(&task.task_type.to_uppercase())
            .cloned()
            .unwrap_or_else(|| self.default_dispatcher.clone())
    }
}

/// Static worker group membership with round-robin host selection.
pub struct WorkerRegistry {
    groups: HashMap<String, (Vec<String>, AtomicUsize)>,
}

impl WorkerRegistry {
    pub fn new(worker_groups: &HashMap<String, Vec<String>>) -> Self {
        let groups = worker_groups
            .iter()
            .map(|(name, hosts)| (name.clone(), (hosts.clone(), AtomicUsize::new(0))))
            .collect();
        Self { groups }
    }

    pub fn select(&self, worker_group: &str) -> Option<String> {
        let (hosts, cursor) = self.groups.get(worker_group)?;
        if hosts.is_empty() {
            return None;
        }
        let index = cursor.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Some(hosts[index].clone())
    }
}

/// Ships tasks to remote workers over the [`WorkerClient`].
pub struct WorkerTaskDispatcher {
    client: Arc<dyn WorkerClient>,
    registry: WorkerRegistry,
    event_bus: Arc<WorkflowEventBus>,
}

impl WorkerTaskDispatcher {
    pub fn new(client: Arc<dyn WorkerClient>, registry: WorkerRegistry, event_bus: Arc<WorkflowEventBus>) -> Self {
        Self {
            client,
            registry,
            event_bus,
        }
    }
}

#[async_trait]
impl TaskDispatcher for WorkerTaskDispatcher {
    async fn dispatch_task(&self, runnable: Arc<TaskExecutionRunnable>) -> Result<(), DispatchError> {
        let worker_group = runnable.update(|t| t.worker_group.clone());
        let host = self
            .registry
            .select(&worker_group)
            .ok_or_else(|| DispatchError::NoAvailableWorker(worker_group.clone()))?;

        if !runnable.mark_dispatched(&host) {
            debug!(task_instance_id = runnable.task_instance_id(), "Task left SUBMITTED_SUCCESS before send, skipping");
            return Ok(());
        }

        let request = runnable.build_dispatch_request();
        match self.client.dispatch(&host, request).await {
            Ok(response) if response.accepted => {
                info!(
                    task_instance_id = runnable.task_instance_id(),
                    workflow_instance_id = runnable.workflow_instance_id(),
                    host = %host,
                    "Task dispatched to worker"
                );
                self.event_bus.publish_task_event(
                    TaskStateEvent::new(
                        runnable.task_instance_id(),
                        runnable.workflow_instance_id(),
                        TaskExecutionStatus::Dispatch,
                    )
                    .with_host(host),
                );
                Ok(())
            }
            Ok(response) => {
                runnable.revert_dispatch();
                let reason = response.message.unwrap_or_else(|| "no reason given".to_string());
                warn!(task_instance_id = runnable.task_instance_id(), host = %host, reason = %reason, "Worker rejected task");
                Err(DispatchError::Rejected { host, reason })
            }
            Err(e) => {
                runnable.revert_dispatch();
                Err(e.into())
            }
        }
    }
}
