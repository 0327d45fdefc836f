use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::rpc::TaskStateEvent;

/// Inputs of a workflow runnable's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    TaskStateChanged(TaskStateEvent),
    /// A task group slot was released elsewhere and handed to one of this workflow's tasks.
    TaskGroupSlotGranted { task_instance_id: i64 },
    Stop,
    Pause,
}

/// Routes events to the live workflow runnables, one channel per workflow instance.
#[derive(Default)]
pub struct WorkflowEventBus {
    channels: DashMap<i64, mpsc::UnboundedSender<WorkflowEvent>>,
}

impl WorkflowEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, workflow_instance_id: i64) -> mpsc::UnboundedReceiver<WorkflowEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(workflow_instance_id, tx);
        rx
    }

    pub fn unregister(&self, workflow_instance_id: i64) {
        self.channels.remove(&workflow_instance_id);
    }

    pub fn is_registered(&self, workflow_instance_id: i64) -> bool {
        self.channels.contains_key(&workflow_instance_id)
    }

    /// Returns false when no live runnable owns the workflow instance.
    pub fn publish(&self, workflow_instance_id: i64, event: WorkflowEvent) -> bool {
        let Some(tx) = self.channels.get(&workflow_instance_id) else {
            debug!(workflow_instance_id, event = ?event, "No live workflow for event, dropping it");
            return false;
        };
        tx.send(event).is_ok()
    }

    pub fn publish_task_event(&self, event: TaskStateEvent) -> bool {
        self.publish(event.workflow_instance_id, WorkflowEvent::TaskStateChanged(event))
    }
}
