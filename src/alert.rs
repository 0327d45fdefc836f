use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::model::{TaskInstance, WorkflowExecutionStatus, WorkflowInstance};

/// Outbound notifications. The engine calls it, nothing calls back.
#[async_trait]
pub trait AlertManager: Send + Sync {
    async fn send_workflow_alert(&self, workflow_instance: &WorkflowInstance);
    async fn send_task_failure_alert(&self, workflow_instance: &WorkflowInstance, task_instance: &TaskInstance);
}

/// Writes alerts to the log.
pub struct LogAlertManager;

#[async_trait]
impl AlertManager for LogAlertManager {
    async fn send_workflow_alert(&self, workflow_instance: &WorkflowInstance) {
        match workflow_instance.state {
            WorkflowExecutionStatus::Success => info!(
                workflow_instance_id = workflow_instance.id,
                name = %workflow_instance.name,
                "Workflow instance succeeded"
            ),
            WorkflowExecutionStatus::Failure => error!(
                workflow_instance_id = workflow_instance.id,
                name = %workflow_instance.name,
                "Workflow instance failed"
            ),
            state => warn!(
                workflow_instance_id = workflow_instance.id,
                name = %workflow_instance.name,
                state = ?state,
                "Workflow instance ended"
            ),
        }
    }

    async fn send_task_failure_alert(&self, workflow_instance: &WorkflowInstance, task_instance: &TaskInstance) {
        error!(
            workflow_instance_id = workflow_instance.id,
            task_instance_id = task_instance.id,
            task_code = task_instance.task_code,
            task = %task_instance.name,
            retry_times = task_instance.retry_times,
            "Task instance failed"
        );
    }
}

pub struct NoopAlertManager;

#[async_trait]
impl AlertManager for NoopAlertManager {
    async fn send_workflow_alert(&self, _workflow_instance: &WorkflowInstance) {}

    async fn send_task_failure_alert(&self, _workflow_instance: &WorkflowInstance, _task_instance: &TaskInstance) {}
}
