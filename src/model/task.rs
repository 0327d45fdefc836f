use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::enums::{Priority, TaskExecutionStatus};
use crate::model::var_pool::Property;
use crate::model::workflow::{TaskDefinition, WorkflowInstance};

/// One attempt to run a DAG node within a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstance {
    pub id: i64,
    pub name: String,
    pub task_code: i64,
    pub task_definition_version: i32,
    pub task_type: String,
    pub task_params: Value,
    pub workflow_instance_id: i64,
    pub workflow_instance_priority: Priority,
    pub state: TaskExecutionStatus,
    pub priority: Priority,
    pub worker_group: String,
    pub host: Option<String>,
    pub task_group_id: Option<i32>,
    pub task_group_priority: Option<i32>,
    /// Set once by the first attempt and kept across retries.
    pub first_submit_time: DateTime<Utc>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub var_pool: Vec<Property>,
    /// Successors chosen by a branching task once it succeeded.
    #[serde(default)]
    pub next_nodes: Option<Vec<i64>>,
    pub retry_times: u32,
    pub max_retry_times: u32,
    pub retry_interval_ms: u64,
    /// False once superseded by a retry.
    pub valid: bool,
}

impl TaskInstance {
    pub fn from_definition(definition: &TaskDefinition, workflow_instance: &WorkflowInstance) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: definition.name.clone(),
            task_code: definition.code,
            task_definition_version: definition.version,
            task_type: definition.task_type.clone(),
            task_params: definition.task_params.clone(),
            workflow_instance_id: workflow_instance.id,
            workflow_instance_priority: workflow_instance.priority,
            state: TaskExecutionStatus::SubmittedSuccess,
            priority: definition.priority,
            worker_group: definition.worker_group.clone(),
            host: None,
            task_group_id: definition.task_group_id,
            task_group_priority: definition.task_group_priority,
            first_submit_time: now,
            submit_time: now,
            start_time: None,
            end_time: None,
            var_pool: Vec::new(),
            next_nodes: None,
            retry_times: 0,
            max_retry_times: definition.max_retry_times,
            retry_interval_ms: definition.retry_interval_ms,
            valid: true,
        }
    }

    /// A fresh attempt of this task. Identity fields and `first_submit_time` carry over.
    pub fn new_retry(&self) -> Self {
        let mut retry = self.clone();
        retry.id = 0;
        retry.state = TaskExecutionStatus::SubmittedSuccess;
        retry.host = None;
        retry.submit_time = Utc::now();
        retry.start_time = None;
        retry.end_time = None;
        retry.next_nodes = None;
        retry.var_pool.retain(|p| p.direct == crate::model::Direction::In);
        retry.retry_times = self.retry_times + 1;
        retry.valid = true;
        retry
    }

    pub fn can_retry(&self) -> bool {
        self.state == TaskExecutionStatus::Failure && self.retry_times < self.max_retry_times
    }

    pub fn out_properties(&self) -> impl Iterator<Item = &Property> {
        self.var_pool
            .iter()
            .filter(|p| p.direct == crate::model::Direction::Out)
    }
}
