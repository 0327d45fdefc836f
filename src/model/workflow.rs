use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::enums::{
    CommandType, ExecutionType, FailureStrategy, Priority, TaskDependType, WorkflowExecutionStatus,
};
use crate::model::var_pool::Property;

/// A versioned workflow definition: the task nodes plus the pre-task relations between them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub code: i64,
    #[serde(default = "default_version")]
    pub version: i32,
    pub name: String,
    #[serde(default)]
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub global_params: Vec<Property>,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub relations: Vec<TaskRelation>,
}

impl WorkflowDefinition {
    pub fn task(&self, code: i64) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.code == code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    pub code: i64,
    #[serde(default = "default_version")]
    pub version: i32,
    pub name: String,
    pub task_type: String,
    #[serde(default)]
    pub task_params: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_worker_group")]
    pub worker_group: String,
    #[serde(default)]
    pub task_group_id: Option<i32>,
    #[serde(default)]
    pub task_group_priority: Option<i32>,
    #[serde(default)]
    pub max_retry_times: u32,
    /// Delay before a failed attempt is retried, in milliseconds.
    #[serde(default)]
    pub retry_interval_ms: u64,
    #[serde(default)]
    pub forbidden: bool,
}

/// Edge `pre -> post`. A relation without `pre` only declares `post` as a root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRelation {
    #[serde(default)]
    pub pre: Option<i64>,
    pub post: i64,
}

impl TaskRelation {
    pub fn new(pre: i64, post: i64) -> Self {
        Self { pre: Some(pre), post }
    }
}

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: i64,
    pub name: String,
    pub definition_code: i64,
    pub definition_version: i32,
    pub priority: Priority,
    pub state: WorkflowExecutionStatus,
    pub command_type: CommandType,
    /// JSON object carried over from the triggering command.
    pub command_param: Option<String>,
    pub failure_strategy: FailureStrategy,
    #[serde(default)]
    pub task_depend_type: TaskDependType,
    pub next_instance_id: Option<i64>,
    pub var_pool: Vec<Property>,
    pub host: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(definition: &WorkflowDefinition, command_type: CommandType) -> Self {
        Self {
            id: 0,
            name: definition.name.clone(),
            definition_code: definition.code,
            definition_version: definition.version,
            priority: Priority::default(),
            state: WorkflowExecutionStatus::Submitted,
            command_type,
            command_param: None,
            failure_strategy: FailureStrategy::default(),
            task_depend_type: TaskDependType::default(),
            next_instance_id: None,
            var_pool: definition
                .global_params
                .iter()
                .map(|p| Property { direct: crate::model::Direction::In, ..p.clone() })
                .collect(),
            host: None,
            start_time: None,
            end_time: None,
        }
    }
}

fn default_version() -> i32 {
    1
}

fn default_worker_group() -> String {
    "default".to_string()
}
