use serde::{Deserialize, Serialize};

use crate::model::enums::{CommandType, FailureStrategy, Priority, TaskDependType};

/// A trigger consumed by the engine. `command_param` is a JSON object whose keys are
/// listed in [`crate::runtime::command_param`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub command_type: CommandType,
    pub workflow_definition_code: i64,
    #[serde(default)]
    pub workflow_definition_version: Option<i32>,
    #[serde(default)]
    pub workflow_instance_id: Option<i64>,
    #[serde(default)]
    pub command_param: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    #[serde(default)]
    pub task_depend_type: TaskDependType,
}

impl Command {
    pub fn start(workflow_definition_code: i64) -> Self {
        Self {
            command_type: CommandType::StartProcess,
            workflow_definition_code,
            workflow_definition_version: None,
            workflow_instance_id: None,
            command_param: None,
            priority: Priority::default(),
            failure_strategy: FailureStrategy::default(),
            task_depend_type: TaskDependType::default(),
        }
    }

    /// Resume an existing workflow instance with the given command type.
    pub fn resume(command_type: CommandType, workflow_definition_code: i64, workflow_instance_id: i64) -> Self {
        Self {
            command_type,
            workflow_instance_id: Some(workflow_instance_id),
            ..Self::start(workflow_definition_code)
        }
    }

    pub fn with_param(mut self, command_param: impl Into<String>) -> Self {
        self.command_param = Some(command_param.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_failure_strategy(mut self, failure_strategy: FailureStrategy) -> Self {
        self.failure_strategy = failure_strategy;
        self
    }

    pub fn with_depend_type(mut self, task_depend_type: TaskDependType) -> Self {
        self.task_depend_type = task_depend_type;
        self
    }
}
