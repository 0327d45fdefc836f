use serde::{Deserialize, Serialize};

/// Scheduling priority. Declaration order is dispatch order: `Highest` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Highest,
    High,
    #[default]
    Medium,
    Low,
    Lowest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowExecutionStatus {
    Submitted,
    Running,
    Blocked,
    SerialWait,
    Pause,
    Stop,
    Success,
    Failure,
}

impl WorkflowExecutionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            WorkflowExecutionStatus::Pause
                | WorkflowExecutionStatus::Stop
                | WorkflowExecutionStatus::Success
                | WorkflowExecutionStatus::Failure
        )
    }

    /// States in which an instance counts as occupying its definition for serial policies.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WorkflowExecutionStatus::Submitted
                | WorkflowExecutionStatus::Running
                | WorkflowExecutionStatus::Blocked
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionStatus {
    SubmittedSuccess,
    Dispatch,
    RunningExecution,
    Pause,
    Kill,
    Success,
    Failure,
}

impl TaskExecutionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskExecutionStatus::Pause
                | TaskExecutionStatus::Kill
                | TaskExecutionStatus::Success
                | TaskExecutionStatus::Failure
        )
    }

    /// Handed to a worker (or a logic executor) and not yet reported back.
    pub fn is_dispatched(&self) -> bool {
        matches!(
            self,
            TaskExecutionStatus::Dispatch | TaskExecutionStatus::RunningExecution
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    StartProcess,
    StartCurrentTaskProcess,
    RecoverToleranceFaultProcess,
    RecoverSuspendedProcess,
    StartFailureTaskProcess,
    RepeatRunning,
    RecoverSerialWait,
    ExecuteTask,
}

impl CommandType {
    /// Commands that resume an already persisted workflow instance.
    pub fn resumes_existing_instance(&self) -> bool {
        matches!(
            self,
            CommandType::RecoverToleranceFaultProcess
                | CommandType::RecoverSuspendedProcess
                | CommandType::StartFailureTaskProcess
                | CommandType::RecoverSerialWait
                | CommandType::ExecuteTask
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    #[default]
    Continue,
    End,
}

/// How concurrent instances of one definition are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    #[default]
    Parallel,
    SerialWait,
    SerialDiscard,
}

impl ExecutionType {
    pub fn is_serial(&self) -> bool {
        !matches!(self, ExecutionType::Parallel)
    }
}

/// Which neighbours of the start nodes are kept when building a partial graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskDependType {
    TaskOnly,
    TaskPre,
    #[default]
    TaskPost,
}
