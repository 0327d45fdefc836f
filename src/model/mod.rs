pub mod command;
pub mod enums;
pub mod loader;
pub mod task;
pub mod var_pool;
pub mod workflow;

pub use command::Command;
pub use enums::{
    CommandType, ExecutionType, FailureStrategy, Priority, TaskDependType, TaskExecutionStatus,
    WorkflowExecutionStatus,
};
pub use task::TaskInstance;
pub use var_pool::{DataType, Direction, Property};
pub use workflow::{TaskDefinition, TaskRelation, WorkflowDefinition, WorkflowInstance};
