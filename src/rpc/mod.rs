pub mod local;
pub mod redis_transport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RpcError;
use crate::model::{Property, TaskExecutionStatus};

/// The execution context shipped to a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDispatchRequest {
    /// Unique per send so a worker can drop a duplicate delivery.
    pub request_id: Uuid,
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub task_code: i64,
    pub task_name: String,
    pub task_type: String,
    pub task_params: Value,
    pub var_pool: Vec<Property>,
    pub worker_group: String,
    pub host: String,
    pub retry_times: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskControlKind {
    Kill,
    Pause,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskControlRequest {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub kind: TaskControlKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchResponse {
    pub accepted: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl DispatchResponse {
    pub fn accepted() -> Self {
        Self { accepted: true, message: None }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self { accepted: false, message: Some(message.into()) }
    }
}

/// A task state change reported back to the master, either by a worker or by the
/// master itself (logic tasks, dispatch bookkeeping, dispatch giving up).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStateEvent {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub state: TaskExecutionStatus,
    #[serde(default)]
    pub host: Option<String>,
    /// OUT variables produced by the task.
    #[serde(default)]
    pub var_pool: Vec<Property>,
    /// Successors chosen by a branching task. `None` means every successor.
    #[serde(default)]
    pub next_nodes: Option<Vec<i64>>,
    pub event_time: DateTime<Utc>,
}

impl TaskStateEvent {
    pub fn new(task_instance_id: i64, workflow_instance_id: i64, state: TaskExecutionStatus) -> Self {
        Self {
            task_instance_id,
            workflow_instance_id,
            state,
            host: None,
            var_pool: Vec::new(),
            next_nodes: None,
            event_time: Utc::now(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_var_pool(mut self, var_pool: Vec<Property>) -> Self {
        self.var_pool = var_pool;
        self
    }

    pub fn with_next_nodes(mut self, next_nodes: Vec<i64>) -> Self {
        self.next_nodes = Some(next_nodes);
        self
    }
}

/// Async request/response channel to the worker tier. Errors describe the transport,
/// never the outcome of the task.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn dispatch(&self, host: &str, request: TaskDispatchRequest) -> Result<DispatchResponse, RpcError>;
    async fn control(&self, host: &str, request: TaskControlRequest) -> Result<(), RpcError>;
}

/// Stream of task state changes coming back from the worker tier.
#[async_trait]
pub trait TaskEventSource: Send + Sync {
    /// `Ok(None)` means nothing arrived within the source's poll window.
    async fn next_event(&self) -> Result<Option<TaskStateEvent>, RpcError>;
}
