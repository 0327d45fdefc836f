use thiserror::Error;

/// Problems found while building a workflow execution graph. All of them are
/// fatal to the workflow instance that asked for the graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate task code {0} in workflow definition")]
    DuplicateTask(i64),

    #[error("relation references unknown task: pre={pre}, post={post}")]
    DanglingReference { pre: i64, post: i64 },

    #[error("cycle detected between tasks {codes:?}")]
    CycleDetected { codes: Vec<i64> },

    #[error("start node {0} is not part of the workflow definition")]
    UnknownStartNode(i64),
}

#[derive(Debug, Error)]
pub enum CommandParamError {
    #[error("command param is not a JSON object: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("invalid entry `{value}` in command param `{key}`")]
    InvalidList { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Transport level failures. These never describe the outcome of the task itself.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request to {host} timed out")]
    Timeout { host: String },

    #[error("connection to {host} refused")]
    ConnectionRefused { host: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode request: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, RpcError::Codec(_))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no worker available in group `{0}`")]
    NoAvailableWorker(String),

    #[error("worker {host} rejected task: {reason}")]
    Rejected { host: String, reason: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("invalid task params for task {task_code}: {message}")]
    InvalidTaskParams { task_code: i64, message: String },
}

impl DispatchError {
    /// Transient failures are retried by requeueing with a backoff delay.
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::NoAvailableWorker(_) | DispatchError::Rejected { .. } => true,
            DispatchError::Rpc(e) => e.is_transient(),
            DispatchError::InvalidTaskParams { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    CommandParam(#[from] CommandParamError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("workflow definition {code} (version {version}) not found")]
    DefinitionNotFound { code: i64, version: i32 },

    #[error("workflow instance {0} not found")]
    WorkflowInstanceNotFound(i64),

    #[error("command {command_type:?} requires a workflow instance id")]
    MissingWorkflowInstance { command_type: crate::model::CommandType },

    #[error("engine is shutting down")]
    Shutdown,
}
