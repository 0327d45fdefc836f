#![allow(dead_code)]

use dagmaster::alert::NoopAlertManager;
use dagmaster::config::MasterConfig;
use dagmaster::model::{Priority, TaskDefinition, TaskRelation, WorkflowDefinition};
use dagmaster::rpc::local::LoopbackWorkerClient;
use dagmaster::runtime::context::MasterContext;
use dagmaster::runtime::engine::Engine;
use dagmaster::runtime::storage::InMemoryRepository;
use serde_json::{Value, json};
use std::sync::Arc;

pub fn task(code: i64, name: &str) -> TaskDefinition {
    TaskDefinition {
        code,
        version: 1,
        name: name.to_string(),
        task_type: "SHELL".to_string(),
        task_params: json!({}),
        priority: Priority::Medium,
        worker_group: "default".to_string(),
        task_group_id: None,
        task_group_priority: None,
        max_retry_times: 0,
        retry_interval_ms: 0,
        forbidden: false,
    }
}

/// A task the loopback worker plays out as described by `simulate`.
pub fn simulated(code: i64, name: &str, simulate: Value) -> TaskDefinition {
    let mut task = task(code, name);
    task.task_params = json!({ "simulate": simulate });
    task
}

pub fn definition(code: i64, tasks: Vec<TaskDefinition>, edges: &[(i64, i64)]) -> WorkflowDefinition {
    WorkflowDefinition {
        code,
        version: 1,
        name: format!("workflow-{}", code),
        execution_type: Default::default(),
        global_params: Vec::new(),
        tasks,
        relations: edges.iter().map(|(pre, post)| TaskRelation::new(*pre, *post)).collect(),
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub workers: Arc<LoopbackWorkerClient>,
    pub repository: Arc<InMemoryRepository>,
}

/// A started engine backed by loopback workers and an in-memory repository.
pub fn start_engine(config: MasterConfig) -> Harness {
    let (workers, events) = LoopbackWorkerClient::new();
    let repository = Arc::new(InMemoryRepository::new());
    let ctx = MasterContext::new(config, workers.clone())
        .with_repository(repository.clone())
        .with_alert_manager(Arc::new(NoopAlertManager));
    let engine = Arc::new(Engine::new(Arc::new(ctx)));
    engine.start(Arc::new(events));
    Harness { engine, workers, repository }
}
