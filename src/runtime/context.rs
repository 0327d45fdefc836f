use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::alert::{AlertManager, LogAlertManager};
use crate::config::MasterConfig;
use crate::dispatch::GlobalTaskDispatchWaitingQueue;
use crate::rpc::WorkerClient;
use crate::runtime::event::WorkflowEventBus;
use crate::runtime::storage::{
    CommandQueue, InMemoryCommandQueue, InMemoryRepository, TaskInstanceRepository,
    WorkflowRepository,
};
use crate::taskgroup::TaskGroupCoordinator;

/// Everything shared by the workflow runnables, the loopers and the engine of one master.
pub struct MasterContext {
    pub config: MasterConfig,
    pub host: String,
    pub workflow_repository: Arc<dyn WorkflowRepository>,
    pub task_repository: Arc<dyn TaskInstanceRepository>,
    pub command_queue: Arc<dyn CommandQueue>,
    pub worker_client: Arc<dyn WorkerClient>,
    pub alert_manager: Arc<dyn AlertManager>,
    pub queue: Arc<GlobalTaskDispatchWaitingQueue>,
    pub coordinator: Arc<TaskGroupCoordinator>,
    pub event_bus: Arc<WorkflowEventBus>,
    serial_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl MasterContext {
    /// In-memory repository and command queue, log alerts.
    pub fn new(config: MasterConfig, worker_client: Arc<dyn WorkerClient>) -> Self {
        let repository = Arc::new(InMemoryRepository::new());
        let host = config
            .host
            .clone()
            .unwrap_or_else(|| format!("master-{}", Uuid::new_v4()));
        let coordinator = Arc::new(TaskGroupCoordinator::new());
        for group in &config.task_groups {
            coordinator.register_task_group(group.clone());
        }

        Self {
            config,
            host,
            workflow_repository: repository.clone(),
            task_repository: repository,
            command_queue: Arc::new(InMemoryCommandQueue::new(1024)),
            worker_client,
            alert_manager: Arc::new(LogAlertManager),
            queue: Arc::new(GlobalTaskDispatchWaitingQueue::new()),
            coordinator,
            event_bus: Arc::new(WorkflowEventBus::new()),
            serial_locks: DashMap::new(),
        }
    }

    pub fn with_repository<R>(mut self, repository: Arc<R>) -> Self
    where
        R: WorkflowRepository + TaskInstanceRepository + 'static,
    {
        self.workflow_repository = repository.clone();
        self.task_repository = repository;
        self
    }

    pub fn with_command_queue(mut self, command_queue: Arc<dyn CommandQueue>) -> Self {
        self.command_queue = command_queue;
        self
    }

    pub fn with_alert_manager(mut self, alert_manager: Arc<dyn AlertManager>) -> Self {
        self.alert_manager = alert_manager;
        self
    }

    /// Serializes submission and promotion of instances of one serial definition.
    pub fn serial_lock(&self, definition_code: i64) -> Arc<Mutex<()>> {
        self.serial_locks
            .entry(definition_code)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}
