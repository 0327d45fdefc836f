use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;

use crate::error::RepositoryError;
use crate::model::{Command, TaskDefinition, TaskInstance, WorkflowDefinition, WorkflowInstance};

// --- Interfaces ---

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn save_workflow_definition(&self, definition: WorkflowDefinition) -> Result<(), RepositoryError>;

    /// `None` as version selects the latest one.
    async fn find_workflow_definition(
        &self,
        code: i64,
        version: Option<i32>,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError>;

    async fn find_task_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<Option<TaskDefinition>, RepositoryError>;

    /// Assigns the instance id.
    async fn create_workflow_instance(&self, instance: &mut WorkflowInstance) -> Result<(), RepositoryError>;

    /// Writes everything except `next_instance_id`, which only [`Self::link_next_instance`] sets.
    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError>;

    async fn link_next_instance(&self, instance_id: i64, next_instance_id: i64) -> Result<(), RepositoryError>;

    async fn find_process_instance_by_id(&self, id: i64) -> Result<Option<WorkflowInstance>, RepositoryError>;

    async fn find_instances_by_definition(&self, definition_code: i64) -> Result<Vec<WorkflowInstance>, RepositoryError>;
}

#[async_trait]
pub trait TaskInstanceRepository: Send + Sync {
    /// Assigns the task instance id.
    async fn create_task_instance(&self, task: &mut TaskInstance) -> Result<(), RepositoryError>;

    async fn update_task_instance(&self, task: &TaskInstance) -> Result<(), RepositoryError>;

    /// Unknown ids are skipped.
    async fn query_by_ids(&self, ids: &[i64]) -> Result<Vec<TaskInstance>, RepositoryError>;

    /// The valid (latest) attempt of one task code.
    async fn query_by_workflow_instance_id_and_task_code(
        &self,
        workflow_instance_id: i64,
        task_code: i64,
    ) -> Result<Option<TaskInstance>, RepositoryError>;

    async fn find_valid_task_list_by_workflow_instance_id(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>, RepositoryError>;
}

#[async_trait]
pub trait CommandQueue: Send + Sync {
    async fn push(&self, command: Command) -> anyhow::Result<()>;
    async fn pop(&self) -> anyhow::Result<Option<Command>>;
}

// --- In-Memory Implementations ---

pub struct InMemoryCommandQueue {
    sender: mpsc::Sender<Command>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Command>>,
}

impl InMemoryCommandQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: tx,
            receiver: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl CommandQueue for InMemoryCommandQueue {
    async fn push(&self, command: Command) -> anyhow::Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|e| anyhow::anyhow!("Command channel closed: {}", e))
    }

    async fn pop(&self) -> anyhow::Result<Option<Command>> {
        let mut rx = self.receiver.lock().await;
        Ok(rx.recv().await)
    }
}

#[derive(Default)]
pub struct InMemoryRepository {
    // Map<DefinitionCode, Map<Version, Definition>>
    definitions: DashMap<i64, DashMap<i32, WorkflowDefinition>>,
    workflow_instances: DashMap<i64, WorkflowInstance>,
    task_instances: DashMap<i64, TaskInstance>,
    workflow_id_seq: AtomicI64,
    task_id_seq: AtomicI64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_instance_count(&self) -> usize {
        self.workflow_instances.len()
    }

    /// Every attempt of every task of one workflow instance, valid or not, ordered by id.
    pub fn all_task_instances(&self, workflow_instance_id: i64) -> Vec<TaskInstance> {
        let mut tasks: Vec<TaskInstance> = self
            .task_instances
            .iter()
            .filter(|t| t.workflow_instance_id == workflow_instance_id)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryRepository {
    async fn save_workflow_definition(&self, definition: WorkflowDefinition) -> Result<(), RepositoryError> {
        let versions = self.definitions.entry(definition.code).or_default();
        versions.insert(definition.version, definition);
        Ok(())
    }

    async fn find_workflow_definition(
        &self,
        code: i64,
        version: Option<i32>,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let Some(versions) = self.definitions.get(&code) else {
            return Ok(None);
        };
        let found = match version {
            Some(v) => versions.get(&v).map(|d| d.value().clone()),
            None => versions
                .iter()
                .max_by_key(|d| *d.key())
                .map(|d| d.value().clone()),
        };
        Ok(found)
    }

    async fn find_task_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<Option<TaskDefinition>, RepositoryError> {
        for versions in self.definitions.iter() {
            for definition in versions.iter() {
                if let Some(task) = definition.tasks.iter().find(|t| t.code == code && t.version == version) {
                    return Ok(Some(task.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn create_workflow_instance(&self, instance: &mut WorkflowInstance) -> Result<(), RepositoryError> {
        instance.id = self.workflow_id_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.workflow_instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut stored = self
            .workflow_instances
            .get_mut(&instance.id)
            .ok_or(RepositoryError::NotFound { entity: "workflow instance", id: instance.id })?;
        let next_instance_id = stored.next_instance_id;
        *stored = instance.clone();
        stored.next_instance_id = next_instance_id;
        Ok(())
    }

    async fn link_next_instance(&self, instance_id: i64, next_instance_id: i64) -> Result<(), RepositoryError> {
        let mut stored = self
            .workflow_instances
            .get_mut(&instance_id)
            .ok_or(RepositoryError::NotFound { entity: "workflow instance", id: instance_id })?;
        stored.next_instance_id = Some(next_instance_id);
        Ok(())
    }

    async fn find_process_instance_by_id(&self, id: i64) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.workflow_instances.get(&id).map(|i| i.value().clone()))
    }

    async fn find_instances_by_definition(&self, definition_code: i64) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut instances: Vec<WorkflowInstance> = self
            .workflow_instances
            .iter()
            .filter(|i| i.definition_code == definition_code)
            .map(|i| i.value().clone())
            .collect();
        instances.sort_by_key(|i| i.id);
        Ok(instances)
    }
}

#[async_trait]
impl TaskInstanceRepository for InMemoryRepository {
    async fn create_task_instance(&self, task: &mut TaskInstance) -> Result<(), RepositoryError> {
        task.id = self.task_id_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.task_instances.insert(task.id, task.clone());
        Ok(())
    }

    async fn update_task_instance(&self, task: &TaskInstance) -> Result<(), RepositoryError> {
        let mut stored = self
            .task_instances
            .get_mut(&task.id)
            .ok_or(RepositoryError::NotFound { entity: "task instance", id: task.id })?;
        *stored = task.clone();
        Ok(())
    }

    async fn query_by_ids(&self, ids: &[i64]) -> Result<Vec<TaskInstance>, RepositoryError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.task_instances.get(id).map(|t| t.value().clone()))
            .collect())
    }

    async fn query_by_workflow_instance_id_and_task_code(
        &self,
        workflow_instance_id: i64,
        task_code: i64,
    ) -> Result<Option<TaskInstance>, RepositoryError> {
        Ok(self
            .task_instances
            .iter()
            .filter(|t| t.workflow_instance_id == workflow_instance_id && t.task_code == task_code && t.valid)
            .max_by_key(|t| t.id)
            .map(|t| t.value().clone()))
    }

    async fn find_valid_task_list_by_workflow_instance_id(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>, RepositoryError> {
        let mut tasks: Vec<TaskInstance> = self
            .task_instances
            .iter()
            .filter(|t| t.workflow_instance_id == workflow_instance_id && t.valid)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }
}
