use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{
    GlobalTaskDispatchWaitingQueueLooper, LogicTaskDispatcher, SWITCH_TASK_TYPE, TaskDispatchFactory,
    WorkerRegistry, WorkerTaskDispatcher,
};
use crate::error::EngineError;
use crate::model::var_pool::merge_properties;
use crate::model::{
    Command, CommandType, ExecutionType, WorkflowDefinition, WorkflowExecutionStatus, WorkflowInstance,
};
use crate::rpc::TaskEventSource;
use crate::runtime::command_param::CommandParam;
use crate::runtime::context::MasterContext;
use crate::runtime::event::WorkflowEvent;
use crate::runtime::workflow::{WorkflowExecuteRunnable, promote_next_serial_instance};

type StatusSender = Arc<watch::Sender<WorkflowExecutionStatus>>;

/// Master entry point: turns commands into running workflow instances and wires the
/// dispatch loopers and the worker event stream to them.
pub struct Engine {
    ctx: Arc<MasterContext>,
    factory: Arc<TaskDispatchFactory>,
    statuses: Arc<DashMap<i64, StatusSender>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(ctx: Arc<MasterContext>) -> Self {
        let registry = WorkerRegistry::new(&ctx.config.worker_groups);
        let worker_dispatcher = Arc::new(WorkerTaskDispatcher::new(
            ctx.worker_client.clone(),
            registry,
            ctx.event_bus.clone(),
        ));
        let logic_dispatcher = Arc::new(LogicTaskDispatcher::new(ctx.host.clone(), ctx.event_bus.clone()));
        let factory = TaskDispatchFactory::new(worker_dispatcher).with_dispatcher(SWITCH_TASK_TYPE, logic_dispatcher);
        Self::with_factory(ctx, factory)
    }

    pub fn with_factory(ctx: Arc<MasterContext>, factory: TaskDispatchFactory) -> Self {
        Self {
            ctx,
            factory: Arc::new(factory),
            statuses: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<MasterContext> {
        &self.ctx
    }

    pub async fn register_workflow_definition(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        info!(code = definition.code, version = definition.version, name = %definition.name, "Registering workflow definition");
        self.ctx.workflow_repository.save_workflow_definition(definition).await?;
        Ok(())
    }

    /// Queues a command for the command loop.
    pub async fn submit(&self, command: Command) -> anyhow::Result<()> {
        self.ctx.command_queue.push(command).await
    }

    // --- Background loops ---

    /// Spawns the dispatch loopers, the command loop and the loop that routes worker events.
    pub fn start(self: &Arc<Self>, event_source: Arc<dyn TaskEventSource>) {
        let mut handles = self.handles.lock();
        let looper_count = self.ctx.config.dispatch_looper_count.max(1);
        for i in 0..looper_count {
            let looper = GlobalTaskDispatchWaitingQueueLooper::new(
                format!("dispatch-looper-{}", i),
                self.ctx.queue.clone(),
                self.factory.clone(),
                self.ctx.config.dispatch_retry.clone(),
                self.ctx.event_bus.clone(),
                self.cancel.child_token(),
            );
            handles.push(tokio::spawn(looper.run()));
        }

        let engine = self.clone();
        handles.push(tokio::spawn(async move { engine.run_command_loop().await }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move { engine.run_event_loop(event_source).await }));
        info!(host = %self.ctx.host, loopers = looper_count, "Master engine started");
    }

    async fn run_command_loop(&self) {
        loop {
            let popped = tokio::select! {
                _ = self.cancel.cancelled() => break,
                popped = self.ctx.command_queue.pop() => popped,
            };
            match popped {
                Ok(Some(command)) => {
                    let command_type = command.command_type;
                    if let Err(e) = self.handle_command(command).await {
                        error!(command_type = ?command_type, error = %e, "Failed to handle command");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to pop command, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!("Command loop stopped");
    }

    async fn run_event_loop(&self, event_source: Arc<dyn TaskEventSource>) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = event_source.next_event() => next,
            };
            match next {
                Ok(Some(event)) => {
                    let task_instance_id = event.task_instance_id;
                    if !self.ctx.event_bus.publish_task_event(event) {
                        debug!(task_instance_id, "Task event for a workflow that is not live on this master");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to read task events, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!("Event loop stopped");
    }

    /// Stops the background loops. Running workflow instances are left as they are.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        info!(host = %self.ctx.host, "Master engine stopped");
    }

    // --- Commands ---

    /// Creates or loads the workflow instance a command refers to and starts running it.
    /// Returns the workflow instance id.
    pub async fn handle_command(&self, command: Command) -> Result<i64, EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        if command.command_type.resumes_existing_instance() {
            self.resume_instance(command).await
        } else {
            self.start_instance(command).await
        }
    }

    async fn start_instance(&self, command: Command) -> Result<i64, EngineError> {
        let definition = self
            .load_definition(command.workflow_definition_code, command.workflow_definition_version)
            .await?;

        let mut instance = WorkflowInstance::new(&definition, command.command_type);
        instance.priority = command.priority;
        instance.failure_strategy = command.failure_strategy;
        instance.task_depend_type = command.task_depend_type;
        instance.command_param = command.command_param.clone();
        if let Ok(param) = CommandParam::parse(command.command_param.as_deref()) {
            merge_properties(&mut instance.var_pool, param.start_params());
        }

        let definition = Arc::new(definition);
        if !definition.execution_type.is_serial() {
            self.ctx.workflow_repository.create_workflow_instance(&mut instance).await?;
            return self.launch(definition, instance).await;
        }

        let lock = self.ctx.serial_lock(definition.code);
        let guard = lock.lock().await;
        self.ctx.workflow_repository.create_workflow_instance(&mut instance).await?;
        if self.hold_back_serial_instance(&definition, &mut instance).await? {
            return Ok(instance.id);
        }
        drop(guard);
        self.launch(definition, instance).await
    }

    async fn resume_instance(&self, command: Command) -> Result<i64, EngineError> {
        let command_type = command.command_type;
        let id = command
            .workflow_instance_id
            .ok_or(EngineError::MissingWorkflowInstance { command_type })?;
        let mut instance = self
            .ctx
            .workflow_repository
            .find_process_instance_by_id(id)
            .await?
            .ok_or(EngineError::WorkflowInstanceNotFound(id))?;
        if self.ctx.event_bus.is_registered(id) {
            warn!(workflow_instance_id = id, command_type = ?command_type, "Workflow instance already running, command ignored");
            return Ok(id);
        }

        let definition = Arc::new(
            self.load_definition(instance.definition_code, Some(instance.definition_version))
                .await?,
        );
        // A resume that was held back in SERIAL_WAIT keeps its own recovery mode.
        let deferred_resume = command_type == CommandType::RecoverSerialWait
            && instance.command_type.resumes_existing_instance()
            && instance.command_type != CommandType::RecoverSerialWait;
        if !deferred_resume {
            instance.command_type = command_type;
        }
        if command.command_param.is_some() {
            instance.command_param = command.command_param;
        }
        instance.end_time = None;
        info!(workflow_instance_id = id, command_type = ?instance.command_type, from_state = ?instance.state, "Resuming workflow instance");

        if !definition.execution_type.is_serial() || command_type == CommandType::RecoverSerialWait {
            return self.launch(definition, instance).await;
        }
        let lock = self.ctx.serial_lock(definition.code);
        let guard = lock.lock().await;
        if self.hold_back_serial_instance(&definition, &mut instance).await? {
            return Ok(id);
        }
        drop(guard);
        self.launch(definition, instance).await
    }

    /// Applies SERIAL_WAIT / SERIAL_DISCARD admission. Returns true when the instance must
    /// not run now. Caller holds the definition's serial lock.
    async fn hold_back_serial_instance(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
    ) -> Result<bool, EngineError> {
        let others: Vec<WorkflowInstance> = self
            .ctx
            .workflow_repository
            .find_instances_by_definition(definition.code)
            .await?
            .into_iter()
            .filter(|i| i.id != instance.id)
            .collect();

        match definition.execution_type {
            ExecutionType::Parallel => Ok(false),
            ExecutionType::SerialDiscard => {
                if !others.iter().any(|i| i.state.is_active()) {
                    return Ok(false);
                }
                instance.state = WorkflowExecutionStatus::Stop;
                instance.end_time = Some(Utc::now());
                self.ctx.workflow_repository.update_workflow_instance(instance).await?;
                self.finish_status(instance.id, instance.state);
                info!(workflow_instance_id = instance.id, code = definition.code, "Serial discard, another instance is running");
                self.ctx.alert_manager.send_workflow_alert(instance).await;
                Ok(true)
            }
            ExecutionType::SerialWait => {
                let chain: Vec<&WorkflowInstance> = others
                    .iter()
                    .filter(|i| i.state.is_active() || i.state == WorkflowExecutionStatus::SerialWait)
                    .collect();
                // The tail's pointer leads to no waiting instance. A resumed instance may still
                // point at a successor that already ran.
                let waiting: HashSet<i64> = chain
                    .iter()
                    .filter(|i| i.state == WorkflowExecutionStatus::SerialWait)
                    .map(|i| i.id)
                    .collect();
                let Some(tail) = chain
                    .iter()
                    .filter(|i| !matches!(i.next_instance_id, Some(next) if waiting.contains(&next)))
                    .max_by_key(|i| i.id)
                    .or_else(|| chain.iter().max_by_key(|i| i.id))
                else {
                    return Ok(false);
                };
                instance.state = WorkflowExecutionStatus::SerialWait;
                self.ctx.workflow_repository.update_workflow_instance(instance).await?;
                self.ctx.workflow_repository.link_next_instance(tail.id, instance.id).await?;
                self.status_sender(instance.id, instance.state).send_replace(instance.state);
                info!(
                    workflow_instance_id = instance.id,
                    behind = tail.id,
                    code = definition.code,
                    "Serial wait, instance queued behind a running one"
                );
                Ok(true)
            }
        }
    }

    async fn launch(&self, definition: Arc<WorkflowDefinition>, mut instance: WorkflowInstance) -> Result<i64, EngineError> {
        let id = instance.id;
        let status = self.status_sender(id, instance.state);

        let runnable = match WorkflowExecuteRunnable::create(self.ctx.clone(), definition.clone(), instance.clone()) {
            Ok(runnable) => runnable.with_status_sender(status.clone()),
            Err(e) => {
                error!(workflow_instance_id = id, error = %e, "Cannot build execution graph, failing workflow instance");
                instance.state = WorkflowExecutionStatus::Failure;
                instance.end_time = Some(Utc::now());
                if definition.execution_type.is_serial() {
                    let lock = self.ctx.serial_lock(definition.code);
                    let _guard = lock.lock().await;
                    self.ctx.workflow_repository.update_workflow_instance(&instance).await?;
                    promote_next_serial_instance(&self.ctx, definition.code, id).await?;
                } else {
                    self.ctx.workflow_repository.update_workflow_instance(&instance).await?;
                }
                self.finish_status(id, WorkflowExecutionStatus::Failure);
                self.ctx.alert_manager.send_workflow_alert(&instance).await;
                return Ok(id);
            }
        };

        let events = self.ctx.event_bus.register(id);
        let statuses = self.statuses.clone();
        tokio::spawn(async move {
            let state = runnable.run(events).await;
            // Receivers already handed out keep the final state.
            statuses.remove_if(&id, |_, s| Arc::ptr_eq(s, &status));
            debug!(workflow_instance_id = id, state = ?state, "Workflow runnable exited");
        });
        Ok(id)
    }

    async fn load_definition(&self, code: i64, version: Option<i32>) -> Result<WorkflowDefinition, EngineError> {
        self.ctx
            .workflow_repository
            .find_workflow_definition(code, version)
            .await?
            .ok_or(EngineError::DefinitionNotFound { code, version: version.unwrap_or(0) })
    }

    fn status_sender(&self, workflow_instance_id: i64, initial: WorkflowExecutionStatus) -> StatusSender {
        let mut entry = self
            .statuses
            .entry(workflow_instance_id)
            .or_insert_with(|| Arc::new(watch::channel(initial).0));
        if entry.value().borrow().is_finished() {
            *entry = Arc::new(watch::channel(initial).0);
        }
        entry.value().clone()
    }

    /// Publishes a final state for an instance that never got a runnable and drops its entry.
    fn finish_status(&self, workflow_instance_id: i64, state: WorkflowExecutionStatus) {
        if let Some((_, status)) = self.statuses.remove(&workflow_instance_id) {
            status.send_replace(state);
        }
    }

    /// Number of workflow instances with a live status channel.
    pub fn tracked_status_count(&self) -> usize {
        self.statuses.len()
    }

    // --- Control and queries ---

    pub fn subscribe(&self, workflow_instance_id: i64) -> Option<watch::Receiver<WorkflowExecutionStatus>> {
        self.statuses.get(&workflow_instance_id).map(|s| s.subscribe())
    }

    /// Waits until the workflow instance reaches PAUSE, STOP, SUCCESS or FAILURE.
    pub async fn wait_for_completion(&self, workflow_instance_id: i64) -> Result<WorkflowExecutionStatus, EngineError> {
        let Some(mut rx) = self.subscribe(workflow_instance_id) else {
            return match self.workflow_instance(workflow_instance_id).await? {
                Some(instance) if instance.state.is_finished() => Ok(instance.state),
                _ => Err(EngineError::WorkflowInstanceNotFound(workflow_instance_id)),
            };
        };
        let state = rx
            .wait_for(|s| s.is_finished())
            .await
            .map_err(|_| EngineError::Shutdown)?;
        Ok(*state)
    }

    pub async fn workflow_instance(&self, workflow_instance_id: i64) -> Result<Option<WorkflowInstance>, EngineError> {
        Ok(self
            .ctx
            .workflow_repository
            .find_process_instance_by_id(workflow_instance_id)
            .await?)
    }

    pub fn stop_workflow(&self, workflow_instance_id: i64) -> Result<(), EngineError> {
        self.control(workflow_instance_id, WorkflowEvent::Stop)
    }

    pub fn pause_workflow(&self, workflow_instance_id: i64) -> Result<(), EngineError> {
        self.control(workflow_instance_id, WorkflowEvent::Pause)
    }

    fn control(&self, workflow_instance_id: i64, event: WorkflowEvent) -> Result<(), EngineError> {
        info!(workflow_instance_id, event = ?event, "Workflow control requested");
        if self.ctx.event_bus.publish(workflow_instance_id, event) {
            Ok(())
        } else {
            Err(EngineError::WorkflowInstanceNotFound(workflow_instance_id))
        }
    }
}
