use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, RepositoryError};
use crate::graph::WorkflowExecutionGraph;
use crate::model::var_pool::merge_properties;
use crate::model::{
    Command, CommandType, Direction, FailureStrategy, Property, TaskDependType,
    TaskExecutionStatus, TaskInstance, WorkflowDefinition, WorkflowExecutionStatus,
    WorkflowInstance,
};
use crate::rpc::{TaskControlKind, TaskControlRequest, TaskStateEvent};
use crate::runtime::command_param::{parse_recovery_node_id_list, parse_start_node_list};
use crate::runtime::context::MasterContext;
use crate::runtime::event::WorkflowEvent;
use crate::runtime::task::TaskExecutionRunnable;
use crate::taskgroup::{AcquireResult, SlotGrant};

/// A finished DAG node, in the order completions were reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedTask {
    pub task_instance_id: i64,
    pub state: TaskExecutionStatus,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    NotReady,
    Ready,
    /// Every predecessor was skipped by a branch decision.
    Skip,
}

/// Drives one workflow instance from start or resume to a terminal state. All mutable
/// bookkeeping is owned here and only touched from the instance's own event loop.
pub struct WorkflowExecuteRunnable {
    ctx: Arc<MasterContext>,
    definition: Arc<WorkflowDefinition>,
    graph: Arc<WorkflowExecutionGraph>,
    workflow_instance: WorkflowInstance,
    /// IN pool every task starts from: global params plus start params.
    base_var_pool: Vec<Property>,

    task_instance_map: HashMap<i64, Arc<TaskExecutionRunnable>>,
    task_code_instance_map: HashMap<i64, i64>,
    complete_task_map: HashMap<i64, CompletedTask>,
    completion_sequence: u64,
    finished_task_ids: HashSet<i64>,
    error_task_map: HashMap<i64, i64>,
    skipped_task_codes: HashSet<i64>,
    active_task_ids: HashSet<i64>,
    /// Ready tasks held back while the workflow is blocked. They hold no slot.
    parked_task_ids: Vec<i64>,
    waiting_slot_ids: HashSet<i64>,

    stop_requested: bool,
    pause_requested: bool,
    failure_ended: bool,
    status: Arc<watch::Sender<WorkflowExecutionStatus>>,
}

impl WorkflowExecuteRunnable {
    pub fn new(
        ctx: Arc<MasterContext>,
        definition: Arc<WorkflowDefinition>,
        graph: Arc<WorkflowExecutionGraph>,
        workflow_instance: WorkflowInstance,
        status: Arc<watch::Sender<WorkflowExecutionStatus>>,
    ) -> Self {
        let base_var_pool = workflow_instance
            .var_pool
            .iter()
            .map(|p| Property { direct: Direction::In, ..p.clone() })
            .collect();
        Self {
            ctx,
            definition,
            graph,
            workflow_instance,
            base_var_pool,
            task_instance_map: HashMap::new(),
            task_code_instance_map: HashMap::new(),
            complete_task_map: HashMap::new(),
            completion_sequence: 0,
            finished_task_ids: HashSet::new(),
            error_task_map: HashMap::new(),
            skipped_task_codes: HashSet::new(),
            active_task_ids: HashSet::new(),
            parked_task_ids: Vec::new(),
            waiting_slot_ids: HashSet::new(),
            stop_requested: false,
            pause_requested: false,
            failure_ended: false,
            status,
        }
    }

    /// Builds the execution graph the instance's command asks for and wraps it in a runnable.
    pub fn create(
        ctx: Arc<MasterContext>,
        definition: Arc<WorkflowDefinition>,
        workflow_instance: WorkflowInstance,
    ) -> Result<Self, EngineError> {
        let start_nodes = parse_start_node_list(workflow_instance.command_param.as_deref(), &definition)?;
        let depend_type = match workflow_instance.command_type {
            CommandType::StartCurrentTaskProcess => TaskDependType::TaskOnly,
            _ => workflow_instance.task_depend_type,
        };
        let graph = WorkflowExecutionGraph::build(&definition, &start_nodes, depend_type)?;
        let (status, _) = watch::channel(workflow_instance.state);
        Ok(Self::new(ctx, definition, Arc::new(graph), workflow_instance, Arc::new(status)))
    }

    /// Reports state changes through `status` instead of a private channel.
    pub fn with_status_sender(mut self, status: Arc<watch::Sender<WorkflowExecutionStatus>>) -> Self {
        status.send_replace(self.workflow_instance.state);
        self.status = status;
        self
    }

    // --- Accessors ---

    pub fn workflow_instance(&self) -> &WorkflowInstance {
        &self.workflow_instance
    }

    pub fn workflow_instance_id(&self) -> i64 {
        self.workflow_instance.id
    }

    pub fn state(&self) -> WorkflowExecutionStatus {
        self.workflow_instance.state
    }

    pub fn is_finished(&self) -> bool {
        self.workflow_instance.state.is_finished()
    }

    pub fn graph(&self) -> &WorkflowExecutionGraph {
        &self.graph
    }

    pub fn status_sender(&self) -> Arc<watch::Sender<WorkflowExecutionStatus>> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowExecutionStatus> {
        self.status.subscribe()
    }

    pub fn task_runnable(&self, task_instance_id: i64) -> Option<Arc<TaskExecutionRunnable>> {
        self.task_instance_map.get(&task_instance_id).cloned()
    }

    /// Latest attempt of a DAG node.
    pub fn task_instance_by_code(&self, task_code: i64) -> Option<TaskInstance> {
        let id = self.task_code_instance_map.get(&task_code)?;
        self.task_instance_map.get(id).map(|r| r.snapshot())
    }

    pub fn is_task_completed(&self, task_code: i64) -> bool {
        self.complete_task_map.contains_key(&task_code)
    }

    pub fn completed_task(&self, task_code: i64) -> Option<CompletedTask> {
        self.complete_task_map.get(&task_code).copied()
    }

    pub fn completed_task_codes(&self) -> Vec<i64> {
        let mut codes: Vec<i64> = self.complete_task_map.keys().copied().collect();
        codes.sort_unstable();
        codes
    }

    pub fn skipped_task_codes(&self) -> Vec<i64> {
        let mut codes: Vec<i64> = self.skipped_task_codes.iter().copied().collect();
        codes.sort_unstable();
        codes
    }

    pub fn active_task_count(&self) -> usize {
        self.active_task_ids.len()
    }

    pub fn parked_task_count(&self) -> usize {
        self.parked_task_ids.len()
    }

    pub fn waiting_slot_count(&self) -> usize {
        self.waiting_slot_ids.len()
    }

    // --- Event loop ---

    /// Starts the instance and processes events until it reaches a terminal state.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<WorkflowEvent>) -> WorkflowExecutionStatus {
        let workflow_instance_id = self.workflow_instance.id;
        if let Err(e) = self.start().await {
            error!(workflow_instance_id, error = %e, "Workflow instance failed to start");
            if let Err(e) = self.end_workflow(WorkflowExecutionStatus::Failure).await {
                error!(workflow_instance_id, error = %e, "Failed to record workflow failure");
            }
        }

        while !self.is_finished() {
            let Some(event) = events.recv().await else {
                warn!(workflow_instance_id, "Event channel closed before the workflow finished");
                break;
            };
            if let Err(e) = self.handle_event(event).await {
                error!(workflow_instance_id, error = %e, "Failed to handle workflow event");
            }
        }

        self.ctx.event_bus.unregister(workflow_instance_id);
        self.workflow_instance.state
    }

    pub async fn start(&mut self) -> Result<(), EngineError> {
        self.workflow_instance.state = WorkflowExecutionStatus::Running;
        if self.workflow_instance.start_time.is_none() {
            self.workflow_instance.start_time = Some(Utc::now());
        }
        self.workflow_instance.host = Some(self.ctx.host.clone());
        self.persist_workflow().await?;
        self.status.send_replace(WorkflowExecutionStatus::Running);
        info!(
            workflow_instance_id = self.workflow_instance.id,
            name = %self.workflow_instance.name,
            command_type = ?self.workflow_instance.command_type,
            tasks = self.graph.len(),
            "Workflow instance started"
        );

        if self.workflow_instance.command_type.resumes_existing_instance() {
            self.recover().await?;
        } else {
            self.submit_frontier().await?;
        }
        self.check_finish().await
    }

    pub async fn handle_event(&mut self, event: WorkflowEvent) -> Result<(), EngineError> {
        if self.is_finished() {
            debug!(workflow_instance_id = self.workflow_instance.id, event = ?event, "Event after workflow finished ignored");
            return Ok(());
        }
        match event {
            WorkflowEvent::TaskStateChanged(event) => self.handle_task_state_event(event).await?,
            WorkflowEvent::TaskGroupSlotGranted { task_instance_id } => {
                self.handle_slot_granted(task_instance_id).await?
            }
            WorkflowEvent::Stop => self.cancel(TaskControlKind::Kill).await?,
            WorkflowEvent::Pause => self.cancel(TaskControlKind::Pause).await?,
        }
        self.check_finish().await
    }

    // --- Command param handling ---

    pub fn parse_start_node_list(&self, cmd_param: Option<&str>) -> Result<Vec<i64>, EngineError> {
        Ok(parse_start_node_list(cmd_param, &self.definition)?)
    }

    /// Task instances of this workflow named by `RecoveryStartNodeIdList`. Ids that cannot
    /// be found are left out, so an empty list means there is nothing to recover.
    pub async fn get_recover_task_instance_list(&self, cmd_param: Option<&str>) -> Result<Vec<TaskInstance>, EngineError> {
        let ids = parse_recovery_node_id_list(cmd_param)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let found: Vec<TaskInstance> = self
            .ctx
            .task_repository
            .query_by_ids(&ids)
            .await?
            .into_iter()
            .filter(|t| t.workflow_instance_id == self.workflow_instance.id)
            .collect();
        if found.is_empty() {
            info!(workflow_instance_id = self.workflow_instance.id, ids = ?ids, "No task instances found to recover");
        }
        Ok(found)
    }

    // --- Recovery ---

    async fn recover(&mut self) -> Result<(), EngineError> {
        let workflow_instance_id = self.workflow_instance.id;
        let command_type = self.workflow_instance.command_type;
        let persisted = self
            .ctx
            .task_repository
            .find_valid_task_list_by_workflow_instance_id(workflow_instance_id)
            .await?;
        let rerun: HashSet<i64> = self
            .get_recover_task_instance_list(self.workflow_instance.command_param.clone().as_deref())
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();

        for mut task in persisted {
            if !self.graph.contains(task.task_code) {
                continue;
            }
            let requested = rerun.contains(&task.id);
            if task.state == TaskExecutionStatus::Success && !requested {
                self.restore_task_instance(task);
            } else if task.state.is_dispatched()
                && command_type == CommandType::RecoverToleranceFaultProcess
                && !requested
            {
                self.reattach_task_instance(task);
            } else {
                task.valid = false;
                self.ctx.task_repository.update_task_instance(&task).await?;
            }
        }

        if command_type == CommandType::ExecuteTask {
            // Every node of the narrowed graph runs again.
            for code in self.graph.topological_order().to_vec() {
                if let Some(done) = self.complete_task_map.get(&code) {
                    if let Some(runnable) = self.task_instance_map.get(&done.task_instance_id) {
                        let task = runnable.update(|t| {
                            t.valid = false;
                            t.clone()
                        });
                        self.ctx.task_repository.update_task_instance(&task).await?;
                    }
                }
            }
            self.clear_data_if_execute_task().await?;
        }

        // Branch decisions of finished switch tasks still apply.
        let mut decisions: Vec<(u64, i64, Vec<i64>)> = self
            .complete_task_map
            .iter()
            .filter_map(|(code, done)| {
                let runnable = self.task_instance_map.get(&done.task_instance_id)?;
                let next = runnable.snapshot().next_nodes?;
                Some((done.sequence, *code, next))
            })
            .collect();
        decisions.sort_unstable();
        for (_, code, chosen) in decisions {
            for post in self.graph.post_tasks(code).to_vec() {
                if !chosen.contains(&post) {
                    self.mark_skipped(post);
                }
            }
        }

        info!(
            workflow_instance_id,
            completed = self.complete_task_map.len(),
            reattached = self.active_task_ids.len(),
            "Workflow instance recovered"
        );
        self.submit_frontier().await
    }

    /// Records a persisted, finished task instance as completed without running it again.
    pub fn restore_task_instance(&mut self, task: TaskInstance) {
        let id = task.id;
        let code = task.task_code;
        let state = task.state;
        let runnable = TaskExecutionRunnable::new(task, self.ctx.queue.clone());
        self.task_instance_map.insert(id, runnable);
        self.task_code_instance_map.insert(code, id);
        self.finished_task_ids.insert(id);
        self.record_completion(code, id, state);
    }

    /// Adopts a task that may still be running on a worker after a master failover.
    fn reattach_task_instance(&mut self, task: TaskInstance) {
        if let AcquireResult::Queued = self.ctx.coordinator.acquire(&task) {
            warn!(task_instance_id = task.id, "Reattached task could not reclaim its task group slot");
        }
        let runnable = TaskExecutionRunnable::new(task, self.ctx.queue.clone());
        self.track(runnable);
    }

    /// For `ExecuteTask`: forgets in-memory progress of every graph node that has no valid
    /// persisted task instance, so those nodes run again.
    pub async fn clear_data_if_execute_task(&mut self) -> Result<(), EngineError> {
        if self.workflow_instance.command_type != CommandType::ExecuteTask {
            return Ok(());
        }
        let persisted_codes: HashSet<i64> = self
            .ctx
            .task_repository
            .find_valid_task_list_by_workflow_instance_id(self.workflow_instance.id)
            .await?
            .into_iter()
            .map(|t| t.task_code)
            .collect();

        for code in self.graph.topological_order().to_vec() {
            if persisted_codes.contains(&code) {
                continue;
            }
            if let Some(done) = self.complete_task_map.remove(&code) {
                self.finished_task_ids.remove(&done.task_instance_id);
                self.task_instance_map.remove(&done.task_instance_id);
            }
            if let Some(id) = self.task_code_instance_map.get(&code).copied() {
                if !self.active_task_ids.contains(&id) {
                    self.task_code_instance_map.remove(&code);
                    self.task_instance_map.remove(&id);
                }
            }
            self.error_task_map.remove(&code);
            self.skipped_task_codes.remove(&code);
            debug!(workflow_instance_id = self.workflow_instance.id, task_code = code, "Cleared task state for re-execution");
        }
        Ok(())
    }

    // --- Submission ---

    fn readiness(&self, code: i64) -> Readiness {
        if !self.graph.contains(code)
            || self.skipped_task_codes.contains(&code)
            || self.complete_task_map.contains_key(&code)
        {
            return Readiness::NotReady;
        }
        if let Some(id) = self.task_code_instance_map.get(&code) {
            if self.active_task_ids.contains(id) {
                return Readiness::NotReady;
            }
        }

        let pre_tasks = self.graph.pre_tasks(code);
        let mut all_skipped = !pre_tasks.is_empty();
        for pre in pre_tasks {
            if self.skipped_task_codes.contains(pre) {
                continue;
            }
            all_skipped = false;
            match self.complete_task_map.get(pre) {
                Some(done) if done.state == TaskExecutionStatus::Success => {}
                _ => return Readiness::NotReady,
            }
        }
        if all_skipped { Readiness::Skip } else { Readiness::Ready }
    }

    fn accepting_new_tasks(&self) -> bool {
        !self.stop_requested && !self.pause_requested && !self.failure_ended
    }

    /// Submits every node whose predecessors are all satisfied.
    async fn submit_frontier(&mut self) -> Result<(), EngineError> {
        for code in self.graph.topological_order().to_vec() {
            self.try_submit_node(code).await?;
        }
        Ok(())
    }

    async fn try_submit_node(&mut self, code: i64) -> Result<(), EngineError> {
        if !self.accepting_new_tasks() {
            return Ok(());
        }
        match self.readiness(code) {
            Readiness::Ready => self.submit_task_node(code).await,
            Readiness::Skip => {
                let unlocked = self.mark_skipped(code);
                self.submit_ready(unlocked).await
            }
            Readiness::NotReady => Ok(()),
        }
    }

    async fn submit_ready(&mut self, codes: Vec<i64>) -> Result<(), EngineError> {
        for code in codes {
            if self.accepting_new_tasks() && self.readiness(code) == Readiness::Ready {
                self.submit_task_node(code).await?;
            }
        }
        Ok(())
    }

    async fn submit_post_nodes(&mut self, code: i64, chosen: Option<Vec<i64>>) -> Result<(), EngineError> {
        let post_tasks = self.graph.post_tasks(code).to_vec();
        if let Some(chosen) = chosen {
            for post in &post_tasks {
                if !chosen.contains(post) {
                    let unlocked = self.mark_skipped(*post);
                    self.submit_ready(unlocked).await?;
                }
            }
        }
        for post in post_tasks {
            self.try_submit_node(post).await?;
        }
        Ok(())
    }

    /// Skips `code` and every descendant left with only skipped predecessors. Returns the
    /// nodes that became ready because a predecessor was skipped.
    fn mark_skipped(&mut self, code: i64) -> Vec<i64> {
        let mut stack = vec![code];
        let mut unlocked = Vec::new();
        while let Some(current) = stack.pop() {
            let running = self
                .task_code_instance_map
                .get(&current)
                .is_some_and(|id| self.active_task_ids.contains(id));
            if running
                || self.complete_task_map.contains_key(&current)
                || !self.skipped_task_codes.insert(current)
            {
                continue;
            }
            info!(workflow_instance_id = self.workflow_instance.id, task_code = current, "Task skipped by branch decision");
            for post in self.graph.post_tasks(current) {
                match self.readiness(*post) {
                    Readiness::Skip => stack.push(*post),
                    Readiness::Ready => unlocked.push(*post),
                    Readiness::NotReady => {}
                }
            }
        }
        unlocked
    }

    async fn submit_task_node(&mut self, code: i64) -> Result<(), EngineError> {
        let Some(definition) = self.graph.task_definition(code).cloned() else {
            return Ok(());
        };
        let mut task = TaskInstance::from_definition(&definition, &self.workflow_instance);
        self.initialize_task_instance_var_pool(&mut task);
        self.ctx.task_repository.create_task_instance(&mut task).await?;
        info!(
            workflow_instance_id = self.workflow_instance.id,
            task_instance_id = task.id,
            task_code = code,
            task = %task.name,
            "Task instance submitted"
        );

        let runnable = TaskExecutionRunnable::new(task, self.ctx.queue.clone());
        self.track(runnable.clone());
        self.submit_to_dispatch(runnable).await
    }

    fn track(&mut self, runnable: Arc<TaskExecutionRunnable>) {
        let id = runnable.task_instance_id();
        self.task_code_instance_map.insert(runnable.task_code(), id);
        self.active_task_ids.insert(id);
        self.task_instance_map.insert(id, runnable);
    }

    /// Merges the OUT variables of completed direct predecessors into the task's IN pool.
    /// Predecessors are applied in completion order, so a later completion wins a name clash.
    pub fn initialize_task_instance_var_pool(&self, task: &mut TaskInstance) {
        let mut pool = self.base_var_pool.clone();

        let mut completed: Vec<&CompletedTask> = self
            .graph
            .pre_tasks(task.task_code)
            .iter()
            .filter_map(|code| self.complete_task_map.get(code))
            .filter(|done| done.state == TaskExecutionStatus::Success)
            .collect();
        completed.sort_by_key(|done| done.sequence);

        for done in completed {
            let Some(runnable) = self.task_instance_map.get(&done.task_instance_id) else {
                continue;
            };
            let outputs: Vec<Property> = runnable
                .snapshot()
                .out_properties()
                .map(|p| Property { direct: Direction::In, ..p.clone() })
                .collect();
            merge_properties(&mut pool, outputs);
        }
        merge_properties(&mut task.var_pool, pool);
    }

    /// Takes a task group slot if needed, then hands the task to the dispatch gate.
    async fn submit_to_dispatch(&mut self, runnable: Arc<TaskExecutionRunnable>) -> Result<(), EngineError> {
        let id = runnable.task_instance_id();
        if self.workflow_instance.state == WorkflowExecutionStatus::Blocked {
            debug!(workflow_instance_id = self.workflow_instance.id, task_instance_id = id, "Workflow blocked, task parked");
            self.parked_task_ids.push(id);
            return Ok(());
        }

        let task = runnable.snapshot();
        match self.ctx.coordinator.acquire(&task) {
            AcquireResult::Queued => {
                self.waiting_slot_ids.insert(id);
                self.set_blocked().await?;
            }
            AcquireResult::Granted | AcquireResult::NotRequired => {
                if !self.try_to_dispatch_task_instance(&task, &runnable) {
                    self.parked_task_ids.push(id);
                }
            }
        }
        Ok(())
    }

    /// Enqueue gate. A no-op while the workflow instance is blocked; otherwise the task is
    /// pushed to the global queue whatever its own state. Stale entries are filtered when
    /// they are taken from the queue.
    pub fn try_to_dispatch_task_instance(&self, task: &TaskInstance, runnable: &Arc<TaskExecutionRunnable>) -> bool {
        if self.workflow_instance.state == WorkflowExecutionStatus::Blocked {
            debug!(
                workflow_instance_id = self.workflow_instance.id,
                task_instance_id = task.id,
                "Workflow blocked, dispatch deferred"
            );
            return false;
        }
        runnable.dispatch();
        true
    }

    async fn set_blocked(&mut self) -> Result<(), EngineError> {
        if self.workflow_instance.state != WorkflowExecutionStatus::Running {
            return Ok(());
        }
        self.workflow_instance.state = WorkflowExecutionStatus::Blocked;
        self.persist_workflow().await?;
        self.status.send_replace(WorkflowExecutionStatus::Blocked);
        info!(workflow_instance_id = self.workflow_instance.id, "Workflow instance blocked on task group");
        Ok(())
    }

    async fn handle_slot_granted(&mut self, task_instance_id: i64) -> Result<(), EngineError> {
        let Some(runnable) = self.task_instance_map.get(&task_instance_id).cloned() else {
            warn!(task_instance_id, "Slot granted to unknown task instance");
            return Ok(());
        };

        let waiting = self.waiting_slot_ids.remove(&task_instance_id);
        if !waiting
            || !self.accepting_new_tasks()
            || runnable.state() != TaskExecutionStatus::SubmittedSuccess
        {
            // Nobody is going to use this slot.
            let task = runnable.snapshot();
            if let Some(group_id) = task.task_group_id {
                self.hand_over(self.ctx.coordinator.release_slot(group_id, task_instance_id));
            }
            return Ok(());
        }

        info!(workflow_instance_id = self.workflow_instance.id, task_instance_id, "Task group slot granted, dispatching");
        // Slot holders are never parked.
        runnable.dispatch();

        if self.waiting_slot_ids.is_empty() && self.workflow_instance.state == WorkflowExecutionStatus::Blocked {
            self.workflow_instance.state = WorkflowExecutionStatus::Running;
            self.persist_workflow().await?;
            self.status.send_replace(WorkflowExecutionStatus::Running);
            info!(workflow_instance_id = self.workflow_instance.id, parked = self.parked_task_ids.len(), "Workflow instance unblocked");

            let parked = std::mem::take(&mut self.parked_task_ids);
            for id in parked {
                if let Some(runnable) = self.task_instance_map.get(&id).cloned() {
                    self.submit_to_dispatch(runnable).await?;
                }
            }
        }
        Ok(())
    }

    /// Delivers a released slot to the workflow that owns the granted task. A grant whose
    /// workflow is gone is released again.
    fn hand_over(&self, mut grant: Option<SlotGrant>) {
        while let Some(g) = grant {
            let delivered = self.ctx.event_bus.publish(
                g.workflow_instance_id,
                WorkflowEvent::TaskGroupSlotGranted { task_instance_id: g.task_instance_id },
            );
            if delivered {
                return;
            }
            warn!(task_instance_id = g.task_instance_id, "Slot granted to a workflow that is no longer live, releasing");
            grant = self.ctx.coordinator.release_slot(g.task_group_id, g.task_instance_id);
        }
    }

    // --- Task state changes ---

    async fn handle_task_state_event(&mut self, event: TaskStateEvent) -> Result<(), EngineError> {
        let id = event.task_instance_id;
        let Some(runnable) = self.task_instance_map.get(&id).cloned() else {
            warn!(workflow_instance_id = self.workflow_instance.id, task_instance_id = id, "Event for unknown task instance");
            return Ok(());
        };
        if self.finished_task_ids.contains(&id) {
            debug!(task_instance_id = id, state = ?event.state, "Report for an already finished task instance ignored");
            return Ok(());
        }

        match event.state {
            TaskExecutionStatus::SubmittedSuccess => {
                warn!(task_instance_id = id, "Unexpected SUBMITTED_SUCCESS report ignored");
            }
            TaskExecutionStatus::Dispatch => {
                let task = runnable.update(|t| {
                    if let Some(host) = &event.host {
                        t.host.get_or_insert_with(|| host.clone());
                    }
                    t.clone()
                });
                self.ctx.task_repository.update_task_instance(&task).await?;
            }
            TaskExecutionStatus::RunningExecution => {
                let task = runnable.update(|t| {
                    if matches!(t.state, TaskExecutionStatus::SubmittedSuccess | TaskExecutionStatus::Dispatch) {
                        t.state = TaskExecutionStatus::RunningExecution;
                        t.start_time = Some(event.event_time);
                        if let Some(host) = &event.host {
                            t.host = Some(host.clone());
                        }
                    }
                    t.clone()
                });
                debug!(task_instance_id = id, host = ?task.host, "Task instance running");
                self.ctx.task_repository.update_task_instance(&task).await?;
            }
            _ => self.handle_task_finished(runnable, event).await?,
        }
        Ok(())
    }

    async fn handle_task_finished(&mut self, runnable: Arc<TaskExecutionRunnable>, event: TaskStateEvent) -> Result<(), EngineError> {
        let id = runnable.task_instance_id();
        let code = runnable.task_code();
        self.finished_task_ids.insert(id);
        self.active_task_ids.remove(&id);
        self.waiting_slot_ids.remove(&id);
        self.parked_task_ids.retain(|p| *p != id);

        let task = runnable.update(|t| {
            t.state = event.state;
            t.end_time = Some(event.event_time);
            if let Some(host) = &event.host {
                t.host = Some(host.clone());
            }
            let outputs = event
                .var_pool
                .iter()
                .map(|p| Property { direct: Direction::Out, ..p.clone() });
            merge_properties(&mut t.var_pool, outputs);
            if event.state == TaskExecutionStatus::Success {
                t.next_nodes = event.next_nodes.clone();
            }
            t.clone()
        });
        self.ctx.task_repository.update_task_instance(&task).await?;
        self.hand_over(self.ctx.coordinator.release(&task));
        info!(
            workflow_instance_id = self.workflow_instance.id,
            task_instance_id = id,
            task_code = code,
            state = ?task.state,
            "Task instance finished"
        );

        match task.state {
            TaskExecutionStatus::Success => {
                self.record_completion(code, id, TaskExecutionStatus::Success);
                let outputs: Vec<Property> = task
                    .out_properties()
                    .map(|p| Property { direct: Direction::In, ..p.clone() })
                    .collect();
                merge_properties(&mut self.workflow_instance.var_pool, outputs);
                self.submit_post_nodes(code, task.next_nodes.clone()).await?;
            }
            TaskExecutionStatus::Failure if task.can_retry() && self.accepting_new_tasks() => {
                self.retry_task(&runnable).await?;
            }
            state => {
                self.record_completion(code, id, state);
                let unrequested = !self.stop_requested && !self.pause_requested && !self.failure_ended;
                if state == TaskExecutionStatus::Failure || unrequested {
                    self.error_task_map.insert(code, id);
                }
                if state == TaskExecutionStatus::Failure {
                    self.ctx
                        .alert_manager
                        .send_task_failure_alert(&self.workflow_instance, &task)
                        .await;
                    if self.workflow_instance.failure_strategy == FailureStrategy::End && !self.failure_ended {
                        info!(workflow_instance_id = self.workflow_instance.id, "Failure strategy END, killing remaining tasks");
                        self.failure_ended = true;
                        self.kill_active_tasks(TaskControlKind::Kill).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn record_completion(&mut self, code: i64, task_instance_id: i64, state: TaskExecutionStatus) {
        self.completion_sequence += 1;
        self.complete_task_map.insert(
            code,
            CompletedTask {
                task_instance_id,
                state,
                sequence: self.completion_sequence,
            },
        );
    }

    /// Replaces a failed attempt with a new task instance, held back by the retry interval.
    async fn retry_task(&mut self, failed: &Arc<TaskExecutionRunnable>) -> Result<(), EngineError> {
        let old = failed.update(|t| {
            t.valid = false;
            t.clone()
        });
        self.ctx.task_repository.update_task_instance(&old).await?;

        let mut retry = old.new_retry();
        self.ctx.task_repository.create_task_instance(&mut retry).await?;
        info!(
            workflow_instance_id = self.workflow_instance.id,
            failed_task_instance_id = old.id,
            task_instance_id = retry.id,
            retry_times = retry.retry_times,
            retry_interval_ms = retry.retry_interval_ms,
            "Retrying failed task"
        );

        let runnable = TaskExecutionRunnable::new(retry, self.ctx.queue.clone());
        self.track(runnable.clone());
        self.submit_to_dispatch(runnable).await
    }

    // --- Stop / pause ---

    async fn cancel(&mut self, kind: TaskControlKind) -> Result<(), EngineError> {
        match kind {
            TaskControlKind::Kill => self.stop_requested = true,
            TaskControlKind::Pause => self.pause_requested = true,
        }
        info!(workflow_instance_id = self.workflow_instance.id, kind = ?kind, "Cancelling workflow instance");
        self.kill_active_tasks(kind).await
    }

    /// Ends tasks that never left the master and signals the ones that did.
    async fn kill_active_tasks(&mut self, kind: TaskControlKind) -> Result<(), EngineError> {
        let removed = self.ctx.queue.remove_workflow_instance(self.workflow_instance.id);
        debug!(workflow_instance_id = self.workflow_instance.id, removed, "Removed queued dispatch entries");

        let target = match kind {
            TaskControlKind::Kill => TaskExecutionStatus::Kill,
            TaskControlKind::Pause => TaskExecutionStatus::Pause,
        };

        let mut active: Vec<i64> = self.active_task_ids.iter().copied().collect();
        active.sort_unstable();
        for id in active {
            let Some(runnable) = self.task_instance_map.get(&id).cloned() else {
                continue;
            };
            runnable.cancel();

            if runnable.compare_and_set_state(TaskExecutionStatus::SubmittedSuccess, target) {
                let task = runnable.snapshot();
                self.hand_over(self.ctx.coordinator.forget(&task));
                self.finished_task_ids.insert(id);
                self.active_task_ids.remove(&id);
                self.record_completion(task.task_code, id, target);
                self.ctx.task_repository.update_task_instance(&task).await?;
                debug!(task_instance_id = id, state = ?target, "Undispatched task cancelled");
            } else if runnable.state().is_dispatched() {
                let task = runnable.snapshot();
                let Some(host) = task.host.clone() else {
                    continue;
                };
                let client = self.ctx.worker_client.clone();
                let request = TaskControlRequest {
                    task_instance_id: id,
                    workflow_instance_id: self.workflow_instance.id,
                    kind,
                };
                tokio::spawn(async move {
                    if let Err(e) = client.control(&host, request).await {
                        warn!(task_instance_id = id, host = %host, error = %e, "Failed to signal task on worker");
                    }
                });
            }
        }
        self.parked_task_ids.clear();
        self.waiting_slot_ids.clear();
        Ok(())
    }

    // --- Completion ---

    async fn check_finish(&mut self) -> Result<(), EngineError> {
        if self.is_finished() {
            return Ok(());
        }
        if !self.active_task_ids.is_empty()
            || !self.waiting_slot_ids.is_empty()
            || !self.parked_task_ids.is_empty()
        {
            return Ok(());
        }

        let state = if self.stop_requested {
            WorkflowExecutionStatus::Stop
        } else if self.pause_requested {
            WorkflowExecutionStatus::Pause
        } else if !self.error_task_map.is_empty() {
            WorkflowExecutionStatus::Failure
        } else {
            WorkflowExecutionStatus::Success
        };
        self.end_workflow(state).await
    }

    pub async fn end_workflow(&mut self, state: WorkflowExecutionStatus) -> Result<(), EngineError> {
        self.workflow_instance.state = state;
        self.workflow_instance.end_time = Some(Utc::now());

        if self.definition.execution_type.is_serial() {
            let lock = self.ctx.serial_lock(self.definition.code);
            let _guard = lock.lock().await;
            self.persist_workflow().await?;
            self.promote_next_serial_instance().await?;
        } else {
            self.persist_workflow().await?;
        }

        self.status.send_replace(state);
        info!(workflow_instance_id = self.workflow_instance.id, state = ?state, "Workflow instance finished");
        self.ctx
            .alert_manager
            .send_workflow_alert(&self.workflow_instance)
            .await;
        Ok(())
    }

    /// Promotes the instance chained behind this one if it is waiting in SERIAL_WAIT.
    /// Returns the promoted instance id.
    pub async fn check_serial_process(&self) -> Result<Option<i64>, EngineError> {
        if !self.definition.execution_type.is_serial() {
            return Ok(None);
        }
        let lock = self.ctx.serial_lock(self.definition.code);
        let _guard = lock.lock().await;
        self.promote_next_serial_instance().await
    }

    async fn promote_next_serial_instance(&self) -> Result<Option<i64>, EngineError> {
        promote_next_serial_instance(&self.ctx, self.definition.code, self.workflow_instance.id).await
    }

    async fn persist_workflow(&self) -> Result<(), EngineError> {
        self.ctx
            .workflow_repository
            .update_workflow_instance(&self.workflow_instance)
            .await?;
        Ok(())
    }
}

/// Moves the SERIAL_WAIT instance chained behind `workflow_instance_id` back to SUBMITTED and
/// queues the command that resumes it. Caller holds the definition's serial lock.
pub(crate) async fn promote_next_serial_instance(
    ctx: &MasterContext,
    definition_code: i64,
    workflow_instance_id: i64,
) -> Result<Option<i64>, EngineError> {
    let repository = &ctx.workflow_repository;
    let next_instance_id = repository
        .find_process_instance_by_id(workflow_instance_id)
        .await?
        .and_then(|i| i.next_instance_id);
    let Some(next_instance_id) = next_instance_id else {
        return Ok(None);
    };
    let Some(mut next) = repository.find_process_instance_by_id(next_instance_id).await? else {
        warn!(next_instance_id, "Next serial instance not found");
        return Ok(None);
    };
    if next.state != WorkflowExecutionStatus::SerialWait {
        debug!(next_instance_id, state = ?next.state, "Next serial instance is not waiting");
        return Ok(None);
    }

    next.state = WorkflowExecutionStatus::Submitted;
    repository.update_workflow_instance(&next).await?;
    let command = Command::resume(CommandType::RecoverSerialWait, definition_code, next_instance_id)
        .with_priority(next.priority);
    ctx.command_queue
        .push(command)
        .await
        .map_err(|e| RepositoryError::Backend(e.to_string()))?;
    info!(workflow_instance_id, next_instance_id, "Promoted next serial workflow instance");
    Ok(Some(next_instance_id))
}
