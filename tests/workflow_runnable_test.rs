mod common;

use common::{definition, task};
use dagmaster::config::MasterConfig;
use dagmaster::error::EngineError;
use dagmaster::model::var_pool::find_property;
use dagmaster::model::{
    CommandType, ExecutionType, FailureStrategy, Property, TaskExecutionStatus, WorkflowDefinition,
    WorkflowExecutionStatus, WorkflowInstance,
};
use dagmaster::rpc::TaskStateEvent;
use dagmaster::rpc::local::LoopbackWorkerClient;
use dagmaster::runtime::context::MasterContext;
use dagmaster::runtime::event::WorkflowEvent;
use dagmaster::runtime::storage::InMemoryRepository;
use dagmaster::runtime::workflow::WorkflowExecuteRunnable;
use dagmaster::taskgroup::TaskGroup;
use std::sync::Arc;

fn context(config: MasterConfig) -> (Arc<MasterContext>, Arc<InMemoryRepository>) {
    let (workers, _events) = LoopbackWorkerClient::new();
    let repository = Arc::new(InMemoryRepository::new());
    let ctx = MasterContext::new(config, workers).with_repository(repository.clone());
    (Arc::new(ctx), repository)
}

async fn create_instance(
    ctx: &Arc<MasterContext>,
    def: &WorkflowDefinition,
    command_type: CommandType,
    param: Option<&str>,
) -> WorkflowInstance {
    ctx.workflow_repository
        .save_workflow_definition(def.clone())
        .await
        .expect("save definition");
    let mut instance = WorkflowInstance::new(def, command_type);
    instance.command_param = param.map(str::to_string);
    ctx.workflow_repository
        .create_workflow_instance(&mut instance)
        .await
        .expect("create instance");
    instance
}

fn runnable(ctx: &Arc<MasterContext>, def: &WorkflowDefinition, instance: WorkflowInstance) -> WorkflowExecuteRunnable {
    WorkflowExecuteRunnable::create(ctx.clone(), Arc::new(def.clone()), instance).expect("runnable")
}

/// Reloads a persisted instance under a new command, as a resume command would.
async fn resume(
    ctx: &Arc<MasterContext>,
    def: &WorkflowDefinition,
    workflow_instance_id: i64,
    command_type: CommandType,
    param: Option<&str>,
) -> WorkflowExecuteRunnable {
    let mut instance = ctx
        .workflow_repository
        .find_process_instance_by_id(workflow_instance_id)
        .await
        .expect("lookup")
        .expect("instance exists");
    instance.command_type = command_type;
    instance.command_param = param.map(str::to_string);
    runnable(ctx, def, instance)
}

fn task_id(runnable: &WorkflowExecuteRunnable, code: i64) -> i64 {
    runnable.task_instance_by_code(code).expect("task submitted").id
}

async fn report(runnable: &mut WorkflowExecuteRunnable, code: i64, state: TaskExecutionStatus, outputs: Vec<Property>) {
    let event = TaskStateEvent::new(task_id(runnable, code), runnable.workflow_instance_id(), state)
        .with_host("worker-1")
        .with_var_pool(outputs);
    runnable
        .handle_event(WorkflowEvent::TaskStateChanged(event))
        .await
        .expect("handle event");
}

fn drain_queue(ctx: &MasterContext) -> Vec<i64> {
    std::iter::from_fn(|| ctx.queue.try_take_task_execute_runnable())
        .map(|r| r.task_instance_id())
        .collect()
}

#[tokio::test]
async fn test_start_submits_roots_and_and_join_waits_for_all_predecessors() {
    let (ctx, _) = context(MasterConfig::default());
    let def = definition(
        1,
        vec![task(1, "a"), task(2, "b"), task(3, "c")],
        &[(1, 3), (2, 3)],
    );
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut wf = runnable(&ctx, &def, instance);

    wf.start().await.expect("start");
    assert_eq!(wf.state(), WorkflowExecutionStatus::Running);
    assert_eq!(ctx.queue.get_waiting_dispatch_task_number(), 2);
    assert!(wf.task_instance_by_code(3).is_none());

    report(&mut wf, 1, TaskExecutionStatus::Success, vec![]).await;
    assert!(wf.task_instance_by_code(3).is_none(), "join must wait for b");

    report(&mut wf, 2, TaskExecutionStatus::Success, vec![]).await;
    assert!(wf.task_instance_by_code(3).is_some());

    report(&mut wf, 3, TaskExecutionStatus::Success, vec![]).await;
    assert_eq!(wf.state(), WorkflowExecutionStatus::Success);
    assert_eq!(wf.completed_task_codes(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_var_pool_later_completion_wins() {
    let (ctx, _) = context(MasterConfig::default());
    let mut def = definition(
        1,
        vec![task(1, "a"), task(2, "b"), task(3, "c")],
        &[(1, 3), (2, 3)],
    );
    def.global_params = vec![Property::input("x", "global"), Property::input("g", "kept")];
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");

    report(&mut wf, 2, TaskExecutionStatus::Success, vec![Property::output("x", "from-b")]).await;
    report(
        &mut wf,
        1,
        TaskExecutionStatus::Success,
        vec![Property::output("x", "from-a"), Property::output("y", "only-a")],
    )
    .await;

    let joined = wf.task_instance_by_code(3).expect("c submitted");
    assert_eq!(find_property(&joined.var_pool, "x").map(|p| p.value.as_str()), Some("from-a"));
    assert_eq!(find_property(&joined.var_pool, "y").map(|p| p.value.as_str()), Some("only-a"));
    assert_eq!(find_property(&joined.var_pool, "g").map(|p| p.value.as_str()), Some("kept"));
    assert!(joined.var_pool.iter().all(|p| p.direct == dagmaster::model::Direction::In));
}

#[tokio::test]
async fn test_command_param_start_nodes_and_recovery_list() {
    let (ctx, _) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "extract"), task(2, "load")], &[(1, 2)]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let wf = runnable(&ctx, &def, instance);

    assert_eq!(wf.parse_start_node_list(None).expect("empty"), Vec::<i64>::new());
    assert_eq!(
        wf.parse_start_node_list(Some(r#"{"StartNodeList":"2,extract,2"}"#)).expect("parsed"),
        vec![2, 1]
    );
    assert!(matches!(
        wf.parse_start_node_list(Some(r#"{"StartNodeList":"nope"}"#)),
        Err(EngineError::CommandParam(_))
    ));

    assert!(wf.get_recover_task_instance_list(None).await.expect("empty").is_empty());
    assert!(
        wf.get_recover_task_instance_list(Some(r#"{"RecoveryStartNodeIdList":"404,405"}"#))
            .await
            .expect("unknown ids")
            .is_empty()
    );
    assert!(matches!(
        wf.get_recover_task_instance_list(Some("{not json")).await,
        Err(EngineError::CommandParam(_))
    ));
}

#[tokio::test]
async fn test_start_node_list_narrows_the_run() {
    let (ctx, repository) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b"), task(3, "c")], &[(1, 2), (2, 3)]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, Some(r#"{"StartNodeList":"2"}"#)).await;
    let mut wf = runnable(&ctx, &def, instance);

    wf.start().await.expect("start");
    assert!(wf.task_instance_by_code(1).is_none());
    report(&mut wf, 2, TaskExecutionStatus::Success, vec![]).await;
    report(&mut wf, 3, TaskExecutionStatus::Success, vec![]).await;

    assert_eq!(wf.state(), WorkflowExecutionStatus::Success);
    assert_eq!(repository.all_task_instances(wf.workflow_instance_id()).len(), 2);
}

#[tokio::test]
async fn test_blocked_workflow_holds_back_dispatch_until_slot_granted() {
    let config = MasterConfig {
        task_groups: vec![TaskGroup { id: 1, name: "db".to_string(), capacity: 1 }],
        ..MasterConfig::default()
    };
    let (ctx, _) = context(config);
    let mut a = task(1, "a");
    a.task_group_id = Some(1);
    let mut b = task(2, "b");
    b.task_group_id = Some(1);
    let def = definition(1, vec![a, b], &[]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut bus = ctx.event_bus.register(instance.id);
    let mut wf = runnable(&ctx, &def, instance);

    wf.start().await.expect("start");
    assert_eq!(wf.state(), WorkflowExecutionStatus::Blocked);
    assert_eq!(wf.waiting_slot_count(), 1);
    assert_eq!(drain_queue(&ctx), vec![task_id(&wf, 1)]);

    let waiting = wf.task_runnable(task_id(&wf, 2)).expect("b tracked");
    assert!(!wf.try_to_dispatch_task_instance(&waiting.snapshot(), &waiting));
    assert_eq!(ctx.queue.get_waiting_dispatch_task_number(), 0);

    report(&mut wf, 1, TaskExecutionStatus::Success, vec![]).await;
    let grant = bus.try_recv().expect("slot grant forwarded");
    assert_eq!(grant, WorkflowEvent::TaskGroupSlotGranted { task_instance_id: task_id(&wf, 2) });

    wf.handle_event(grant).await.expect("grant");
    assert_eq!(wf.state(), WorkflowExecutionStatus::Running);
    assert_eq!(drain_queue(&ctx), vec![task_id(&wf, 2)]);
    assert!(ctx.coordinator.is_holder(1, task_id(&wf, 2)));

    report(&mut wf, 2, TaskExecutionStatus::Success, vec![]).await;
    assert_eq!(wf.state(), WorkflowExecutionStatus::Success);
    assert_eq!(ctx.coordinator.held_count(1), 0);
}

#[tokio::test]
async fn test_failed_task_is_retried_with_a_new_instance() {
    let (ctx, repository) = context(MasterConfig::default());
    let mut a = task(1, "a");
    a.max_retry_times = 1;
    let def = definition(1, vec![a], &[]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");

    let first = task_id(&wf, 1);
    report(&mut wf, 1, TaskExecutionStatus::Failure, vec![]).await;
    let second = task_id(&wf, 1);
    assert_ne!(first, second);
    assert_eq!(wf.state(), WorkflowExecutionStatus::Running);

    let attempts = repository.all_task_instances(wf.workflow_instance_id());
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].valid);
    assert_eq!(attempts[0].state, TaskExecutionStatus::Failure);
    assert!(attempts[1].valid);
    assert_eq!(attempts[1].retry_times, 1);
    assert_eq!(attempts[1].first_submit_time, attempts[0].first_submit_time);

    report(&mut wf, 1, TaskExecutionStatus::Failure, vec![]).await;
    assert_eq!(wf.state(), WorkflowExecutionStatus::Failure);
}

#[tokio::test]
async fn test_failure_strategy_end_kills_the_rest() {
    let (ctx, repository) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b"), task(3, "c")], &[(2, 3)]);
    let mut instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    instance.failure_strategy = FailureStrategy::End;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");

    report(&mut wf, 1, TaskExecutionStatus::Failure, vec![]).await;

    assert_eq!(wf.state(), WorkflowExecutionStatus::Failure);
    assert_eq!(ctx.queue.get_waiting_dispatch_task_number(), 0);
    let b = repository
        .all_task_instances(wf.workflow_instance_id())
        .into_iter()
        .find(|t| t.task_code == 2)
        .expect("b persisted");
    assert_eq!(b.state, TaskExecutionStatus::Kill);
    assert!(wf.task_instance_by_code(3).is_none());
}

#[tokio::test]
async fn test_failure_strategy_continue_runs_independent_branches() {
    let (ctx, _) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b"), task(3, "c"), task(4, "d")], &[(1, 4), (2, 3)]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");

    report(&mut wf, 1, TaskExecutionStatus::Failure, vec![]).await;
    report(&mut wf, 2, TaskExecutionStatus::Success, vec![]).await;
    assert_eq!(wf.state(), WorkflowExecutionStatus::Running);
    report(&mut wf, 3, TaskExecutionStatus::Success, vec![]).await;

    assert_eq!(wf.state(), WorkflowExecutionStatus::Failure);
    assert!(wf.task_instance_by_code(4).is_none());
}

#[tokio::test]
async fn test_stop_kills_queued_and_signals_running_tasks() {
    let (ctx, repository) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b")], &[]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");

    let running = wf.task_runnable(task_id(&wf, 1)).expect("a tracked");
    assert!(running.mark_dispatched("worker-1"));
    report(&mut wf, 1, TaskExecutionStatus::RunningExecution, vec![]).await;

    wf.handle_event(WorkflowEvent::Stop).await.expect("stop");
    assert_eq!(ctx.queue.get_waiting_dispatch_task_number(), 0);
    assert_eq!(wf.state(), WorkflowExecutionStatus::Running, "a is still on its worker");

    report(&mut wf, 1, TaskExecutionStatus::Kill, vec![]).await;
    assert_eq!(wf.state(), WorkflowExecutionStatus::Stop);
    let states: Vec<TaskExecutionStatus> = repository
        .all_task_instances(wf.workflow_instance_id())
        .into_iter()
        .map(|t| t.state)
        .collect();
    assert_eq!(states, vec![TaskExecutionStatus::Kill, TaskExecutionStatus::Kill]);
}

#[tokio::test]
async fn test_late_and_duplicate_completion_after_stop_is_ignored() {
    let (ctx, repository) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b")], &[(1, 2)]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");

    let a = wf.task_runnable(task_id(&wf, 1)).expect("a tracked");
    assert!(a.mark_dispatched("worker-1"));
    wf.handle_event(WorkflowEvent::Stop).await.expect("stop");

    // The worker finished before the kill reached it.
    report(&mut wf, 1, TaskExecutionStatus::Success, vec![]).await;
    assert_eq!(wf.state(), WorkflowExecutionStatus::Stop);
    let recorded = wf.completed_task(1).expect("a recorded");

    report(&mut wf, 1, TaskExecutionStatus::Success, vec![]).await;
    assert_eq!(wf.completed_task(1), Some(recorded));
    assert_eq!(wf.completed_task_codes(), vec![1]);
    assert!(wf.task_instance_by_code(2).is_none(), "b must not run after stop");
    assert!(ctx.queue.try_take_task_execute_runnable().is_none());
    assert_eq!(repository.all_task_instances(wf.workflow_instance_id()).len(), 1);
    assert_eq!(wf.state(), WorkflowExecutionStatus::Stop);
}

#[tokio::test]
async fn test_pause_with_nothing_running_ends_immediately() {
    let (ctx, _) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b")], &[(1, 2)]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");

    wf.handle_event(WorkflowEvent::Pause).await.expect("pause");

    assert_eq!(wf.state(), WorkflowExecutionStatus::Pause);
    assert_eq!(wf.task_instance_by_code(1).map(|t| t.state), Some(TaskExecutionStatus::Pause));
}

#[tokio::test]
async fn test_start_failure_task_process_reruns_only_failed_tasks() {
    let (ctx, repository) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b")], &[(1, 2)]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let id = instance.id;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");
    report(&mut wf, 1, TaskExecutionStatus::Success, vec![Property::output("rows", "42")]).await;
    report(&mut wf, 2, TaskExecutionStatus::Failure, vec![]).await;
    assert_eq!(wf.state(), WorkflowExecutionStatus::Failure);
    let first_a = task_id(&wf, 1);
    drain_queue(&ctx);

    let mut rerun = resume(&ctx, &def, id, CommandType::StartFailureTaskProcess, None).await;
    rerun.start().await.expect("resume");

    assert!(rerun.is_task_completed(1));
    assert_eq!(task_id(&rerun, 1), first_a);
    let b = rerun.task_instance_by_code(2).expect("b resubmitted");
    assert_eq!(b.state, TaskExecutionStatus::SubmittedSuccess);
    assert_eq!(find_property(&b.var_pool, "rows").map(|p| p.value.as_str()), Some("42"));
    assert_eq!(drain_queue(&ctx), vec![b.id]);

    report(&mut rerun, 2, TaskExecutionStatus::Success, vec![]).await;
    assert_eq!(rerun.state(), WorkflowExecutionStatus::Success);
    let valid: Vec<i64> = repository
        .all_task_instances(id)
        .into_iter()
        .filter(|t| t.valid)
        .map(|t| t.task_code)
        .collect();
    assert_eq!(valid, vec![1, 2]);
}

#[tokio::test]
async fn test_recovery_start_node_id_list_forces_rerun() {
    let (ctx, _) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b")], &[(1, 2)]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let id = instance.id;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");
    report(&mut wf, 1, TaskExecutionStatus::Success, vec![]).await;
    report(&mut wf, 2, TaskExecutionStatus::Failure, vec![]).await;
    let first_a = task_id(&wf, 1);
    drain_queue(&ctx);

    let param = format!(r#"{{"RecoveryStartNodeIdList":"{}"}}"#, first_a);
    let mut rerun = resume(&ctx, &def, id, CommandType::StartFailureTaskProcess, Some(&param)).await;
    let listed = rerun.get_recover_task_instance_list(Some(&param)).await.expect("list");
    assert_eq!(listed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![first_a]);

    rerun.start().await.expect("resume");
    assert!(!rerun.is_task_completed(1));
    assert_ne!(task_id(&rerun, 1), first_a);
    assert!(rerun.task_instance_by_code(2).is_none());
}

#[tokio::test]
async fn test_tolerance_fault_recovery_reattaches_running_tasks() {
    let (ctx, _) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b")], &[(1, 2)]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let id = instance.id;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");
    let a = wf.task_runnable(task_id(&wf, 1)).expect("a tracked");
    assert!(a.mark_dispatched("worker-1"));
    report(&mut wf, 1, TaskExecutionStatus::RunningExecution, vec![]).await;
    let a_id = a.task_instance_id();
    drop(wf);
    drain_queue(&ctx);

    let mut recovered = resume(&ctx, &def, id, CommandType::RecoverToleranceFaultProcess, None).await;
    recovered.start().await.expect("recover");
    assert_eq!(recovered.active_task_count(), 1);
    assert_eq!(task_id(&recovered, 1), a_id);
    assert_eq!(ctx.queue.get_waiting_dispatch_task_number(), 0, "running task must not be dispatched again");

    report(&mut recovered, 1, TaskExecutionStatus::Success, vec![]).await;
    report(&mut recovered, 2, TaskExecutionStatus::Success, vec![]).await;
    assert_eq!(recovered.state(), WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn test_execute_task_reruns_selected_node_and_successors() {
    let (ctx, repository) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b"), task(3, "c")], &[(1, 2), (2, 3)]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let id = instance.id;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");
    for code in [1, 2, 3] {
        report(&mut wf, code, TaskExecutionStatus::Success, vec![]).await;
    }
    assert_eq!(wf.state(), WorkflowExecutionStatus::Success);
    let old_b = task_id(&wf, 2);
    drain_queue(&ctx);

    let mut execute = resume(&ctx, &def, id, CommandType::ExecuteTask, Some(r#"{"StartNodeList":"2"}"#)).await;
    execute.start().await.expect("execute task");

    let new_b = task_id(&execute, 2);
    assert_ne!(new_b, old_b);
    assert!(!execute.is_task_completed(2));
    assert!(!execute.is_task_completed(3));
    assert_eq!(drain_queue(&ctx), vec![new_b]);

    let rows = repository.all_task_instances(id);
    let valid: Vec<(i64, bool)> = rows.iter().map(|t| (t.task_code, t.valid)).collect();
    assert_eq!(valid, vec![(1, true), (2, false), (3, false), (2, true)]);

    // Only meaningful for EXECUTE_TASK.
    let mut plain = resume(&ctx, &def, id, CommandType::StartProcess, None).await;
    plain.clear_data_if_execute_task().await.expect("no-op");
}

#[tokio::test]
async fn test_check_serial_process_promotes_waiting_successor() {
    let (ctx, _) = context(MasterConfig::default());
    let mut def = definition(1, vec![task(1, "a")], &[]);
    def.execution_type = ExecutionType::SerialWait;
    let first = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut second = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    second.state = WorkflowExecutionStatus::SerialWait;
    ctx.workflow_repository.update_workflow_instance(&second).await.expect("update");
    ctx.workflow_repository
        .link_next_instance(first.id, second.id)
        .await
        .expect("link");

    let wf = runnable(&ctx, &def, first);
    assert_eq!(wf.check_serial_process().await.expect("promote"), Some(second.id));

    let promoted = ctx
        .workflow_repository
        .find_process_instance_by_id(second.id)
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(promoted.state, WorkflowExecutionStatus::Submitted);
    let command = ctx.command_queue.pop().await.expect("pop").expect("command");
    assert_eq!(command.command_type, CommandType::RecoverSerialWait);
    assert_eq!(command.workflow_instance_id, Some(second.id));

    // A second call finds nobody waiting.
    assert_eq!(wf.check_serial_process().await.expect("no-op"), None);
}

#[tokio::test]
async fn test_restore_task_instance_counts_as_completed() {
    let (ctx, _) = context(MasterConfig::default());
    let def = definition(1, vec![task(1, "a"), task(2, "b")], &[(1, 2)]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut wf = runnable(&ctx, &def, instance.clone());

    let mut done = dagmaster::model::TaskInstance::from_definition(&def.tasks[0], &instance);
    done.id = 99;
    done.state = TaskExecutionStatus::Success;
    wf.restore_task_instance(done);

    assert!(wf.is_task_completed(1));
    assert_eq!(wf.completed_task(1).map(|c| c.task_instance_id), Some(99));
    assert_eq!(wf.active_task_count(), 0);
}

#[derive(Default)]
struct RecordingAlerts {
    workflows: parking_lot::Mutex<Vec<(i64, WorkflowExecutionStatus)>>,
    tasks: parking_lot::Mutex<Vec<i64>>,
}

#[async_trait::async_trait]
impl dagmaster::alert::AlertManager for RecordingAlerts {
    async fn send_workflow_alert(&self, workflow_instance: &WorkflowInstance) {
        self.workflows.lock().push((workflow_instance.id, workflow_instance.state));
    }

    async fn send_task_failure_alert(
        &self,
        _workflow_instance: &WorkflowInstance,
        task_instance: &dagmaster::model::TaskInstance,
    ) {
        self.tasks.lock().push(task_instance.id);
    }
}

#[tokio::test]
async fn test_alerts_on_task_failure_and_workflow_end() {
    let alerts = Arc::new(RecordingAlerts::default());
    let (workers, _events) = LoopbackWorkerClient::new();
    let ctx = Arc::new(MasterContext::new(MasterConfig::default(), workers).with_alert_manager(alerts.clone()));
    let def = definition(1, vec![task(1, "a")], &[]);
    let instance = create_instance(&ctx, &def, CommandType::StartProcess, None).await;
    let mut wf = runnable(&ctx, &def, instance);
    wf.start().await.expect("start");
    let failed = task_id(&wf, 1);

    report(&mut wf, 1, TaskExecutionStatus::Failure, vec![]).await;

    assert_eq!(wf.state(), WorkflowExecutionStatus::Failure);
    assert_eq!(*alerts.tasks.lock(), vec![failed]);
    assert_eq!(
        *alerts.workflows.lock(),
        vec![(wf.workflow_instance_id(), WorkflowExecutionStatus::Failure)]
    );
}
