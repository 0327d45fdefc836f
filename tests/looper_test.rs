mod common;

use async_trait::async_trait;
use common::{definition, task};
use dagmaster::config::DispatchRetryConfig;
use dagmaster::dispatch::{GlobalTaskDispatchWaitingQueue, GlobalTaskDispatchWaitingQueueLooper, TaskDispatchFactory, TaskDispatcher};
use dagmaster::error::DispatchError;
use dagmaster::model::{CommandType, TaskExecutionStatus, TaskInstance, WorkflowInstance};
use dagmaster::runtime::event::{WorkflowEvent, WorkflowEventBus};
use dagmaster::runtime::task::TaskExecutionRunnable;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records dispatched task ids and answers with a fixed outcome.
struct RecordingDispatcher {
    dispatched: Mutex<Vec<i64>>,
    fail_with: Option<fn() -> DispatchError>,
}

impl RecordingDispatcher {
    fn new(fail_with: Option<fn() -> DispatchError>) -> Arc<Self> {
        Arc::new(Self { dispatched: Mutex::new(Vec::new()), fail_with })
    }

    fn dispatched(&self) -> Vec<i64> {
        self.dispatched.lock().clone()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch_task(&self, runnable: Arc<TaskExecutionRunnable>) -> Result<(), DispatchError> {
        self.dispatched.lock().push(runnable.task_instance_id());
        match self.fail_with {
            Some(error) => Err(error()),
            None => {
                runnable.mark_dispatched("worker-1");
                Ok(())
            }
        }
    }
}

struct Fixture {
    queue: Arc<GlobalTaskDispatchWaitingQueue>,
    bus: Arc<WorkflowEventBus>,
    looper: GlobalTaskDispatchWaitingQueueLooper,
}

fn fixture(dispatcher: Arc<RecordingDispatcher>, retry: DispatchRetryConfig) -> Fixture {
    let queue = Arc::new(GlobalTaskDispatchWaitingQueue::new());
    let bus = Arc::new(WorkflowEventBus::new());
    let looper = GlobalTaskDispatchWaitingQueueLooper::new(
        "test-looper",
        queue.clone(),
        Arc::new(TaskDispatchFactory::new(dispatcher)),
        retry,
        bus.clone(),
        CancellationToken::new(),
    );
    Fixture { queue, bus, looper }
}

fn runnable(queue: &Arc<GlobalTaskDispatchWaitingQueue>, id: i64) -> Arc<TaskExecutionRunnable> {
    let def = definition(1, vec![task(10, "t")], &[]);
    let mut workflow = WorkflowInstance::new(&def, CommandType::StartProcess);
    workflow.id = 1;
    let mut instance = TaskInstance::from_definition(&def.tasks[0], &workflow);
    instance.id = id;
    TaskExecutionRunnable::new(instance, queue.clone())
}

fn fast_retry(max_attempts: u32) -> DispatchRetryConfig {
    DispatchRetryConfig {
        initial_delay_ms: 10,
        multiplier: 2.0,
        max_delay_ms: 50,
        max_attempts,
    }
}

fn expect_task_event(event: Option<WorkflowEvent>) -> (i64, TaskExecutionStatus) {
    match event {
        Some(WorkflowEvent::TaskStateChanged(e)) => (e.task_instance_id, e.state),
        other => panic!("expected a task event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_killed_entry_is_never_dispatched() {
    let dispatcher = RecordingDispatcher::new(None);
    let f = fixture(dispatcher.clone(), fast_retry(3));
    let killed = runnable(&f.queue, 1);
    assert!(killed.compare_and_set_state(TaskExecutionStatus::SubmittedSuccess, TaskExecutionStatus::Kill));

    f.looper.dispatch_one(killed).await;

    assert!(dispatcher.dispatched().is_empty());
    assert_eq!(f.queue.get_waiting_dispatch_task_number(), 0);
}

#[tokio::test]
async fn test_submitted_entry_is_dispatched() {
    let dispatcher = RecordingDispatcher::new(None);
    let f = fixture(dispatcher.clone(), fast_retry(3));
    let submitted = runnable(&f.queue, 2);

    f.looper.dispatch_one(submitted.clone()).await;

    assert_eq!(dispatcher.dispatched(), vec![2]);
    assert_eq!(submitted.state(), TaskExecutionStatus::Dispatch);
    assert_eq!(submitted.snapshot().host.as_deref(), Some("worker-1"));
}

#[tokio::test]
async fn test_transient_failure_requeues_then_gives_up() {
    let dispatcher = RecordingDispatcher::new(Some(|| DispatchError::NoAvailableWorker("default".to_string())));
    let f = fixture(dispatcher.clone(), fast_retry(2));
    let mut events = f.bus.register(1);
    let flaky = runnable(&f.queue, 3);

    f.looper.dispatch_one(flaky.clone()).await;
    assert_eq!(f.queue.get_waiting_dispatch_task_number(), 1);
    assert_eq!(flaky.dispatch_failures(), 1);

    let again = tokio::time::timeout(Duration::from_secs(1), f.queue.take_task_execute_runnable())
        .await
        .expect("requeued entry");
    f.looper.dispatch_one(again).await;
    assert_eq!(flaky.dispatch_failures(), 2);

    let last = tokio::time::timeout(Duration::from_secs(1), f.queue.take_task_execute_runnable())
        .await
        .expect("requeued entry");
    f.looper.dispatch_one(last).await;

    assert_eq!(dispatcher.dispatched(), vec![3, 3, 3]);
    assert_eq!(f.queue.get_waiting_dispatch_task_number(), 0);
    assert_eq!(expect_task_event(events.try_recv().ok()), (3, TaskExecutionStatus::Failure));
}

#[tokio::test]
async fn test_permanent_failure_fails_the_task() {
    let dispatcher = RecordingDispatcher::new(Some(|| DispatchError::InvalidTaskParams {
        task_code: 10,
        message: "bad".to_string(),
    }));
    let f = fixture(dispatcher, fast_retry(5));
    let mut events = f.bus.register(1);

    f.looper.dispatch_one(runnable(&f.queue, 4)).await;

    assert_eq!(f.queue.get_waiting_dispatch_task_number(), 0);
    assert_eq!(expect_task_event(events.try_recv().ok()), (4, TaskExecutionStatus::Failure));
}

#[tokio::test]
async fn test_failure_of_cancelled_task_reports_kill() {
    let dispatcher = RecordingDispatcher::new(Some(|| DispatchError::NoAvailableWorker("default".to_string())));
    let f = fixture(dispatcher, fast_retry(5));
    let mut events = f.bus.register(1);
    let cancelled = runnable(&f.queue, 5);
    cancelled.cancel();

    f.looper.dispatch_one(cancelled).await;

    assert_eq!(f.queue.get_waiting_dispatch_task_number(), 0);
    assert_eq!(expect_task_event(events.try_recv().ok()), (5, TaskExecutionStatus::Kill));
}

#[tokio::test]
async fn test_run_loop_drains_queue_until_cancelled() {
    let dispatcher = RecordingDispatcher::new(None);
    let queue = Arc::new(GlobalTaskDispatchWaitingQueue::new());
    let cancel = CancellationToken::new();
    let looper = GlobalTaskDispatchWaitingQueueLooper::new(
        "test-looper",
        queue.clone(),
        Arc::new(TaskDispatchFactory::new(dispatcher.clone())),
        fast_retry(1),
        Arc::new(WorkflowEventBus::new()),
        cancel.clone(),
    );
    let handle = tokio::spawn(looper.run());

    for id in 1..=3 {
        queue.dispatch_task_execute_runnable(runnable(&queue, id));
    }
    for _ in 0..100 {
        if dispatcher.dispatched().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut dispatched = dispatcher.dispatched();
    dispatched.sort();
    assert_eq!(dispatched, vec![1, 2, 3]);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("looper did not stop")
        .expect("looper panicked");
}
