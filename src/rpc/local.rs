use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RpcError;
use crate::model::{Property, TaskExecutionStatus};
use crate::rpc::{
    DispatchResponse, TaskControlKind, TaskControlRequest, TaskDispatchRequest, TaskEventSource,
    TaskStateEvent, WorkerClient,
};

/// How the loopback worker plays out a task, read from `task_params.simulate`.
#[derive(Debug, Clone, Default, Deserialize)]
struct Simulation {
    #[serde(default)]
    outcome: Option<TaskExecutionStatus>,
    #[serde(default)]
    outputs: BTreeMap<String, Value>,
    #[serde(default)]
    duration_ms: u64,
    /// The first `fail_attempts` attempts report FAILURE regardless of `outcome`.
    #[serde(default)]
    fail_attempts: u32,
}

impl Simulation {
    fn from_request(request: &TaskDispatchRequest) -> Self {
        request
            .task_params
            .get("simulate")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    fn final_state(&self, retry_times: u32) -> TaskExecutionStatus {
        if retry_times < self.fail_attempts {
            TaskExecutionStatus::Failure
        } else {
            self.outcome.unwrap_or(TaskExecutionStatus::Success)
        }
    }

    fn out_properties(&self) -> Vec<Property> {
        self.outputs
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Property::output(name, value)
            })
            .collect()
    }
}

type RunningTask = (CancellationToken, Arc<parking_lot::Mutex<Option<TaskControlKind>>>);

/// In-process stand-in for the worker tier. Every dispatched task is played out on a
/// tokio task and its state changes are fed to the paired [`ChannelTaskEventSource`].
pub struct LoopbackWorkerClient {
    events: mpsc::UnboundedSender<TaskStateEvent>,
    running: Arc<DashMap<i64, RunningTask>>,
    dispatched: AtomicUsize,
}

impl LoopbackWorkerClient {
    pub fn new() -> (Arc<Self>, ChannelTaskEventSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            events: tx,
            running: Arc::new(DashMap::new()),
            dispatched: AtomicUsize::new(0),
        });
        (client, ChannelTaskEventSource::new(rx))
    }

    /// Number of dispatch requests accepted so far.
    pub fn dispatched_count(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerClient for LoopbackWorkerClient {
    async fn dispatch(&self, host: &str, request: TaskDispatchRequest) -> Result<DispatchResponse, RpcError> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let simulation = Simulation::from_request(&request);
        let token = CancellationToken::new();
        let control = Arc::new(parking_lot::Mutex::new(None));
        self.running
            .insert(request.task_instance_id, (token.clone(), control.clone()));

        let events = self.events.clone();
        let running = self.running.clone();
        let host = host.to_string();
        info!(task_instance_id = request.task_instance_id, host = %host, task = %request.task_name, "Loopback worker accepted task");

        tokio::spawn(async move {
            let base = |state| {
                TaskStateEvent::new(request.task_instance_id, request.workflow_instance_id, state)
                    .with_host(host.clone())
            };
            let _ = events.send(base(TaskExecutionStatus::RunningExecution));

            let finished = tokio::select! {
                _ = token.cancelled() => {
                    match *control.lock() {
                        Some(TaskControlKind::Pause) => base(TaskExecutionStatus::Pause),
                        _ => base(TaskExecutionStatus::Kill),
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(simulation.duration_ms)) => {
                    let state = simulation.final_state(request.retry_times);
                    let outputs = if state == TaskExecutionStatus::Success {
                        simulation.out_properties()
                    } else {
                        Vec::new()
                    };
                    base(state).with_var_pool(outputs)
                }
            };
            running.remove(&request.task_instance_id);
            if events.send(finished).is_err() {
                debug!(task_instance_id = request.task_instance_id, "Loopback event channel closed, dropping task event");
            }
        });

        Ok(DispatchResponse::accepted())
    }

    async fn control(&self, host: &str, request: TaskControlRequest) -> Result<(), RpcError> {
        match self.running.get(&request.task_instance_id) {
            Some(entry) => {
                let (token, control) = entry.value();
                *control.lock() = Some(request.kind);
                token.cancel();
                info!(task_instance_id = request.task_instance_id, host = %host, kind = ?request.kind, "Loopback worker signalled task");
            }
            None => {
                debug!(task_instance_id = request.task_instance_id, "Control request for unknown task ignored");
            }
        }
        Ok(())
    }
}

impl Drop for LoopbackWorkerClient {
    fn drop(&mut self) {
        for entry in self.running.iter() {
            entry.value().0.cancel();
        }
    }
}

/// Task events delivered over an in-process channel.
pub struct ChannelTaskEventSource {
    receiver: Mutex<mpsc::UnboundedReceiver<TaskStateEvent>>,
}

impl ChannelTaskEventSource {
    pub fn new(receiver: mpsc::UnboundedReceiver<TaskStateEvent>) -> Self {
        Self {
            receiver: Mutex::new(receiver),
        }
    }

    /// A source fed by the returned sender, for masters that report events themselves.
    pub fn channel() -> (mpsc::UnboundedSender<TaskStateEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl TaskEventSource for ChannelTaskEventSource {
    async fn next_event(&self) -> Result<Option<TaskStateEvent>, RpcError> {
        let mut rx = self.receiver.lock().await;
        rx.recv()
            .await
            .map(Some)
            .ok_or_else(|| RpcError::Transport("task event channel closed".to_string()))
    }
}
