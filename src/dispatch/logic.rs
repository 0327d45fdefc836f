use async_trait::async_trait;
use evalexpr::{
    ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, Node as EvalNode,
    build_operator_tree,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::DispatchError;
use crate::model::{DataType, Property, TaskExecutionStatus};
use crate::rpc::TaskStateEvent;
use crate::runtime::event::WorkflowEventBus;
use crate::runtime::task::TaskExecutionRunnable;

pub const SWITCH_TASK_TYPE: &str = "SWITCH";

#[derive(Debug, Clone, Deserialize)]
struct SwitchBranchParams {
    condition: String,
    next_node: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct SwitchParams {
    #[serde(default)]
    branches: Vec<SwitchBranchParams>,
    #[serde(default)]
    default_node: Option<i64>,
}

struct SwitchBranch {
    condition: EvalNode<DefaultNumericTypes>,
    next_node: i64,
}

/// Compiled form of a SWITCH task's `task_params.switch` block:
///
/// ```yaml
/// switch:
///   branches:
///     - condition: "${count} > 10"
///       next_node: 3
///   default_node: 4
/// ```
pub struct SwitchTask {
    branches: Vec<SwitchBranch>,
    default_node: Option<i64>,
}

impl SwitchTask {
    pub fn from_task_params(params: &Value) -> Result<Self, String> {
        let raw = params
            .get("switch")
            .ok_or_else(|| "missing `switch` block".to_string())?;
        let parsed: SwitchParams =
            serde_json::from_value(raw.clone()).map_err(|e| format!("invalid `switch` block: {}", e))?;

        let mut branches = Vec::with_capacity(parsed.branches.len());
        for branch in parsed.branches {
            let clean = branch.condition.replace("${", "").replace('}', "");
            let condition = build_operator_tree(&clean)
                .map_err(|e| format!("invalid condition `{}`: {}", branch.condition, e))?;
            branches.push(SwitchBranch {
                condition,
                next_node: branch.next_node,
            });
        }

        Ok(Self {
            branches,
            default_node: parsed.default_node,
        })
    }

    /// First branch whose condition holds, else the default. `None` skips every successor.
    pub fn evaluate(&self, var_pool: &[Property]) -> Result<Option<i64>, String> {
        let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
        for property in var_pool {
            let _ = eval_ctx.set_value(property.prop.clone(), to_eval_value(property));
        }

        for branch in &self.branches {
            let matched = branch
                .condition
                .eval_boolean_with_context(&eval_ctx)
                .map_err(|e| format!("condition evaluation failed: {}", e))?;
            if matched {
                return Ok(Some(branch.next_node));
            }
        }
        Ok(self.default_node)
    }
}

fn to_eval_value(property: &Property) -> evalexpr::Value<DefaultNumericTypes> {
    let raw = property.value.as_str();
    match property.data_type {
        DataType::Integer | DataType::Long => raw
            .parse::<i64>()
            .map(evalexpr::Value::Int)
            .unwrap_or_else(|_| evalexpr::Value::String(raw.to_string())),
        DataType::Float | DataType::Double => raw
            .parse::<f64>()
            .map(evalexpr::Value::Float)
            .unwrap_or_else(|_| evalexpr::Value::String(raw.to_string())),
        DataType::Boolean => raw
            .parse::<bool>()
            .map(evalexpr::Value::Boolean)
            .unwrap_or_else(|_| evalexpr::Value::String(raw.to_string())),
        // Untyped values are guessed so `${count} > 1` works on VARCHAR outputs.
        _ => {
            if let Ok(i) = raw.parse::<i64>() {
                evalexpr::Value::Int(i)
            } else if let Ok(f) = raw.parse::<f64>() {
                evalexpr::Value::Float(f)
            } else if let Ok(b) = raw.parse::<bool>() {
                evalexpr::Value::Boolean(b)
            } else {
                evalexpr::Value::String(raw.to_string())
            }
        }
    }
}

/// Runs logic tasks inside the master instead of shipping them to a worker.
pub struct LogicTaskDispatcher {
    host: String,
    event_bus: Arc<WorkflowEventBus>,
}

impl LogicTaskDispatcher {
    pub fn new(host: impl Into<String>, event_bus: Arc<WorkflowEventBus>) -> Self {
        Self {
            host: host.into(),
            event_bus,
        }
    }
}

#[async_trait]
impl crate::dispatch::TaskDispatcher for LogicTaskDispatcher {
    async fn dispatch_task(&self, runnable: Arc<TaskExecutionRunnable>) -> Result<(), DispatchError> {
        if !runnable.mark_dispatched(&self.host) {
            debug!(task_instance_id = runnable.task_instance_id(), "Logic task no longer pending, skipping");
            return Ok(());
        }
        let task = runnable.snapshot();

        let outcome = SwitchTask::from_task_params(&task.task_params)
            .and_then(|switch| switch.evaluate(&task.var_pool));
        let chosen = match outcome {
            Ok(chosen) => chosen,
            Err(message) => {
                runnable.revert_dispatch();
                return Err(DispatchError::InvalidTaskParams {
                    task_code: task.task_code,
                    message,
                });
            }
        };

        info!(
            task_instance_id = task.id,
            workflow_instance_id = task.workflow_instance_id,
            next_node = ?chosen,
            "Switch task evaluated"
        );
        self.event_bus.publish_task_event(
            TaskStateEvent::new(task.id, task.workflow_instance_id, TaskExecutionStatus::Success)
                .with_host(self.host.clone())
                .with_next_nodes(chosen.into_iter().collect()),
        );
        Ok(())
    }
}
