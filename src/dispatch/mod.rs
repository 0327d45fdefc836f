pub mod dispatcher;
pub mod logic;
pub mod looper;
pub mod queue;

pub use dispatcher::{TaskDispatchFactory, TaskDispatcher, WorkerRegistry, WorkerTaskDispatcher};
pub use logic::{LogicTaskDispatcher, SWITCH_TASK_TYPE, SwitchTask};
pub use looper::GlobalTaskDispatchWaitingQueueLooper;
pub use queue::{DispatchKey, GlobalTaskDispatchWaitingQueue};
