pub mod command_param;
pub mod context;
pub mod engine;
pub mod event;
pub mod redis_storage;
pub mod storage;
pub mod task;
pub mod workflow;
