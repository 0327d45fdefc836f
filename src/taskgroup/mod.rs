pub mod coordinator;

pub use coordinator::{AcquireResult, SlotGrant, TaskGroup, TaskGroupCoordinator};
